//! The builtin call contract.
//!
//! Builtins are supplied by the embedder; the core only knows their
//! call shape. A validator is a builtin applied to stored arguments
//! whose remaining parameter is the subject value.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use strata_core::kind::Kind;

use crate::context::OpContext;
use crate::errors::Bottom;
use crate::value::Value;

/// The function type of a builtin body.
pub type BuiltinFn = fn(&mut OpContext, &[Value]) -> Value;

/// Violations of a builtin's call contract. These surface as eval
/// bottoms on the calling vertex.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("{name}: got {got} arguments, want {want}")]
    Arity {
        name: String,
        got: usize,
        want: usize,
    },
    #[error("{name}: cannot use {arg} (kind {kind}) as {want} in argument {index}")]
    ArgKind {
        name: String,
        arg: String,
        kind: String,
        want: String,
        index: usize,
    },
}

/// A named builtin with a fixed call contract.
pub struct Builtin {
    pub name: String,
    /// Parameter kinds, in order.
    pub params: Vec<Kind>,
    pub result: Kind,
    /// Validators that do not constrain the field set of their subject
    /// erase closedness requirements (see the typo-check pruning rules).
    pub open: bool,
    pub func: BuiltinFn,
}

impl Builtin {
    pub fn call(&self, ctx: &mut OpContext, args: &[Value]) -> Value {
        if args.len() != self.params.len() {
            let e = CallError::Arity {
                name: self.name.clone(),
                got: args.len(),
                want: self.params.len(),
            };
            return Value::bottom(Bottom::eval(e.to_string()));
        }
        for (i, (arg, want)) in args.iter().zip(&self.params).enumerate() {
            if let Some(b) = arg.as_bottom() {
                return Value::Bottom(b.clone());
            }
            if !want.intersects(arg.kind()) {
                let e = CallError::ArgKind {
                    name: self.name.clone(),
                    arg: arg.to_string(),
                    kind: arg.kind().to_string(),
                    want: want.to_string(),
                    index: i + 1,
                };
                return Value::bottom(Bottom::eval(e.to_string()));
            }
        }
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("result", &self.result)
            .field("open", &self.open)
            .finish()
    }
}

// Builtins are compared by identity: two registrations of the same
// name are distinct validators.
impl PartialEq for Builtin {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// A builtin partially applied to validation arguments.
#[derive(Debug, Clone)]
pub struct ValidatorCall {
    pub builtin: Rc<Builtin>,
    pub args: Vec<Value>,
}

impl PartialEq for ValidatorCall {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.builtin, &other.builtin) && self.args == other.args
    }
}

impl ValidatorCall {
    /// Apply the validator to a subject. `None` means the subject passed.
    pub fn validate(&self, ctx: &mut OpContext, subject: &Value) -> Option<Rc<Bottom>> {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(subject.clone());
        args.extend(self.args.iter().cloned());
        match self.builtin.call(ctx, &args) {
            Value::Bool(true) => None,
            Value::Bool(false) => Some(Rc::new(Bottom::eval(format!(
                "invalid value {} (does not satisfy {})",
                subject, self.builtin.name
            )))),
            Value::Bottom(b) => Some(b),
            other => Some(Rc::new(Bottom::eval(format!(
                "invalid validator result {} from {}",
                other, self.builtin.name
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_even(_: &mut OpContext, args: &[Value]) -> Value {
        match args[0].as_num().and_then(|n| n.to_bigint()) {
            Some(i) => Value::Bool(&i % 2 == num_bigint::BigInt::from(0)),
            None => Value::bottom(Bottom::eval("not an integer")),
        }
    }

    #[test]
    fn arity_and_kind_checks() {
        let b = Builtin {
            name: "even".into(),
            params: vec![Kind::INT],
            result: Kind::BOOL,
            open: true,
            func: is_even,
        };
        let mut ctx = OpContext::new();
        assert_eq!(b.call(&mut ctx, &[Value::int(4)]), Value::Bool(true));
        assert!(b.call(&mut ctx, &[Value::string("x")]).is_bottom());
        assert!(b.call(&mut ctx, &[]).is_bottom());
    }

    #[test]
    fn validator_failure_message() {
        let b = Rc::new(Builtin {
            name: "even".into(),
            params: vec![Kind::INT],
            result: Kind::BOOL,
            open: true,
            func: is_even,
        });
        let v = ValidatorCall {
            builtin: b,
            args: vec![],
        };
        let mut ctx = OpContext::new();
        assert!(v.validate(&mut ctx, &Value::int(2)).is_none());
        let err = v.validate(&mut ctx, &Value::int(3)).unwrap();
        assert!(err.err.contains("does not satisfy even"));
    }
}
