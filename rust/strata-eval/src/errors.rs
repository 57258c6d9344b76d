//! The error value of the lattice.
//!
//! Evaluation failures are not `Err` results: they are `Bottom` values,
//! the unique least element of the value lattice. A bottom carries an
//! error code whose order decides which error wins when alternatives
//! are combined, an optional source vertex, and an optional child error
//! chain for ancestor reporting.

use serde::Serialize;
use std::fmt;
use std::rc::Rc;

use crate::vertex::VertexId;

/// Error codes by increasing severity. When two errors are combined,
/// the higher code wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorCode {
    /// Missing dependency or unresolved cycle; retryable.
    Incomplete,
    /// A reference cycle that did not resolve to a value.
    Cycle,
    /// A self-referential structure that would be infinite.
    StructuralCycle,
    /// The computation itself failed.
    Eval,
    /// Assertion failure; should be impossible.
    Internal,
}

impl ErrorCode {
    /// Incomplete and cycle errors may resolve on retry.
    pub fn is_incomplete(self) -> bool {
        matches!(self, ErrorCode::Incomplete | ErrorCode::Cycle)
    }
}

/// The bottom value: an error as a lattice element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bottom {
    pub code: ErrorCode,
    pub err: String,
    /// Vertex the error is reported at, if known.
    pub node: Option<VertexId>,
    /// Opaque source-position token; used to deduplicate combined errors.
    pub pos: Option<u32>,
    /// True if the error came from closedness enforcement. Such errors
    /// are suppressed while disjunction alternatives are probed.
    pub close_check: bool,
    /// True if a recursive (descendant) error is folded in.
    pub has_recursive: bool,
    /// Marks the structural "field is not present" bottom.
    pub not_present: bool,
    /// Ancestor chain convenience link.
    pub child: Option<Rc<Bottom>>,
}

impl Bottom {
    pub fn new(code: ErrorCode, err: impl Into<String>) -> Bottom {
        Bottom {
            code,
            err: err.into(),
            node: None,
            pos: None,
            close_check: false,
            has_recursive: false,
            not_present: false,
            child: None,
        }
    }

    pub fn incomplete(err: impl Into<String>) -> Bottom {
        Bottom::new(ErrorCode::Incomplete, err)
    }

    pub fn cycle(err: impl Into<String>) -> Bottom {
        Bottom::new(ErrorCode::Cycle, err)
    }

    pub fn structural_cycle(err: impl Into<String>) -> Bottom {
        Bottom::new(ErrorCode::StructuralCycle, err)
    }

    pub fn eval(err: impl Into<String>) -> Bottom {
        Bottom::new(ErrorCode::Eval, err)
    }

    pub fn internal(err: impl Into<String>) -> Bottom {
        Bottom::new(ErrorCode::Internal, err)
    }

    /// The structural bottom marking an absent optional field.
    pub fn field_not_present() -> Bottom {
        let mut b = Bottom::new(ErrorCode::Incomplete, "field not present");
        b.not_present = true;
        b
    }

    /// A closedness violation for `field`.
    pub fn field_not_allowed(field: impl fmt::Display) -> Bottom {
        let mut b = Bottom::eval(format!("field not allowed: {}", field));
        b.close_check = true;
        b
    }

    pub fn at(mut self, node: VertexId) -> Bottom {
        self.node = Some(node);
        self
    }

    pub fn with_pos(mut self, pos: u32) -> Bottom {
        if pos != 0 {
            self.pos = Some(pos);
        }
        self
    }

    pub fn is_incomplete(&self) -> bool {
        self.code.is_incomplete()
    }
}

impl fmt::Display for Bottom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.err)
    }
}

/// Combine two errors; the higher code wins, and an error subsuming
/// another at the same position absorbs it.
pub fn combine(a: Rc<Bottom>, b: Rc<Bottom>) -> Rc<Bottom> {
    if a.code > b.code {
        return a;
    }
    if b.code > a.code {
        return b;
    }
    if a.pos.is_some() && a.pos == b.pos && a.err == b.err {
        return a;
    }
    let mut out = (*b).clone();
    out.child = Some(a);
    Rc::new(out)
}

/// Combine per-alternative errors into one compound error whose code is
/// the maximum of its children, deduplicated by source position.
pub fn compound(msg: impl Into<String>, mut errs: Vec<Rc<Bottom>>) -> Rc<Bottom> {
    errs.sort_by_key(|e| (e.pos, e.err.clone()));
    errs.dedup_by(|a, b| a.pos.is_some() && a.pos == b.pos && a.err == b.err);
    let code = errs
        .iter()
        .map(|e| e.code)
        .max()
        .unwrap_or(ErrorCode::Incomplete);
    let mut out = Bottom::new(code, msg);
    let mut chain: Option<Rc<Bottom>> = None;
    for e in errs.into_iter().rev() {
        let mut node = (*e).clone();
        node.child = chain.take();
        chain = Some(Rc::new(node));
    }
    out.child = chain;
    Rc::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_order_is_severity() {
        assert!(ErrorCode::Incomplete < ErrorCode::Cycle);
        assert!(ErrorCode::Cycle < ErrorCode::StructuralCycle);
        assert!(ErrorCode::StructuralCycle < ErrorCode::Eval);
        assert!(ErrorCode::Eval < ErrorCode::Internal);
    }

    #[test]
    fn combine_prefers_higher_code() {
        let inc = Rc::new(Bottom::incomplete("later"));
        let eval = Rc::new(Bottom::eval("boom"));
        assert_eq!(combine(inc.clone(), eval.clone()).code, ErrorCode::Eval);
        assert_eq!(combine(eval.clone(), inc).code, ErrorCode::Eval);
    }

    #[test]
    fn compound_dedupes_by_position() {
        let a = Rc::new(Bottom::eval("no").with_pos(7));
        let b = Rc::new(Bottom::eval("no").with_pos(7));
        let c = Rc::new(Bottom::eval("other").with_pos(9));
        let out = compound("empty disjunction", vec![a, b, c]);
        assert_eq!(out.code, ErrorCode::Eval);
        let mut n = 0;
        let mut cur = out.child.clone();
        while let Some(e) = cur {
            n += 1;
            cur = e.child.clone();
        }
        assert_eq!(n, 2);
    }
}
