//! Debug rendering of the evaluation graph.
//!
//! Renders a vertex tree to JSON for the optional debug hooks and for
//! test diagnostics. Never used on the evaluation path.

use serde_json::{json, Value as Json};

use crate::context::OpContext;
use crate::vertex::{VertexId, VertexStatus};

impl OpContext {
    /// A JSON snapshot of a vertex and its arcs.
    pub fn vertex_to_json(&self, v: VertexId) -> Json {
        let vx = self.vertex(v);
        let arcs: Vec<Json> = vx
            .arcs
            .iter()
            .map(|&a| {
                json!({
                    "label": self.label_str(self.vertex(a).label),
                    "value": self.vertex_to_json(a),
                })
            })
            .collect();
        json!({
            "label": self.label_str(vx.label),
            "status": match vx.status {
                VertexStatus::Unprocessed => "unprocessed",
                VertexStatus::Evaluating => "evaluating",
                VertexStatus::Finalized => "finalized",
            },
            "base": vx.base_value.as_ref().map(|b| b.to_string()),
            "arcType": format!("{:?}", vx.arc_type),
            "closed": vx.closed_recursive || vx.closed_non_recursive,
            "conjuncts": vx.conjuncts.len(),
            "arcs": arcs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{RunMode, ALL_KNOWN};
    use crate::testing;
    use crate::value::Value;
    use crate::vertex::{CloseInfo, Conjunct, Environment};

    #[test]
    fn renders_scalar_vertex() {
        let mut ctx = OpContext::new();
        let f = ctx.runtime.str_label("x");
        let root = ctx.new_vertex(f, None);
        let env = Environment::root(root);
        let ci = CloseInfo::root(&mut ctx);
        ctx.add_conjunct(root, Conjunct::new(env, testing::int(5), ci));
        ctx.unify(root, ALL_KNOWN, RunMode::Finalize);
        let j = ctx.vertex_to_json(root);
        assert_eq!(j["status"], "finalized");
        assert_eq!(j["base"], "5");
        assert_eq!(ctx.vertex(root).base_value, Some(Value::int(5)));
    }
}
