//! Comprehension scenarios: deferred field emission, pending-arc
//! demotion, filtering, and the self-cyclic projection.

use strata_eval::expr::Clause;
use strata_eval::testing::{self, *};
use strata_eval::value::{Op, Value};
use strata_eval::OpContext;

#[test]
fn comprehension_projects_source_fields() {
    // src: {a: 1, b: 2}
    // out: { for k, v in src { (k): v } }
    let mut ctx = OpContext::new();
    let src = ctx.runtime.str_label("src");
    let out = ctx.runtime.str_label("out");
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");
    let k = ctx.runtime.string_to_index("k");
    let v = ctx.runtime.string_to_index("v");

    let root = eval_root(
        &mut ctx,
        vec![
            field(src, struct_lit(vec![field(a, int(1)), field(b, int(2))])),
            field(
                out,
                struct_lit(vec![embed(comprehension(
                    vec![for_clause(Some(k), v, field_ref(1, src))],
                    vec![dynamic(var(k), var(v))],
                ))]),
            ),
        ],
    );
    let out_v = ctx.lookup_arc(root, out).unwrap();
    assert_eq!(testing::field_value(&ctx, out_v, "a"), Some(Value::int(1)));
    assert_eq!(testing::field_value(&ctx, out_v, "b"), Some(Value::int(2)));
}

#[test]
fn self_cyclic_comprehension_freezes_and_converges() {
    // x: { for k, v in x { (k): v }, foo: 5 }
    // must finalize with x.foo = 5 and no other arcs.
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let foo = ctx.runtime.str_label("foo");
    let k = ctx.runtime.string_to_index("k");
    let v = ctx.runtime.string_to_index("v");

    let root = eval_root(
        &mut ctx,
        vec![field(
            x,
            struct_lit(vec![
                embed(comprehension(
                    vec![for_clause(Some(k), v, field_ref(1, x))],
                    vec![dynamic(var(k), var(v))],
                )),
                field(foo, int(5)),
            ]),
        )],
    );
    let x_v = ctx.lookup_arc(root, x).unwrap();
    assert_eq!(testing::field_value(&ctx, x_v, "foo"), Some(Value::int(5)));
    let regular: Vec<_> = ctx
        .vertex(x_v)
        .arcs
        .iter()
        .filter(|&&a| ctx.vertex(a).label.is_regular())
        .collect();
    assert_eq!(regular.len(), 1, "the projection adds no new fields");
}

#[test]
fn zero_yield_demotes_pending_arcs() {
    // empty: {}
    // out: { for k, v in empty { marker: v } }
    let mut ctx = OpContext::new();
    let empty = ctx.runtime.str_label("empty");
    let out = ctx.runtime.str_label("out");
    let marker = ctx.runtime.str_label("marker");
    let k = ctx.runtime.string_to_index("k");
    let v = ctx.runtime.string_to_index("v");

    let root = eval_root(
        &mut ctx,
        vec![
            field(empty, struct_lit(vec![])),
            field(
                out,
                struct_lit(vec![embed(comprehension(
                    vec![for_clause(Some(k), v, field_ref(1, empty))],
                    vec![field(marker, var(v))],
                ))]),
            ),
        ],
    );
    let out_v = ctx.lookup_arc(root, out).unwrap();
    assert_eq!(
        testing::field_value(&ctx, out_v, "marker"),
        None,
        "pending arcs of a zero-yield comprehension are dropped"
    );
}

#[test]
fn if_clause_filters_environments() {
    // src: {a: 1, b: 2}
    // out: { for k, v in src if v > 1 { (k): v } }
    let mut ctx = OpContext::new();
    let src = ctx.runtime.str_label("src");
    let out = ctx.runtime.str_label("out");
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");
    let k = ctx.runtime.string_to_index("k");
    let v = ctx.runtime.string_to_index("v");

    let root = eval_root(
        &mut ctx,
        vec![
            field(src, struct_lit(vec![field(a, int(1)), field(b, int(2))])),
            field(
                out,
                struct_lit(vec![embed(comprehension(
                    vec![
                        for_clause(Some(k), v, field_ref(1, src)),
                        Clause::If {
                            cond: binary(Op::Greater, var(v), int(1)),
                        },
                    ],
                    vec![dynamic(var(k), var(v))],
                ))]),
            ),
        ],
    );
    let out_v = ctx.lookup_arc(root, out).unwrap();
    assert_eq!(testing::field_value(&ctx, out_v, "a"), None);
    assert_eq!(testing::field_value(&ctx, out_v, "b"), Some(Value::int(2)));
}

#[test]
fn let_clause_binds_derived_values() {
    // src: {a: 2}
    // out: { for k, v in src let w = v * 10 { (k): w } }
    let mut ctx = OpContext::new();
    let src = ctx.runtime.str_label("src");
    let out = ctx.runtime.str_label("out");
    let a = ctx.runtime.str_label("a");
    let k = ctx.runtime.string_to_index("k");
    let v = ctx.runtime.string_to_index("v");
    let w = ctx.runtime.string_to_index("w");

    let root = eval_root(
        &mut ctx,
        vec![
            field(src, struct_lit(vec![field(a, int(2))])),
            field(
                out,
                struct_lit(vec![embed(comprehension(
                    vec![
                        for_clause(Some(k), v, field_ref(1, src)),
                        Clause::Let {
                            name: w,
                            expr: binary(Op::Multiply, var(v), int(10)),
                        },
                    ],
                    vec![dynamic(var(k), var(w))],
                ))]),
            ),
        ],
    );
    let out_v = ctx.lookup_arc(root, out).unwrap();
    assert_eq!(testing::field_value(&ctx, out_v, "a"), Some(Value::int(20)));
}
