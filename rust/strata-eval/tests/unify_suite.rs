//! End-to-end unification scenarios: scalars, bounds, cycles and
//! disjunctions driven through the full scheduler.

use strata_core::kind::Kind;
use strata_eval::errors::ErrorCode;
use strata_eval::sched::{RunMode, ALL_KNOWN};
use strata_eval::testing::{self, *};
use strata_eval::value::{Op, Value};
use strata_eval::OpContext;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn assert_field(ctx: &OpContext, root: strata_eval::VertexId, name: &str, want: Value) {
    match testing::field_value(ctx, root, name) {
        Some(got) => assert_eq!(got, want, "field '{}'", name),
        None => panic!("field '{}' missing", name),
    }
}

#[test]
fn scalar_fields_finalize() {
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");
    let root = eval_root(
        &mut ctx,
        vec![field(a, int(1)), field(b, str_("hello"))],
    );
    assert_field(&ctx, root, "a", Value::int(1));
    assert_field(&ctx, root, "b", Value::string("hello"));
}

#[test]
fn conflicting_scalars_are_bottom() {
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let root = eval_root(&mut ctx, vec![field(a, int(1)), field(a, int(2))]);
    let got = testing::field_value(&ctx, root, "a").unwrap();
    let b = got.as_bottom().expect("conflict must be bottom");
    assert!(b.err.contains("conflicting values"));
}

#[test]
fn reference_resolves_through_scope() {
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");
    let root = eval_root(
        &mut ctx,
        vec![
            field(a, int(4)),
            field(b, binary(Op::Add, field_ref(0, a), int(1))),
        ],
    );
    assert_field(&ctx, root, "b", Value::int(5));
}

#[test]
fn mutual_reference_cycle_in_scalars() {
    // a: b + 10, b: a - 10, a: 5  =>  a = 5, b = -5
    init_logs();
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");
    let root = eval_root(
        &mut ctx,
        vec![
            field(a, binary(Op::Add, field_ref(0, b), int(10))),
            field(a, int(5)),
            field(b, binary(Op::Subtract, field_ref(0, a), int(10))),
        ],
    );
    assert_field(&ctx, root, "a", Value::int(5));
    assert_field(&ctx, root, "b", Value::int(-5));
}

#[test]
fn unresolvable_cycle_becomes_cycle_bottom() {
    // a: b, b: a — no concrete value arrives.
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");
    let root = eval_root(
        &mut ctx,
        vec![field(a, field_ref(0, b)), field(b, field_ref(0, a))],
    );
    let got = testing::field_value(&ctx, root, "a").unwrap();
    match got {
        Value::Bottom(bot) => assert_eq!(bot.code, ErrorCode::Cycle),
        // A tautological cycle may also settle as top.
        Value::Top => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn bound_conjunct_checks_scalar() {
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let root = eval_root(
        &mut ctx,
        vec![
            field(x, bound_int(Op::GreaterEqual, 0)),
            field(x, bound_int(Op::LessEqual, 255)),
            field(x, int(10)),
        ],
    );
    assert_field(&ctx, root, "x", Value::int(10));
}

#[test]
fn bound_violation_is_reported() {
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let root = eval_root(
        &mut ctx,
        vec![field(x, bound_int(Op::Greater, 0)), field(x, int(-3))],
    );
    let got = testing::field_value(&ctx, root, "x").unwrap();
    assert!(got.as_bottom().unwrap().err.contains("out of bound"));
}

#[test]
fn incompatible_integer_bounds_error() {
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let root = eval_root(
        &mut ctx,
        vec![field(
            x,
            binary(Op::And, bound_int(Op::Greater, 0), bound_int(Op::Less, 1)),
        )],
    );
    let got = testing::field_value(&ctx, root, "x").unwrap();
    assert!(got
        .as_bottom()
        .unwrap()
        .err
        .contains("incompatible integer bounds"));
}

#[test]
fn type_conjunct_without_scalar_stays_a_type() {
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let root = eval_root(&mut ctx, vec![field(x, basic(Kind::INT))]);
    assert_field(&ctx, root, "x", Value::BasicType(Kind::INT));
}

// ── Disjunctions ────────────────────────────────────────────────────

#[test]
fn disjunction_single_survivor_materializes() {
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let root = eval_root(
        &mut ctx,
        vec![
            field(x, disj(vec![(int(1), false), (str_("a"), false)])),
            field(x, basic(Kind::STRING)),
        ],
    );
    assert_field(&ctx, root, "x", Value::string("a"));
}

#[test]
fn disjunction_defaults_of_meet_is_meet_of_defaults() {
    // (*1 | 2) & (1 | *2)  =>  1 | 2 with no defaults.
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let root = eval_root(
        &mut ctx,
        vec![
            field(x, disj(vec![(int(1), true), (int(2), false)])),
            field(x, disj(vec![(int(1), false), (int(2), true)])),
        ],
    );
    match testing::field_value(&ctx, root, "x").unwrap() {
        Value::Disjunction(d) => {
            assert_eq!(d.num_defaults, 0, "defaults of the meet are empty");
            assert_eq!(d.values.len(), 2);
            assert!(d.values.contains(&Value::int(1)));
            assert!(d.values.contains(&Value::int(2)));
        }
        other => panic!("expected disjunction, got {:?}", other),
    }
}

#[test]
fn disjunction_keeps_single_default() {
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let root = eval_root(
        &mut ctx,
        vec![field(x, disj(vec![(int(1), true), (int(2), false)]))],
    );
    match testing::field_value(&ctx, root, "x").unwrap() {
        Value::Disjunction(d) => {
            assert_eq!(d.num_defaults, 1);
            assert_eq!(d.values[0], Value::int(1), "defaults come first");
        }
        other => panic!("expected disjunction, got {:?}", other),
    }
}

#[test]
fn nested_meet_of_disjunctions_keeps_default_arithmetic() {
    // y: ((*1|2) & (*1|2)) + 0 — the `&` is not a top-level conjunct,
    // so it evaluates through the value-level meet; 1 stays the default
    // and elides to 1 for the addition.
    let mut ctx = OpContext::new();
    let y = ctx.runtime.str_label("y");
    let root = eval_root(
        &mut ctx,
        vec![field(
            y,
            binary(
                Op::Add,
                binary(
                    Op::And,
                    disj(vec![(int(1), true), (int(2), false)]),
                    disj(vec![(int(1), true), (int(2), false)]),
                ),
                int(0),
            ),
        )],
    );
    assert_field(&ctx, root, "y", Value::int(1));
}

#[test]
fn nested_meet_with_empty_default_set_stays_incomplete() {
    // y: ((*1|2) & (1|*2)) + 0 — the default of the meet is the meet
    // of the defaults, which is empty, so the addition has no concrete
    // operand.
    let mut ctx = OpContext::new();
    let y = ctx.runtime.str_label("y");
    let root = eval_root(
        &mut ctx,
        vec![field(
            y,
            binary(
                Op::Add,
                binary(
                    Op::And,
                    disj(vec![(int(1), true), (int(2), false)]),
                    disj(vec![(int(1), false), (int(2), true)]),
                ),
                int(0),
            ),
        )],
    );
    let got = testing::field_value(&ctx, root, "y").unwrap();
    let b = got.as_bottom().expect("no default to compute with");
    assert!(b.err.contains("non-concrete"));
}

#[test]
fn empty_disjunction_collects_alternative_errors() {
    let mut ctx = OpContext::new();
    let x = ctx.runtime.str_label("x");
    let root = eval_root(
        &mut ctx,
        vec![
            field(x, disj(vec![(int(1), false), (int(2), false)])),
            field(x, basic(Kind::STRING)),
        ],
    );
    let got = testing::field_value(&ctx, root, "x").unwrap();
    let b = got.as_bottom().expect("all alternatives fail");
    assert!(b.err.contains("empty disjunction"));
}

#[test]
fn disjunction_commutes_up_to_order() {
    let build = |alts: Vec<(i64, bool)>| {
        let mut ctx = OpContext::new();
        let x = ctx.runtime.str_label("x");
        let root = eval_root(
            &mut ctx,
            vec![field(
                x,
                disj(alts.into_iter().map(|(i, d)| (int(i), d)).collect()),
            )],
        );
        let v = testing::field_value(&ctx, root, "x").unwrap();
        match v {
            Value::Disjunction(d) => {
                let mut vals: Vec<String> = d.values.iter().map(|v| v.to_string()).collect();
                vals.sort();
                (vals, d.num_defaults)
            }
            other => (vec![other.to_string()], 0),
        }
    };
    let (v1, d1) = build(vec![(1, false), (2, true), (3, false)]);
    let (v2, d2) = build(vec![(3, false), (1, false), (2, true)]);
    assert_eq!(v1, v2, "permuting alternatives preserves the result set");
    assert_eq!(d1, d2, "and the default count");
}

// ── Structs and patterns ────────────────────────────────────────────

#[test]
fn nested_structs_unify_fieldwise() {
    let mut ctx = OpContext::new();
    let outer = ctx.runtime.str_label("outer");
    let p = ctx.runtime.str_label("p");
    let q = ctx.runtime.str_label("q");
    let root = eval_root(
        &mut ctx,
        vec![
            field(outer, struct_lit(vec![field(p, int(1))])),
            field(outer, struct_lit(vec![field(q, int(2))])),
        ],
    );
    let arc = ctx
        .lookup_arc(root, outer)
        .expect("outer must exist");
    assert_eq!(ctx.vertex(arc).base_value, Some(Value::StructMarker));
    assert_field(&ctx, arc, "p", Value::int(1));
    assert_field(&ctx, arc, "q", Value::int(2));
}

#[test]
fn pattern_constraints_apply_to_matching_arcs() {
    // s: { [string]: >=0, n: 5, m: -1 } — m violates the pattern.
    let mut ctx = OpContext::new();
    let s = ctx.runtime.str_label("s");
    let n = ctx.runtime.str_label("n");
    let m = ctx.runtime.str_label("m");
    let root = eval_root(
        &mut ctx,
        vec![field(
            s,
            struct_lit(vec![
                pattern(basic(Kind::STRING), bound_int(Op::GreaterEqual, 0)),
                field(n, int(5)),
                field(m, int(-1)),
            ]),
        )],
    );
    let arc = ctx.lookup_arc(root, s).unwrap();
    assert_field(&ctx, arc, "n", Value::int(5));
    let got = testing::field_value(&ctx, arc, "m").unwrap();
    assert!(got.as_bottom().unwrap().err.contains("out of bound"));
}

#[test]
fn lists_become_integer_arcs() {
    let mut ctx = OpContext::new();
    let l = ctx.runtime.str_label("l");
    let root = eval_root(&mut ctx, vec![field(l, list(vec![int(7), int(8)], false))]);
    let arc = ctx.lookup_arc(root, l).unwrap();
    assert_eq!(ctx.vertex(arc).base_value, Some(Value::ListMarker));
    assert_eq!(ctx.vertex(arc).arcs.len(), 2);
    let first = ctx.vertex(arc).arcs[0];
    assert_eq!(ctx.vertex(first).base_value, Some(Value::int(7)));
}

#[test]
fn structural_cycles_are_reported() {
    // a: {b: a} expands forever; the recursion bound turns the tail
    // into a structural-cycle bottom instead of overflowing.
    init_logs();
    let mut ctx = OpContext::with_config(strata_eval::Config {
        check_structural: false,
        max_depth: 64,
    });
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");
    let root = eval_root(
        &mut ctx,
        vec![field(a, struct_lit(vec![field(b, field_ref(1, a))]))],
    );
    let mut cur = ctx.lookup_arc(root, a).expect("a exists");
    let mut found = false;
    for _ in 0..200 {
        if let Some(Value::Bottom(bot)) = &ctx.vertex(cur).base_value {
            assert_eq!(bot.code, ErrorCode::StructuralCycle);
            found = true;
            break;
        }
        match ctx.lookup_arc(cur, b) {
            Some(next) => cur = next,
            None => break,
        }
    }
    assert!(found, "the expansion must hit the structural-cycle bound");
}

// ── Idempotence ─────────────────────────────────────────────────────

#[test]
fn unify_twice_is_idempotent() {
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");
    let root = eval_root(
        &mut ctx,
        vec![
            field(a, int(1)),
            field(b, binary(Op::Add, field_ref(0, a), int(1))),
        ],
    );
    let before: Vec<Option<Value>> = ctx
        .vertex(root)
        .arcs
        .iter()
        .map(|&arc| ctx.vertex(arc).base_value.clone())
        .collect();
    let arc_count = ctx.vertex(root).arcs.len();
    assert!(ctx.unify(root, ALL_KNOWN, RunMode::Finalize));
    let after: Vec<Option<Value>> = ctx
        .vertex(root)
        .arcs
        .iter()
        .map(|&arc| ctx.vertex(arc).base_value.clone())
        .collect();
    assert_eq!(before, after);
    assert_eq!(arc_count, ctx.vertex(root).arcs.len());
}
