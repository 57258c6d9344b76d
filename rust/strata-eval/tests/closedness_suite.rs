//! Typo-check scenarios: closed embeddings, narrowing by conjoined
//! definitions, non-recursive closing, and evidence bookkeeping.

use strata_core::kind::Kind;
use strata_eval::sched::{RunMode, ALL_KNOWN};
use strata_eval::testing::{self, *};
use strata_eval::value::Value;
use strata_eval::vertex::{CloseInfo, Conjunct, Environment};
use strata_eval::OpContext;

#[test]
fn closed_embedding_admits_fields_of_embedded_schema() {
    // n: {a: 1, c: 1} with a *closed* embedded {c: 1, d: 1}:
    // a, c and d are admitted; e is not.
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let c = ctx.runtime.str_label("c");
    let d = ctx.runtime.str_label("d");
    let e = ctx.runtime.str_label("e");

    let n = ctx.runtime.str_label("n");
    let root = ctx.new_vertex(n, None);
    let env = Environment::root(root);
    let outer_ci = CloseInfo::root(&mut ctx);
    ctx.add_conjunct(
        root,
        Conjunct::new(
            env.clone(),
            struct_lit(vec![field(a, int(1)), field(c, int(1))]),
            outer_ci.clone(),
        ),
    );
    let mut embed_ci = outer_ci.spawn_embed(&mut ctx);
    embed_ci.is_closed = true;
    ctx.add_conjunct(
        root,
        Conjunct::new(
            env,
            struct_lit(vec![field(c, int(1)), field(d, int(1))]),
            embed_ci,
        ),
    );
    ctx.unify(root, ALL_KNOWN, RunMode::Finalize);

    assert!(ctx.accept(root, a), "outer field is admitted");
    assert!(ctx.accept(root, c), "shared field is admitted");
    assert!(ctx.accept(root, d), "embedded field is admitted");
    assert!(!ctx.accept(root, e), "undeclared field is rejected");
}

#[test]
fn narrowing_by_conjoined_definitions() {
    // #bar: {d: 1, e: 1}
    // #baz: {d: 1, f: 1}
    // #foo: {c: #bar & #baz, c: {d: 1, e: 1}}
    // For c: d is accepted; e and f are rejected.
    let mut ctx = OpContext::new();
    let bar = ctx.runtime.def_label("#bar");
    let baz = ctx.runtime.def_label("#baz");
    let foo = ctx.runtime.def_label("#foo");
    let c = ctx.runtime.str_label("c");
    let d = ctx.runtime.str_label("d");
    let e = ctx.runtime.str_label("e");
    let f = ctx.runtime.str_label("f");

    let root = eval_root(
        &mut ctx,
        vec![
            field(bar, struct_lit(vec![field(d, int(1)), field(e, int(1))])),
            field(baz, struct_lit(vec![field(d, int(1)), field(f, int(1))])),
            field(
                foo,
                struct_lit(vec![
                    field(
                        c,
                        binary(
                            strata_eval::value::Op::And,
                            field_ref(1, bar),
                            field_ref(1, baz),
                        ),
                    ),
                    field(c, struct_lit(vec![field(d, int(1)), field(e, int(1))])),
                ]),
            ),
        ],
    );
    let foo_v = ctx.lookup_arc(root, foo).expect("#foo exists");
    let c_v = ctx.lookup_arc(foo_v, c).expect("c exists");

    assert!(ctx.accept(c_v, d), "d is in both #bar and #baz");
    assert!(!ctx.accept(c_v, e), "e is missing from #baz");
    assert!(!ctx.accept(c_v, f), "f is missing from #bar");

    // The rejected fields surface as closedness bottoms on the arcs.
    let e_val = testing::field_value(&ctx, c_v, "e").unwrap();
    let bot = e_val.as_bottom().expect("e must be rejected");
    assert!(bot.close_check);
    assert!(bot.err.contains("field not allowed"));
    let d_val = testing::field_value(&ctx, c_v, "d").unwrap();
    assert_eq!(d_val, Value::int(1));
}

#[test]
fn once_groups_do_not_descend() {
    // close({c: {d: 1}}): the top level is closed, the nested struct
    // stays open.
    let mut ctx = OpContext::new();
    let c = ctx.runtime.str_label("c");
    let d = ctx.runtime.str_label("d");
    let x = ctx.runtime.str_label("x");

    let n = ctx.runtime.str_label("n");
    let root = ctx.new_vertex(n, None);
    let env = Environment::root(root);
    let ci = CloseInfo::root(&mut ctx).close_once(&mut ctx);
    ctx.add_conjunct(
        root,
        Conjunct::new(
            env,
            struct_lit(vec![field(c, struct_lit(vec![field(d, int(1))]))]),
            ci,
        ),
    );
    ctx.unify(root, ALL_KNOWN, RunMode::Finalize);

    assert!(!ctx.accept(root, x), "top level is closed");
    assert!(ctx.accept(root, c));
    let c_v = ctx.lookup_arc(root, c).unwrap();
    assert!(ctx.accept(c_v, x), "nested level stays open");
}

#[test]
fn definitions_and_hidden_fields_are_always_admitted() {
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let hidden = ctx.runtime.hidden_label("_h");
    let def = ctx.runtime.def_label("#d");
    let lab = ctx.runtime.let_label("l");

    let n = ctx.runtime.str_label("n");
    let root = ctx.new_vertex(n, None);
    let env = Environment::root(root);
    let ci = CloseInfo::root(&mut ctx).close_once(&mut ctx);
    ctx.add_conjunct(
        root,
        Conjunct::new(env, struct_lit(vec![field(a, int(1))]), ci),
    );
    ctx.unify(root, ALL_KNOWN, RunMode::Finalize);

    let z = ctx.runtime.str_label("z");
    assert!(ctx.accept(root, hidden));
    assert!(ctx.accept(root, def));
    assert!(ctx.accept(root, lab));
    assert!(ctx.accept(root, a));
    assert!(!ctx.accept(root, z), "regular fields stay subject to closing");
}

#[test]
fn patterns_admit_matching_fields_in_closed_structs() {
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let other = ctx.runtime.str_label("other");

    let n = ctx.runtime.str_label("n");
    let root = ctx.new_vertex(n, None);
    let env = Environment::root(root);
    let mut ci = CloseInfo::root(&mut ctx);
    ci.is_closed = true;
    ci.from_def = true;
    ctx.add_conjunct(
        root,
        Conjunct::new(
            env,
            struct_lit(vec![
                field(a, int(1)),
                pattern(basic(Kind::STRING), basic(Kind::INT)),
            ]),
            ci,
        ),
    );
    ctx.unify(root, ALL_KNOWN, RunMode::Finalize);
    assert!(ctx.accept(root, a));
    assert!(ctx.accept(root, other), "pattern admits any string label");
}

#[test]
fn openness_erases_requirements() {
    // An ellipsis in the closed struct prunes its requirement group.
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let other = ctx.runtime.str_label("other");

    let n = ctx.runtime.str_label("n");
    let root = ctx.new_vertex(n, None);
    let env = Environment::root(root);
    let mut ci = CloseInfo::root(&mut ctx);
    ci.is_closed = true;
    ci.from_def = true;
    ctx.add_conjunct(
        root,
        Conjunct::new(
            env,
            struct_lit(vec![field(a, int(1)), ellipsis()]),
            ci,
        ),
    );
    ctx.unify(root, ALL_KNOWN, RunMode::Finalize);
    assert!(ctx.accept(root, other), "ellipsis reopens the struct");
}

#[test]
fn requirements_fold_through_references() {
    // #inner: {d: 1}
    // #outer: #inner
    // n: #outer — n admits d and rejects undeclared fields; the
    // requirement of #inner is rewritten onto the new reference id.
    let mut ctx = OpContext::new();
    let inner = ctx.runtime.def_label("#inner");
    let outer = ctx.runtime.def_label("#outer");
    let n = ctx.runtime.str_label("n");
    let d = ctx.runtime.str_label("d");
    let x = ctx.runtime.str_label("x");

    let root = eval_root(
        &mut ctx,
        vec![
            field(inner, struct_lit(vec![field(d, int(1))])),
            field(outer, field_ref(0, inner)),
            field(n, field_ref(0, outer)),
        ],
    );
    let n_v = ctx.lookup_arc(root, n).unwrap();
    assert!(ctx.accept(n_v, d));
    assert!(!ctx.accept(n_v, x));
    assert_eq!(testing::field_value(&ctx, n_v, "d"), Some(Value::int(1)));
}

#[test]
fn evidence_set_grows_monotonically() {
    let mut ctx = OpContext::new();
    let a = ctx.runtime.str_label("a");
    let b = ctx.runtime.str_label("b");

    let n = ctx.runtime.str_label("n");
    let root = ctx.new_vertex(n, None);
    let env = Environment::root(root);
    let ci1 = CloseInfo::root(&mut ctx);
    ctx.add_conjunct(
        root,
        Conjunct::new(env.clone(), struct_lit(vec![field(a, int(1))]), ci1),
    );
    ctx.unify(root, ALL_KNOWN, RunMode::AttemptOnly);
    let after_one = ctx.vertex(root).conjunct_info.len();

    let ci2 = CloseInfo::root(&mut ctx);
    ctx.add_conjunct(
        root,
        Conjunct::new(env, struct_lit(vec![field(b, int(2))]), ci2),
    );
    ctx.unify(root, ALL_KNOWN, RunMode::Finalize);
    let after_two = ctx.vertex(root).conjunct_info.len();

    assert!(after_one >= 1);
    assert!(
        after_two > after_one,
        "adding conjuncts never shrinks the evidence set"
    );
    assert!(!ctx.evidence(root, a).is_empty());
    assert!(!ctx.evidence(root, b).is_empty());
}
