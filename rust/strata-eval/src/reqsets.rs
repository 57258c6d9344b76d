//! Requirement sets: the typo-check algebra.
//!
//! While conjuncts are inserted, each vertex records which schemas
//! *require* evidence for its fields. The requirements are a set of
//! sets of `defID`s, stored flat: a head entry spans itself and
//! `size - 1` non-head entries; members of a group satisfy the head
//! (logical OR), and the groups combine by AND. References, embeddings
//! and definitions fold into the sets through the `replace_ids`
//! rewriting rules.

/// Schema-invocation identity; the atom of the typo-check algebra.
/// `DefId(0)` is reserved: it is both "no id" and the delete sentinel
/// of the rewrite rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DefId(pub u32);

impl DefId {
    pub const NONE: DefId = DefId(0);
    pub const DELETE: DefId = DefId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// One entry of the flat requirement array. Heads have `size >= 1`;
/// non-heads have `size == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Req {
    pub id: DefId,
    pub size: u32,
    /// Non-recursive requirement; dropped on descent into child arcs.
    pub once: bool,
}

/// A rewrite rule for `replace_ids`.
///
/// - `from -> to`: substitute `to` for `from` everywhere.
/// - `from -> to` with `add`: append `to` to the group headed by `from`.
/// - `from -> DefId::DELETE`: remove the whole group containing `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceRule {
    pub from: DefId,
    pub to: DefId,
    pub add: bool,
}

impl ReplaceRule {
    pub fn replace(from: DefId, to: DefId) -> ReplaceRule {
        ReplaceRule {
            from,
            to,
            add: false,
        }
    }

    pub fn embed(from: DefId, to: DefId) -> ReplaceRule {
        ReplaceRule {
            from,
            to,
            add: true,
        }
    }

    pub fn delete(from: DefId) -> ReplaceRule {
        ReplaceRule {
            from,
            to: DefId::DELETE,
            add: false,
        }
    }
}

/// Evidence flags recorded per contributing conjunct of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConjunctFlags {
    pub id: DefId,
    pub has_top: bool,
    pub has_struct: bool,
    pub has_ellipsis: bool,
    pub has_open_validator: bool,
}

impl ConjunctFlags {
    pub fn new(id: DefId) -> ConjunctFlags {
        ConjunctFlags {
            id,
            has_top: false,
            has_struct: false,
            has_ellipsis: false,
            has_open_validator: false,
        }
    }

    /// Openness erases the requirement headed by this conjunct.
    pub fn is_open(&self) -> bool {
        (self.has_top && !self.has_struct) || self.has_ellipsis || self.has_open_validator
    }
}

/// The flat set-of-sets of required schema ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReqSets(Vec<Req>);

impl ReqSets {
    pub fn new() -> ReqSets {
        ReqSets::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[Req] {
        &self.0
    }

    /// Iterate over head-delimited groups.
    pub fn groups(&self) -> impl Iterator<Item = &[Req]> {
        GroupIter {
            entries: &self.0,
            pos: 0,
        }
    }

    /// Append a requirement group, head first. A group whose head is
    /// already present is not duplicated.
    pub fn add_group(&mut self, ids: &[DefId], once: bool) {
        debug_assert!(!ids.is_empty());
        if self.groups().any(|g| g[0].id == ids[0]) {
            return;
        }
        self.0.push(Req {
            id: ids[0],
            size: ids.len() as u32,
            once,
        });
        for id in &ids[1..] {
            self.0.push(Req {
                id: *id,
                size: 0,
                once: false,
            });
        }
        self.assert_valid();
    }

    /// Drop non-recursive groups; called when requirements descend into
    /// a child arc.
    pub fn filter_non_recursive(&mut self) {
        let mut out = Vec::with_capacity(self.0.len());
        for g in self.groups() {
            if !g[0].once {
                out.extend_from_slice(g);
            }
        }
        self.0 = out;
        self.assert_valid();
    }

    /// Apply rewrite rules to every group.
    ///
    /// For each head: a delete rule naming any member drops the whole
    /// group; replace rules substitute member ids in place; then the
    /// group is closed transitively under the additive rules and
    /// deduplicated by identity. The rewritten group is emitted in
    /// place with its size set to the closure length.
    pub fn replace_ids(&mut self, rules: &[ReplaceRule]) {
        let mut out: Vec<Req> = Vec::with_capacity(self.0.len());
        'groups: for g in self.groups() {
            let mut buf: Vec<DefId> = Vec::with_capacity(g.len());
            for m in g {
                let mut id = m.id;
                for r in rules.iter().filter(|r| !r.add) {
                    if r.from == id {
                        if r.to == DefId::DELETE {
                            continue 'groups;
                        }
                        id = r.to;
                        break;
                    }
                }
                if !buf.contains(&id) {
                    buf.push(id);
                }
            }
            // Transitive closure under the additive rules.
            let mut j = 0;
            while j < buf.len() {
                let cur = buf[j];
                for r in rules.iter().filter(|r| r.add && r.from == cur) {
                    if !buf.contains(&r.to) {
                        buf.push(r.to);
                    }
                }
                j += 1;
            }
            out.push(Req {
                id: buf[0],
                size: buf.len() as u32,
                once: g[0].once,
            });
            for id in &buf[1..] {
                out.push(Req {
                    id: *id,
                    size: 0,
                    once: false,
                });
            }
        }
        self.0 = out;
        self.assert_valid();
    }

    /// The evidence check: every group must contain at least one of the
    /// evidence ids. Groups whose head conjunct is open are pruned
    /// first. Returns the head of the first unsatisfied group.
    pub fn unsatisfied(&self, evidence: &[DefId], flags: &[ConjunctFlags]) -> Option<DefId> {
        for g in self.groups() {
            let head = g[0].id;
            if flags.iter().any(|f| f.id == head && f.is_open()) {
                continue;
            }
            if !g.iter().any(|m| evidence.contains(&m.id)) {
                return Some(head);
            }
        }
        None
    }

    /// Structural invariants of the flat encoding; debug builds panic
    /// on violation.
    pub fn assert_valid(&self) {
        debug_assert!(self.validate(), "malformed reqSets: {:?}", self.0);
    }

    pub fn validate(&self) -> bool {
        let mut i = 0;
        let mut total = 0usize;
        while i < self.0.len() {
            let head = &self.0[i];
            if head.size == 0 {
                return false;
            }
            let span = head.size as usize;
            if i + span > self.0.len() {
                return false;
            }
            if self.0[i + 1..i + span].iter().any(|m| m.size != 0) {
                return false;
            }
            total += span;
            i += span;
        }
        total == self.0.len()
    }
}

impl ReqSets {
    /// Conjoin another requirement set: groups whose head is not yet
    /// present are appended.
    pub fn merge(&mut self, other: &ReqSets) {
        for g in other.groups() {
            let ids: Vec<DefId> = g.iter().map(|m| m.id).collect();
            self.add_group(&ids, g[0].once);
        }
    }
}

struct GroupIter<'a> {
    entries: &'a [Req],
    pos: usize,
}

impl<'a> Iterator for GroupIter<'a> {
    type Item = &'a [Req];

    fn next(&mut self) -> Option<&'a [Req]> {
        if self.pos >= self.entries.len() {
            return None;
        }
        let size = self.entries[self.pos].size as usize;
        debug_assert!(size >= 1);
        let g = &self.entries[self.pos..self.pos + size];
        self.pos += size;
        Some(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(sets: &ReqSets) -> Vec<(u32, u32)> {
        sets.entries().iter().map(|r| (r.id.0, r.size)).collect()
    }

    #[test]
    fn add_group_encodes_head_and_members() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1), DefId(2)], false);
        r.add_group(&[DefId(3)], false);
        assert_eq!(ids(&r), vec![(1, 2), (2, 0), (3, 1)]);
        assert!(r.validate());
    }

    #[test]
    fn duplicate_heads_are_not_added() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1)], false);
        r.add_group(&[DefId(1), DefId(9)], false);
        assert_eq!(ids(&r), vec![(1, 1)]);
    }

    #[test]
    fn replace_substitutes_in_all_groups() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1), DefId(2)], false);
        r.add_group(&[DefId(2)], false);
        r.replace_ids(&[ReplaceRule::replace(DefId(2), DefId(7))]);
        assert_eq!(ids(&r), vec![(1, 2), (7, 0), (7, 1)]);
        assert!(r.validate());
    }

    #[test]
    fn embed_appends_to_equivalence_class() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1)], false);
        r.replace_ids(&[ReplaceRule::embed(DefId(1), DefId(5))]);
        assert_eq!(ids(&r), vec![(1, 2), (5, 0)]);
    }

    #[test]
    fn additive_closure_is_transitive_and_deduplicated() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1)], false);
        r.replace_ids(&[
            ReplaceRule::embed(DefId(1), DefId(2)),
            ReplaceRule::embed(DefId(2), DefId(3)),
            ReplaceRule::embed(DefId(3), DefId(1)),
        ]);
        assert_eq!(ids(&r), vec![(1, 3), (2, 0), (3, 0)]);
        assert!(r.validate());
    }

    #[test]
    fn delete_removes_whole_group() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1), DefId(2)], false);
        r.add_group(&[DefId(3)], false);
        r.replace_ids(&[ReplaceRule::delete(DefId(2))]);
        assert_eq!(ids(&r), vec![(3, 1)]);
    }

    #[test]
    fn filter_non_recursive_drops_once_groups() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1)], true);
        r.add_group(&[DefId(2)], false);
        r.filter_non_recursive();
        assert_eq!(ids(&r), vec![(2, 1)]);
    }

    #[test]
    fn unsatisfied_reports_first_failing_head() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1), DefId(2)], false);
        r.add_group(&[DefId(3)], false);
        let flags = [ConjunctFlags::new(DefId(1)), ConjunctFlags::new(DefId(3))];
        assert_eq!(r.unsatisfied(&[DefId(2), DefId(3)], &flags), None);
        assert_eq!(r.unsatisfied(&[DefId(2)], &flags), Some(DefId(3)));
        assert_eq!(r.unsatisfied(&[], &flags), Some(DefId(1)));
    }

    #[test]
    fn open_head_prunes_its_group() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1)], false);
        let mut f = ConjunctFlags::new(DefId(1));
        f.has_ellipsis = true;
        assert_eq!(r.unsatisfied(&[], &[f]), None);
        let mut g = ConjunctFlags::new(DefId(1));
        g.has_top = true;
        assert_eq!(r.unsatisfied(&[], &[g]), None);
        g.has_struct = true;
        assert_eq!(r.unsatisfied(&[], &[g]), Some(DefId(1)));
    }

    #[test]
    fn invariants_hold_after_rule_sequences() {
        let mut r = ReqSets::new();
        r.add_group(&[DefId(1)], false);
        r.add_group(&[DefId(2), DefId(3)], false);
        r.replace_ids(&[ReplaceRule::embed(DefId(1), DefId(4))]);
        r.replace_ids(&[ReplaceRule::replace(DefId(4), DefId(5))]);
        r.replace_ids(&[ReplaceRule::delete(DefId(3))]);
        assert!(r.validate());
        let total: u32 = r
            .groups()
            .map(|g| g[0].size)
            .sum();
        assert_eq!(total as usize, r.entries().len());
    }
}
