//! Lineage-closure computation over entries.
//!
//! A derived entry's `sources` must equal the union of its immediate
//! ancestors' `sources`. Because the invariant is enforced at every creation,
//! walking `derived_from` to the original-source leaves always agrees with
//! the closure stored on the entry itself; [`closure_holds`] checks exactly
//! that at entry creation.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::models::Entry;

/// Union of the ancestors' source ids, sorted and deduplicated.
///
/// This is the `sources` value a derived entry must carry.
pub fn union_sources(ancestors: &[Entry]) -> Vec<Uuid> {
    let set: BTreeSet<Uuid> = ancestors
        .iter()
        .flat_map(|e| e.sources.iter().copied())
        .collect();
    set.into_iter().collect()
}

/// Whether `sources` equals the union of `ancestors`' sources as sets.
pub fn closure_holds(sources: &[Uuid], ancestors: &[Entry]) -> bool {
    let expected: BTreeSet<Uuid> = ancestors
        .iter()
        .flat_map(|e| e.sources.iter().copied())
        .collect();
    let actual: BTreeSet<Uuid> = sources.iter().copied().collect();
    expected == actual
}

/// Walk `derived_from` edges down to original-source leaves, collecting the
/// source ids found there.
///
/// `lookup` resolves an entry id to its record; unknown ids are skipped by
/// returning `None` (callers that need strict resolution do it at the store
/// layer). Cycles cannot occur because entries are write-once, but visited
/// tracking keeps the walk linear on diamond-shaped lineage.
pub fn walk_to_leaves<'a, F>(roots: &[Uuid], mut lookup: F) -> Vec<Uuid>
where
    F: FnMut(Uuid) -> Option<&'a Entry>,
{
    let mut visited: BTreeSet<Uuid> = BTreeSet::new();
    let mut sources: BTreeSet<Uuid> = BTreeSet::new();
    let mut stack: Vec<Uuid> = roots.to_vec();

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(entry) = lookup(id) else { continue };
        if entry.derived_from.is_empty() {
            sources.extend(entry.sources.iter().copied());
        } else {
            stack.extend(entry.derived_from.iter().copied());
        }
    }

    sources.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn entry(sources: Vec<Uuid>, derived_from: Vec<Uuid>) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            archive_id: None,
            content: String::new(),
            sources,
            original_source: derived_from.is_empty(),
            derived_from,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_union_sources_dedups() {
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let a = entry(vec![s1, s2], vec![]);
        let b = entry(vec![s2], vec![]);
        let union = union_sources(&[a, b]);
        assert_eq!(union.len(), 2);
        assert!(union.contains(&s1));
        assert!(union.contains(&s2));
    }

    #[test]
    fn test_closure_holds_ignores_order() {
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let a = entry(vec![s1], vec![]);
        let b = entry(vec![s2], vec![]);
        assert!(closure_holds(&[s2, s1], &[a.clone(), b.clone()]));
        assert!(!closure_holds(&[s1], &[a, b]));
    }

    #[test]
    fn test_walk_matches_stored_closure() {
        // Two originals -> one intermediate -> one final; the walk from the
        // final entry must land on both originals' sources.
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let a = entry(vec![s1], vec![]);
        let b = entry(vec![s2], vec![]);
        let mid = entry(vec![s1, s2], vec![a.id, b.id]);
        let fin = entry(vec![s1, s2], vec![mid.id]);

        let map: HashMap<Uuid, Entry> = [a, b, mid, fin.clone()]
            .into_iter()
            .map(|e| (e.id, e))
            .collect();

        let walked = walk_to_leaves(&[fin.id], |id| map.get(&id));
        let mut stored = fin.sources.clone();
        stored.sort();
        assert_eq!(walked, stored);
    }

    #[test]
    fn test_walk_handles_diamond_lineage() {
        let s = Uuid::new_v4();
        let base = entry(vec![s], vec![]);
        let left = entry(vec![s], vec![base.id]);
        let right = entry(vec![s], vec![base.id]);
        let top = entry(vec![s], vec![left.id, right.id]);

        let map: HashMap<Uuid, Entry> = [base, left, right, top.clone()]
            .into_iter()
            .map(|e| (e.id, e))
            .collect();

        assert_eq!(walk_to_leaves(&[top.id], |id| map.get(&id)), vec![s]);
    }
}
