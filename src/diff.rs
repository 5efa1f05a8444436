//! Incremental list reconciliation.
//!
//! Transforms a view's current id sequence into fresh query results using
//! contiguous range operations, so observers see one insert or remove per
//! divergent region instead of per-element churn. The reference sequence
//! may arrive in chunks; callers hold the two cursors across calls and
//! finish with [`complete_synchronize_list`] once the final chunk is in.

/// Mutation sink for the reconciliation walk.
///
/// Implementors own the live sequence: `insert_range` and `remove_range`
/// mutate it directly and `current` exposes the mutated state back to the
/// walk. `insert_range` returns the number of elements actually inserted,
/// which may be less than `count` when the implementor filters elements
/// out (for example a view refusing its own self-contact).
pub trait ListMutator {
    type Id: Copy + PartialEq;

    /// The live sequence being reconciled.
    fn current(&self) -> &[Self::Id];

    /// Insert `count` elements from `source[source_index..]` at `index`.
    /// Returns how many were actually inserted.
    fn insert_range(
        &mut self,
        index: usize,
        count: usize,
        source: &[Self::Id],
        source_index: usize,
    ) -> usize;

    /// Remove `count` elements starting at `index`.
    fn remove_range(&mut self, index: usize, count: usize);
}

enum Step {
    Advanced,
    NeedsMoreData,
    Exhausted,
}

fn sync_step<M: ListMutator>(
    agent: &mut M,
    cache_index: &mut usize,
    reference: &[M::Id],
    ref_index: &mut usize,
    reference_complete: bool,
) -> Step {
    if *ref_index >= reference.len() {
        return Step::Exhausted;
    }

    let cache_len = agent.current().len();
    if *cache_index >= cache_len {
        if !reference_complete {
            // Trailing insertions wait for the final chunk, in case later
            // results reorder rather than extend
            return Step::NeedsMoreData;
        }
        let count = reference.len() - *ref_index;
        let inserted = agent.insert_range(cache_len, count, reference, *ref_index);
        *cache_index += inserted;
        *ref_index += count;
        return Step::Advanced;
    }

    let cached = agent.current()[*cache_index];
    let wanted = reference[*ref_index];

    if cached == wanted {
        *cache_index += 1;
        *ref_index += 1;
        return Step::Advanced;
    }

    // Reconverge: the nearer of "wanted appears later in the cache" (a
    // remove batch) and "cached appears later in the reference" (an
    // insert batch) decides which single range operation to emit.
    let remove_count = agent.current()[*cache_index..]
        .iter()
        .position(|id| *id == wanted);
    let insert_count = reference[*ref_index..]
        .iter()
        .position(|id| *id == cached);

    match (remove_count, insert_count) {
        (Some(rc), None) => {
            agent.remove_range(*cache_index, rc);
            Step::Advanced
        }
        (Some(rc), Some(ic)) if rc <= ic => {
            agent.remove_range(*cache_index, rc);
            Step::Advanced
        }
        (_, Some(ic)) => {
            let inserted = agent.insert_range(*cache_index, ic, reference, *ref_index);
            *cache_index += inserted;
            *ref_index += ic;
            Step::Advanced
        }
        (None, None) => {
            if !reference_complete {
                // Either element may still turn up in a later chunk
                return Step::NeedsMoreData;
            }
            // Genuinely disjoint pair: replace one-for-one
            agent.remove_range(*cache_index, 1);
            let inserted = agent.insert_range(*cache_index, 1, reference, *ref_index);
            *cache_index += inserted;
            *ref_index += 1;
            Step::Advanced
        }
    }
}

/// Reconcile as far as the available reference data allows.
///
/// Call once per result chunk with the cursors carried over; regions whose
/// fate cannot be decided yet (elements that may reappear in a later
/// chunk) are left untouched for [`complete_synchronize_list`].
pub fn synchronize_list<M: ListMutator>(
    agent: &mut M,
    cache_index: &mut usize,
    reference: &[M::Id],
    ref_index: &mut usize,
) {
    loop {
        match sync_step(agent, cache_index, reference, ref_index, false) {
            Step::Advanced => continue,
            Step::NeedsMoreData | Step::Exhausted => return,
        }
    }
}

/// Finish reconciliation once the reference sequence is complete: resolve
/// any deferred regions, remove the unmatched cache tail and append the
/// unmatched reference tail.
pub fn complete_synchronize_list<M: ListMutator>(
    agent: &mut M,
    cache_index: &mut usize,
    reference: &[M::Id],
    ref_index: &mut usize,
) {
    loop {
        match sync_step(agent, cache_index, reference, ref_index, true) {
            Step::Advanced => continue,
            Step::NeedsMoreData | Step::Exhausted => break,
        }
    }

    let cache_len = agent.current().len();
    if *cache_index < cache_len {
        agent.remove_range(*cache_index, cache_len - *cache_index);
    }
}
