//! Batching of a BFS wave into bounded fetch requests.

use dagsync_store::AddressSet;

/// Splits a wave of addresses into batches of at most `max_batch`
/// addresses each, sized evenly when splitting is required.
pub(crate) fn split_batches(addrs: AddressSet, max_batch: usize) -> Vec<AddressSet> {
    if addrs.is_empty() {
        return Vec::new();
    }
    if addrs.len() <= max_batch {
        return vec![addrs];
    }

    let num_batches = addrs.len() / max_batch + 1;
    let batch_size = addrs.len() / num_batches + 1;

    let mut batches = Vec::with_capacity(num_batches);
    let mut current = AddressSet::with_capacity(batch_size);
    for addr in addrs.iter() {
        current.insert(*addr);
        if current.len() == batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagsync_store::Address;

    fn addrs(n: u64) -> AddressSet {
        (0..n).map(|i| Address::of(&i.to_le_bytes())).collect()
    }

    #[test]
    fn empty_wave_yields_no_batches() {
        assert!(split_batches(AddressSet::new(), 64).is_empty());
    }

    #[test]
    fn small_wave_is_one_batch() {
        let batches = split_batches(addrs(64), 64);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 64);
    }

    #[test]
    fn oversized_wave_splits_evenly() {
        let batches = split_batches(addrs(65), 64);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() <= 64));
        assert_eq!(batches.iter().map(AddressSet::len).sum::<usize>(), 65);
    }

    #[test]
    fn every_batch_respects_bound_and_union_is_preserved() {
        for total in [1u64, 63, 64, 65, 128, 129, 200, 500] {
            let wave = addrs(total);
            let batches = split_batches(wave.clone(), 64);

            let mut union = AddressSet::new();
            for batch in &batches {
                assert!(batch.len() <= 64, "batch of {} exceeds bound for total {total}", batch.len());
                assert!(!batch.is_empty());
                union.insert_all(batch);
            }
            assert_eq!(union, wave, "coverage lost for total {total}");
        }
    }

    #[test]
    fn batches_are_disjoint() {
        let batches = split_batches(addrs(300), 64);
        let total: usize = batches.iter().map(AddressSet::len).sum();
        let mut union = AddressSet::new();
        for batch in &batches {
            union.insert_all(batch);
        }
        assert_eq!(union.len(), total);
    }
}
