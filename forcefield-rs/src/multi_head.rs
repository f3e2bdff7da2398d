//! Round-robin interleaving of several datasets for multi-head training.
//!
//! Every batch of every dataset gets one slot in a flattened index space,
//! partitioned by cumulative dataset length. The slots are shuffled once per
//! epoch; each slot names a dataset, which then yields its next batch in its
//! own order. Only the interleaving is random.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Cumulative boundaries of the flattened index space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadSchedule {
    boundaries: Vec<usize>,
}

impl HeadSchedule {
    /// Schedule over datasets of the given lengths.
    pub fn new(lengths: &[usize]) -> Self {
        let boundaries = lengths
            .iter()
            .scan(0, |total, &len| {
                *total += len;
                Some(*total)
            })
            .collect();
        Self { boundaries }
    }

    /// Total number of slots.
    pub fn total(&self) -> usize {
        self.boundaries.last().copied().unwrap_or(0)
    }

    /// Dataset owning flattened index `idx`: the first boundary above it.
    pub fn source_of(&self, idx: usize) -> Option<usize> {
        self.boundaries.iter().position(|&bound| idx < bound)
    }

    /// Dataset of every step of an epoch, shuffled with `seed`.
    pub fn epoch_order(&self, seed: u64) -> Vec<usize> {
        let mut slots: Vec<usize> = (0..self.total()).collect();
        slots.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        slots
            .into_iter()
            .filter_map(|idx| self.source_of(idx))
            .collect()
    }
}

/// Iterator yielding `(dataset index, item)` in interleaved order.
pub struct Interleave<'a, T> {
    sources: &'a [Vec<T>],
    order: std::vec::IntoIter<usize>,
    cursors: Vec<usize>,
}

impl<'a, T> Iterator for Interleave<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let source = self.order.next()?;
        let cursor = self.cursors.get_mut(source)?;
        let item = self.sources.get(source)?.get(*cursor)?;
        *cursor += 1;
        Some((source, item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.order.size_hint()
    }
}

/// Interleave `sources` for one epoch.
pub fn interleave<T>(sources: &[Vec<T>], seed: u64) -> Interleave<'_, T> {
    let lengths: Vec<usize> = sources.iter().map(Vec::len).collect();
    Interleave {
        sources,
        order: HeadSchedule::new(&lengths).epoch_order(seed).into_iter(),
        cursors: vec![0; sources.len()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        let schedule = HeadSchedule::new(&[3, 5]);
        assert_eq!(schedule.total(), 8);
        assert_eq!(schedule.source_of(0), Some(0));
        assert_eq!(schedule.source_of(2), Some(0));
        assert_eq!(schedule.source_of(3), Some(1));
        assert_eq!(schedule.source_of(7), Some(1));
        assert_eq!(schedule.source_of(8), None);
    }

    #[test]
    fn test_empty_dataset_is_skipped() {
        let schedule = HeadSchedule::new(&[2, 0, 1]);
        let order = schedule.epoch_order(1);
        assert_eq!(order.len(), 3);
        assert!(!order.contains(&1));
    }

    #[test]
    fn test_interleave_keeps_dataset_order() {
        let sources = vec![vec!["a0", "a1", "a2"], vec!["b0", "b1", "b2", "b3", "b4"]];
        let visited: Vec<(usize, &str)> = interleave(&sources, 42).map(|(s, b)| (s, *b)).collect();
        assert_eq!(visited.len(), 8);

        for (source, items) in sources.iter().enumerate() {
            let drawn: Vec<&str> = visited
                .iter()
                .filter(|(s, _)| *s == source)
                .map(|(_, b)| *b)
                .collect();
            assert_eq!(&drawn, items);
        }
    }

    #[test]
    fn test_seed_changes_interleaving() {
        let schedule = HeadSchedule::new(&[10, 10]);
        assert_eq!(schedule.epoch_order(7), schedule.epoch_order(7));
        assert_ne!(schedule.epoch_order(7), schedule.epoch_order(8));
    }
}
