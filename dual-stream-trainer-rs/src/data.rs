//! Training streams.
//!
//! Each replica draws from two independent, unbounded streams: one of base
//! class batches and one of novel class batches. A [`TrainingStream`] wraps any
//! iterator and tags it with its [`StreamKind`]; [`CyclicSampler`] provides the
//! usual infinite source over a finite dataset, reshuffled every epoch from a
//! seeded RNG so that replicas with different ranks see different orders.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{self, DualResult, DualStreamError};
use crate::StreamKind;

/// An unbounded, independently advancing source of batches.
pub struct TrainingStream<B> {
    kind: StreamKind,
    source: Box<dyn Iterator<Item = B> + Send>,
    drawn: u64,
}

impl<B> TrainingStream<B> {
    /// Wraps an iterator as a stream of the given kind.
    ///
    /// The iterator is expected to be infinite; see [`CyclicSampler`].
    pub fn new<I>(kind: StreamKind, source: I) -> Self
    where
        I: IntoIterator<Item = B>,
        I::IntoIter: Send + 'static,
    {
        Self {
            kind,
            source: Box::new(source.into_iter()),
            drawn: 0,
        }
    }

    /// Which stream this is.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Number of batches drawn so far.
    #[must_use]
    pub fn drawn(&self) -> u64 {
        self.drawn
    }

    /// Draws the next batch.
    ///
    /// # Errors
    ///
    /// Returns a fatal `StreamExhausted` if the source ran dry.
    pub fn next_batch(&mut self) -> DualResult<B> {
        match self.source.next() {
            Some(batch) => {
                self.drawn += 1;
                Ok(batch)
            }
            None => error::fatal(DualStreamError::StreamExhausted {
                stream: self.kind,
                drawn: self.drawn,
            }),
        }
    }
}

impl<B> std::fmt::Debug for TrainingStream<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingStream")
            .field("kind", &self.kind)
            .field("drawn", &self.drawn)
            .finish_non_exhaustive()
    }
}

/// Infinite sampler over a finite dataset, reshuffled every epoch.
#[derive(Debug, Clone)]
pub struct CyclicSampler<T> {
    items: Vec<T>,
    order: Vec<usize>,
    cursor: usize,
    epoch: u64,
    shuffle: bool,
    rng: StdRng,
}

impl<T: Clone> CyclicSampler<T> {
    /// Creates a shuffling sampler seeded with `seed`.
    #[must_use]
    pub fn new(items: Vec<T>, seed: u64) -> Self {
        let mut sampler = Self {
            order: (0..items.len()).collect(),
            items,
            cursor: 0,
            epoch: 0,
            shuffle: true,
            rng: StdRng::seed_from_u64(seed),
        };
        sampler.order.shuffle(&mut sampler.rng);
        sampler
    }

    /// Creates a sampler that cycles in dataset order.
    #[must_use]
    pub fn sequential(items: Vec<T>) -> Self {
        Self {
            order: (0..items.len()).collect(),
            items,
            cursor: 0,
            epoch: 0,
            shuffle: false,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Number of completed passes over the dataset.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Dataset size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether the dataset is empty (the sampler yields nothing).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone> Iterator for CyclicSampler<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        if self.cursor == self.order.len() {
            self.cursor = 0;
            self.epoch += 1;
            if self.shuffle {
                self.order.shuffle(&mut self.rng);
            }
        }
        let item = self.items[self.order[self.cursor]].clone();
        self.cursor += 1;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_sampler_visits_every_item_per_epoch() {
        let mut sampler = CyclicSampler::new((0..10).collect::<Vec<u32>>(), 7);
        let mut first: Vec<u32> = sampler.by_ref().take(10).collect();
        first.sort_unstable();
        assert_eq!(first, (0..10).collect::<Vec<_>>());
        assert_eq!(sampler.epoch(), 0);

        let _ = sampler.next();
        assert_eq!(sampler.epoch(), 1);
    }

    #[test]
    fn test_same_seed_same_order() {
        let a: Vec<u32> = CyclicSampler::new((0..32).collect(), 3).take(64).collect();
        let b: Vec<u32> = CyclicSampler::new((0..32).collect(), 3).take(64).collect();
        let c: Vec<u32> = CyclicSampler::new((0..32).collect(), 4).take(64).collect();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sequential_order() {
        let items: Vec<u8> = CyclicSampler::sequential(vec![1, 2, 3]).take(5).collect();
        assert_eq!(items, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_stream_counts_and_exhaustion() {
        let mut stream = TrainingStream::new(StreamKind::Base, vec![1u8, 2]);
        assert_eq!(stream.next_batch().unwrap(), 1);
        assert_eq!(stream.next_batch().unwrap(), 2);
        let (err, action) = stream.next_batch().unwrap_err();
        assert!(matches!(
            err,
            DualStreamError::StreamExhausted { drawn: 2, .. }
        ));
        assert!(action.is_none());
    }

    #[test]
    fn test_empty_sampler_exhausts_stream() {
        let mut stream =
            TrainingStream::new(StreamKind::Novel, CyclicSampler::new(Vec::<u8>::new(), 0));
        assert!(stream.next_batch().is_err());
    }
}
