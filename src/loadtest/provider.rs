//! Input data selection for virtual user iterations.

use rand::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Supplies the input for the next iteration.
///
/// Shared by every virtual user, so `next` takes `&self` and must be safe
/// to call concurrently.
pub trait DataProvider: Send + Sync {
    /// Returns the next input item.
    fn next(&self) -> &str;

    /// Number of distinct items available.
    fn len(&self) -> usize;

    /// Returns `true` if the provider has no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picks uniformly at random from a fixed pool.
#[derive(Debug, Clone)]
pub struct RandomPool {
    items: Vec<String>,
}

impl RandomPool {
    /// Creates a pool. Returns `None` if `items` is empty.
    pub fn new(items: Vec<String>) -> Option<Self> {
        (!items.is_empty()).then_some(Self { items })
    }
}

impl DataProvider for RandomPool {
    fn next(&self) -> &str {
        let idx = rand::rng().random_range(0..self.items.len());
        &self.items[idx]
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Cycles through a fixed list in order, wrapping around.
///
/// Deterministic across calls, which makes it the provider of choice for
/// tests and for replaying a known request mix.
#[derive(Debug)]
pub struct SequenceProvider {
    items: Vec<String>,
    cursor: AtomicUsize,
}

impl SequenceProvider {
    /// Creates a sequence. Returns `None` if `items` is empty.
    pub fn new(items: Vec<String>) -> Option<Self> {
        (!items.is_empty()).then_some(Self {
            items,
            cursor: AtomicUsize::new(0),
        })
    }
}

impl DataProvider for SequenceProvider {
    fn next(&self) -> &str {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.items.len();
        &self.items[idx]
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
