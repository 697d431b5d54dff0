//! Batch planning.
//!
//! Splits an ordered collection into fixed-size batches (the last one may be
//! shorter) and groups batches into execution windows of
//! `concurrent_batches * 2`, each window dispatched in groups of
//! `concurrent_batches`.

use crate::transfer::config::BatchConfig;

/// An ordered slice of the input, identified by its 0-based index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    /// 0-based batch index for logging and retry correlation
    pub index: usize,
    /// Records in input order
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Deterministic batch partitioning.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    batch_size: usize,
    concurrent_batches: usize,
}

impl BatchPlanner {
    /// Planner for the given sizes. Zero sizes are treated as 1.
    pub fn new(batch_size: usize, concurrent_batches: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            concurrent_batches: concurrent_batches.max(1),
        }
    }

    /// Planner using the sizes of a [`BatchConfig`].
    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.batch_size, config.concurrent_batches)
    }

    /// Number of batches `len` records split into: `ceil(len / batch_size)`.
    pub fn batch_count(&self, len: usize) -> usize {
        len.div_ceil(self.batch_size)
    }

    /// Batches per execution window.
    pub fn window_size(&self) -> usize {
        self.concurrent_batches * 2
    }

    /// Batches dispatched together inside a window.
    pub fn group_size(&self) -> usize {
        self.concurrent_batches
    }

    /// Partition `items` into batches, numbering them from `first_index`.
    pub fn plan<T>(&self, items: Vec<T>, first_index: usize) -> Vec<Batch<T>> {
        let mut batches = Vec::with_capacity(self.batch_count(items.len()));
        let mut items = items.into_iter().peekable();
        let mut index = first_index;

        while items.peek().is_some() {
            let chunk: Vec<T> = items.by_ref().take(self.batch_size).collect();
            batches.push(Batch { index, items: chunk });
            index += 1;
        }

        batches
    }

    /// Group planned batches into windows, each window a list of groups.
    pub fn windows<T>(&self, batches: Vec<Batch<T>>) -> Vec<Vec<Vec<Batch<T>>>> {
        let mut windows = Vec::with_capacity(batches.len().div_ceil(self.window_size()));
        let mut batches = batches.into_iter().peekable();

        while batches.peek().is_some() {
            let mut window = Vec::with_capacity(2);
            for _ in 0..2 {
                let group: Vec<Batch<T>> = batches.by_ref().take(self.group_size()).collect();
                if group.is_empty() {
                    break;
                }
                window.push(group);
            }
            windows.push(window);
        }

        windows
    }
}
