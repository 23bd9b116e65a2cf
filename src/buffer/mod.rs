//! Self-tuning growable buffer
//!
//! Holds completed inbound packets and queued outbound commands. Capacity
//! grows geometrically on demand and is only reconsidered for shrinking once
//! per window of `shrink_after_rounds` clears, using the average fill level
//! over that window. A single burst therefore does not pin peak capacity
//! forever, and quiet rounds do not cause an allocation per round.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Out of memory growing buffer to {requested} elements")]
    OutOfMemory { requested: usize },
}

/// Sizing policy for a [`GrowableBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Elements allocated up front
    #[serde(default = "default_capacity")]
    pub initial_capacity: usize,
    /// Capacity is never shrunk below this
    #[serde(default = "default_capacity")]
    pub min_capacity: usize,
    /// Clears between shrink decisions
    #[serde(default = "default_shrink_after_rounds")]
    pub shrink_after_rounds: u32,
}

fn default_capacity() -> usize {
    16
}

fn default_shrink_after_rounds() -> u32 {
    100
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_capacity: default_capacity(),
            min_capacity: default_capacity(),
            shrink_after_rounds: default_shrink_after_rounds(),
        }
    }
}

/// Append-only buffer drained through a cursor, cleared once per round
#[derive(Debug)]
pub struct GrowableBuffer<T> {
    items: Vec<T>,
    /// Managed capacity; `items.capacity()` is always at least this
    capacity: usize,
    cursor: usize,
    config: BufferConfig,
    rounds_since_resize: u32,
    cumulative_size_since_resize: u64,
}

impl<T> GrowableBuffer<T> {
    /// Create a buffer with `config.initial_capacity` slots allocated
    pub fn new(config: BufferConfig) -> Result<Self, BufferError> {
        let capacity = config.initial_capacity.max(config.min_capacity).max(1);
        let mut items = Vec::new();
        items
            .try_reserve_exact(capacity)
            .map_err(|_| BufferError::OutOfMemory { requested: capacity })?;

        Ok(Self {
            items,
            capacity,
            cursor: 0,
            config,
            rounds_since_resize: 0,
            cumulative_size_since_resize: 0,
        })
    }

    /// Logical element count
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Allocated capacity in elements
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements not yet returned by [`next_item`](Self::next_item)
    pub fn remaining(&self) -> usize {
        self.items.len() - self.cursor
    }

    pub fn rounds_since_resize(&self) -> u32 {
        self.rounds_since_resize
    }

    pub fn cumulative_size_since_resize(&self) -> u64 {
        self.cumulative_size_since_resize
    }

    /// Append an element, doubling capacity when full
    pub fn push(&mut self, item: T) -> Result<(), BufferError> {
        if self.items.len() == self.capacity {
            let new_capacity = (self.capacity * 2).max(self.config.min_capacity).max(1);
            self.items
                .try_reserve_exact(new_capacity - self.items.len())
                .map_err(|_| BufferError::OutOfMemory {
                    requested: new_capacity,
                })?;
            tracing::trace!("Buffer grew {} -> {}", self.capacity, new_capacity);
            self.capacity = new_capacity;
            self.rounds_since_resize = 0;
            self.cumulative_size_since_resize = 0;
        }
        self.items.push(item);
        Ok(())
    }

    /// Return the element at the cursor and advance past it
    ///
    /// Returns `None` once every element has been read; only
    /// [`clear`](Self::clear) restarts the buffer.
    pub fn next_item(&mut self) -> Option<&T> {
        let item = self.items.get(self.cursor)?;
        self.cursor += 1;
        Some(item)
    }

    /// End a round: drop all elements, keep capacity, update usage history,
    /// then let [`maybe_shrink`](Self::maybe_shrink) act on it.
    pub fn clear(&mut self) {
        self.cumulative_size_since_resize += self.items.len() as u64;
        self.rounds_since_resize = self.rounds_since_resize.saturating_add(1);
        self.items.clear();
        self.cursor = 0;
        self.maybe_shrink();
    }

    /// Shrink towards the average observed size once a full window of rounds
    /// has passed. Returns whether capacity changed.
    pub fn maybe_shrink(&mut self) -> bool {
        if self.rounds_since_resize < self.config.shrink_after_rounds {
            return false;
        }

        let rounds = self.rounds_since_resize as u64;
        let average = self.cumulative_size_since_resize.div_ceil(rounds) as usize;
        let target = average
            .saturating_mul(2)
            .max(self.config.min_capacity)
            .max(self.items.len())
            .max(1);

        self.rounds_since_resize = 0;
        self.cumulative_size_since_resize = 0;

        if target.saturating_mul(2) > self.capacity {
            return false;
        }

        tracing::debug!(
            "Buffer shrinking {} -> {} (average {} over {} rounds)",
            self.capacity,
            target,
            average,
            rounds
        );
        self.items.shrink_to(target);
        self.capacity = target;
        true
    }
}
