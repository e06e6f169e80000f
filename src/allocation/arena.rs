//! Generational arena for recovery attempts
//!
//! Attempts live in a [`Slab`], which reuses the key of a removed attempt.
//! Every insert takes a fresh generation, so a handle to a removed attempt
//! resolves to nothing instead of to whatever attempt took its key.

use serde::{Deserialize, Serialize};
use slab::Slab;
use std::fmt;

/// Reference to a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptHandle {
    index: usize,
    generation: u32,
}

impl AttemptHandle {
    pub fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for AttemptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt-{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: T,
}

#[derive(Debug)]
pub struct Arena<T> {
    entries: Slab<Entry<T>>,
    next_generation: u32,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            entries: Slab::new(),
            next_generation: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> AttemptHandle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.entries.insert(Entry { generation, value });
        AttemptHandle::new(index, generation)
    }

    pub fn get(&self, handle: AttemptHandle) -> Option<&T> {
        self.entries
            .get(handle.index)
            .filter(|e| e.generation == handle.generation)
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, handle: AttemptHandle) -> Option<&mut T> {
        self.entries
            .get_mut(handle.index)
            .filter(|e| e.generation == handle.generation)
            .map(|e| &mut e.value)
    }

    pub fn remove(&mut self, handle: AttemptHandle) -> Option<T> {
        self.get(handle)?;
        self.entries.try_remove(handle.index).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
