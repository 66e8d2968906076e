//! Bounded buffer → framebuffer id table.
//!
//! Registering a framebuffer is a kernel call; buffers from a fixed pool
//! come back every few frames, so their ids are kept. When the table is
//! full new buffers are simply registered per use.

use std::collections::HashMap;

use tracing::debug;

use crate::kms::{BufferId, FramebufferId};

#[derive(Debug)]
pub struct FramebufferCache {
    entries: HashMap<BufferId, FramebufferId>,
    capacity: usize,
    full_reported: bool,
}

impl FramebufferCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            full_reported: false,
        }
    }

    pub fn get(&self, buffer: BufferId) -> Option<FramebufferId> {
        self.entries.get(&buffer).copied()
    }

    /// Remember `fb` for `buffer`. Returns `false` (and caches nothing) when
    /// the table is full.
    pub fn insert(&mut self, buffer: BufferId, fb: FramebufferId) -> bool {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&buffer) {
            if !self.full_reported {
                debug!(capacity = self.capacity, "Framebuffer cache full, caching stopped");
                self.full_reported = true;
            }
            return false;
        }
        self.entries.insert(buffer, fb);
        true
    }

    /// Empty the table, returning every cached framebuffer id so the owner
    /// can remove them.
    pub fn invalidate(&mut self) -> Vec<FramebufferId> {
        self.full_reported = false;
        let mut ids: Vec<FramebufferId> = self.entries.drain().map(|(_, fb)| fb).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
