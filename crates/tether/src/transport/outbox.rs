// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded FIFO of serialized frames waiting for a live WebSocket link.

use std::collections::VecDeque;

use crate::config::OverflowPolicy;
use crate::error::ClientError;

#[derive(Debug)]
pub struct Outbox {
    frames: VecDeque<String>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Frames evicted under [`OverflowPolicy::DropOldest`].
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self { frames: VecDeque::new(), capacity: capacity.max(1), policy, dropped: 0 }
    }

    /// Append a frame, applying the overflow policy when full.
    pub fn push(&mut self, frame: String) -> Result<(), ClientError> {
        if self.frames.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Reject => {
                    return Err(ClientError::QueueFull { capacity: self.capacity });
                }
                OverflowPolicy::DropOldest => {
                    self.frames.pop_front();
                    self.dropped += 1;
                    tracing::warn!(
                        capacity = self.capacity,
                        dropped = self.dropped,
                        "outbound queue full, dropped oldest frame"
                    );
                }
            }
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Put frames that were handed to a link but never written back at the
    /// front, preserving their order. Ignores capacity: they were already
    /// accepted once.
    pub fn restore(&mut self, frames: Vec<String>) {
        for frame in frames.into_iter().rev() {
            self.frames.push_front(frame);
        }
    }

    /// Take every queued frame in FIFO order.
    pub fn drain(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
#[path = "outbox_tests.rs"]
mod tests;
