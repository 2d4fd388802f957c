//! Outbound frame queue
//!
//! Hands frames from the caller's thread to the write drainer without
//! blocking on socket I/O.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

/// What to do with a new frame when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Evict the oldest queued frame (latest value wins)
    #[default]
    OverwriteOldest,
    /// Keep the queued frames and discard the new one
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    depth: usize,
    policy: QueuePolicy,
}

impl QueueConfig {
    pub const MAX_DEPTH: usize = 4;

    /// `depth` is clamped to `1..=MAX_DEPTH`.
    pub fn new(depth: usize, policy: QueuePolicy) -> Self {
        Self {
            depth: depth.clamp(1, Self::MAX_DEPTH),
            policy,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(1, QueuePolicy::OverwriteOldest)
    }
}

/// Bounded FIFO of outbound frames shared between `LinkManager::write` and
/// the write drainer of the current session.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    config: QueueConfig,
    ready: Notify,
}

impl FrameQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(config.depth())),
            config,
            ready: Notify::new(),
        }
    }

    /// Queue a frame. Returns `false` if a frame had to be discarded.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let mut kept_all = true;
        {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            if frames.len() >= self.config.depth() {
                kept_all = false;
                match self.config.policy() {
                    QueuePolicy::OverwriteOldest => {
                        frames.pop_front();
                    }
                    QueuePolicy::DropNewest => return false,
                }
            }
            frames.push_back(frame);
        }
        self.ready.notify_one();
        kept_all
    }

    /// Wait for the next frame in FIFO order.
    pub async fn next(&self) -> Vec<u8> {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.ready.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
