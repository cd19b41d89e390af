use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Command, TargetKey};
use crate::error::CubeError;

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Command>,
    /// Id and key of the most recently accepted command.
    last: Option<(u64, TargetKey)>,
}

/// Bounded FIFO of pending commands with one-slot supersession.
///
/// A new command whose key equals the key of the immediately preceding
/// enqueued command replaces it, provided that command has not been polled
/// yet. Non-adjacent duplicates are kept. When the queue is full new
/// commands are dropped; callers are never blocked.
#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity),
                last: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the command was dropped because the queue is full.
    pub fn enqueue(&self, command: Command) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.entries.len() >= self.capacity {
            let error = CubeError::QueueFull { capacity: self.capacity };
            tracing::debug!(
                id = command.id(),
                key = %command.target_key(),
                error = %error,
                "Dropping command"
            );
            return false;
        }

        // The last accepted command, if still pending, is always the tail.
        if let Some((last_id, last_key)) = &state.last {
            if *last_key == *command.target_key()
                && state.entries.back().map(Command::id) == Some(*last_id)
            {
                state.entries.pop_back();
                tracing::debug!(
                    removed = last_id,
                    key = %last_key,
                    superseded_by = command.id(),
                    "Removed command from queue"
                );
            }
        }

        tracing::debug!(
            id = command.id(),
            key = %command.target_key(),
            description = command.description(),
            "Command queued"
        );
        state.last = Some((command.id(), command.target_key().clone()));
        state.entries.push_back(command);
        true
    }

    /// Removes and returns the oldest pending command.
    pub fn poll(&self) -> Option<Command> {
        self.lock().entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the pending commands in queue order.
    pub fn snapshot(&self) -> Vec<Command> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.last = None;
    }
}
