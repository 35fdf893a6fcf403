//! Command/Response Stack
//!
//! The robot protocol carries no request ids. Every command sent is pushed
//! here, and the next frame to arrive is attributed to the most recent
//! command. This only holds while at most one command awaits its reply.

use crate::domain::models::{CommandToken, Frame};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Default number of commands remembered.
pub const DEFAULT_CAPACITY: usize = 15;

/// Bounded LIFO of command/response pairs; the oldest entry is evicted when
/// a push would exceed the capacity.
#[derive(Debug, Clone)]
pub struct CommandStack {
    tokens: VecDeque<CommandToken>,
    capacity: usize,
}

impl CommandStack {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            tokens: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Record a freshly sent command.
    pub fn push_command(&mut self, command: impl Into<String>) {
        self.push(CommandToken::new(command));
    }

    pub fn push(&mut self, token: CommandToken) {
        self.tokens.push_back(token);
        while self.tokens.len() > self.capacity {
            if let Some(evicted) = self.tokens.pop_front() {
                trace!("Evicted command {:?}", evicted.command);
            }
        }
    }

    pub fn pop(&mut self) -> Option<CommandToken> {
        self.tokens.pop_back()
    }

    pub fn top(&self) -> Option<&CommandToken> {
        self.tokens.back()
    }

    /// Attach `frame` to the most recent command. Returns the updated
    /// token, or `None` (frame dropped) when no command is pending.
    pub fn attach_response(&mut self, frame: &Frame) -> Option<&CommandToken> {
        let Some(mut top) = self.pop() else {
            debug!("Dropping frame with no pending command: {:?}", frame.as_str());
            return None;
        };
        top.response = frame.as_str().to_string();
        self.push(top);
        self.top()
    }

    /// Response of the most recent command, empty if none.
    pub fn peek_top_response(&self) -> &str {
        self.top().map(|t| t.response.as_str()).unwrap_or("")
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &CommandToken> {
        self.tokens.iter()
    }
}

impl Default for CommandStack {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
