//! Frame Assembler
//!
//! The robot streams its output as a burst of small notifications with no
//! length prefix and no terminator. Chunks are cleaned and appended to a
//! pending buffer; a message is considered complete once the stream has
//! been silent for longer than the idle timeout.

use crate::domain::models::Frame;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default silence that ends a message.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Strip line endings, turn tabs into commas and collapse repeated commas.
///
/// The result contains no `\r`, `\n`, `\t` or `,,`, so applying it again is
/// a no-op.
pub fn normalize(text: &str) -> String {
    let cleaned = text
        .replace("\r\n", "")
        .replace('\n', "")
        .replace('\r', "")
        .replace('\t', ",");
    collapse_commas(cleaned)
}

fn collapse_commas(mut text: String) -> String {
    while text.contains(",,") {
        text = text.replace(",,", ",");
    }
    text
}

/// Accumulates normalized text until the stream goes quiet.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: String,
    last_receive: Option<Instant>,
    idle_timeout: Duration,
}

impl FrameAssembler {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            pending: String::new(),
            last_receive: None,
            idle_timeout,
        }
    }

    /// Append one raw notification.
    ///
    /// Chunks that are not valid UTF-8 are dropped whole and do not count as
    /// activity: the receive timestamp is left untouched.
    pub fn on_chunk_received(&mut self, bytes: &[u8], now: Instant) {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping undecodable chunk ({} bytes): {}", bytes.len(), e);
                return;
            }
        };

        let cleaned = normalize(text);
        trace!("Chunk {:?} -> {:?}", text, cleaned);
        self.pending.push_str(&cleaned);
        self.last_receive = Some(now);
    }

    /// Emit the pending text as a frame if the stream has been idle for
    /// longer than the timeout and something is pending.
    pub fn check_idle(&mut self, now: Instant) -> Option<Frame> {
        if self.pending.is_empty() {
            return None;
        }
        let last = self.last_receive?;
        if now.saturating_duration_since(last) <= self.idle_timeout {
            return None;
        }

        // Chunk boundaries can leave a ",," behind.
        let text = collapse_commas(std::mem::take(&mut self.pending));
        debug!("Frame assembled: {:?}", text);
        Some(Frame::new(text))
    }

    /// Drop any partially received text.
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} pending bytes", self.pending.len());
        }
        self.pending.clear();
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn last_receive(&self) -> Option<Instant> {
        self.last_receive
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}
