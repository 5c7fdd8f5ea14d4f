//! Message-id and sequence-number generation.

use std::time::{SystemTime, UNIX_EPOCH};

/// Generates monotonically increasing 64-bit message ids.
///
/// The upper 32 bits carry server-corrected Unix seconds; the two least
/// significant bits must be zero for client messages, so collisions within
/// one instant bump by 4.
pub struct MsgIdGen {
    last: i64,
    time_offset: i32,
}

impl MsgIdGen {
    pub fn new(time_offset: i32) -> Self {
        Self { last: 0, time_offset }
    }

    /// Clock skew versus the server, in seconds.
    pub fn time_offset(&self) -> i32 {
        self.time_offset
    }

    /// Adjust the clock skew (from a server message id).
    pub fn set_time_offset(&mut self, offset: i32) {
        self.time_offset = offset;
    }

    pub fn generate(&mut self) -> i64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = (now.as_secs() as i64).wrapping_add(i64::from(self.time_offset)) as u64;
        let nanos = u64::from(now.subsec_nanos());
        let mut id = ((secs << 32) | ((nanos << 2) & 0xffff_fffc)) as i64;
        if self.last >= id {
            id = self.last + 4;
        }
        self.last = id;
        id
    }

    /// Forget the last generated id (after a session reset).
    pub fn reset(&mut self) {
        self.last = 0;
    }
}

/// Per-session outgoing sequence numbers.
///
/// Content-related messages get odd numbers and advance the counter;
/// content-unrelated ones get the even number in between.
pub struct SeqNoGen {
    counter: i32,
}

impl SeqNoGen {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    pub fn next(&mut self, content_related: bool) -> i32 {
        let v = self.counter;
        if content_related {
            self.counter += 1;
        }
        v * 2 + i32::from(content_related)
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

impl Default for SeqNoGen {
    fn default() -> Self {
        Self::new()
    }
}
