/// A pluggable congestion controller
///
/// Implementations own only window arithmetic; bytes-in-flight accounting lives with the ACK
/// ledgers. Times are absolute microseconds, matching the rest of the crate.
pub trait Controller: Send {
    /// Bytes of an in-flight packet were newly acknowledged
    fn on_ack(&mut self, now: u64, sent_time: u64, bytes: u64, app_limited: bool);
    /// A loss or ECN-CE signal occurred for a packet sent at `sent_time`
    fn on_congestion_event(&mut self, now: u64, sent_time: u64, persistent: bool);
    /// Current congestion window in bytes
    fn window(&self) -> u64;
}

/// New Reno, the default controller (RFC 9002 §7)
pub struct NewReno {
    window: u64,
    ssthresh: u64,
    /// Packets sent before this instant don't trigger a new recovery epoch
    recovery_start: u64,
    max_datagram_size: u64,
    minimum_window: u64,
}

impl NewReno {
    pub fn new(max_datagram_size: u64) -> Self {
        NewReno {
            window: 10 * max_datagram_size,
            ssthresh: u64::max_value(),
            recovery_start: 0,
            max_datagram_size,
            minimum_window: 2 * max_datagram_size,
        }
    }

    fn in_recovery(&self, sent_time: u64) -> bool {
        sent_time < self.recovery_start
    }
}

impl Controller for NewReno {
    fn on_ack(&mut self, _now: u64, sent_time: u64, bytes: u64, app_limited: bool) {
        if app_limited || self.in_recovery(sent_time) {
            return;
        }
        if self.window < self.ssthresh {
            // Slow start
            self.window += bytes;
        } else {
            // Congestion avoidance
            self.window += self.max_datagram_size * bytes / self.window;
        }
    }

    fn on_congestion_event(&mut self, now: u64, sent_time: u64, persistent: bool) {
        if persistent {
            self.window = self.minimum_window;
            self.recovery_start = now;
            return;
        }
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start = now;
        self.window = (self.window / 2).max(self.minimum_window);
        self.ssthresh = self.window;
    }

    fn window(&self) -> u64 {
        self.window
    }
}
