//! Reconnect and receive-timeout bookkeeping for one connection.
//!
//! Pure state: every method takes or returns milliseconds, and the worker
//! owns the timers.

use tdmtp_mtproto::constants::{
    MAX_CONNECT_DELAY, MAX_RECEIVE_DELAY, MAX_RETRY_TIMEOUT, MIN_CONNECT_DELAY,
    MIN_RECEIVE_DELAY,
};

/// Bytes per [`Backoff::receive_budget`] step: a frame this big gets one
/// `wait_for_received` of time, bigger frames proportionally more.
const RECEIVE_BUDGET_STEP: u64 = 8_192;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    retry_timeout: u64,
    wait_for_received: u64,
    connect_timeout: u64,
    old: bool,
}

impl Default for Backoff {
    fn default() -> Self { Self::new() }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            retry_timeout: 1,
            wait_for_received: MIN_RECEIVE_DELAY,
            connect_timeout: MIN_CONNECT_DELAY,
            old: false,
        }
    }

    /// Delay before the next reconnect attempt.
    ///
    /// Grows 1, 2, 3 ms, then jumps to a second and doubles up to a minute.
    pub fn next_retry(&mut self) -> u64 {
        let delay = self.retry_timeout;
        self.retry_timeout = match self.retry_timeout {
            0..=2 => self.retry_timeout + 1,
            3 => 1_000,
            n => (n * 2).min(MAX_RETRY_TIMEOUT),
        };
        delay
    }

    /// Connect attempts give up after this many ms.
    pub fn connect_timeout(&self) -> u64 { self.connect_timeout }

    /// A connect attempt timed out; allow the next one longer.
    pub fn on_connect_timeout(&mut self) {
        self.connect_timeout = (self.connect_timeout * 2).min(MAX_CONNECT_DELAY);
    }

    /// How long to wait for an answer after sending `bytes`.
    pub fn receive_budget(&self, bytes: usize) -> u64 {
        if self.old {
            return self.wait_for_received;
        }
        let scaled = bytes as u64 * self.wait_for_received / RECEIVE_BUDGET_STEP;
        scaled.clamp(self.wait_for_received, MAX_RECEIVE_DELAY)
    }

    pub fn wait_for_received(&self) -> u64 { self.wait_for_received }

    /// A frame arrived `rtt` ms after the send that armed the timer.
    ///
    /// Resets the retry delay, makes the connection young again and
    /// tightens the receive wait toward twice the observed round trip.
    pub fn on_received(&mut self, rtt: Option<u64>) {
        self.retry_timeout = 1;
        self.old = false;
        self.connect_timeout = MIN_CONNECT_DELAY;
        if let Some(rtt) = rtt {
            if rtt * 2 < self.wait_for_received {
                self.wait_for_received = (rtt * 2).max(MIN_RECEIVE_DELAY);
            }
        }
    }

    /// Nothing arrived within the budget; the next connection waits longer.
    pub fn on_receive_timeout(&mut self) {
        if self.wait_for_received < MAX_RECEIVE_DELAY {
            self.wait_for_received = (self.wait_for_received * 2).min(MAX_RECEIVE_DELAY);
        }
    }

    /// The connection outlived the old-connection timeout.
    pub fn mark_old(&mut self) {
        self.old = true;
        self.wait_for_received = MIN_RECEIVE_DELAY;
    }

    pub fn is_old(&self) -> bool { self.old }

    /// A fresh connection is up.
    pub fn on_connected(&mut self) { self.old = false; }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_jump_then_double() {
        let mut b = Backoff::new();
        let delays: Vec<u64> = (0..12).map(|_| b.next_retry()).collect();
        assert_eq!(
            delays,
            [1, 2, 3, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 64_000, 64_000]
        );
        b.on_received(None);
        assert_eq!(b.next_retry(), 1);
    }

    #[test]
    fn receive_budget_scales_with_the_frame() {
        let mut b = Backoff::new();
        assert_eq!(b.receive_budget(100), MIN_RECEIVE_DELAY);
        assert_eq!(b.receive_budget(8_192 * 3), 3 * MIN_RECEIVE_DELAY);
        assert_eq!(b.receive_budget(10 << 20), MAX_RECEIVE_DELAY);
        b.mark_old();
        assert_eq!(b.receive_budget(10 << 20), MIN_RECEIVE_DELAY);
        b.on_received(None);
        assert!(!b.is_old());
    }

    #[test]
    fn receive_wait_doubles_and_tightens() {
        let mut b = Backoff::new();
        b.on_receive_timeout();
        b.on_receive_timeout();
        assert_eq!(b.wait_for_received(), 16_000);
        b.on_received(Some(5_000));
        assert_eq!(b.wait_for_received(), 10_000);
        b.on_received(Some(100));
        assert_eq!(b.wait_for_received(), MIN_RECEIVE_DELAY);
        for _ in 0..10 {
            b.on_receive_timeout();
        }
        assert_eq!(b.wait_for_received(), MAX_RECEIVE_DELAY);
    }

    #[test]
    fn connect_timeout_doubles_up_to_the_cap() {
        let mut b = Backoff::new();
        let mut seen = vec![b.connect_timeout()];
        for _ in 0..4 {
            b.on_connect_timeout();
            seen.push(b.connect_timeout());
        }
        assert_eq!(seen, [1_000, 2_000, 4_000, 8_000, 8_000]);
        b.on_received(None);
        assert_eq!(b.connect_timeout(), MIN_CONNECT_DELAY);
    }
}
