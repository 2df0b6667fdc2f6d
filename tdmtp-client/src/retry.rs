//! Retry policies for `FLOOD_WAIT`, internal server errors and transient I/O errors.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use tracing::info;

use crate::errors::InvocationError;

/// Longest pause between retries of a call the server failed internally.
const MAX_SERVER_ERROR_DELAY: Duration = Duration::from_secs(60);

/// Controls how the client reacts when a call fails.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    pub fail_count:   NonZeroU32,
    pub slept_so_far: Duration,
    pub error:        InvocationError,
}

/// Never retry.
pub struct NoRetries;
impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Sleep on short `FLOOD_WAIT`s, back off on internal server errors and
/// retry once on I/O errors.
///
/// Internal errors (negative codes and 5xx) wait one second, doubling per
/// failure up to a minute.
pub struct AutoSleep {
    pub threshold:             Duration,
    pub io_errors_as_flood_of: Option<Duration>,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self {
            threshold:             Duration::from_secs(60),
            io_errors_as_flood_of: Some(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if let Some(secs) = ctx.error.flood_wait_seconds() {
            if secs <= self.threshold.as_secs() {
                info!("[tdmtp] FLOOD_WAIT_{secs}, sleeping before retry");
                return ControlFlow::Continue(Duration::from_secs(secs));
            }
            return ControlFlow::Break(());
        }
        if let InvocationError::Rpc(e) = &ctx.error {
            if e.is_server_side() {
                let shift = (ctx.fail_count.get() - 1).min(6);
                let delay = Duration::from_secs(1 << shift).min(MAX_SERVER_ERROR_DELAY);
                info!("[tdmtp] server error {}, retrying in {delay:?}", e.code);
                return ControlFlow::Continue(delay);
            }
        }
        if matches!(ctx.error, InvocationError::Io(_)) && ctx.fail_count.get() == 1 {
            if let Some(d) = self.io_errors_as_flood_of {
                info!("[tdmtp] I/O error, sleeping {d:?} before retry");
                return ControlFlow::Continue(d);
            }
        }
        ControlFlow::Break(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RpcError;

    fn ctx(fail_count: u32, error: InvocationError) -> RetryContext {
        RetryContext {
            fail_count: NonZeroU32::new(fail_count).unwrap(),
            slept_so_far: Duration::ZERO,
            error,
        }
    }

    fn rpc(code: i32, message: &str) -> InvocationError {
        InvocationError::Rpc(RpcError::from_telegram(code, message))
    }

    #[test]
    fn short_flood_waits_are_slept_off() {
        let policy = AutoSleep::default();
        assert_eq!(
            policy.should_retry(&ctx(1, rpc(420, "FLOOD_WAIT_7"))),
            ControlFlow::Continue(Duration::from_secs(7))
        );
        assert_eq!(policy.should_retry(&ctx(1, rpc(420, "FLOOD_WAIT_3600"))), ControlFlow::Break(()));
    }

    #[test]
    fn server_errors_back_off_up_to_a_minute() {
        let policy = AutoSleep::default();
        let delays: Vec<_> = (1..=8)
            .map(|n| match policy.should_retry(&ctx(n, rpc(500, "INTERNAL"))) {
                ControlFlow::Continue(d) => d.as_secs(),
                ControlFlow::Break(()) => 0,
            })
            .collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 32, 60, 60]);
        assert!(policy.should_retry(&ctx(1, rpc(-503, "Timeout"))).is_continue());
        assert!(policy.should_retry(&ctx(1, rpc(400, "PEER_ID_INVALID"))).is_break());
    }

    #[test]
    fn io_errors_retry_once() {
        let policy = AutoSleep::default();
        let io = || InvocationError::Io(std::io::Error::other("reset"));
        assert!(policy.should_retry(&ctx(1, io())).is_continue());
        assert!(policy.should_retry(&ctx(2, io())).is_break());
        assert!(NoRetries.should_retry(&ctx(1, io())).is_break());
    }
}
