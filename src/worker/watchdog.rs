//! Request-timeout watchdog and the shared cells it races the main loop on.

use crate::http::response::Output;
use crate::worker::channel::ResponseWriter;
use log::error;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Unix seconds when handler dispatch entered; 0 while idle. Published with
/// release ordering by the request loop, read with acquire by the watchdog.
static PROCESSED_STARTED_AT: AtomicU64 = AtomicU64::new(0);

/// Send guard: whoever flips this false→true owns the response for the
/// current request. Loser does nothing (main loop) or is already dead
/// (watchdog exited the process).
static JUST_SENT: AtomicBool = AtomicBool::new(false);

/// Effective deadline for the current request, in seconds. Re-armed by the
/// request loop each iteration, raised live by `Output::set_timeout`.
static REQUEST_TIMEOUT_SECS: AtomicU64 = AtomicU64::new(0);

#[inline]
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[inline]
pub(crate) fn mark_processing_started() {
    PROCESSED_STARTED_AT.store(unix_now(), Ordering::Release);
}

#[inline]
pub(crate) fn mark_processing_done() {
    PROCESSED_STARTED_AT.store(0, Ordering::Release);
}

#[inline]
pub(crate) fn arm_request_timeout(limit: Duration) {
    // Sub-second limits still get one full watchdog tick.
    REQUEST_TIMEOUT_SECS.store(limit.as_secs().max(1), Ordering::Release);
}

/// Raises the deadline for the in-flight request only; the next iteration
/// re-arms the configured limit.
#[inline]
pub(crate) fn override_request_timeout(limit: Duration) {
    arm_request_timeout(limit);
}

/// Wins the right to answer the current request. At most one caller per
/// iteration succeeds.
#[inline]
pub(crate) fn claim_send_slot() -> bool {
    JUST_SENT
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Re-opens the send slot for the next iteration.
#[inline]
pub(crate) fn release_send_slot() {
    JUST_SENT.store(false, Ordering::Release);
}

/// The watchdog's trigger condition, kept pure for testing.
#[inline]
pub(crate) fn deadline_exceeded(started_at: u64, now: u64, limit_secs: u64) -> bool {
    started_at != 0 && now.saturating_sub(started_at) > limit_secs
}

/// Spawns the watchdog task.
///
/// Every second it samples the shared cells; once a request overruns its
/// deadline and the CAS is won, it emits a `504` frame, closes the control
/// socket and forces the process to exit. Shutdown hooks deliberately do
/// not run on this path.
pub(crate) fn spawn(writer: ResponseWriter) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_secs(1)).await;

            let started_at = PROCESSED_STARTED_AT.load(Ordering::Acquire);
            let limit = REQUEST_TIMEOUT_SECS.load(Ordering::Acquire);
            if !deadline_exceeded(started_at, unix_now(), limit) {
                continue;
            }
            if !claim_send_slot() {
                continue;
            }

            error!("request exceeded its {limit}s deadline; answering 504 and exiting");

            let mut output = Output::new();
            output.set_keep_alive(false);
            output.reset_to_status(504);
            output.build_headers();

            if let Err(e) = writer
                .send(false, output.headers_buffer().as_slice(), &[])
                .await
            {
                error!("could not deliver the 504 response: {e}");
            }
            writer.shutdown().await;

            std::process::exit(0);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_rules() {
        // idle worker never triggers
        assert!(!deadline_exceeded(0, 1_000, 5));

        // within the limit
        assert!(!deadline_exceeded(1_000, 1_003, 5));
        assert!(!deadline_exceeded(1_000, 1_005, 5));

        // past the limit
        assert!(deadline_exceeded(1_000, 1_006, 5));
        assert!(deadline_exceeded(1_000, 2_000, 5));

        // clock went backwards: treated as not exceeded
        assert!(!deadline_exceeded(1_000, 999, 5));
    }

    #[test]
    fn send_slot_is_exclusive() {
        release_send_slot();
        assert!(claim_send_slot());
        assert!(!claim_send_slot(), "second claim must lose");

        release_send_slot();
        assert!(claim_send_slot());
        release_send_slot();
    }

    #[test]
    fn sub_second_limits_round_up() {
        arm_request_timeout(Duration::from_millis(100));
        assert_eq!(REQUEST_TIMEOUT_SECS.load(Ordering::Acquire), 1);

        arm_request_timeout(Duration::from_secs(5));
        assert_eq!(REQUEST_TIMEOUT_SECS.load(Ordering::Acquire), 5);
    }
}
