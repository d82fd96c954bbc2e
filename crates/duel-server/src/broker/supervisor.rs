//! Per-session supervisor and the stale-session sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::session::{SessionEnd, SessionHandle, SessionTable};

/// Watch one session until its game completes, its deadline passes, or it
/// is cancelled; then retire it.
///
/// Completion is detected by polling the rule engine every `poll`.
#[instrument(skip_all, fields(session_id = %handle.id()))]
pub(crate) async fn supervise(handle: Arc<SessionHandle>, table: SessionTable, poll: Duration) {
    let mut ticker = time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let _ = ticker.tick().await;
    let deadline = time::sleep_until(handle.deadline());
    tokio::pin!(deadline);

    let end = loop {
        tokio::select! {
            biased;
            () = handle.cancelled() => {
                break if handle.engine_terminal() {
                    SessionEnd::Completed { winner: handle.winner() }
                } else {
                    SessionEnd::Cancelled
                };
            }
            () = &mut deadline => break SessionEnd::DeadlineExceeded,
            _ = ticker.tick() => {
                if handle.engine_terminal() {
                    break SessionEnd::Completed { winner: handle.winner() };
                }
            }
        }
    };

    if !table.retire(handle.id(), end) {
        debug!("session already retired");
    }
}

/// Periodically retire sessions older than `max_age`, in case a supervisor
/// never fired.
pub(crate) async fn sweep_stale(
    table: SessionTable,
    every: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                for id in table.stale(max_age) {
                    if table.retire(&id, SessionEnd::Swept) {
                        warn!(session_id = %id, "swept stale session");
                    }
                }
            }
        }
    }
}
