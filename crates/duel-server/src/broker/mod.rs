//! Matchmaking broker.
//!
//! Join requests enter a bounded FIFO queue. A single pairing loop holds at
//! most one waiting request and pairs it with the next arrival. Each pair
//! needs one admission token (non-blocking try-acquire); the token is held by
//! the session until its supervisor, or the stale sweep, retires it.
//!
//! Request lifecycle: `queued -> paired -> admitted -> (active -> ended)`,
//! or `rejected` / `timed out`. Every request gets exactly one reply.

pub mod errors;
mod request;
pub mod session;
mod supervisor;

use std::sync::Arc;

use duel_core::{EngineError, EngineFactory, ParticipantId, RuleEngine, SessionId};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub use errors::{MatchError, SessionError};
pub use request::MatchResult;
pub use session::{SessionEnd, SessionHandle};

use crate::config::BrokerConfig;
use crate::metrics::{
    ADMISSION_TOKENS_AVAILABLE, MATCHMAKING_FAILURES_TOTAL, MATCHMAKING_QUEUE_DEPTH,
    MATCHMAKING_REQUESTS_TOTAL, SESSIONS_ACTIVE, SESSIONS_STARTED_TOTAL,
};
use request::JoinRequest;
use session::SessionTable;

/// Read-only broker telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    /// Sessions holding an admission token.
    pub active_sessions: usize,
    /// Join requests waiting in the queue.
    pub queue_depth: usize,
    /// Admission tokens not held by any session.
    pub available_slots: usize,
    /// Size of the admission budget.
    pub max_sessions: usize,
}

/// Pairs participants into supervised sessions under a fixed budget.
pub struct MatchBroker {
    config: BrokerConfig,
    factory: Arc<dyn EngineFactory>,
    queue_tx: Mutex<Option<mpsc::Sender<JoinRequest>>>,
    queue_rx: Mutex<Option<mpsc::Receiver<JoinRequest>>>,
    admission: Arc<Semaphore>,
    sessions: SessionTable,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl MatchBroker {
    /// Create a broker. Requests queue up but nothing is paired until
    /// [`start`](Self::start).
    ///
    /// Every session context is derived from `parent`.
    pub fn new(
        config: BrokerConfig,
        factory: Arc<dyn EngineFactory>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let admission = Arc::new(Semaphore::new(config.max_sessions));
        Arc::new(Self {
            factory,
            queue_tx: Mutex::new(Some(tx)),
            queue_rx: Mutex::new(Some(rx)),
            sessions: SessionTable::new(admission.clone()),
            admission,
            cancel: parent.child_token(),
            tasks: TaskTracker::new(),
            config,
        })
    }

    /// Spawn the pairing loop, the stale sweep, and the stats loop.
    ///
    /// Returns `false` if the broker was already started or shut down.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(rx) = self.queue_rx.lock().take() else {
            warn!("broker already started or stopped");
            return false;
        };
        let _ = self.tasks.spawn(self.clone().pairing_loop(rx));
        let _ = self.tasks.spawn(supervisor::sweep_stale(
            self.sessions.clone(),
            self.config.sweep_interval,
            self.config.session_timeout,
            self.cancel.clone(),
        ));
        let _ = self.tasks.spawn(self.clone().stats_loop());
        info!(
            max_sessions = self.config.max_sessions,
            queue_capacity = self.config.queue_capacity,
            "broker started"
        );
        true
    }

    /// Ask to be paired.
    ///
    /// Fails immediately with [`MatchError::QueueFull`] when the queue is at
    /// capacity. Otherwise waits for a partner and admission, up to the
    /// matchmaking deadline.
    pub async fn request_session(&self, participant: ParticipantId) -> MatchResult {
        counter!(MATCHMAKING_REQUESTS_TOTAL).increment(1);
        let result = self.enqueue_and_wait(participant.clone()).await;
        if let Err(e) = &result {
            counter!(MATCHMAKING_FAILURES_TOTAL, "reason" => e.code()).increment(1);
            debug!(participant = %participant, error = %e, "join request failed");
        }
        result
    }

    async fn enqueue_and_wait(&self, participant: ParticipantId) -> MatchResult {
        let (req, reply) = JoinRequest::new(participant);
        let tx = self.queue_tx.lock().clone().ok_or(MatchError::ShuttingDown)?;
        tx.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => MatchError::ShuttingDown,
        })?;
        drop(tx);

        match time::timeout(self.config.match_timeout, reply).await {
            Ok(Ok(result)) => result,
            // Request dropped unanswered: the broker went away
            Ok(Err(_)) => Err(MatchError::ShuttingDown),
            Err(_) => Err(MatchError::TimedOut),
        }
    }

    /// Look up an active session.
    pub fn session(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id)
    }

    /// Every active session.
    pub fn active_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.handles()
    }

    /// Current telemetry. Never blocks on the pairing loop.
    pub fn stats(&self) -> BrokerStats {
        let queue_depth = self
            .queue_tx
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity());
        BrokerStats {
            active_sessions: self.sessions.len(),
            queue_depth,
            available_slots: self.admission.available_permits(),
            max_sessions: self.config.max_sessions,
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop intake, cancel every session, and wait for all broker tasks.
    ///
    /// The waiting request and anything still queued fail with
    /// [`MatchError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let _ = self.queue_tx.lock().take();
        self.cancel.cancel();

        // Never started: nothing else will drain the queue
        let unstarted = self.queue_rx.lock().take();
        if let Some(rx) = unstarted {
            fail_queued(rx);
        }

        let _ = self.tasks.close();
        self.tasks.wait().await;
        info!("broker stopped");
    }

    async fn pairing_loop(self: Arc<Self>, mut rx: mpsc::Receiver<JoinRequest>) {
        let mut waiting: Option<JoinRequest> = None;

        loop {
            let req = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };
            if req.is_withdrawn() {
                debug!(participant = %req.participant, "skipping withdrawn request");
                continue;
            }
            match waiting.take() {
                Some(first) if !first.is_withdrawn() => waiting = self.pair(first, req),
                _ => {
                    debug!(participant = %req.participant, "waiting for partner");
                    waiting = Some(req);
                }
            }
        }

        if let Some(req) = waiting {
            let _ = req.respond(Err(MatchError::ShuttingDown));
        }
        fail_queued(rx);
        debug!("pairing loop stopped");
    }

    /// Admit `first` and `second` together.
    ///
    /// Replies go out in arrival order. If `first` has left by the time its
    /// reply is sent, the new session is ended and `second` is handed back
    /// to wait for another partner.
    fn pair(&self, first: JoinRequest, second: JoinRequest) -> Option<JoinRequest> {
        match self.admit(&first.participant, &second.participant) {
            Ok(handle) => {
                info!(
                    session_id = %handle.id(),
                    first = %first.participant,
                    second = %second.participant,
                    waited_ms = u64::try_from(first.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "session admitted"
                );
                let left = first.participant.clone();
                if !first.respond(Ok(handle.clone())) {
                    warn!(session_id = %handle.id(), participant = %left, "participant left during admission");
                    handle.end();
                    debug!(participant = %second.participant, "waiting for partner again");
                    return Some(second);
                }
                let left = second.participant.clone();
                if !second.respond(Ok(handle.clone())) {
                    warn!(session_id = %handle.id(), participant = %left, "participant left during admission");
                    handle.end();
                }
                None
            }
            Err(e) => {
                warn!(
                    first = %first.participant,
                    second = %second.participant,
                    error = %e,
                    "pairing rejected"
                );
                let _ = first.respond(Err(e.clone()));
                let _ = second.respond(Err(e));
                None
            }
        }
    }

    /// Acquire a token, then build and start the game. Any failure drops
    /// the token before returning.
    fn admit(&self, first: &ParticipantId, second: &ParticipantId) -> MatchResult {
        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| MatchError::CapacityExceeded)?;

        let id = SessionId::new();
        let mut engine = self.factory.create(&id);
        seat_and_start(engine.as_mut(), first, second).map_err(MatchError::SessionConstruction)?;

        let handle = Arc::new(SessionHandle::new(
            id,
            [first.clone(), second.clone()],
            engine,
            self.cancel.child_token(),
            self.config.session_timeout,
        ));
        self.sessions.insert(handle.clone(), permit);
        counter!(SESSIONS_STARTED_TOTAL).increment(1);
        let _ = self.tasks.spawn(supervisor::supervise(
            handle.clone(),
            self.sessions.clone(),
            self.config.poll_interval,
        ));
        Ok(handle)
    }

    #[allow(clippy::cast_precision_loss)]
    async fn stats_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let stats = self.stats();
                    gauge!(MATCHMAKING_QUEUE_DEPTH).set(stats.queue_depth as f64);
                    gauge!(SESSIONS_ACTIVE).set(stats.active_sessions as f64);
                    gauge!(ADMISSION_TOKENS_AVAILABLE).set(stats.available_slots as f64);
                    info!(
                        active_sessions = stats.active_sessions,
                        queue_depth = stats.queue_depth,
                        available_slots = stats.available_slots,
                        "broker stats"
                    );
                }
            }
        }
    }
}

fn seat_and_start(
    engine: &mut dyn RuleEngine,
    first: &ParticipantId,
    second: &ParticipantId,
) -> Result<(), EngineError> {
    engine.add_participant(first)?;
    engine.add_participant(second)?;
    engine.start()
}

fn fail_queued(mut rx: mpsc::Receiver<JoinRequest>) {
    rx.close();
    let mut failed = 0usize;
    while let Ok(req) = rx.try_recv() {
        let _ = req.respond(Err(MatchError::ShuttingDown));
        failed += 1;
    }
    if failed > 0 {
        debug!(failed, "failed queued requests on shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use duel_sticks::SticksFactory;
    use proptest::prelude::*;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config(max_sessions: usize, queue_capacity: usize) -> BrokerConfig {
        BrokerConfig {
            max_sessions,
            queue_capacity,
            ..BrokerConfig::default()
        }
    }

    fn broker(config: BrokerConfig) -> Arc<MatchBroker> {
        MatchBroker::new(config, Arc::new(SticksFactory), &CancellationToken::new())
    }

    fn submit(broker: &Arc<MatchBroker>, name: &str) -> JoinHandle<MatchResult> {
        let broker = broker.clone();
        let participant = ParticipantId::from(name);
        tokio::spawn(async move { broker.request_session(participant).await })
    }

    /// Submit in a fixed arrival order by waiting for each to land in the
    /// queue. Only valid before `start`.
    async fn submit_queued(broker: &Arc<MatchBroker>, names: &[&str]) -> Vec<JoinHandle<MatchResult>> {
        let mut handles = Vec::new();
        for name in names {
            let depth = broker.stats().queue_depth;
            handles.push(submit(broker, name));
            while broker.stats().queue_depth == depth {
                tokio::task::yield_now().await;
            }
        }
        handles
    }

    async fn result(handle: JoinHandle<MatchResult>) -> MatchResult {
        time::timeout(TIMEOUT, handle).await.unwrap().unwrap()
    }

    async fn wait_for_slots(broker: &MatchBroker, slots: usize) {
        time::timeout(TIMEOUT, async {
            while broker.stats().available_slots != slots {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn pairs_two_requests() {
        let broker = broker(config(4, 16));
        let queued = submit_queued(&broker, &["alice", "bob"]).await;
        assert!(broker.start());

        let mut results = Vec::new();
        for h in queued {
            results.push(result(h).await.unwrap());
        }
        assert!(Arc::ptr_eq(&results[0], &results[1]));
        let session = &results[0];
        assert_eq!(
            session.participants(),
            &[ParticipantId::from("alice"), ParticipantId::from("bob")]
        );
        assert!(broker.session(session.id()).is_some());
        assert_eq!(broker.stats().active_sessions, 1);
        assert_eq!(broker.stats().available_slots, 3);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let broker = broker(config(1, 1));
        assert!(broker.start());
        assert!(!broker.start());
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn queue_full_reports_immediately() {
        let broker = broker(config(1, 1));
        let first = submit(&broker, "a");
        while broker.stats().queue_depth == 0 {
            tokio::task::yield_now().await;
        }

        let second = time::timeout(
            Duration::from_millis(100),
            broker.request_session("b".into()),
        )
        .await
        .expect("QueueFull must not wait");
        assert_matches!(second, Err(MatchError::QueueFull));

        broker.shutdown().await;
        assert_matches!(result(first).await, Err(MatchError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn lone_request_times_out() {
        let broker = broker(BrokerConfig {
            match_timeout: Duration::from_secs(5),
            ..config(4, 16)
        });
        assert!(broker.start());
        assert_matches!(
            broker.request_session("alone".into()).await,
            Err(MatchError::TimedOut)
        );
        assert_eq!(broker.stats().active_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_is_never_paired() {
        let broker = broker(BrokerConfig {
            match_timeout: Duration::from_secs(5),
            ..config(4, 16)
        });
        assert!(broker.start());
        assert_matches!(
            broker.request_session("early".into()).await,
            Err(MatchError::TimedOut)
        );

        let late_a = submit(&broker, "late-a");
        let late_b = submit(&broker, "late-b");
        let a = result(late_a).await.unwrap();
        let b = result(late_b).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.seat_of(&"early".into()).is_none());
    }

    #[tokio::test]
    async fn budget_of_one_with_three_arrivals() {
        let broker = broker(config(1, 16));
        let mut queued = submit_queued(&broker, &["a", "b", "c"]).await;
        assert!(broker.start());

        let c = queued.pop().unwrap();
        let b = result(queued.pop().unwrap()).await.unwrap();
        let a = result(queued.pop().unwrap()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(broker.stats().available_slots, 0);

        // c waits alone
        time::sleep(Duration::from_millis(50)).await;
        assert!(!c.is_finished());

        // d pairs with c, but there is no token
        let d = submit(&broker, "d");
        assert_matches!(result(c).await, Err(MatchError::CapacityExceeded));
        assert_matches!(result(d).await, Err(MatchError::CapacityExceeded));
        assert_eq!(broker.stats().active_sessions, 1);

        // once a/b ends, new arrivals are admitted
        a.end();
        wait_for_slots(&broker, 1).await;
        let e = submit(&broker, "e");
        let f = submit(&broker, "f");
        let e = result(e).await.unwrap();
        let f = result(f).await.unwrap();
        assert!(Arc::ptr_eq(&e, &f));
        assert_eq!(a.outcome(), Some(SessionEnd::Cancelled));
    }

    #[tokio::test]
    async fn construction_failure_fails_both_and_releases_token() {
        let broker = broker(config(1, 16));
        let queued = submit_queued(&broker, &["twin", "twin"]).await;
        assert!(broker.start());

        for h in queued {
            assert_matches!(
                result(h).await,
                Err(MatchError::SessionConstruction(EngineError::DuplicateParticipant(p))) if p.as_str() == "twin"
            );
        }
        assert_eq!(broker.stats().available_slots, 1);
        assert_eq!(broker.stats().active_sessions, 0);

        let a = submit(&broker, "a");
        let b = submit(&broker, "b");
        assert!(result(a).await.is_ok());
        assert!(result(b).await.is_ok());
    }

    #[tokio::test]
    async fn failing_start_releases_token() {
        struct NeverStarts;
        impl RuleEngine for NeverStarts {
            fn add_participant(&mut self, _: &ParticipantId) -> Result<(), EngineError> {
                Ok(())
            }
            fn start(&mut self) -> Result<(), EngineError> {
                Err(EngineError::NotStarted)
            }
            fn apply(&mut self, _: &ParticipantId, _: &serde_json::Value) -> Result<(), EngineError> {
                Ok(())
            }
            fn is_terminal(&self) -> bool {
                false
            }
            fn winner(&self) -> Option<ParticipantId> {
                None
            }
            fn terminate(&mut self) {}
            fn snapshot(&self) -> serde_json::Value {
                serde_json::Value::Null
            }
        }

        let factory = |_: &SessionId| -> Box<dyn RuleEngine> { Box::new(NeverStarts) };
        let broker = MatchBroker::new(config(2, 16), Arc::new(factory), &CancellationToken::new());
        let queued = submit_queued(&broker, &["a", "b"]).await;
        assert!(broker.start());
        for h in queued {
            assert_matches!(
                result(h).await,
                Err(MatchError::SessionConstruction(EngineError::NotStarted))
            );
        }
        assert_eq!(broker.stats().available_slots, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn budget_never_oversubscribed() {
        let max = 3;
        let broker = broker(config(max, 256));
        assert!(broker.start());

        let handles: Vec<_> = (0..40).map(|i| submit(&broker, &format!("p{i}"))).collect();
        let results = futures::future::join_all(handles).await;

        let mut sessions = HashSet::new();
        let mut failures = 0;
        for r in results {
            match r.unwrap() {
                Ok(handle) => {
                    let _ = sessions.insert(handle.id().clone());
                }
                Err(MatchError::CapacityExceeded) => failures += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(sessions.len(), max);
        assert_eq!(sessions.len() * 2 + failures, 40);
        let stats = broker.stats();
        assert_eq!(stats.active_sessions, max);
        assert_eq!(stats.available_slots, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_deadline_releases_token_within_one_poll() {
        let broker = broker(BrokerConfig {
            session_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            ..config(1, 16)
        });
        assert!(broker.start());
        let a = submit(&broker, "a");
        let b = submit(&broker, "b");
        let session = result(a).await.unwrap();
        let _ = result(b).await.unwrap();
        assert_eq!(broker.stats().available_slots, 0);

        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(broker.stats().available_slots, 1);
        assert_eq!(broker.stats().active_sessions, 0);
        assert!(broker.session(session.id()).is_none());
        assert_eq!(session.outcome(), Some(SessionEnd::DeadlineExceeded));
    }

    #[tokio::test]
    async fn partner_leaving_during_admission_requeues_the_other() {
        let broker = broker(config(2, 16));
        let (gone, gone_rx) = JoinRequest::new("gone".into());
        let (stays, mut stays_rx) = JoinRequest::new("stays".into());
        drop(gone_rx);

        let requeued = broker.pair(gone, stays).expect("second request handed back");
        assert_eq!(requeued.participant, ParticipantId::from("stays"));
        assert!(!requeued.is_withdrawn());
        assert!(stays_rx.try_recv().is_err());

        // The abandoned session gives its token back within one poll
        wait_for_slots(&broker, 2).await;
        assert_eq!(broker.stats().active_sessions, 0);

        let (partner, partner_rx) = JoinRequest::new("partner".into());
        assert!(broker.pair(requeued, partner).is_none());
        let session = time::timeout(TIMEOUT, stays_rx).await.unwrap().unwrap().unwrap();
        let other = time::timeout(TIMEOUT, partner_rx).await.unwrap().unwrap().unwrap();
        assert_eq!(session.id(), other.id());
        assert_eq!(session.end_reason(), None);
    }

    #[tokio::test]
    async fn shutdown_fails_waiter_and_cancels_sessions() {
        let broker = broker(config(2, 16));
        let queued = submit_queued(&broker, &["a", "b", "c"]).await;
        assert!(broker.start());
        let mut queued = queued.into_iter();
        let a = result(queued.next().unwrap()).await.unwrap();
        let _ = result(queued.next().unwrap()).await.unwrap();
        let waiter = queued.next().unwrap();

        time::timeout(TIMEOUT, broker.shutdown()).await.unwrap();

        assert!(broker.is_shutting_down());
        let err = result(waiter).await.unwrap_err();
        assert!(err.is_shutdown());
        assert_eq!(a.outcome(), Some(SessionEnd::Cancelled));
        assert_eq!(broker.stats().available_slots, 2);
        assert_matches!(
            broker.request_session("late".into()).await,
            Err(MatchError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn shutdown_before_start_fails_queued() {
        let broker = broker(config(2, 16));
        let queued = submit_queued(&broker, &["a", "b", "c"]).await;
        broker.shutdown().await;
        for h in queued {
            assert_matches!(result(h).await, Err(MatchError::ShuttingDown));
        }
        assert!(!broker.start());
    }

    #[tokio::test]
    async fn stats_serialize_camel_case() {
        let broker = broker(config(5, 16));
        let json = serde_json::to_value(broker.stats()).unwrap();
        assert_eq!(json["activeSessions"], 0);
        assert_eq!(json["queueDepth"], 0);
        assert_eq!(json["availableSlots"], 5);
        assert_eq!(json["maxSessions"], 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Sessions pair consecutive arrivals among requests that were not
        /// withdrawn.
        #[test]
        fn pairing_is_fifo(withdrawn in proptest::collection::vec(any::<bool>(), 2..14)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let broker = broker(config(64, 64));
                let names: Vec<String> = (0..withdrawn.len()).map(|i| format!("p{i}")).collect();
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                let handles = submit_queued(&broker, &refs).await;

                let mut live = Vec::new();
                for (handle, gone) in handles.into_iter().zip(&withdrawn) {
                    if *gone {
                        handle.abort();
                        let _ = handle.await;
                    } else {
                        live.push(handle);
                    }
                }
                let paired = live.len() / 2 * 2;
                assert!(broker.start());

                let mut rest = live.split_off(paired);
                let mut live = live.into_iter();
                while let (Some(first), Some(second)) = (live.next(), live.next()) {
                    let a = result(first).await.unwrap();
                    let b = result(second).await.unwrap();
                    assert!(Arc::ptr_eq(&a, &b));
                }
                // Arrival order is preserved inside each session
                for s in broker.active_sessions() {
                    let [a, b] = s.participants();
                    let index = |p: &ParticipantId| p.as_str()[1..].parse::<usize>().unwrap();
                    assert!(index(a) < index(b));
                    let between = withdrawn[index(a) + 1..index(b)].iter().all(|w| *w);
                    assert!(between, "only withdrawn requests may sit between partners");
                }
                assert_eq!(broker.stats().active_sessions, paired / 2);

                broker.shutdown().await;
                if let Some(odd) = rest.pop() {
                    assert_matches!(result(odd).await, Err(MatchError::ShuttingDown));
                }
            });
        }
    }
}
