//! Relays moves between a player's connection and their session.
//!
//! One [`serve_player`] task runs per upgraded socket: it starts the pump
//! pair (the registry is the lifecycle hook), submits the player to the
//! broker, announces the pairing, and forwards the session end. Moves are
//! applied by a per-connection [`MoveRelay`] that the read pump invokes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use duel_core::{ConnectionId, ParticipantId};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::broker::{SessionEnd, SessionHandle};
use crate::protocol::{MALFORMED, NOT_MATCHED, ServerMessage};
use crate::server::AppState;
use crate::websocket::connection::Connection;
use crate::websocket::pump::{self, MessageHandler, PumpContext};
use crate::websocket::transport::{FrameSink, FrameSource};

/// Error code sent when a player ID is already connected.
pub const PLAYER_TAKEN: &str = "player_taken";

/// Connected players, one connection per participant ID.
#[derive(Default)]
pub struct PlayerDirectory {
    players: DashMap<ParticipantId, Arc<Connection>>,
}

impl PlayerDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `participant` to `conn`. Fails if another connection holds it.
    pub fn claim(&self, participant: &ParticipantId, conn: &Arc<Connection>) -> bool {
        match self.players.entry(participant.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let _ = slot.insert(conn.clone());
                true
            }
        }
    }

    /// Unbind `participant`, but only if `conn` still holds it.
    pub fn release(&self, participant: &ParticipantId, conn: &ConnectionId) -> bool {
        self.players
            .remove_if(participant, |_, held| held.id() == conn)
            .is_some()
    }

    /// The connection bound to `participant`.
    pub fn get(&self, participant: &ParticipantId) -> Option<Arc<Connection>> {
        self.players.get(participant).map(|c| c.value().clone())
    }

    /// Connected players.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Whether no player is connected.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Queue `msg` for `participant`, if connected. Drops on a full queue.
    pub fn send(&self, participant: &ParticipantId, msg: &ServerMessage) -> bool {
        let Some(conn) = self.get(participant) else {
            return false;
        };
        reply(&conn, msg)
    }
}

fn reply(conn: &Connection, msg: &ServerMessage) -> bool {
    match conn.send_json(msg) {
        Ok(()) => true,
        Err(e) => {
            debug!(connection_id = %conn.id(), error = %e, "reply dropped");
            false
        }
    }
}

/// Applies each inbound frame as a move for one participant.
pub struct MoveRelay {
    participant: ParticipantId,
    session: Mutex<Option<Arc<SessionHandle>>>,
    players: Arc<PlayerDirectory>,
}

impl MoveRelay {
    /// A relay with no session bound yet.
    pub fn new(participant: ParticipantId, players: Arc<PlayerDirectory>) -> Self {
        Self {
            participant,
            session: Mutex::new(None),
            players,
        }
    }

    /// Route subsequent moves to `session`.
    pub fn bind(&self, session: Arc<SessionHandle>) {
        *self.session.lock() = Some(session);
    }
}

#[async_trait]
impl MessageHandler for MoveRelay {
    async fn handle(&self, conn: &Arc<Connection>, payload: Bytes) {
        let action: Value = match serde_json::from_slice(&payload) {
            Ok(v) => v,
            Err(e) => {
                let _ = reply(conn, &ServerMessage::error(MALFORMED, e));
                return;
            }
        };
        let Some(session) = self.session.lock().clone() else {
            let _ = reply(conn, &ServerMessage::error(NOT_MATCHED, "not in a session yet"));
            return;
        };

        match session.apply(&self.participant, &action) {
            Ok(state) => {
                let msg = ServerMessage::State { state };
                for p in session.participants() {
                    let _ = self.players.send(p, &msg);
                }
                if session.is_finished() {
                    info!(session_id = %session.id(), winner = ?session.winner(), "game over");
                    session.end();
                }
            }
            Err(e) => {
                debug!(session_id = %session.id(), participant = %self.participant, error = %e, "move rejected");
                let _ = reply(conn, &ServerMessage::error(e.code(), &e));
            }
        }
    }
}

/// Serve one player over an established transport until they leave or
/// their session ends.
#[instrument(skip_all, fields(participant = %participant))]
pub async fn serve_player<K, S>(state: AppState, participant: ParticipantId, sink: K, source: S)
where
    K: FrameSink,
    S: FrameSource,
{
    let (conn, outbound) = Connection::new(
        ConnectionId::new(),
        state.config.send_queue_capacity,
        &state.shutdown.token(),
    );
    let relay = Arc::new(MoveRelay::new(participant.clone(), state.players.clone()));
    let ctx = Arc::new(
        PumpContext::new(state.config.keepalive_interval)
            .with_pong_timeout(state.config.pong_timeout)
            .with_handler(relay.clone())
            .with_hooks(state.registry.clone()),
    );
    let Some(pumps) = pump::start(conn.clone(), outbound, sink, source, ctx).await else {
        warn!("connection rejected by registry");
        return;
    };

    if state.players.claim(&participant, &conn) {
        play(&state, &participant, &conn, &relay).await;
    } else {
        let _ = reply(
            &conn,
            &ServerMessage::error(PLAYER_TAKEN, format!("{participant} is already connected")),
        );
        let _ = conn.close();
    }

    let (write, read) = pumps.join().await;
    let _ = state.players.release(&participant, conn.id());
    conn.wait().await;
    debug!(write = %write, read = %read, "player disconnected");
}

async fn play(state: &AppState, participant: &ParticipantId, conn: &Arc<Connection>, relay: &MoveRelay) {
    // Dropping the request when the player leaves withdraws it
    let result = tokio::select! {
        biased;
        () = conn.cancelled() => return,
        result = state.broker.request_session(participant.clone()) => result,
    };
    let session = match result {
        Ok(session) => session,
        Err(e) => {
            let _ = reply(conn, &ServerMessage::error(e.code(), &e));
            let _ = conn.close();
            return;
        }
    };

    let (Some(seat), Some(opponent)) = (
        session.seat_of(participant),
        session.opponent_of(participant).cloned(),
    ) else {
        warn!(session_id = %session.id(), "session does not seat this player");
        session.end();
        let _ = conn.close();
        return;
    };
    relay.bind(session.clone());
    let _ = reply(
        conn,
        &ServerMessage::Matched {
            session: session.id().clone(),
            player: participant.clone(),
            opponent,
            seat,
            state: session.snapshot(),
        },
    );

    tokio::select! {
        biased;
        () = session.cancelled() => {
            let outcome = session.end_reason().unwrap_or(SessionEnd::Cancelled);
            debug!(session_id = %session.id(), outcome = outcome.label(), "session over");
            let _ = reply(conn, &ServerMessage::End { outcome, state: session.snapshot() });
            let _ = conn.close();
        }
        () = conn.cancelled() => {
            info!(session_id = %session.id(), "player left, ending session");
            session.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time;

    use crate::config::{BrokerConfig, ServerConfig};
    use crate::server::DuelServer;
    use crate::websocket::transport::memory::{self, MemoryPeer};
    use crate::websocket::transport::OutboundFrame;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn server() -> DuelServer {
        DuelServer::new(
            ServerConfig::default(),
            BrokerConfig::default(),
            Arc::new(duel_sticks::SticksFactory),
            None,
        )
    }

    fn join(server: &DuelServer, name: &str) -> (MemoryPeer, tokio::task::JoinHandle<()>) {
        let (sink, source, peer) = memory::pair();
        let task = tokio::spawn(serve_player(server.state(), name.into(), sink, source));
        (peer, task)
    }

    async fn next_message(peer: &mut MemoryPeer) -> Value {
        loop {
            match time::timeout(TIMEOUT, peer.next_written()).await.unwrap() {
                Some(OutboundFrame::Data(bytes)) => return serde_json::from_slice(&bytes).unwrap(),
                Some(OutboundFrame::Ping) => {}
                other => panic!("expected a message, got {other:?}"),
            }
        }
    }

    async fn next_close(peer: &mut MemoryPeer) {
        loop {
            match time::timeout(TIMEOUT, peer.next_written()).await.unwrap() {
                Some(OutboundFrame::Close) | None => return,
                Some(_) => {}
            }
        }
    }

    #[test]
    fn directory_claims_once_and_releases_only_owner() {
        let players = PlayerDirectory::new();
        let root = tokio_util::sync::CancellationToken::new();
        let (first, _rx1) = Connection::new(ConnectionId::new(), 4, &root);
        let (second, _rx2) = Connection::new(ConnectionId::new(), 4, &root);
        let p = ParticipantId::from("alice");

        assert!(players.claim(&p, &first));
        assert!(!players.claim(&p, &second));
        assert!(!players.release(&p, second.id()));
        assert_eq!(players.len(), 1);
        assert!(players.release(&p, first.id()));
        assert!(players.is_empty());
    }

    #[tokio::test]
    async fn move_before_match_is_rejected() {
        let players = Arc::new(PlayerDirectory::new());
        let relay = MoveRelay::new("alice".into(), players);
        let (conn, mut rx) = Connection::new(ConnectionId::new(), 4, &tokio_util::sync::CancellationToken::new());

        relay.handle(&conn, Bytes::from_static(b"not json")).await;
        relay.handle(&conn, Bytes::from(json!({"type": "attack"}).to_string())).await;

        let first: Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["code"], MALFORMED);
        let second: Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["code"], NOT_MATCHED);
    }

    #[tokio::test]
    async fn two_players_are_matched_and_relay_moves() {
        let server = server();
        let _registry = server.start();

        let (mut alice, _a) = join(&server, "alice");
        let (mut bob, _b) = join(&server, "bob");

        let a = next_message(&mut alice).await;
        let b = next_message(&mut bob).await;
        assert_eq!(a["type"], "matched");
        assert_eq!(b["type"], "matched");
        assert_eq!(a["session"], b["session"]);
        assert_eq!(a["opponent"], "bob");
        assert_eq!(b["opponent"], "alice");
        assert_ne!(a["seat"], b["seat"]);

        let (mover, waiter) = if a["seat"] == 0 {
            (&mut alice, &mut bob)
        } else {
            (&mut bob, &mut alice)
        };
        assert!(mover.send(json!({"type": "attack", "with_left": true, "attack_left": true}).to_string()));
        let seen_by_mover = next_message(mover).await;
        let seen_by_waiter = next_message(waiter).await;
        assert_eq!(seen_by_mover["type"], "state");
        assert_eq!(seen_by_mover, seen_by_waiter);

        // Out of turn
        assert!(mover.send(json!({"type": "attack", "with_left": true, "attack_left": true}).to_string()));
        let err = next_message(mover).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "rejected_move");
    }

    #[tokio::test]
    async fn leaving_ends_the_session_for_the_opponent() {
        let server = server();
        let _registry = server.start();

        let (mut alice, a_task) = join(&server, "alice");
        let (mut bob, b_task) = join(&server, "bob");
        let _ = next_message(&mut alice).await;
        let _ = next_message(&mut bob).await;

        assert!(alice.close(crate::websocket::transport::CLOSE_NORMAL));
        time::timeout(TIMEOUT, a_task).await.unwrap().unwrap();

        let end = next_message(&mut bob).await;
        assert_eq!(end["type"], "end");
        assert_eq!(end["outcome"]["kind"], "cancelled");
        next_close(&mut bob).await;
        let _ = bob.close(crate::websocket::transport::CLOSE_NORMAL);
        time::timeout(TIMEOUT, b_task).await.unwrap().unwrap();

        time::timeout(TIMEOUT, async {
            while server.broker().stats().active_sessions > 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(server.state().players.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_player_is_dropped_and_frees_the_session() {
        let server = DuelServer::new(
            ServerConfig {
                keepalive_interval: Duration::from_secs(1),
                pong_timeout: Duration::from_secs(3),
                ..ServerConfig::default()
            },
            BrokerConfig::default(),
            Arc::new(duel_sticks::SticksFactory),
            None,
        );
        let _registry = server.start();

        let (mut alice, _a_task) = join(&server, "alice");
        let (mut bob, b_task) = join(&server, "bob");
        let _ = next_message(&mut alice).await;
        let _ = next_message(&mut bob).await;

        // Alice answers every ping, bob never does
        let end = loop {
            match time::timeout(TIMEOUT, alice.next_written()).await.unwrap() {
                Some(OutboundFrame::Ping) => assert!(alice.pong()),
                Some(OutboundFrame::Data(bytes)) => {
                    break serde_json::from_slice::<Value>(&bytes).unwrap();
                }
                other => panic!("expected end, got {other:?}"),
            }
        };
        assert_eq!(end["type"], "end");
        assert_eq!(end["outcome"]["kind"], "cancelled");
        time::timeout(TIMEOUT, b_task).await.unwrap().unwrap();

        time::timeout(TIMEOUT, async {
            while server.broker().stats().active_sessions > 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(server.state().players.get(&"bob".into()).is_none());
    }

    #[tokio::test]
    async fn duplicate_player_is_turned_away() {
        let server = server();
        let _registry = server.start();

        let (_first, _t1) = join(&server, "alice");
        time::timeout(TIMEOUT, async {
            while server.state().players.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (mut second, task) = join(&server, "alice");
        let err = next_message(&mut second).await;
        assert_eq!(err["code"], PLAYER_TAKEN);
        next_close(&mut second).await;
        let _ = second.close(crate::websocket::transport::CLOSE_NORMAL);
        time::timeout(TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(server.state().players.len(), 1);
    }

    #[tokio::test]
    async fn broker_rejection_is_reported_and_closes() {
        let server = DuelServer::new(
            ServerConfig::default(),
            BrokerConfig {
                match_timeout: Duration::from_millis(50),
                ..BrokerConfig::default()
            },
            Arc::new(duel_sticks::SticksFactory),
            None,
        );
        let _registry = server.start();

        let (mut lonely, task) = join(&server, "lonely");
        let err = next_message(&mut lonely).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "timed_out");
        next_close(&mut lonely).await;
        let _ = lonely.close(crate::websocket::transport::CLOSE_NORMAL);
        time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    }
}
