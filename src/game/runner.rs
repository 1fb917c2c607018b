//! Session tasks and the registry of live sessions
//!
//! Each session runs as one tokio task that owns its [`GameSession`]. Connection
//! tasks never touch game state; they send [`SessionCommand`]s and receive
//! encoded packets on their own outbound channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::Catalog;
use super::objects::ObjectId;
use super::session::{GameSession, SessionError};
use crate::config::GameConfig;
use crate::util::time::Timer;

const COMMAND_QUEUE: usize = 1024;

/// Sessions tried before a join gives up
const JOIN_ATTEMPTS: usize = 3;

/// Requests from connection tasks to a session task
#[derive(Debug)]
pub enum SessionCommand {
    Connect {
        name: String,
        outbound: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<Result<ObjectId, SessionError>>,
    },
    Message {
        player: ObjectId,
        data: Bytes,
    },
    Disconnect {
        player: ObjectId,
    },
}

/// Snapshot of a session published after every tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub tick: u64,
    pub connected: usize,
    pub alive: usize,
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub command_tx: mpsc::Sender<SessionCommand>,
    /// Connected players plus reserved slots for joins still in flight
    player_count: Arc<AtomicUsize>,
    stats: Arc<RwLock<SessionStats>>,
}

impl SessionHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Acquire)
    }

    /// Reserve a slot if fewer than `max_players` are taken. The slot is
    /// released by the session when the join fails or the player leaves.
    pub fn try_reserve(&self, max_players: usize) -> bool {
        self.player_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_players).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give back a slot whose Connect never reached the session.
    pub fn release(&self) {
        release_slot(&self.player_count);
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.read()
    }
}

/// Registry of all live sessions
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, h)| h)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_players(&self) -> usize {
        self.sessions.iter().map(|s| s.value().stats().connected).sum()
    }

    pub fn total_alive(&self) -> usize {
        self.sessions.iter().map(|s| s.value().stats().alive).sum()
    }

    /// Find a session with a free slot and reserve it
    pub fn find_available(&self, max_players: usize) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|s| !s.value().command_tx.is_closed() && s.value().try_reserve(max_players))
            .map(|s| s.value().clone())
    }

    /// Reserve a slot in an existing session with room, or start a new one.
    pub fn find_or_spawn(
        self: &Arc<Self>,
        catalog: &Arc<Catalog>,
        config: &Arc<GameConfig>,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.find_available(config.max_players) {
            return Ok(handle);
        }

        let seed = config.map_seed.unwrap_or_else(rand::random);
        let session = GameSession::new(Arc::clone(catalog), Arc::clone(config), seed)?;
        let (runner, handle) = SessionRunner::new(Uuid::new_v4(), session, config.tick_ms);
        // reserved before other joins can see the session
        handle.player_count.fetch_add(1, Ordering::AcqRel);
        self.insert(handle.clone());

        let registry = Arc::clone(self);
        let id = handle.id;
        tokio::spawn(async move {
            runner.run().await;
            registry.remove(&id);
        });
        Ok(handle)
    }

    /// Put a player into some session, moving on to another one if the
    /// chosen session fills up or ends before the join lands.
    pub async fn join(
        self: &Arc<Self>,
        catalog: &Arc<Catalog>,
        config: &Arc<GameConfig>,
        name: &str,
        outbound: &mpsc::Sender<Bytes>,
    ) -> Result<(SessionHandle, ObjectId), SessionError> {
        let mut last_error = SessionError::Closed;
        for attempt in 1..=JOIN_ATTEMPTS {
            let handle = self.find_or_spawn(catalog, config)?;
            let (reply, answer) = oneshot::channel();
            let connect = SessionCommand::Connect {
                name: name.to_string(),
                outbound: outbound.clone(),
                reply,
            };
            if handle.command_tx.send(connect).await.is_err() {
                handle.release();
                debug!(session_id = %handle.id, attempt, "Session closed before join");
                continue;
            }
            match answer.await {
                Ok(Ok(player)) => return Ok((handle, player)),
                Ok(Err(SessionError::SessionFull)) => {
                    debug!(session_id = %handle.id, attempt, "Session full, retrying");
                    last_error = SessionError::SessionFull;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(session_id = %handle.id, attempt, "Session dropped join request");
                    last_error = SessionError::Closed;
                }
            }
        }
        Err(last_error)
    }
}

fn release_slot(count: &AtomicUsize) {
    // never wraps, even for a Connect that skipped the registry
    let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The task that owns one session
pub struct SessionRunner {
    id: Uuid,
    session: GameSession,
    command_rx: mpsc::Receiver<SessionCommand>,
    outbound: HashMap<ObjectId, mpsc::Sender<Bytes>>,
    player_count: Arc<AtomicUsize>,
    stats: Arc<RwLock<SessionStats>>,
    tick_period: Duration,
    had_players: bool,
}

impl SessionRunner {
    pub fn new(id: Uuid, session: GameSession, tick_ms: u64) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let player_count = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(RwLock::new(SessionStats::default()));

        let handle = SessionHandle {
            id,
            command_tx,
            player_count: player_count.clone(),
            stats: stats.clone(),
        };

        let runner = Self {
            id,
            session,
            command_rx,
            outbound: HashMap::new(),
            player_count,
            stats,
            tick_period: Duration::from_millis(tick_ms.max(1)),
            had_players: false,
        };

        (runner, handle)
    }

    /// Run ticks and commands until the last player leaves.
    pub async fn run(mut self) {
        info!(session_id = %self.id, map = %self.session.map().name, "Session started");

        let mut ticker = interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let timer = Timer::new();
                    self.session.tick(Instant::now());
                    self.flush_outbox();
                    self.publish_stats();

                    let elapsed = timer.elapsed_micros();
                    if elapsed > self.tick_period.as_micros() as u64 {
                        warn!(
                            session_id = %self.id,
                            tick = self.session.tick_count(),
                            elapsed_us = elapsed,
                            "Tick overran its period"
                        );
                    }

                    if self.had_players && self.player_count.load(Ordering::Acquire) == 0 {
                        info!(session_id = %self.id, "All players left, ending session");
                        break;
                    }
                }
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        self.handle_command(command);
                        self.flush_outbox();
                    }
                    None => {
                        info!(session_id = %self.id, "Command channel closed, ending session");
                        break;
                    }
                }
            }
        }

        self.command_rx.close();
        info!(
            session_id = %self.id,
            ticks = self.session.tick_count(),
            players = self.session.roster().len(),
            "Session ended"
        );
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect {
                name,
                outbound,
                reply,
            } => {
                let result = self.session.connect(&name);
                let joined = result.as_ref().ok().copied();
                match joined {
                    Some(id) => {
                        self.outbound.insert(id, outbound);
                        self.had_players = true;
                    }
                    None => release_slot(&self.player_count),
                }
                // The connection gave up waiting; drop the player again
                if reply.send(result).is_err() {
                    if let Some(id) = joined {
                        self.drop_player(id);
                    }
                }
            }
            SessionCommand::Message { player, data } => {
                self.session.handle_message(player, &data);
            }
            SessionCommand::Disconnect { player } => self.drop_player(player),
        }
    }

    fn drop_player(&mut self, player: ObjectId) {
        if self.outbound.remove(&player).is_some() {
            release_slot(&self.player_count);
        }
        self.session.disconnect(player);
    }

    fn flush_outbox(&mut self) {
        for (player, packet) in self.session.drain_outbox() {
            let Some(tx) = self.outbound.get(&player) else {
                continue;
            };
            match tx.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(session_id = %self.id, player_id = player, "Outbound queue full, dropping packet");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %self.id, player_id = player, "Outbound channel closed");
                    self.drop_player(player);
                }
            }
        }
    }

    fn publish_stats(&self) {
        let stats = SessionStats {
            tick: self.session.tick_count(),
            connected: self.session.connected_count(),
            alive: self.session.alive_count(),
        };
        *self.stats.write() = stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::MsgType;
    use tokio::time::timeout;

    fn test_config() -> Arc<GameConfig> {
        Arc::new(GameConfig {
            tick_ms: 5,
            disable_map_gen: true,
            disable_gas: true,
            map_seed: Some(1),
            ..Default::default()
        })
    }

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::builtin().unwrap())
    }

    async fn connect(handle: &SessionHandle, name: &str) -> (ObjectId, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(64);
        let (reply, answer) = oneshot::channel();
        handle
            .command_tx
            .send(SessionCommand::Connect {
                name: name.to_string(),
                outbound,
                reply,
            })
            .await
            .unwrap();
        let id = tokio_test::assert_ok!(answer.await.unwrap());
        (id, rx)
    }

    #[tokio::test]
    async fn runner_streams_joined_map_then_updates() {
        let session = GameSession::new(catalog(), test_config(), 1).unwrap();
        let (runner, handle) = SessionRunner::new(Uuid::new_v4(), session, 5);
        let task = tokio::spawn(runner.run());

        assert!(handle.try_reserve(1));
        assert!(!handle.try_reserve(1));
        let (id, mut rx) = connect(&handle, "alice").await;
        assert!(id > 0);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first[0], MsgType::Joined as u8);
        assert_eq!(second[0], MsgType::Map as u8);
        assert_eq!(third[0], MsgType::Update as u8);

        handle
            .command_tx
            .send(SessionCommand::Disconnect { player: id })
            .await
            .unwrap();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(handle.stats().connected, 0);
        assert_eq!(handle.player_count(), 0);
    }

    #[tokio::test]
    async fn registry_reuses_sessions_with_room() {
        let registry = Arc::new(SessionRegistry::new());
        let catalog = catalog();
        let config = test_config();

        let first = registry.find_or_spawn(&catalog, &config).unwrap();
        let (_a, _rx_a) = connect(&first, "a").await;
        let second = registry.find_or_spawn(&catalog, &config).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.active_sessions(), 1);

        let full = Arc::new(GameConfig {
            max_players: 1,
            ..(*config).clone()
        });
        let third = registry.find_or_spawn(&catalog, &full).unwrap();
        assert_ne!(first.id, third.id);
        assert_eq!(registry.active_sessions(), 2);
    }

    #[tokio::test]
    async fn empty_session_removes_itself() {
        let registry = Arc::new(SessionRegistry::new());
        let handle = registry.find_or_spawn(&catalog(), &test_config()).unwrap();
        let (_id, rx) = connect(&handle, "a").await;

        // dropping the receiver closes the outbound channel
        drop(rx);
        timeout(Duration::from_secs(2), async {
            while registry.active_sessions() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(registry.get(&handle.id).is_none());
    }

    #[tokio::test]
    async fn reservations_spread_joins_before_they_land() {
        let registry = Arc::new(SessionRegistry::new());
        let catalog = catalog();
        let config = Arc::new(GameConfig {
            max_players: 2,
            ..(*test_config()).clone()
        });

        // all three slots are picked before any Connect reaches a session
        let handles: Vec<SessionHandle> = (0..3)
            .map(|_| registry.find_or_spawn(&catalog, &config).unwrap())
            .collect();
        assert_eq!(handles[0].id, handles[1].id);
        assert_ne!(handles[0].id, handles[2].id);

        let mut receivers = Vec::new();
        for (i, handle) in handles.iter().enumerate() {
            let (_id, rx) = connect(handle, &format!("p{i}")).await;
            receivers.push(rx);
        }
        assert_eq!(handles[0].player_count(), 2);
        assert_eq!(handles[2].player_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_all_find_a_session() {
        let registry = Arc::new(SessionRegistry::new());
        let catalog = catalog();
        let config = Arc::new(GameConfig {
            max_players: 2,
            ..(*test_config()).clone()
        });

        let joins = (0..config.max_players * 2 + 1).map(|i| {
            let (registry, catalog, config) = (registry.clone(), catalog.clone(), config.clone());
            tokio::spawn(async move {
                let (outbound, rx) = mpsc::channel(64);
                let joined = registry
                    .join(&catalog, &config, &format!("p{i}"), &outbound)
                    .await;
                (joined, rx)
            })
        });
        let results = futures::future::join_all(joins).await;

        let mut per_session: HashMap<Uuid, usize> = HashMap::new();
        let mut receivers = Vec::new();
        for result in results {
            let (joined, rx) = result.unwrap();
            let (handle, _player) = tokio_test::assert_ok!(joined);
            *per_session.entry(handle.id).or_default() += 1;
            receivers.push(rx);
        }
        assert_eq!(per_session.values().sum::<usize>(), 5);
        assert!(per_session.values().all(|&n| n <= config.max_players));
        assert!(per_session.len() >= 3);
    }

    #[tokio::test]
    async fn failed_join_gives_its_slot_back() {
        let session = GameSession::new(
            catalog(),
            Arc::new(GameConfig {
                max_players: 0,
                ..(*test_config()).clone()
            }),
            1,
        )
        .unwrap();
        let (runner, handle) = SessionRunner::new(Uuid::new_v4(), session, 5);
        tokio::spawn(runner.run());

        assert!(handle.try_reserve(1));
        let (outbound, _rx) = mpsc::channel(8);
        let (reply, answer) = oneshot::channel();
        handle
            .command_tx
            .send(SessionCommand::Connect {
                name: "late".to_string(),
                outbound,
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(answer.await.unwrap(), Err(SessionError::SessionFull)));
        assert_eq!(handle.player_count(), 0);
    }
}
