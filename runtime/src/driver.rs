//! Async event loop around a [`Room`]
//!
//! [`spawn`] moves the room into a tokio task that owns its transport
//! subscriptions and timers:
//! - inbound messages and peer joins/leaves, in arrival order
//! - the host's sync clock
//! - the host's periodic reconciliation
//! - the lobby auto-start deadline
//!
//! Each event locks the room, runs to completion and releases it, so the
//! state is only ever mutated by one event at a time. Shutdown stops the
//! sync clock, the auto-start timer, the reconciliation timer and the
//! transport subscriptions, in that order.

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::room::{Room, RoomEvents};
use crate::scheduler::{FrameSignal, SyncClock, TickSource};
use crate::transport::Transport;
use crate::utils::Moment;
use log::{debug, error, info, warn};
use shared::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};

/// Owner's handle to a running room
///
/// Dropping the handle stops the room as well; [`RoomHandle::destroy`]
/// additionally waits for the teardown to finish.
pub struct RoomHandle<T: Transport> {
    room: Arc<Mutex<Room<T>>>,
    presence: watch::Receiver<usize>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Starts driving `room`
///
/// `frames` aligns the host's sync clock with an external render loop; pass
/// `None` to tick on a fixed timer. Fails if the room was already destroyed.
pub fn spawn<T: Transport>(
    mut room: Room<T>,
    frames: Option<FrameSignal>,
) -> Result<RoomHandle<T>> {
    let events = room.take_events().ok_or(RuntimeError::Destroyed)?;
    let presence = room.presence_watch().ok_or(RuntimeError::Destroyed)?;
    let is_host = room.is_host();
    let config = room.config().clone();

    let room = Arc::new(Mutex::new(room));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(drive(
        Arc::clone(&room),
        events,
        frames,
        config,
        is_host,
        shutdown_rx,
    ));

    Ok(RoomHandle {
        room,
        presence,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn drive<T: Transport>(
    room: Arc<Mutex<Room<T>>>,
    mut events: RoomEvents,
    frames: Option<FrameSignal>,
    config: RuntimeConfig,
    is_host: bool,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut clock = is_host.then(|| {
        SyncClock::new(
            TickSource::detect(frames, config.sync_interval),
            config.sync_interval,
            config.frame_epsilon,
        )
    });

    let mut reconcile = interval_at(
        Instant::now() + config.reconcile_interval,
        config.reconcile_interval,
    );
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let deadline = room.lock().await.next_deadline();

        tokio::select! {
            _ = &mut shutdown => break,
            Some(envelope) = events.messages.recv() => {
                let kind = envelope.message.kind();
                if let Err(err) = room.lock().await.handle_message(envelope, Moment::now()) {
                    warn!("Failed to handle {:?} message: {}", kind, err);
                }
            }
            Some(peer) = events.joins.recv() => {
                if let Err(err) = room.lock().await.handle_peer_join(&peer, Moment::now()) {
                    warn!("Failed to handle join of {}: {}", peer, err);
                }
            }
            Some(peer) = events.leaves.recv() => {
                if let Err(err) = room.lock().await.handle_peer_leave(&peer, Moment::now()) {
                    warn!("Failed to handle leave of {}: {}", peer, err);
                }
            }
            Some(now) = next_tick(&mut clock), if clock.is_some() => {
                if let Err(err) = room.lock().await.sync_tick(now) {
                    error!("Sync tick failed: {}", err);
                }
            }
            _ = reconcile.tick(), if is_host => {
                if let Err(err) = room.lock().await.reconcile(Moment::now()) {
                    warn!("Reconciliation failed: {}", err);
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Err(err) = room.lock().await.poll_timers(Moment::now()) {
                    warn!("Lobby timer failed: {}", err);
                }
            }
        }
    }

    drop(clock);
    debug!("Sync clock stopped");
    room.lock().await.cancel_auto_start();
    drop(reconcile);
    debug!("Reconciliation timer stopped");
    drop(events);

    let mut room = room.lock().await;
    room.destroy();
    info!("Room driver for {} shut down", room.player_id());
}

async fn next_tick(clock: &mut Option<SyncClock>) -> Option<Instant> {
    match clock {
        Some(clock) => Some(clock.next_tick().await),
        None => None,
    }
}

impl<T: Transport> RoomHandle<T> {
    /// Shared access to the room itself
    pub fn room(&self) -> Arc<Mutex<Room<T>>> {
        Arc::clone(&self.room)
    }

    /// Runs `f` with exclusive access to the room
    pub async fn with<R>(&self, f: impl FnOnce(&mut Room<T>) -> R) -> R {
        let mut room = self.room.lock().await;
        f(&mut room)
    }

    /// A snapshot of the current state
    pub async fn state(&self) -> Value {
        self.room.lock().await.state().clone()
    }

    pub async fn submit_action(
        &self,
        name: &str,
        input: Value,
        target: Option<&str>,
    ) -> Result<()> {
        self.room.lock().await.submit_action(name, input, target)
    }

    pub async fn mutate_state(&self, mutate: impl FnOnce(&mut Value)) -> Result<()> {
        self.room.lock().await.mutate_state(mutate)
    }

    pub async fn broadcast_event(&self, name: &str, payload: Value) -> Result<()> {
        self.room.lock().await.broadcast_event(name, payload)
    }

    /// Waits until at least `count` players are present
    ///
    /// Suspends only the caller. Fails with [`RuntimeError::Timeout`] once
    /// `limit` elapses, or [`RuntimeError::Destroyed`] if the room stops
    /// first.
    pub async fn wait_for_players(&self, count: usize, limit: Option<Duration>) -> Result<()> {
        let mut presence = self.presence.clone();
        let wait = async move {
            loop {
                if *presence.borrow_and_update() >= count {
                    return Ok(());
                }
                if presence.changed().await.is_err() {
                    return Err(RuntimeError::Destroyed);
                }
            }
        };

        match limit {
            Some(limit) => match timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout {
                    wanted: count,
                    present: *self.presence.borrow(),
                }),
            },
            None => wait.await,
        }
    }

    /// Stops the room and waits for its teardown
    pub async fn destroy(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The loop may already be gone
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("Room driver task failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LobbyConfig;
    use crate::game::GameDefinition;
    use crate::lobby::{Phase, PhaseReason};
    use crate::scheduler::frame_channel;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    fn game(lobby: Option<LobbyConfig>) -> GameDefinition {
        let mut builder = GameDefinition::builder()
            .setup(|_, _| Value::map())
            .action("set", |state, ctx, input| {
                state.insert(ctx.player_id.as_str(), input.clone());
            });
        if let Some(config) = lobby {
            builder = builder.lobby(config);
        }
        builder.build().unwrap()
    }

    fn start(
        network: &MemoryNetwork,
        id: &str,
        lobby: Option<LobbyConfig>,
    ) -> RoomHandle<MemoryTransport> {
        let transport = network.connect(id).unwrap();
        let room = Room::new(game(lobby), transport, RuntimeConfig::default()).unwrap();
        spawn(room, None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_converges_through_driver() {
        let network = MemoryNetwork::new();
        let host = start(&network, "host", None);
        let client = start(&network, "c1", None);

        client.submit_action("set", Value::Int(7), None).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let state = client.state().await;
        assert_eq!(state.get("c1"), Some(&Value::Int(7)));
        assert_eq!(state, host.state().await);

        client.destroy().await;
        host.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_players() {
        let network = MemoryNetwork::new();
        let host = start(&network, "host", Some(LobbyConfig::new(1)));

        let timed_out = host.wait_for_players(2, Some(Duration::from_millis(50))).await;
        assert!(matches!(
            timed_out,
            Err(RuntimeError::Timeout {
                wanted: 2,
                present: 1
            })
        ));

        let _client = start(&network, "c1", Some(LobbyConfig::new(1)));
        host.wait_for_players(2, Some(Duration::from_secs(1)))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_start_fires_in_driver() {
        let config = LobbyConfig::new(2).with_auto_start(Duration::from_secs(3));
        let network = MemoryNetwork::new();
        let host = start(&network, "host", Some(config.clone()));

        let reasons = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        host.with(|room| {
            room.on_phase_change(move |change| sink.lock().unwrap().push(change.reason));
        })
        .await;

        let _client = start(&network, "c1", Some(config));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(host.with(|room| room.phase()).await, Some(Phase::Lobby));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(host.with(|room| room.phase()).await, Some(Phase::Playing));
        assert_eq!(*reasons.lock().unwrap(), vec![PhaseReason::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_timers_and_subscriptions() {
        let config = LobbyConfig::new(2).with_auto_start(Duration::from_secs(1));
        let network = MemoryNetwork::new();
        let host = start(&network, "host", Some(config.clone()));
        let _client = start(&network, "c1", Some(config));
        sleep(Duration::from_millis(100)).await;

        let room = host.room();
        assert!(room.lock().await.next_deadline().is_some());
        host.destroy().await;

        let room = room.lock().await;
        assert!(room.is_destroyed());
        assert!(room.next_deadline().is_none());
        assert_eq!(room.phase(), Some(Phase::Lobby));
    }

    #[tokio::test]
    async fn test_frame_driven_host_ticks() {
        let network = MemoryNetwork::new();
        let transport = network.connect("host").unwrap();
        let room = Room::new(game(None), transport, RuntimeConfig::default()).unwrap();
        let (frames, signal) = frame_channel();
        let host = spawn(room, Some(signal)).unwrap();

        let patches = Arc::new(StdMutex::new(0usize));
        let sink = Arc::clone(&patches);
        host.with(|room| {
            room.on_patch(move |batch| *sink.lock().unwrap() += batch.len());
        })
        .await;
        host.submit_action("set", Value::Bool(true), None).await.unwrap();

        let start = Instant::now();
        for i in 0..4u32 {
            frames.send(start + Duration::from_millis(16) * i).unwrap();
        }
        sleep(Duration::from_millis(20)).await;

        assert_eq!(*patches.lock().unwrap(), 1);
        host.destroy().await;
    }
}
