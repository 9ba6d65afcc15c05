//! The runtime coordinator
//!
//! A [`Room`] owns the state and wires every other component together:
//! transport events go to the dispatcher and the lobby machine, host ticks
//! go through the sync scheduler, and every change is fanned out to the
//! registered listeners.
//!
//! `Room` is synchronous. Nothing in here awaits; the [`driver`] module
//! owns the event loop and the timers and calls into the room one event at
//! a time, so the state is never touched concurrently.
//!
//! [`driver`]: crate::driver

use crate::actions::{
    run_action, ActionDispatcher, ActionHandler, Invocation, END_ACTION, READY_ACTION, START_ACTION,
};
use crate::config::RuntimeConfig;
use crate::error::{ConfigError, Result, RuntimeError};
use crate::game::GameDefinition;
use crate::lobby::{LobbyEffects, LobbyMachine, LobbyState, Phase, PhaseChange};
use crate::observers::{Observers, SubscriptionId};
use crate::scheduler::{SyncOutcome, SyncScheduler};
use crate::transport::{Envelope, Subscription, Transport};
use crate::utils::{get_timestamp, Moment};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use shared::{apply_patches, Patch, Payload, SeededRandom, StateSync, Value, WireMessage};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Seed of the random source handed to the game's setup function
const SETUP_SEED: u32 = 1;

/// The transport event streams a room listens to
pub struct RoomEvents {
    pub messages: Subscription<Envelope>,
    pub joins: Subscription<String>,
    pub leaves: Subscription<String>,
}

/// A custom event received from another participant
#[derive(Debug, Clone, PartialEq)]
pub struct GameEvent {
    pub name: String,
    pub payload: Value,
    pub sender: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topic {
    Change,
    Patch,
    Event,
    Phase,
}

/// Returned by the `on_*` registrations; pass to [`Room::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    topic: Topic,
    id: SubscriptionId,
}

pub struct Room<T: Transport> {
    transport: T,
    config: RuntimeConfig,
    game: GameDefinition,
    dispatcher: ActionDispatcher,
    lobby: Option<LobbyMachine>,
    scheduler: SyncScheduler,
    state: Value,
    player_id: String,
    host_id: Option<String>,
    events: Option<RoomEvents>,
    change_listeners: Observers<Value>,
    patch_listeners: Observers<[Patch]>,
    event_listeners: Observers<GameEvent>,
    phase_listeners: Observers<PhaseChange>,
    presence: Option<watch::Sender<usize>>,
    destroyed: bool,
}

impl<T: Transport> Room<T> {
    /// Builds a room around a connected transport
    ///
    /// The host runs the game's setup and, with a lobby, records a presence
    /// for every peer already connected. A client starts from an empty
    /// mirror and asks the network who the host is; the host answers with
    /// the full state.
    pub fn new(
        game: GameDefinition,
        transport: T,
        config: RuntimeConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let player_id = transport.player_id();
        let is_host = transport.is_host();

        let mut dispatcher = ActionDispatcher::new();
        for (name, handler) in &game.actions {
            dispatcher.register(name.clone(), Arc::clone(handler))?;
        }

        let mut lobby = game.lobby().cloned().map(LobbyMachine::new);
        if lobby.is_some() {
            dispatcher.register_lobby_actions();
        }

        let state = if is_host {
            let mut players = vec![player_id.clone()];
            players.extend(transport.peer_ids());

            let mut state = game.initial_state(&players, &mut SeededRandom::new(SETUP_SEED))?;
            if let Some(machine) = lobby.as_mut() {
                if state.as_map().is_none() {
                    return Err(ConfigError::NonMapState(state.kind()));
                }
                machine.install(&mut state, &players, Moment::now())?;
            }
            state
        } else {
            Value::map()
        };

        let events = RoomEvents {
            messages: transport.on_message(),
            joins: transport.on_peer_join(),
            leaves: transport.on_peer_leave(),
        };

        let (presence, _) = watch::channel(0);
        let mut room = Self {
            scheduler: SyncScheduler::new(&state, config.heartbeat_interval, Instant::now()),
            host_id: is_host.then(|| player_id.clone()),
            transport,
            config,
            game,
            dispatcher,
            lobby,
            state,
            player_id,
            events: Some(events),
            change_listeners: Observers::new("change"),
            patch_listeners: Observers::new("patch"),
            event_listeners: Observers::new("event"),
            phase_listeners: Observers::new("phase"),
            presence: Some(presence),
            destroyed: false,
        };
        room.update_presence();

        info!(
            "Room created for {} as {} ({} actions)",
            room.player_id,
            if is_host { "host" } else { "client" },
            room.dispatcher.len()
        );

        if !is_host {
            if let Err(err) = room.send(WireMessage::new(Payload::HostQuery), None) {
                warn!("Host query failed: {}", err);
            }
        }

        Ok(room)
    }

    /// Hands the transport event streams to whoever drives the room
    pub fn take_events(&mut self) -> Option<RoomEvents> {
        self.events.take()
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// The state converted into a typed view
    pub fn state_as<S: DeserializeOwned>(&self) -> Result<S> {
        Ok(self.state.deserialize_into()?)
    }

    pub fn is_host(&self) -> bool {
        self.transport.is_host()
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// The host as last announced to this participant
    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn lobby_state(&self) -> Option<LobbyState> {
        LobbyState::read(&self.state)
    }

    pub fn phase(&self) -> Option<Phase> {
        self.lobby_state().map(|lobby| lobby.phase)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Number of players present, updated on every change
    pub fn presence_watch(&self) -> Option<watch::Receiver<usize>> {
        self.presence.as_ref().map(watch::Sender::subscribe)
    }

    /// Submits an action by name
    ///
    /// On the host the action is applied immediately. Everywhere it is also
    /// broadcast; a client's own state only changes once the host's patches
    /// come back.
    pub fn submit_action(&mut self, name: &str, input: Value, target: Option<&str>) -> Result<()> {
        self.ensure_alive()?;
        let is_host = self.is_host();

        let prepared = self
            .dispatcher
            .prepare(name, input, &self.player_id, target, is_host);
        let invocation = match prepared {
            Ok(invocation) => invocation,
            Err(err) => return self.usage(err),
        };
        let message = WireMessage::action(invocation.to_message());

        if is_host {
            if let Err(err) = self.apply_invocation(invocation, Moment::now()) {
                return self.usage(err);
            }
        }

        self.send(message, None)
    }

    /// Sets this player's ready flag
    pub fn set_ready(&mut self, ready: bool) -> Result<()> {
        let mut input = Value::map();
        input.insert("ready", ready);
        self.submit_action(READY_ACTION, input, None)
    }

    /// Flips this player's ready flag
    pub fn toggle_ready(&mut self) -> Result<()> {
        self.submit_action(READY_ACTION, Value::map(), None)
    }

    pub fn request_start(&mut self) -> Result<()> {
        self.submit_action(START_ACTION, Value::map(), None)
    }

    pub fn request_end(&mut self) -> Result<()> {
        self.submit_action(END_ACTION, Value::map(), None)
    }

    /// Sends a custom event to every other participant
    pub fn broadcast_event(&mut self, name: &str, payload: Value) -> Result<()> {
        self.ensure_alive()?;
        self.send(WireMessage::event(name, payload), None)
    }

    /// Host-only direct mutation, notified like any action
    pub fn mutate_state(&mut self, mutate: impl FnOnce(&mut Value)) -> Result<()> {
        self.ensure_alive()?;
        if !self.is_host() {
            return self.usage(RuntimeError::NotHost {
                operation: "mutate_state",
            });
        }
        mutate(&mut self.state);
        self.notify_change();
        Ok(())
    }

    pub fn on_change(&mut self, listener: impl FnMut(&Value) + Send + 'static) -> Listener {
        Listener {
            topic: Topic::Change,
            id: self.change_listeners.subscribe(listener),
        }
    }

    /// Receives the patches of each sync, as computed by the host
    pub fn on_patch(&mut self, listener: impl FnMut(&[Patch]) + Send + 'static) -> Listener {
        Listener {
            topic: Topic::Patch,
            id: self.patch_listeners.subscribe(listener),
        }
    }

    pub fn on_event(
        &mut self,
        name: impl Into<String>,
        mut listener: impl FnMut(&GameEvent) + Send + 'static,
    ) -> Listener {
        let name = name.into();
        let id = self.event_listeners.subscribe(move |event: &GameEvent| {
            if event.name == name {
                listener(event);
            }
        });
        Listener {
            topic: Topic::Event,
            id,
        }
    }

    pub fn on_phase_change(
        &mut self,
        listener: impl FnMut(&PhaseChange) + Send + 'static,
    ) -> Listener {
        Listener {
            topic: Topic::Phase,
            id: self.phase_listeners.subscribe(listener),
        }
    }

    pub fn unsubscribe(&mut self, listener: Listener) -> bool {
        match listener.topic {
            Topic::Change => self.change_listeners.unsubscribe(listener.id),
            Topic::Patch => self.patch_listeners.unsubscribe(listener.id),
            Topic::Event => self.event_listeners.unsubscribe(listener.id),
            Topic::Phase => self.phase_listeners.unsubscribe(listener.id),
        }
    }

    /// Processes one inbound message
    pub fn handle_message(&mut self, envelope: Envelope, at: Moment) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        let Envelope { from, message } = envelope;
        let is_host = self.is_host();

        match message.payload {
            Payload::StateSync(sync) => {
                if is_host {
                    warn!("Ignoring state sync from {} on the host", from);
                    return Ok(());
                }
                if self.host_id.is_none() {
                    self.host_id = Some(from);
                }
                self.apply_sync(sync)
            }
            Payload::Action(action) => {
                // Clients wait for the host's patches; the host skips its own echo
                if !is_host || from == self.player_id {
                    return Ok(());
                }
                let invocation = match self.dispatcher.receive(action, &from) {
                    Ok(invocation) => invocation,
                    Err(err) => return self.usage(err),
                };
                match self.apply_invocation(invocation, at) {
                    Ok(()) => Ok(()),
                    Err(err) => self.usage(err),
                }
            }
            Payload::Event {
                event_name,
                payload,
            } => {
                self.event_listeners.notify(&GameEvent {
                    name: event_name,
                    payload,
                    sender: from,
                });
                Ok(())
            }
            Payload::Heartbeat { .. } => {
                if !is_host {
                    self.notify_change();
                }
                Ok(())
            }
            Payload::HostMigration { new_host_id } => {
                info!("Host migrated to {}", new_host_id);
                self.host_id = Some(new_host_id);
                Ok(())
            }
            Payload::HostQuery => {
                if !is_host {
                    return Ok(());
                }
                debug!("Answering host query from {}", from);
                let announce = WireMessage::new(Payload::HostAnnounce {
                    host_id: self.player_id.clone(),
                });
                self.send(announce, Some(from.as_str()))?;
                self.send(WireMessage::full_state(self.state.clone()), Some(from.as_str()))
            }
            Payload::HostAnnounce { host_id } => {
                debug!("Host announced as {}", host_id);
                self.host_id = Some(host_id);
                Ok(())
            }
        }
    }

    /// Registers a newly connected peer and bootstraps its mirror
    pub fn handle_peer_join(&mut self, peer: &str, at: Moment) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if !self.is_host() {
            self.update_presence();
            return Ok(());
        }

        let effects = match self.lobby.as_mut() {
            Some(machine) => match machine.player_joined(&mut self.state, peer, at) {
                Ok(effects) => effects,
                Err(err @ RuntimeError::LobbyRejected { .. }) => {
                    warn!("Not admitting {}: {}", peer, err);
                    return Ok(());
                }
                Err(err) => return Err(err),
            },
            None => LobbyEffects {
                joined: vec![peer.to_string()],
                ..LobbyEffects::default()
            },
        };

        self.apply_effects(effects);
        self.notify_change();
        self.send(WireMessage::full_state(self.state.clone()), Some(peer))
    }

    pub fn handle_peer_leave(&mut self, peer: &str, at: Moment) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if !self.is_host() {
            if self.host_id.as_deref() == Some(peer) {
                warn!("Host {} left the room", peer);
            }
            self.update_presence();
            return Ok(());
        }

        let effects = match self.lobby.as_mut() {
            Some(machine) => machine.player_left(&mut self.state, peer, at)?,
            None => LobbyEffects {
                left: vec![peer.to_string()],
                ..LobbyEffects::default()
            },
        };

        self.apply_effects(effects);
        self.notify_change();
        Ok(())
    }

    /// Runs one sync tick on the host
    pub fn sync_tick(&mut self, now: Instant) -> Result<SyncOutcome> {
        if self.destroyed || !self.is_host() {
            return Ok(SyncOutcome::Idle);
        }

        let outcome = self.scheduler.tick(&self.state, now);
        match &outcome {
            SyncOutcome::Idle => {}
            SyncOutcome::Patches(patches) => {
                self.send(WireMessage::patches(patches.clone()), None)?;
                self.patch_listeners.notify(patches.as_slice());
            }
            SyncOutcome::FullState => {
                info!("State root changed shape, sending full state");
                self.send(WireMessage::full_state(self.state.clone()), None)?;
                self.notify_change();
            }
            SyncOutcome::Heartbeat => {
                self.send(WireMessage::heartbeat(), None)?;
                self.notify_change();
            }
        }
        Ok(outcome)
    }

    /// Evicts presences the transport no longer knows about
    pub fn reconcile(&mut self, at: Moment) -> Result<()> {
        if self.destroyed || !self.is_host() {
            return Ok(());
        }
        let Some(machine) = self.lobby.as_mut() else {
            return Ok(());
        };

        let mut live = self.transport.peer_ids();
        live.push(self.player_id.clone());

        let effects = machine.reconcile(&mut self.state, &live, at)?;
        if !effects.left.is_empty() {
            info!("Reconciliation evicted {} presence(s)", effects.left.len());
            self.apply_effects(effects);
            self.notify_change();
        }
        Ok(())
    }

    /// Fires any lobby timer that has come due
    pub fn poll_timers(&mut self, at: Moment) -> Result<()> {
        if self.destroyed || !self.is_host() {
            return Ok(());
        }
        let Some(machine) = self.lobby.as_mut() else {
            return Ok(());
        };

        let effects = machine.poll_auto_start(&mut self.state, at)?;
        if !effects.is_empty() {
            self.apply_effects(effects);
            self.notify_change();
        }
        Ok(())
    }

    /// When the next lobby timer is due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lobby.as_ref().and_then(LobbyMachine::auto_start_deadline)
    }

    pub fn cancel_auto_start(&mut self) {
        if let Some(machine) = self.lobby.as_mut() {
            machine.cancel_auto_start();
        }
    }

    /// Stops the room: no listener, timer or transport event reaches the
    /// state afterwards
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.cancel_auto_start();
        self.events = None;
        self.change_listeners.clear();
        self.patch_listeners.clear();
        self.event_listeners.clear();
        self.phase_listeners.clear();
        self.presence = None;
        self.destroyed = true;
        info!("Room for {} destroyed", self.player_id);
    }

    fn apply_invocation(&mut self, mut invocation: Invocation, at: Moment) -> Result<()> {
        match invocation.handler.clone() {
            ActionHandler::Game(handler) => run_action(
                handler.as_ref(),
                &invocation.name,
                &mut self.state,
                &mut invocation.context,
                &invocation.input,
            )?,
            ActionHandler::Lobby(command) => {
                let Some(machine) = self.lobby.as_mut() else {
                    return Ok(());
                };
                let effects = machine.apply(
                    command,
                    &mut self.state,
                    &invocation.context,
                    &invocation.input,
                    at,
                )?;
                self.apply_effects(effects);
            }
        }
        self.notify_change();
        Ok(())
    }

    /// Runs game hooks and listeners for what the lobby reported
    fn apply_effects(&mut self, effects: LobbyEffects) {
        for player in &effects.joined {
            if let Some(hook) = &self.game.on_player_join {
                hook(&mut self.state, player);
            }
        }
        for player in &effects.left {
            if let Some(hook) = &self.game.on_player_leave {
                hook(&mut self.state, player);
            }
        }
        if let Some((player, ready)) = &effects.readied {
            if let Some(hook) = &self.game.on_player_ready {
                hook(&mut self.state, player, *ready);
            }
        }

        for change in &effects.changes {
            if let Some(hook) = &self.game.on_phase_change {
                hook(&mut self.state, change);
            }
            self.phase_listeners.notify(change);

            let late_join = self.lobby.as_ref().map(|machine| machine.config().allow_late_join);
            if change.to == Phase::Playing && late_join == Some(false) {
                self.transport.lock();
            }
        }
    }

    fn apply_sync(&mut self, sync: StateSync) -> Result<()> {
        match sync {
            StateSync::Full { full_state } => {
                debug!("Received full state");
                self.state = full_state;
            }
            StateSync::Patches { patches } => {
                if let Err(err) = apply_patches(&mut self.state, &patches) {
                    return self.usage(err.into());
                }
                self.patch_listeners.notify(patches.as_slice());
            }
        }
        self.notify_change();
        Ok(())
    }

    fn notify_change(&mut self) {
        self.change_listeners.notify(&self.state);
        self.update_presence();
    }

    fn update_presence(&self) {
        let Some(presence) = &self.presence else {
            return;
        };
        let count = match self.lobby_state() {
            Some(lobby) => lobby.player_count(),
            None => self.transport.peer_ids().len() + 1,
        };
        presence.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            return Err(RuntimeError::Destroyed);
        }
        Ok(())
    }

    /// Returns usage errors in strict mode and logs them otherwise
    fn usage(&self, err: RuntimeError) -> Result<()> {
        if self.config.strict || err.is_invariant_violation() {
            return Err(err);
        }
        warn!("{}", err);
        Ok(())
    }

    fn send(&self, message: WireMessage, target: Option<&str>) -> Result<()> {
        let message = message.from_sender(self.player_id.as_str()).at(get_timestamp());
        self.transport.send(&message, target).map_err(|err| {
            error!("Failed to send {:?} message: {}", message.kind(), err);
            RuntimeError::from(err)
        })
    }
}
