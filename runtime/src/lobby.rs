//! Room lifecycle: lobby, playing, ended
//!
//! The lobby section lives inside the shared state under [`LOBBY_KEY`], so
//! clients see phase, presence and readiness through ordinary sync patches.
//! Only the host's [`LobbyMachine`] writes it. The machine itself holds
//! nothing but the config and the auto-start deadline.
//!
//! Phases only move forward. Every transition records its timestamp and
//! yields a [`PhaseChange`] for the room to hand to hooks and listeners.

use crate::actions::ActionContext;
use crate::config::LobbyConfig;
use crate::error::{ConfigError, Result, RuntimeError};
use crate::utils::Moment;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::Value;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Reserved top-level state key holding the [`LobbyState`]
pub const LOBBY_KEY: &str = "__lobby";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Lobby,
    Playing,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseReason {
    Manual,
    Timeout,
    AllReady,
    PlayerLeft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
    pub reason: PhaseReason,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerPresence {
    pub player_id: String,
    pub ready: bool,
    pub joined_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl PlayerPresence {
    pub fn new(player_id: impl Into<String>, joined_at: u64) -> Self {
        Self {
            player_id: player_id.into(),
            ready: false,
            joined_at,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyState {
    pub phase: Phase,
    pub players: BTreeMap<String, PlayerPresence>,
    pub config: LobbyConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
}

impl LobbyState {
    pub fn new(config: LobbyConfig) -> Self {
        Self {
            phase: Phase::Lobby,
            players: BTreeMap::new(),
            config,
            started_at: None,
            ended_at: None,
        }
    }

    /// Reads the lobby section out of a state tree
    pub fn read(state: &Value) -> Option<Self> {
        state
            .get(LOBBY_KEY)
            .and_then(|section| section.deserialize_into().ok())
    }

    fn write(&self, state: &mut Value) -> std::result::Result<(), serde_json::Error> {
        state.insert(LOBBY_KEY, Value::from_serialize(self)?);
        Ok(())
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Every present player is ready and there are enough of them
    pub fn all_ready(&self) -> bool {
        self.players.len() >= self.config.min_players
            && !self.players.is_empty()
            && self.players.values().all(|p| p.ready)
    }
}

/// The built-in lobby actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyCommand {
    MarkReady,
    RequestStart,
    RequestEnd,
}

/// Side effects of a lobby operation, for the room to act on
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LobbyEffects {
    pub changes: Vec<PhaseChange>,
    /// A player whose ready flag was set, and its new value
    pub readied: Option<(String, bool)>,
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

impl LobbyEffects {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
            && self.readied.is_none()
            && self.joined.is_empty()
            && self.left.is_empty()
    }
}

pub struct LobbyMachine {
    config: LobbyConfig,
    auto_start_deadline: Option<Instant>,
}

impl LobbyMachine {
    pub fn new(config: LobbyConfig) -> Self {
        Self {
            config,
            auto_start_deadline: None,
        }
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    /// Embeds a fresh lobby section holding the already-known players
    pub fn install(
        &mut self,
        state: &mut Value,
        players: &[String],
        at: Moment,
    ) -> std::result::Result<(), ConfigError> {
        let mut lobby = LobbyState::new(self.config.clone());
        for id in players {
            lobby
                .players
                .insert(id.clone(), PlayerPresence::new(id.as_str(), at.wall_ms));
        }
        let mut effects = LobbyEffects::default();
        self.evaluate_start(&mut lobby, at, &mut effects);
        Ok(lobby.write(state)?)
    }

    pub fn auto_start_deadline(&self) -> Option<Instant> {
        self.auto_start_deadline
    }

    pub fn cancel_auto_start(&mut self) {
        if self.auto_start_deadline.take().is_some() {
            debug!("Auto-start timer cancelled");
        }
    }

    fn load(state: &Value) -> Result<LobbyState> {
        let section = state.get(LOBBY_KEY).cloned().unwrap_or_default();
        Ok(section.deserialize_into()?)
    }

    /// Adds a presence for a newly connected peer
    ///
    /// Rejections leave the state untouched and are returned as
    /// [`RuntimeError::LobbyRejected`].
    pub fn player_joined(
        &mut self,
        state: &mut Value,
        player_id: &str,
        at: Moment,
    ) -> Result<LobbyEffects> {
        let mut lobby = Self::load(state)?;
        let mut effects = LobbyEffects::default();

        if lobby.players.contains_key(player_id) {
            return Ok(effects);
        }
        if let Some(max) = self.config.max_players {
            if lobby.player_count() >= max {
                return Err(rejected("join", format!("room is full ({} players)", max)));
            }
        }
        if lobby.phase == Phase::Playing && !self.config.allow_late_join {
            return Err(rejected("join", "game already in progress"));
        }

        lobby
            .players
            .insert(player_id.to_string(), PlayerPresence::new(player_id, at.wall_ms));
        effects.joined.push(player_id.to_string());
        info!("Player {} joined the lobby ({} present)", player_id, lobby.player_count());

        self.evaluate_start(&mut lobby, at, &mut effects);
        lobby.write(state)?;
        Ok(effects)
    }

    /// Removes a presence, ending the game if too few players remain
    pub fn player_left(
        &mut self,
        state: &mut Value,
        player_id: &str,
        at: Moment,
    ) -> Result<LobbyEffects> {
        let mut lobby = Self::load(state)?;
        let mut effects = LobbyEffects::default();

        if lobby.players.remove(player_id).is_none() {
            return Ok(effects);
        }
        effects.left.push(player_id.to_string());
        info!("Player {} left ({} present)", player_id, lobby.player_count());

        self.after_departure(&mut lobby, at, &mut effects);
        lobby.write(state)?;
        Ok(effects)
    }

    /// Evicts every presence whose id the transport no longer reports
    pub fn reconcile(
        &mut self,
        state: &mut Value,
        live: &[String],
        at: Moment,
    ) -> Result<LobbyEffects> {
        let mut lobby = Self::load(state)?;
        let mut effects = LobbyEffects::default();

        let stale: Vec<String> = lobby
            .players
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        if stale.is_empty() {
            return Ok(effects);
        }

        for id in stale {
            warn!("Evicting {}: missing from the transport peer list", id);
            lobby.players.remove(&id);
            effects.left.push(id);
        }

        self.after_departure(&mut lobby, at, &mut effects);
        lobby.write(state)?;
        Ok(effects)
    }

    /// Fires the auto-start timer if its deadline has passed
    pub fn poll_auto_start(&mut self, state: &mut Value, at: Moment) -> Result<LobbyEffects> {
        let mut effects = LobbyEffects::default();
        match self.auto_start_deadline {
            Some(deadline) if deadline <= at.instant => {}
            _ => return Ok(effects),
        }
        self.auto_start_deadline = None;

        let mut lobby = Self::load(state)?;
        if lobby.phase == Phase::Lobby && lobby.player_count() >= self.config.min_players {
            self.transition(&mut lobby, Phase::Playing, PhaseReason::Timeout, at, &mut effects);
            lobby.write(state)?;
        } else {
            debug!("Auto-start timer elapsed without enough players");
        }
        Ok(effects)
    }

    /// Applies one of the built-in lobby actions
    pub fn apply(
        &mut self,
        command: LobbyCommand,
        state: &mut Value,
        context: &ActionContext,
        input: &Value,
        at: Moment,
    ) -> Result<LobbyEffects> {
        let mut lobby = Self::load(state)?;
        let mut effects = LobbyEffects::default();

        match command {
            LobbyCommand::MarkReady => {
                let target = context.target_id.as_str();
                if !context.is_host && target != context.player_id {
                    return Err(rejected("ready", "players may only change their own readiness"));
                }
                let Some(presence) = lobby.players.get_mut(target) else {
                    return Err(rejected("ready", format!("`{}` is not in the lobby", target)));
                };
                let ready = input
                    .get("ready")
                    .and_then(Value::as_bool)
                    .unwrap_or(!presence.ready);
                presence.ready = ready;
                effects.readied = Some((target.to_string(), ready));
                debug!("Player {} ready: {}", target, ready);
                self.evaluate_start(&mut lobby, at, &mut effects);
            }
            LobbyCommand::RequestStart => {
                if lobby.phase != Phase::Lobby {
                    return Err(rejected("start", "room is not in the lobby phase"));
                }
                if !context.is_host && !lobby.all_ready() {
                    return Err(rejected(
                        "start",
                        "only the host may start before everyone is ready",
                    ));
                }
                if lobby.player_count() < self.config.min_players {
                    return Err(rejected(
                        "start",
                        format!(
                            "{} of {} required players present",
                            lobby.player_count(),
                            self.config.min_players
                        ),
                    ));
                }
                self.transition(&mut lobby, Phase::Playing, PhaseReason::Manual, at, &mut effects);
            }
            LobbyCommand::RequestEnd => {
                if lobby.phase != Phase::Playing {
                    return Err(rejected("end", "no game in progress"));
                }
                self.transition(&mut lobby, Phase::Ended, PhaseReason::Manual, at, &mut effects);
            }
        }

        lobby.write(state)?;
        Ok(effects)
    }

    fn after_departure(&mut self, lobby: &mut LobbyState, at: Moment, effects: &mut LobbyEffects) {
        match lobby.phase {
            Phase::Playing if lobby.player_count() < self.config.min_players => {
                self.transition(lobby, Phase::Ended, PhaseReason::PlayerLeft, at, effects);
            }
            Phase::Lobby => self.evaluate_start(lobby, at, effects),
            _ => {}
        }
    }

    /// Starts on all-ready, or arms/cancels the auto-start timer
    fn evaluate_start(&mut self, lobby: &mut LobbyState, at: Moment, effects: &mut LobbyEffects) {
        if lobby.phase != Phase::Lobby {
            return;
        }

        if lobby.player_count() < self.config.min_players {
            self.cancel_auto_start();
            return;
        }

        if self.config.require_all_ready && lobby.all_ready() {
            self.transition(lobby, Phase::Playing, PhaseReason::AllReady, at, effects);
            return;
        }

        if let Some(timeout) = self.config.auto_start_timeout() {
            if self.auto_start_deadline.is_none() {
                debug!("Auto-start armed for {:?}", timeout);
                self.auto_start_deadline = Some(at.instant + timeout);
            }
        }
    }

    fn transition(
        &mut self,
        lobby: &mut LobbyState,
        to: Phase,
        reason: PhaseReason,
        at: Moment,
        effects: &mut LobbyEffects,
    ) {
        let from = lobby.phase;
        if to <= from {
            return;
        }

        lobby.phase = to;
        match to {
            Phase::Playing => {
                lobby.started_at = Some(at.wall_ms);
                self.cancel_auto_start();
            }
            Phase::Ended => lobby.ended_at = Some(at.wall_ms),
            Phase::Lobby => {}
        }

        info!("Room phase {:?} -> {:?} ({:?})", from, to, reason);
        effects.changes.push(PhaseChange {
            from,
            to,
            reason,
            timestamp: at.wall_ms,
        });
    }
}

fn rejected(action: &str, reason: impl Into<String>) -> RuntimeError {
    RuntimeError::LobbyRejected {
        action: action.to_string(),
        reason: reason.into(),
    }
}
