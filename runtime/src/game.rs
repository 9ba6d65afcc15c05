//! The game-definition contract
//!
//! A game is a setup function, a set of named actions and a few optional
//! lifecycle hooks. Everything is registered through [`GameBuilder`] and
//! validated once, in [`GameBuilder::build`].

use crate::actions::{ActionContext, ActionFn, LOBBY_NAMESPACE};
use crate::config::LobbyConfig;
use crate::error::ConfigError;
use crate::lobby::PhaseChange;
use serde::Serialize;
use shared::{SeededRandom, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

pub type SetupFn =
    dyn Fn(&[String], &mut SeededRandom) -> Result<Value, serde_json::Error> + Send + Sync;
pub type PlayerHook = dyn Fn(&mut Value, &str) + Send + Sync;
pub type ReadyHook = dyn Fn(&mut Value, &str, bool) + Send + Sync;
pub type PhaseHook = dyn Fn(&mut Value, &PhaseChange) + Send + Sync;

pub struct GameDefinition {
    setup: Box<SetupFn>,
    pub(crate) actions: Vec<(String, Arc<ActionFn>)>,
    pub(crate) on_player_join: Option<Box<PlayerHook>>,
    pub(crate) on_player_leave: Option<Box<PlayerHook>>,
    pub(crate) on_player_ready: Option<Box<ReadyHook>>,
    pub(crate) on_phase_change: Option<Box<PhaseHook>>,
    lobby: Option<LobbyConfig>,
}

impl GameDefinition {
    pub fn builder() -> GameBuilder {
        GameBuilder::default()
    }

    /// Runs the setup function for the given starting players
    pub fn initial_state(
        &self,
        players: &[String],
        random: &mut SeededRandom,
    ) -> Result<Value, ConfigError> {
        Ok((self.setup)(players, random)?)
    }

    pub fn lobby(&self) -> Option<&LobbyConfig> {
        self.lobby.as_ref()
    }
}

#[derive(Default)]
pub struct GameBuilder {
    setup: Option<Box<SetupFn>>,
    actions: Vec<(String, Arc<ActionFn>)>,
    on_player_join: Option<Box<PlayerHook>>,
    on_player_leave: Option<Box<PlayerHook>>,
    on_player_ready: Option<Box<ReadyHook>>,
    on_phase_change: Option<Box<PhaseHook>>,
    lobby: Option<LobbyConfig>,
}

impl GameBuilder {
    pub fn setup(
        mut self,
        setup: impl Fn(&[String], &mut SeededRandom) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.setup = Some(Box::new(
            move |players: &[String],
                  random: &mut SeededRandom|
                  -> Result<Value, serde_json::Error> { Ok(setup(players, random)) },
        ));
        self
    }

    /// Setup returning a typed state, converted into a [`Value`] tree
    pub fn setup_typed<S, F>(mut self, setup: F) -> Self
    where
        S: Serialize,
        F: Fn(&[String], &mut SeededRandom) -> S + Send + Sync + 'static,
    {
        self.setup = Some(Box::new(move |players: &[String], random: &mut SeededRandom| {
            Value::from_serialize(&setup(players, random))
        }));
        self
    }

    pub fn action(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&mut Value, &mut ActionContext, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.actions.push((name.into(), Arc::new(handler)));
        self
    }

    pub fn on_player_join(
        mut self,
        hook: impl Fn(&mut Value, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_player_join = Some(Box::new(hook));
        self
    }

    pub fn on_player_leave(
        mut self,
        hook: impl Fn(&mut Value, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_player_leave = Some(Box::new(hook));
        self
    }

    pub fn on_player_ready(
        mut self,
        hook: impl Fn(&mut Value, &str, bool) + Send + Sync + 'static,
    ) -> Self {
        self.on_player_ready = Some(Box::new(hook));
        self
    }

    pub fn on_phase_change(
        mut self,
        hook: impl Fn(&mut Value, &PhaseChange) + Send + Sync + 'static,
    ) -> Self {
        self.on_phase_change = Some(Box::new(hook));
        self
    }

    /// Enables the room lifecycle with the given rules
    pub fn lobby(mut self, config: LobbyConfig) -> Self {
        self.lobby = Some(config);
        self
    }

    pub fn build(self) -> Result<GameDefinition, ConfigError> {
        let setup = self.setup.ok_or(ConfigError::MissingSetup)?;

        let mut seen = BTreeSet::new();
        for (name, _) in &self.actions {
            if name.is_empty() {
                return Err(ConfigError::EmptyActionName);
            }
            if name.starts_with(LOBBY_NAMESPACE) {
                return Err(ConfigError::ReservedActionName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateAction(name.clone()));
            }
        }

        if let Some(lobby) = &self.lobby {
            lobby.validate()?;
        }

        Ok(GameDefinition {
            setup,
            actions: self.actions,
            on_player_join: self.on_player_join,
            on_player_leave: self.on_player_leave,
            on_player_ready: self.on_player_ready,
            on_phase_change: self.on_phase_change,
            lobby: self.lobby,
        })
    }
}
