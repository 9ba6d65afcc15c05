//! Action registry and dispatch
//!
//! Every invocation draws a fresh seed from a monotonically increasing
//! counter, salted with the submitting participant's id so that two
//! participants' n-th actions do not share a seed. Only that seed travels
//! with the action; whoever applies it rebuilds the same [`SeededRandom`]
//! from it, so host and clients observe identical "random" values for the
//! same invocation.

use crate::error::{ConfigError, Result, RuntimeError};
use crate::lobby::LobbyCommand;
use crate::utils::suggest;
use log::debug;
use sha2::{Digest, Sha256};
use shared::{ActionMessage, SeededRandom, Value, WireContext};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Prefix reserved for the built-in lobby actions
pub const LOBBY_NAMESPACE: &str = "__lobby/";
pub const READY_ACTION: &str = "__lobby/ready";
pub const START_ACTION: &str = "__lobby/start";
pub const END_ACTION: &str = "__lobby/end";

/// Seeds start well above anything else seeded in the room
const SEED_FLOOR: u32 = 100_000;

/// Moves a participant's counter value into a region of the seed space
/// picked by its id
///
/// The salt comes from a SHA-256 digest so it is the same on every build
/// and platform.
pub fn participant_seed(player_id: &str, counter: u32) -> u32 {
    let digest = Sha256::digest(player_id.as_bytes());
    let salt = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    SEED_FLOOR + 1 + (salt ^ counter) % (u32::MAX - SEED_FLOOR)
}

pub type ActionFn = dyn Fn(&mut Value, &mut ActionContext, &Value) + Send + Sync;

/// Who is acting, on whom, and the invocation's random source
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub player_id: String,
    pub target_id: String,
    pub is_host: bool,
    pub random: SeededRandom,
}

impl ActionContext {
    pub fn new(
        player_id: impl Into<String>,
        target_id: Option<&str>,
        is_host: bool,
        seed: u32,
    ) -> Self {
        let player_id = player_id.into();
        let target_id = target_id.map(str::to_string).unwrap_or_else(|| player_id.clone());
        Self {
            player_id,
            target_id,
            is_host,
            random: SeededRandom::new(seed),
        }
    }

    /// The context as transmitted, without its random source
    pub fn to_wire(&self) -> WireContext {
        WireContext {
            player_id: self.player_id.clone(),
            target_id: self.target_id.clone(),
            is_host: self.is_host,
        }
    }
}

#[derive(Clone)]
pub enum ActionHandler {
    Game(Arc<ActionFn>),
    Lobby(LobbyCommand),
}

/// A resolved action, ready to apply and to broadcast
pub struct Invocation {
    pub name: String,
    pub handler: ActionHandler,
    pub input: Value,
    pub context: ActionContext,
    pub seed: u32,
}

impl Invocation {
    pub fn to_message(&self) -> ActionMessage {
        ActionMessage {
            action_name: self.name.clone(),
            input: self.input.clone(),
            context: self.context.to_wire(),
            action_seed: self.seed,
        }
    }
}

pub struct ActionDispatcher {
    handlers: BTreeMap<String, ActionHandler>,
    next_seed: u32,
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            next_seed: SEED_FLOOR,
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<ActionFn>,
    ) -> std::result::Result<(), ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::EmptyActionName);
        }
        if name.starts_with(LOBBY_NAMESPACE) {
            return Err(ConfigError::ReservedActionName(name));
        }
        if self.handlers.contains_key(&name) {
            return Err(ConfigError::DuplicateAction(name));
        }
        self.handlers.insert(name, ActionHandler::Game(handler));
        Ok(())
    }

    /// Adds the three built-in lobby actions
    pub fn register_lobby_actions(&mut self) {
        for (name, command) in [
            (READY_ACTION, LobbyCommand::MarkReady),
            (START_ACTION, LobbyCommand::RequestStart),
            (END_ACTION, LobbyCommand::RequestEnd),
        ] {
            self.handlers.insert(name.to_string(), ActionHandler::Lobby(command));
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Draws the next invocation seed, wrapping back to the floor
    pub fn next_seed(&mut self) -> u32 {
        self.next_seed = match self.next_seed.checked_add(1) {
            Some(seed) => seed,
            None => SEED_FLOOR + 1,
        };
        self.next_seed
    }

    pub fn resolve(&self, name: &str) -> Result<ActionHandler> {
        if let Some(handler) = self.handlers.get(name) {
            return Ok(handler.clone());
        }

        let known: Vec<String> = self.handlers.keys().cloned().collect();
        Err(RuntimeError::UnknownAction {
            name: name.to_string(),
            suggestion: suggest(name, self.names()),
            known,
        })
    }

    /// Resolves a locally submitted action and gives it a fresh seed
    pub fn prepare(
        &mut self,
        name: &str,
        input: Value,
        player_id: &str,
        target_id: Option<&str>,
        is_host: bool,
    ) -> Result<Invocation> {
        let handler = self.resolve(name)?;
        let seed = participant_seed(player_id, self.next_seed());
        debug!("Dispatching {} for {} (seed {})", name, player_id, seed);

        Ok(Invocation {
            name: name.to_string(),
            handler,
            input,
            context: ActionContext::new(player_id, target_id, is_host, seed),
            seed,
        })
    }

    /// Rebuilds an invocation received from `sender`
    ///
    /// The acting player is whoever sent the message, not whatever the
    /// message claims, and a remote sender is never the host.
    pub fn receive(&self, message: ActionMessage, sender: &str) -> Result<Invocation> {
        let handler = self.resolve(&message.action_name)?;
        let mut context = ActionContext::new(
            sender,
            Some(message.context.target_id.as_str()),
            false,
            message.action_seed,
        );
        if context.target_id.is_empty() {
            context.target_id = sender.to_string();
        }

        Ok(Invocation {
            name: message.action_name,
            handler,
            input: message.input,
            context,
            seed: message.action_seed,
        })
    }
}

/// Applies a game action, turning a panicking handler into an error
pub fn run_action(
    handler: &ActionFn,
    name: &str,
    state: &mut Value,
    context: &mut ActionContext,
    input: &Value,
) -> Result<()> {
    catch_unwind(AssertUnwindSafe(|| handler(state, context, input)))
        .map_err(|_| RuntimeError::ActionPanicked(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::generate_diff;

    fn add_points() -> Arc<ActionFn> {
        Arc::new(|state: &mut Value, ctx: &mut ActionContext, input: &Value| {
            let bonus = ctx.random.int(1, 100);
            let points = input.get("points").and_then(Value::as_i64).unwrap_or(0);
            state.insert(ctx.target_id.as_str(), points + bonus);
        })
    }

    fn dispatcher() -> ActionDispatcher {
        let mut dispatcher = ActionDispatcher::new();
        dispatcher.register("attack", add_points()).unwrap();
        dispatcher.register("move", add_points()).unwrap();
        dispatcher
    }

    #[test]
    fn test_seeds_start_high_and_increase() {
        let mut dispatcher = ActionDispatcher::new();
        let first = dispatcher.next_seed();
        let second = dispatcher.next_seed();
        assert!(first > 100_000);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_participants_draw_distinct_seeds() {
        let mut seeds = Vec::new();
        for player in ["host", "c1", "c2"] {
            let invocation = dispatcher()
                .prepare("attack", Value::Null, player, None, player == "host")
                .unwrap();
            assert!(invocation.seed > SEED_FLOOR);
            assert_eq!(invocation.seed, participant_seed(player, SEED_FLOOR + 1));
            seeds.push(invocation.seed);
        }
        assert_ne!(seeds[0], seeds[1]);
        assert_ne!(seeds[0], seeds[2]);
        assert_ne!(seeds[1], seeds[2]);
    }

    #[test]
    fn test_one_participant_never_repeats_a_seed() {
        let mut dispatcher = dispatcher();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..1_000 {
            let invocation = dispatcher
                .prepare("move", Value::Null, "c1", None, false)
                .unwrap();
            assert!(seen.insert(invocation.seed));
        }
    }

    #[test]
    fn test_seed_counter_wraps_to_floor() {
        let mut dispatcher = ActionDispatcher::new();
        dispatcher.next_seed = u32::MAX;
        assert_eq!(dispatcher.next_seed(), SEED_FLOOR + 1);
    }

    #[test]
    fn test_unknown_action_suggests_closest() {
        let err = dispatcher().resolve("atack").err().unwrap();
        match err {
            RuntimeError::UnknownAction {
                suggestion, known, ..
            } => {
                assert_eq!(suggestion.as_deref(), Some("attack"));
                assert_eq!(known, vec!["attack".to_string(), "move".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = dispatcher().resolve("zzzzzzzz").err().unwrap();
        assert!(matches!(err, RuntimeError::UnknownAction { suggestion: None, .. }));
    }

    #[test]
    fn test_registration_rejects_reserved_and_duplicates() {
        let mut dispatcher = dispatcher();
        assert!(matches!(
            dispatcher.register("attack", add_points()),
            Err(ConfigError::DuplicateAction(_))
        ));
        assert!(matches!(
            dispatcher.register("__lobby/kick", add_points()),
            Err(ConfigError::ReservedActionName(_))
        ));
    }

    #[test]
    fn test_lobby_actions_resolve() {
        let mut dispatcher = dispatcher();
        dispatcher.register_lobby_actions();
        assert_eq!(dispatcher.len(), 5);
        assert!(matches!(
            dispatcher.resolve(READY_ACTION),
            Ok(ActionHandler::Lobby(LobbyCommand::MarkReady))
        ));
        assert!(matches!(
            dispatcher.resolve(END_ACTION),
            Ok(ActionHandler::Lobby(LobbyCommand::RequestEnd))
        ));
    }

    #[test]
    fn test_target_defaults_to_player() {
        let mut dispatcher = dispatcher();
        let invocation = dispatcher
            .prepare("move", Value::Null, "p1", None, true)
            .unwrap();
        assert_eq!(invocation.context.target_id, "p1");

        let invocation = dispatcher
            .prepare("move", Value::Null, "p1", Some("p2"), true)
            .unwrap();
        assert_eq!(invocation.context.target_id, "p2");
    }

    #[test]
    fn test_received_invocation_uses_sender_and_seed() {
        let mut client = dispatcher();
        let sent = client
            .prepare("attack", Value::Null, "c1", None, false)
            .unwrap()
            .to_message();

        let mut forged = sent.clone();
        forged.context.player_id = "someone-else".to_string();
        forged.context.is_host = true;

        let received = dispatcher().receive(forged, "c1").unwrap();
        assert_eq!(received.context.player_id, "c1");
        assert!(!received.context.is_host);
        assert_eq!(received.seed, sent.action_seed);
    }

    #[test]
    fn test_same_seed_same_delta() {
        let mut input = Value::map();
        input.insert("points", 10);

        let mut host = dispatcher();
        let mut local = host.prepare("attack", input, "p1", None, true).unwrap();
        let message = local.to_message();
        let mut remote = dispatcher().receive(message, "p1").unwrap();

        let base = Value::map();
        let mut host_state = base.clone();
        let mut remote_state = base.clone();

        let ActionHandler::Game(handler) = local.handler.clone() else {
            panic!("expected a game action");
        };
        let handler = handler.as_ref();
        run_action(handler, "attack", &mut host_state, &mut local.context, &local.input).unwrap();
        run_action(handler, "attack", &mut remote_state, &mut remote.context, &remote.input)
            .unwrap();

        assert_eq!(generate_diff(&base, &host_state), generate_diff(&base, &remote_state));
    }

    #[test]
    fn test_panicking_handler_becomes_error() {
        let handler: Arc<ActionFn> =
            Arc::new(|_: &mut Value, _: &mut ActionContext, _: &Value| panic!("boom"));
        let mut context = ActionContext::new("p1", None, true, 1);
        let mut state = Value::map();
        let result = run_action(&*handler, "explode", &mut state, &mut context, &Value::Null);
        assert!(matches!(result, Err(RuntimeError::ActionPanicked(name)) if name == "explode"));
    }
}
