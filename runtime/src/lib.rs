//! # Room Runtime Library
//!
//! This library runs a host-authoritative multiplayer room. One participant,
//! the host, owns the game state and applies every action; all other
//! participants keep a mirror of that state which converges through patches
//! streamed by the host.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Actions
//! Actions are named, synchronous state mutations registered by the game.
//! Clients never apply them locally: they forward the action to the host
//! and wait for the resulting patches. Each invocation carries a seed so
//! that its "random" outcome is identical wherever it is computed.
//!
//! ### State Synchronization
//! On a steady cadence the host diffs its state against the previous
//! snapshot and broadcasts the patches. When nothing changes for a while it
//! sends a heartbeat instead, keeping the arrival cadence stable on clients.
//!
//! ### Room Lifecycle
//! With a lobby configured, the room moves from `lobby` to `playing` to
//! `ended`. Presence and readiness live in the shared state, the game can
//! start when everyone is ready or when a timer runs out, and presence is
//! periodically reconciled against the transport's peer list to catch
//! peers that vanished without a leave notification.
//!
//! ## Architecture Design
//!
//! ### Single-Task Event Loop
//! The [`Room`] itself is synchronous. A single task per participant
//! (see [`driver`]) feeds it transport events and timer ticks one at a time,
//! so state is never mutated concurrently and no handler ever awaits.
//!
//! ### Pluggable Transport
//! The room talks to a [`Transport`] trait object: send, subscribe to
//! messages and peer changes, list peers. [`MemoryNetwork`] provides an
//! in-process implementation that still round-trips every message through
//! the binary codec.
//!
//! ## Module Organization
//!
//! ### Actions Module (`actions`)
//! Action registry, seed counter and dispatch, including the built-in lobby
//! actions and "did you mean" suggestions for unknown names.
//!
//! ### Scheduler Module (`scheduler`)
//! Frame-aligned and fixed-interval tick sources behind one clock, the
//! drift-correcting cadence accumulator, and the diff-or-heartbeat decision
//! made on every tick.
//!
//! ### Lobby Module (`lobby`)
//! Phase transitions, presence tracking, the auto-start timer and
//! reconciliation.
//!
//! ### Room and Driver Modules (`room`, `driver`)
//! The coordinator that owns the state and the async loop that runs it.
//!
//! ## Error Handling
//!
//! Usage errors (unknown actions, host-only calls from a client, rejected
//! lobby requests) are logged as warnings unless [`RuntimeConfig::strict`]
//! is set, in which case they are returned. Patching an empty path is
//! always an error.

pub mod actions;
pub mod config;
pub mod driver;
pub mod error;
pub mod game;
pub mod lobby;
pub mod observers;
pub mod room;
pub mod scheduler;
pub mod transport;
pub mod utils;

pub use actions::{ActionContext, END_ACTION, READY_ACTION, START_ACTION};
pub use config::{LobbyConfig, RuntimeConfig};
pub use driver::{spawn, RoomHandle};
pub use error::{ConfigError, Result, RuntimeError};
pub use game::{GameBuilder, GameDefinition};
pub use lobby::{LobbyState, Phase, PhaseChange, PhaseReason, PlayerPresence};
pub use room::{GameEvent, Listener, Room, RoomEvents};
pub use scheduler::{frame_channel, FrameSender, FrameSignal, SyncOutcome};
pub use transport::{
    Envelope, MemoryNetwork, MemoryTransport, Transport, TransportError, TransportMetrics,
};
