//! # Shared Room Synchronization Primitives
//!
//! Leaf building blocks used identically by the host and every client of a
//! room. Nothing here knows about transports, timers or async; these are
//! pure data types and functions so that both sides of the wire compute
//! exactly the same results.
//!
//! ## Module Organization
//!
//! ### Value Module (`value`)
//! The dynamically shaped state tree: maps, arrays and primitives, with
//! conversions to and from typed serde values.
//!
//! ### Diff Module (`diff`)
//! Edit scripts between two trees:
//! - `generate_diff` produces ordered add/replace/remove patches
//! - `apply_patch` replays them onto a live tree
//! - `deep_clone` snapshots a tree for the next comparison
//!
//! ### Random Module (`random`)
//! A seeded generator so that host and clients draw identical "random"
//! numbers for the same action.
//!
//! ### Protocol Module (`protocol`)
//! Wire messages and their binary codec.

pub mod diff;
pub mod protocol;
pub mod random;
pub mod value;

pub use diff::{
    apply_patch, apply_patches, deep_clone, generate_diff, Patch, PatchError, PatchOp, PathSegment,
};
pub use protocol::{
    decode, encode, ActionMessage, CodecError, MessageKind, Payload, StateSync, WireContext,
    WireMessage,
};
pub use random::SeededRandom;
pub use value::{Map, Value, ValueKind};
