//! Minimal edit scripts between two state trees
//!
//! [`generate_diff`] walks two snapshots and emits an ordered list of
//! [`Patch`]es; [`apply_patch`] replays them onto a live tree. Applying the
//! full script from `generate_diff(a, b)` to a copy of `a` reproduces `b`.
//!
//! The script is minimal only down to structural changes:
//! - a change of shape at a node replaces the node wholesale
//! - an array whose length changed is replaced wholesale (no move or
//!   insert detection)
//! - a newly added map key carries its whole subtree

use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One step of a path into the state tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    /// The segment used as a map key
    fn to_key(&self) -> String {
        match self {
            PathSegment::Key(key) => key.clone(),
            PathSegment::Index(index) => index.to_string(),
        }
    }

    /// The segment used as an array index, if it is numeric
    fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(index) => Some(*index),
            PathSegment::Key(key) => key.parse().ok(),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => f.write_str(key),
            PathSegment::Index(index) => write!(f, "{}", index),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchOp::Add => "add",
            PatchOp::Replace => "replace",
            PatchOp::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// A single edit at a path
///
/// `value` is present for [`PatchOp::Add`] and [`PatchOp::Replace`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<PathSegment>,
    pub value: Option<Value>,
}

impl Patch {
    pub fn add(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    pub fn replace(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            value: Some(value),
        }
    }

    pub fn remove(path: Vec<PathSegment>) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    /// Dotted rendering of the path, for logs
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    /// The root itself cannot be patched; callers replace the whole state
    /// instead.
    #[error("cannot apply a patch with an empty path")]
    EmptyPath,
    #[error("cannot descend into {found} at `{path}` (segment `{segment}`)")]
    InvalidPath {
        path: String,
        segment: String,
        found: ValueKind,
    },
    /// Sequences only grow by appending at their current length
    #[error("index {index} at `{path}` is past the end of a sequence of {len}")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },
    #[error("{op} patch at `{path}` carries no value")]
    MissingValue { op: PatchOp, path: String },
}

/// Computes the ordered patches that turn `old` into `new`
pub fn generate_diff(old: &Value, new: &Value) -> Vec<Patch> {
    let mut patches = Vec::new();
    let mut path = Vec::new();
    diff_into(old, new, &mut path, &mut patches);
    patches
}

fn diff_into(old: &Value, new: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<Patch>) {
    if old.kind() != new.kind() {
        out.push(Patch::replace(path.clone(), new.clone()));
        return;
    }

    match (old, new) {
        (Value::Array(old_items), Value::Array(new_items)) => {
            if old_items.len() != new_items.len() {
                out.push(Patch::replace(path.clone(), new.clone()));
                return;
            }
            for (index, (before, after)) in old_items.iter().zip(new_items).enumerate() {
                path.push(PathSegment::Index(index));
                diff_into(before, after, path, out);
                path.pop();
            }
        }
        (Value::Map(old_entries), Value::Map(new_entries)) => {
            for key in old_entries.keys() {
                if !new_entries.contains_key(key) {
                    path.push(PathSegment::Key(key.clone()));
                    out.push(Patch::remove(path.clone()));
                    path.pop();
                }
            }
            for (key, after) in new_entries {
                path.push(PathSegment::Key(key.clone()));
                match old_entries.get(key) {
                    None => out.push(Patch::add(path.clone(), after.clone())),
                    Some(before) => diff_into(before, after, path, out),
                }
                path.pop();
            }
        }
        _ => {
            if !primitive_eq(old, new) {
                out.push(Patch::replace(path.clone(), new.clone()));
            }
        }
    }
}

/// Equality for leaves; NaN is treated as equal to itself so an untouched
/// NaN field does not produce a patch on every tick.
fn primitive_eq(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
        _ => old == new,
    }
}

/// Applies one patch to `state` in place
///
/// Missing intermediate nodes are created as empty maps, so a patch whose
/// parent was never sent still lands.
pub fn apply_patch(state: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let (last, parents) = patch.path.split_last().ok_or(PatchError::EmptyPath)?;

    let mut current = state;
    for segment in parents {
        current = child_or_create(current, segment, patch)?;
    }

    match patch.op {
        PatchOp::Add | PatchOp::Replace => {
            let value = patch.value.clone().ok_or_else(|| PatchError::MissingValue {
                op: patch.op,
                path: patch.path_string(),
            })?;
            assign(current, last, value, patch)
        }
        PatchOp::Remove => remove(current, last, patch),
    }
}

/// Applies patches in order, stopping at the first failure
pub fn apply_patches(state: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_patch(state, patch)?;
    }
    Ok(())
}

/// Structural copy of a state tree, independent of later mutation
///
/// Used for baseline snapshots; every node including timestamps is owned.
pub fn deep_clone(value: &Value) -> Value {
    value.clone()
}

fn invalid_path(segment: &PathSegment, found: ValueKind, patch: &Patch) -> PatchError {
    PatchError::InvalidPath {
        path: patch.path_string(),
        segment: segment.to_string(),
        found,
    }
}

fn check_index(index: usize, len: usize, patch: &Patch) -> Result<(), PatchError> {
    if index > len {
        return Err(PatchError::IndexOutOfRange {
            path: patch.path_string(),
            index,
            len,
        });
    }
    Ok(())
}

fn child_or_create<'a>(
    node: &'a mut Value,
    segment: &PathSegment,
    patch: &Patch,
) -> Result<&'a mut Value, PatchError> {
    if node.is_null() {
        *node = Value::map();
    }

    match node {
        Value::Map(entries) => Ok(entries.entry(segment.to_key()).or_insert_with(Value::map)),
        Value::Array(items) => {
            let index = segment
                .as_index()
                .ok_or_else(|| invalid_path(segment, ValueKind::Array, patch))?;
            check_index(index, items.len(), patch)?;
            if index == items.len() {
                items.push(Value::map());
            }
            Ok(&mut items[index])
        }
        other => Err(invalid_path(segment, other.kind(), patch)),
    }
}

fn assign(
    parent: &mut Value,
    segment: &PathSegment,
    value: Value,
    patch: &Patch,
) -> Result<(), PatchError> {
    if parent.is_null() {
        *parent = Value::map();
    }

    match parent {
        Value::Map(entries) => {
            entries.insert(segment.to_key(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = segment
                .as_index()
                .ok_or_else(|| invalid_path(segment, ValueKind::Array, patch))?;
            check_index(index, items.len(), patch)?;
            if index < items.len() {
                items[index] = value;
            } else {
                items.push(value);
            }
            Ok(())
        }
        other => Err(invalid_path(segment, other.kind(), patch)),
    }
}

fn remove(parent: &mut Value, segment: &PathSegment, patch: &Patch) -> Result<(), PatchError> {
    match parent {
        Value::Map(entries) => {
            entries.remove(&segment.to_key());
            Ok(())
        }
        Value::Array(items) => {
            let index = segment
                .as_index()
                .ok_or_else(|| invalid_path(segment, ValueKind::Array, patch))?;
            if index < items.len() {
                items.remove(index);
            }
            Ok(())
        }
        // Nothing to remove below a leaf
        Value::Null => Ok(()),
        other => Err(invalid_path(segment, other.kind(), patch)),
    }
}
