//! Per-group canvas state: a JSON document patched by agents over IPC.
//!
//! Paths are JSON Pointers (RFC 6901). `set` creates missing parent objects,
//! `merge` applies an RFC 7396 merge patch at the path, `remove` deletes the
//! path if present. The `-` token appends to an array, so a patch list is
//! not safe to re-apply; the broker records applied request ids instead.

use hutch_core::CanvasPatch;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CanvasError {
    #[error("invalid JSON pointer: {0}")]
    InvalidPointer(String),
    #[error("cannot descend into scalar at {0}")]
    NotAContainer(String),
    #[error("array index out of range at {0}")]
    IndexOutOfRange(String),
}

fn parse_pointer(path: &str) -> Result<Vec<String>, CanvasError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(CanvasError::InvalidPointer(path.to_string()));
    };
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn array_index(token: &str, len: usize, path: &str) -> Result<usize, CanvasError> {
    if token == "-" {
        return Ok(len);
    }
    match token.parse::<usize>() {
        Ok(i) if i <= len => Ok(i),
        Ok(_) => Err(CanvasError::IndexOutOfRange(path.to_string())),
        Err(_) => Err(CanvasError::InvalidPointer(path.to_string())),
    }
}

/// Walk to the parent of the last token, creating objects on the way.
fn parent_mut<'a>(
    root: &'a mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a mut Value, CanvasError> {
    let mut current = root;
    for token in tokens {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let len = items.len();
                let i = array_index(token, len, path)?;
                if i == len {
                    items.push(Value::Object(Map::new()));
                }
                &mut items[i]
            }
            _ => return Err(CanvasError::NotAContainer(path.to_string())),
        };
    }
    Ok(current)
}

fn set(root: &mut Value, path: &str, value: Value) -> Result<(), CanvasError> {
    let tokens = parse_pointer(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *root = value;
        return Ok(());
    };
    let parent = parent_mut(root, parents, path)?;
    if parent.is_null() {
        *parent = Value::Object(Map::new());
    }
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(items) => {
            let i = array_index(last, items.len(), path)?;
            if i == items.len() {
                items.push(value);
            } else {
                items[i] = value;
            }
        }
        _ => return Err(CanvasError::NotAContainer(path.to_string())),
    }
    Ok(())
}

fn merge_patch(target: &mut Value, patch: Value) {
    let Value::Object(patch) = patch else {
        *target = patch;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(&key);
            } else {
                merge_patch(map.entry(key).or_insert(Value::Null), value);
            }
        }
    }
}

fn merge(root: &mut Value, path: &str, value: Value) -> Result<(), CanvasError> {
    let tokens = parse_pointer(path)?;
    let target = parent_mut(root, &tokens, path)?;
    merge_patch(target, value);
    Ok(())
}

fn remove(root: &mut Value, path: &str) -> Result<(), CanvasError> {
    let tokens = parse_pointer(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *root = Value::Object(Map::new());
        return Ok(());
    };
    let mut current = &mut *root;
    for token in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(token) {
                Some(next) => next,
                None => return Ok(()),
            },
            Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
    }
    match current {
        Value::Object(map) => {
            map.remove(last);
        }
        Value::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items.remove(i);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Apply `patches` in order. On error the state is left untouched.
pub fn apply_patches(state: &Value, patches: &[CanvasPatch]) -> Result<Value, CanvasError> {
    let mut next = if state.is_null() {
        Value::Object(Map::new())
    } else {
        state.clone()
    };
    for patch in patches {
        match patch {
            CanvasPatch::Set { path, value } => set(&mut next, path, value.clone())?,
            CanvasPatch::Merge { path, value } => merge(&mut next, path, value.clone())?,
            CanvasPatch::Remove { path } => remove(&mut next, path)?,
        }
    }
    Ok(next)
}
