//! Minimal JSON path lookup for generic REST sources.
//!
//! Supports dot-separated keys with optional `[index]` suffixes:
//! `a.b.c`, `a.b[0].c`. Nothing more; sources needing richer
//! extraction get their own dialect.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("bad index in `{0}`")]
    BadIndex(String),
    #[error("expected object at `{0}`")]
    NotObject(String),
    #[error("missing key `{0}`")]
    MissingKey(String),
    #[error("expected array at `{0}`")]
    NotArray(String),
    #[error("index out of range in `{0}`")]
    OutOfRange(String),
}

/// Walk `root` along `path` and return the value it lands on.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    if path.trim().is_empty() {
        return Err(PathError::Empty);
    }

    let mut cur = root;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }

        let (name, index) = split_index(part)?;

        if !name.is_empty() {
            let obj = cur
                .as_object()
                .ok_or_else(|| PathError::NotObject(name.to_string()))?;
            cur = obj
                .get(name)
                .ok_or_else(|| PathError::MissingKey(name.to_string()))?;
        }

        if let Some(idx) = index {
            let arr = cur
                .as_array()
                .ok_or_else(|| PathError::NotArray(part.to_string()))?;
            cur = arr
                .get(idx)
                .ok_or_else(|| PathError::OutOfRange(part.to_string()))?;
        }
    }
    Ok(cur)
}

/// Split `x[3]` into `("x", Some(3))`; plain keys pass through.
fn split_index(part: &str) -> Result<(&str, Option<usize>), PathError> {
    match (part.find('['), part.ends_with(']')) {
        (Some(open), true) => {
            let idx = part[open + 1..part.len() - 1]
                .parse::<usize>()
                .map_err(|_| PathError::BadIndex(part.to_string()))?;
            Ok((&part[..open], Some(idx)))
        }
        (None, _) => Ok((part, None)),
        _ => Err(PathError::BadIndex(part.to_string())),
    }
}
