//! Hash classification: block hash → ON/OFF under the active rule.
//!
//! Pure and stateless; the runner owns the active rule and the reset
//! obligations that come with switching it.

use crate::machine::State;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Selectable classification rule. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rule {
    /// Last two hash characters: one digit and one hex letter → ON,
    /// same class → OFF.
    #[default]
    #[serde(rename = "LUCKY")]
    Lucky,
    /// Rightmost decimal digit: 0-4 → ON, 5-9 → OFF.
    #[serde(rename = "BIG_SMALL")]
    BigSmall,
    /// Rightmost decimal digit: even → ON, odd → OFF.
    #[serde(rename = "ODD_EVEN")]
    OddEven,
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rule::Lucky => write!(f, "LUCKY"),
            Rule::BigSmall => write!(f, "BIG_SMALL"),
            Rule::OddEven => write!(f, "ODD_EVEN"),
        }
    }
}

/// The hash carries nothing the active rule can decide on; the block
/// is discarded by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hash not classifiable under {rule}")]
pub struct Unclassifiable {
    pub rule: Rule,
}

/// Classify a hash under the given rule.
pub fn classify(rule: Rule, hash: &str) -> Result<State, Unclassifiable> {
    let decided = match rule {
        Rule::Lucky => lucky(hash),
        Rule::BigSmall => last_digit(hash).map(|d| if d <= 4 { State::On } else { State::Off }),
        Rule::OddEven => last_digit(hash).map(|d| {
            if d % 2 == 0 {
                State::On
            } else {
                State::Off
            }
        }),
    };
    decided.ok_or(Unclassifiable { rule })
}

fn lucky(hash: &str) -> Option<State> {
    let h = hash.trim().to_ascii_lowercase();
    let bytes = h.as_bytes();
    if bytes.len() < 2 {
        return None;
    }

    // false = decimal digit, true = hex letter; anything else is not
    // classifiable.
    let class = |c: u8| match c {
        b'0'..=b'9' => Some(false),
        b'a'..=b'f' => Some(true),
        _ => None,
    };

    let a = class(bytes[bytes.len() - 2])?;
    let b = class(bytes[bytes.len() - 1])?;
    Some(if a != b { State::On } else { State::Off })
}

fn last_digit(hash: &str) -> Option<u8> {
    hash.trim()
        .bytes()
        .rev()
        .find(u8::is_ascii_digit)
        .map(|c| c - b'0')
}
