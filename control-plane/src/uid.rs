//! Time-sortable 64-bit identifiers.
//!
//! Layout (most significant first): 41 bits of milliseconds since
//! 2022-01-01T00:00:00Z, 10 bits of node id, 12 bits of per-millisecond
//! sequence. The API renders ids as base58 strings of at most 11 characters.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

const EPOCH_MS: i64 = 1_640_995_200_000;
const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
const STEP_MASK: i64 = (1 << STEP_BITS) - 1;
const NODE_MASK: i64 = (1 << NODE_BITS) - 1;

const ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";
const MAX_ENCODED_LEN: usize = 11;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid id: empty")]
    Empty,
    #[error("invalid id: {0:?} is longer than 11 characters")]
    TooLong(String),
    #[error("invalid id: {0:?} must not start with '1'")]
    LeadingZero(String),
    #[error("invalid id: character {1:?} in {0:?} is not base58")]
    InvalidCharacter(String, char),
    #[error("invalid id: {0:?} is out of range")]
    Overflow(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[sqlx(transparent)]
pub struct Id(pub i64);

struct GeneratorState {
    last_ms: i64,
    step: i64,
}

static NODE: OnceLock<i64> = OnceLock::new();
static GENERATOR: Mutex<GeneratorState> = Mutex::new(GeneratorState { last_ms: 0, step: 0 });

fn node_id() -> i64 {
    *NODE.get_or_init(|| rand::thread_rng().gen_range(0..=NODE_MASK))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis() - EPOCH_MS
}

impl Id {
    /// Generates a new id, strictly greater than any previously generated by
    /// this process.
    pub fn new() -> Self {
        let node = node_id();
        let mut state = match GENERATOR.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut ms = now_ms().max(state.last_ms);
        if ms == state.last_ms {
            state.step = (state.step + 1) & STEP_MASK;
            if state.step == 0 {
                // Sequence exhausted for this millisecond; borrow the next one.
                ms += 1;
            }
        } else {
            state.step = 0;
        }
        state.last_ms = ms;

        Id((ms << (NODE_BITS + STEP_BITS)) | (node << STEP_BITS) | state.step)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_ENCODED_LEN {
            return Err(IdError::TooLong(s.to_string()));
        }
        if s.starts_with('1') {
            return Err(IdError::LeadingZero(s.to_string()));
        }

        let mut value: i64 = 0;
        for c in s.chars() {
            let digit = ALPHABET
                .iter()
                .position(|&a| a as char == c)
                .ok_or_else(|| IdError::InvalidCharacter(s.to_string(), c))?;
            value = value
                .checked_mul(58)
                .and_then(|v| v.checked_add(digit as i64))
                .ok_or_else(|| IdError::Overflow(s.to_string()))?;
        }
        Ok(Id(value))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 <= 0 {
            return f.write_str("1");
        }
        let mut n = self.0 as u64;
        let mut buf = Vec::with_capacity(MAX_ENCODED_LEN);
        while n > 0 {
            buf.push(ALPHABET[(n % 58) as usize]);
            n /= 58;
        }
        buf.reverse();
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::parse(s)
    }
}

impl From<i64> for Id {
    fn from(v: i64) -> Self {
        Id(v)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_zero() {
            serializer.serialize_str("")
        } else {
            serializer.collect_str(self)
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Id(0));
        }
        Id::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Either an id or the literal `self`, as accepted by `/api/users/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdOrSelf {
    Id(Id),
    SelfRef,
}

impl IdOrSelf {
    /// Resolves `self` against the caller.
    pub fn resolve(&self, caller: Id) -> Id {
        match self {
            IdOrSelf::Id(id) => *id,
            IdOrSelf::SelfRef => caller,
        }
    }
}

impl Default for IdOrSelf {
    fn default() -> Self {
        IdOrSelf::Id(Id(0))
    }
}

impl<'de> Deserialize<'de> for IdOrSelf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "self" {
            return Ok(IdOrSelf::SelfRef);
        }
        Id::parse(&s)
            .map(IdOrSelf::Id)
            .map_err(serde::de::Error::custom)
    }
}

impl Serialize for IdOrSelf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IdOrSelf::Id(id) => id.serialize(serializer),
            IdOrSelf::SelfRef => serializer.serialize_str("self"),
        }
    }
}
