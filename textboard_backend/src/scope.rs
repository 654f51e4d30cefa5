//! Scopes narrow a ban or banword to the submissions whose context matches.
//!
//! Accepted forms: empty (applies everywhere), `key:` (key is present),
//! `key:value`, `key:"value with spaces"` and `key:/regex/`. Keys are made of
//! ASCII letters, `_` and `-`.

use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("scope {0:?} is missing the `key:` prefix")]
    MissingKey(String),
    #[error("scope key {0:?} may only contain letters, `_` and `-`")]
    InvalidKey(String),
    #[error("scope value {0:?} contains whitespace or quotes; quote it")]
    InvalidValue(String),
    #[error("scope regex {pattern:?} does not compile: {message}")]
    InvalidRegex { pattern: String, message: String },
}

#[derive(Debug, Clone)]
pub enum Scope {
    Unscoped,
    KeyPresent(String),
    Equals { key: String, value: String },
    Matches { key: String, pattern: Regex },
}

impl Scope {
    pub fn parse(raw: &str) -> Result<Self, ScopeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Scope::Unscoped);
        }
        let (key, value) = raw
            .split_once(':')
            .ok_or_else(|| ScopeError::MissingKey(raw.to_string()))?;
        if key.is_empty()
            || !key
                .chars()
                .all(|ch| ch.is_ascii_alphabetic() || ch == '_' || ch == '-')
        {
            return Err(ScopeError::InvalidKey(key.to_string()));
        }
        let key = key.to_string();

        if value.is_empty() {
            return Ok(Scope::KeyPresent(key));
        }
        if value.len() >= 2 && value.starts_with('/') && value.ends_with('/') {
            let inner = &value[1..value.len() - 1];
            let pattern = Regex::new(inner).map_err(|err| ScopeError::InvalidRegex {
                pattern: inner.to_string(),
                message: err.to_string(),
            })?;
            return Ok(Scope::Matches { key, pattern });
        }
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            let inner = &value[1..value.len() - 1];
            let value = inner.replace("\\\"", "\"").replace("\\\\", "\\");
            return Ok(Scope::Equals { key, value });
        }
        if value
            .chars()
            .any(|ch| ch.is_whitespace() || ch == '"')
        {
            return Err(ScopeError::InvalidValue(value.to_string()));
        }
        Ok(Scope::Equals {
            key,
            value: value.to_string(),
        })
    }

    /// `None` and blank strings are both unscoped.
    pub fn parse_optional(raw: Option<&str>) -> Result<Self, ScopeError> {
        raw.map_or(Ok(Scope::Unscoped), Scope::parse)
    }

    pub fn applies_to(&self, context: &ScopeContext) -> bool {
        match self {
            Scope::Unscoped => true,
            Scope::KeyPresent(key) => context.get(key).is_some(),
            Scope::Equals { key, value } => context.get(key) == Some(value.as_str()),
            Scope::Matches { key, pattern } => context
                .get(key)
                .is_some_and(|candidate| pattern.is_match(candidate)),
        }
    }
}

/// Named dimensions of a submission (`board`, `topic`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeContext {
    values: BTreeMap<String, String>,
}

impl ScopeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}
