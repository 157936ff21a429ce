//! A string-keyed dictionary for engine configuration.
//!
//! All values are stored as strings and converted on access, so callers
//! can mix numeric, boolean and textual parameters freely:
//!
//! ```
//! use soundfield::ParameterMap;
//!
//! let mut params = ParameterMap::new();
//! params.set("sample_rate", 48000);
//! params.set("threads", 4);
//! params.set("name", "scene one");
//!
//! assert_eq!(params.get::<u32>("sample_rate").unwrap(), 48000);
//! assert_eq!(params.get_or("block_size", 512usize), 512);
//! ```

use crate::strings::Value;
use std::collections::BTreeMap;

/// Error produced by the throwing getters of [`ParameterMap`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParameterError {
    #[error("parameter {0:?} does not exist")]
    Missing(String),
    #[error("parameter {key:?}: cannot convert {value:?}")]
    Conversion { key: String, value: String },
}

/// A dictionary for parameters, stored as strings.
#[derive(Clone, Debug, Default)]
pub struct ParameterMap {
    entries: BTreeMap<String, String>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, converting it to its string form.
    /// An existing value is replaced.
    pub fn set<T: Value>(&mut self, key: &str, value: T) -> &str {
        self.entries.insert(key.to_string(), value.format_text());
        &self.entries[key]
    }

    /// The raw string stored under `key`.
    pub fn get_str(&self, key: &str) -> Result<&str, ParameterError> {
        self.entries
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ParameterError::Missing(key.to_string()))
    }

    /// The value under `key` converted to `T`; fails if the key is
    /// missing or the stored string does not parse.
    pub fn get<T: Value>(&self, key: &str) -> Result<T, ParameterError> {
        let text = self.get_str(key)?;
        T::parse_text(text).ok_or_else(|| ParameterError::Conversion {
            key: key.to_string(),
            value: text.to_string(),
        })
    }

    /// The value under `key`, or `default` if the key is missing or the
    /// stored string does not parse.
    pub fn get_or<T: Value>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}
