//! Key/value sources that settings are read from.
//!
//! # Design
//! - Blank values are treated as absent so `KEY=` in a `.env` file does not count as set.
//! - Layering is explicit: the primary source wins, the fallback fills gaps.

use std::collections::HashMap;

/// Read-only key/value lookup.
pub trait ConfigSource {
    /// Raw value for `key`, if set.
    fn get(&self, key: &str) -> Option<String>;

    /// Trimmed, non-empty value for `key`.
    fn value(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

/// Process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// In-memory map, used for `.env` contents and in tests.
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    values: HashMap<String, String>,
}

impl MapSource {
    /// Empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl<K, V> FromIterator<(K, V)> for MapSource
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut source = Self::new();
        for (key, value) in iter {
            source.insert(key, value);
        }
        source
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Two sources consulted in order.
#[derive(Debug, Clone)]
pub struct Layered<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> Layered<P, F> {
    /// Combine `primary` over `fallback`.
    pub const fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P, F> ConfigSource for Layered<P, F>
where
    P: ConfigSource,
    F: ConfigSource,
{
    fn get(&self, key: &str) -> Option<String> {
        self.primary
            .value(key)
            .or_else(|| self.fallback.value(key))
    }
}
