//! Closed registry of storage hosts.
//!
//! # Design
//! - The host set is fixed at construction and never discovered at runtime.
//! - [`Host`] has no public constructor, so credential lookups can only ever be
//!   keyed by a name that passed [`HostRegistry::resolve`].

use std::fmt::{self, Display, Formatter};

use crate::error::{CoreError, CoreResult};

/// Hosts known to the system when no explicit list is configured.
pub const DEFAULT_HOSTS: &[&str] = &["COVIS-NAS", "DMAS"];

/// Validated storage host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    name: String,
    prefix: String,
}

impl Host {
    /// Host name as recorded in the catalog.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix used to build per-host configuration keys (`COVIS-NAS` -> `COVIS_NAS`).
    #[must_use]
    pub fn config_prefix(&self) -> &str {
        &self.prefix
    }

    /// Configuration key for `suffix` under this host's prefix, e.g. `COVIS_NAS_URL`.
    #[must_use]
    pub fn config_key(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix)
    }
}

impl Display for Host {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.name)
    }
}

/// Membership test and prefix derivation over the closed host set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRegistry {
    hosts: Vec<String>,
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HOSTS.iter().copied())
    }
}

impl HostRegistry {
    /// Build a registry from an explicit host list.
    ///
    /// Blank entries are ignored and duplicates collapse to the first occurrence.
    #[must_use]
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: Vec<String> = Vec::new();
        for host in hosts {
            let host = host.as_ref().trim();
            if !host.is_empty() && !unique.iter().any(|known| known == host) {
                unique.push(host.to_string());
            }
        }
        Self { hosts: unique }
    }

    /// Whether `name` is a member of the host set.
    #[must_use]
    pub fn validate(&self, name: &str) -> bool {
        self.hosts.iter().any(|host| host == name)
    }

    /// Configuration prefix for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownHost`] when `name` is not registered.
    pub fn config_key_prefix(&self, name: &str) -> CoreResult<String> {
        self.resolve(name).map(|host| host.prefix)
    }

    /// Validate `name` and return the corresponding [`Host`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownHost`] when `name` is not registered.
    pub fn resolve(&self, name: &str) -> CoreResult<Host> {
        if !self.validate(name) {
            return Err(CoreError::UnknownHost {
                host: name.to_string(),
            });
        }
        Ok(Host {
            name: name.to_string(),
            prefix: derive_prefix(name),
        })
    }

    /// Registered host names in configuration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    /// All registered hosts.
    #[must_use]
    pub fn hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .map(|name| Host {
                name: name.clone(),
                prefix: derive_prefix(name),
            })
            .collect()
    }
}

fn derive_prefix(name: &str) -> String {
    name.chars()
        .map(|ch| if ch == '-' { '_' } else { ch.to_ascii_uppercase() })
        .collect()
}
