//! Runtime configuration.
//!
//! [`RuntimeConfig`] carries the few tunables a [`Runtime`](crate::Runtime)
//! reads at construction. Defaults match the limits the dispatch and pool
//! code were designed around; [`RuntimeConfig::from_env`] lets a host
//! override them without recompiling.

use std::env;
use std::str::FromStr;

use oxobj_log::Level;

use crate::error::{Error, Result};

/// Default bound on receiver substitutions during one message send.
pub const DEFAULT_MAX_FORWARDING_DEPTH: u32 = 32;

/// Size of one autorelease pool page.
pub const POOL_PAGE_SIZE: usize = 4096;

/// Default number of pending objects per pool frame: one page of ids minus
/// the frame bookkeeping words.
pub const DEFAULT_POOL_FRAME_CAPACITY: usize = POOL_PAGE_SIZE / size_of::<usize>() - 2;

/// Environment variable overriding [`RuntimeConfig::max_forwarding_depth`].
pub const ENV_MAX_FORWARDING_DEPTH: &str = "OXOBJ_MAX_FORWARDING_DEPTH";

/// Environment variable overriding [`RuntimeConfig::pool_frame_capacity`].
pub const ENV_POOL_FRAME_CAPACITY: &str = "OXOBJ_POOL_FRAME_CAPACITY";

/// Tunables for one runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Maximum receiver substitutions before a send is declared a loop.
    pub max_forwarding_depth: u32,
    /// Objects held by one autorelease pool frame.
    pub pool_frame_capacity: usize,
    /// Log level applied when the runtime is created, if any.
    pub log_level: Option<Level>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_forwarding_depth: DEFAULT_MAX_FORWARDING_DEPTH,
            pool_frame_capacity: DEFAULT_POOL_FRAME_CAPACITY,
            log_level: None,
        }
    }
}

impl RuntimeConfig {
    /// Builds a configuration from the defaults plus `OXOBJ_*` variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set but does not
    /// parse, or if the pool capacity is zero.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(depth) = parse_var(&lookup, ENV_MAX_FORWARDING_DEPTH)? {
            config.max_forwarding_depth = depth;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_POOL_FRAME_CAPACITY)? {
            if capacity == 0 {
                return Err(Error::InvalidConfig {
                    key: ENV_POOL_FRAME_CAPACITY.into(),
                    value: "0".into(),
                });
            }
            config.pool_frame_capacity = capacity;
        }
        config.log_level = parse_var(&lookup, oxobj_log::ENV_VAR)?;

        Ok(config)
    }

    /// Sets [`max_forwarding_depth`](Self::max_forwarding_depth).
    #[must_use]
    pub fn with_max_forwarding_depth(mut self, depth: u32) -> Self {
        self.max_forwarding_depth = depth;
        self
    }

    /// Sets [`pool_frame_capacity`](Self::pool_frame_capacity), at least 1.
    #[must_use]
    pub fn with_pool_frame_capacity(mut self, capacity: usize) -> Self {
        self.pool_frame_capacity = capacity.max(1);
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| Error::InvalidConfig {
            key: key.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_forwarding_depth, 32);
        assert_eq!(config.pool_frame_capacity * size_of::<usize>() + 16, POOL_PAGE_SIZE);
        assert_eq!(config.log_level, None);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_MAX_FORWARDING_DEPTH, "8"),
            (ENV_POOL_FRAME_CAPACITY, " 16 "),
            ("OXOBJ_LOG", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.max_forwarding_depth, 8);
        assert_eq!(config.pool_frame_capacity, 16);
        assert_eq!(config.log_level, Some(Level::Debug));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = RuntimeConfig::from_lookup(lookup(&[(ENV_MAX_FORWARDING_DEPTH, "deep")]))
            .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidConfig {
                key: ENV_MAX_FORWARDING_DEPTH.into(),
                value: "deep".into()
            }
        );
        assert!(RuntimeConfig::from_lookup(lookup(&[(ENV_POOL_FRAME_CAPACITY, "0")])).is_err());
    }
}
