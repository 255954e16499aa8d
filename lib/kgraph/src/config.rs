//! Recognized configuration keys for the engine core. Algorithms may define
//! and read their own keys through [`PregelConfig::get`].

use crate::error::{config_error, PregelError};
use std::collections::HashMap;
use std::str::FromStr;

/// Forces halt once the next superstep would reach this bound.
pub const MAX_ITERATIONS: &str = "max.iterations";
/// `P` in `hash(vid) mod P`.
pub const NUM_PARTITIONS: &str = "num.partitions";
/// Expected worker count `G`.
pub const GROUP_SIZE: &str = "group.size";
/// Coordination service endpoints (a root directory for the file-backed store).
pub const COORDINATION_CONNECT: &str = "coordination.connect";
/// Apply the algorithm-provided combiner on inbound message bags.
pub const COMBINER_ENABLED: &str = "combiner.enabled";

#[derive(Debug, Clone, Default)]
pub struct PregelConfig {
    entries: HashMap<String, String>,
}

impl PregelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.entries.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, PregelError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| config_error(format!("invalid value '{}' for '{}'", raw, key))),
        }
    }

    /// Unbounded when unset.
    pub fn max_iterations(&self) -> Result<i32, PregelError> {
        Ok(self.parsed::<i32>(MAX_ITERATIONS)?.unwrap_or(i32::MAX))
    }

    pub fn group_size(&self) -> Result<usize, PregelError> {
        match self.parsed::<usize>(GROUP_SIZE)? {
            Some(0) | None => Err(config_error(format!("'{}' must be set and positive", GROUP_SIZE))),
            Some(g) => Ok(g),
        }
    }

    /// Defaults to the group size: one partition per worker.
    pub fn num_partitions(&self) -> Result<usize, PregelError> {
        match self.parsed::<usize>(NUM_PARTITIONS)? {
            Some(0) => Err(config_error(format!("'{}' must be positive", NUM_PARTITIONS))),
            Some(p) => Ok(p),
            None => self.group_size(),
        }
    }

    pub fn coordination_connect(&self) -> Option<&str> {
        self.get(COORDINATION_CONNECT)
    }

    pub fn combiner_enabled(&self) -> bool {
        match self.get(COMBINER_ENABLED) {
            Some(v) => {
                let v = v.to_ascii_lowercase();
                v == "1" || v == "true" || v == "yes" || v == "on"
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_typed_getters() {
        let config = PregelConfig::new().set(GROUP_SIZE, 3);
        assert_eq!(config.group_size().unwrap(), 3);
        assert_eq!(config.num_partitions().unwrap(), 3);
        assert_eq!(config.max_iterations().unwrap(), i32::MAX);
        assert!(!config.combiner_enabled());

        let config = config.set(NUM_PARTITIONS, 8).set(MAX_ITERATIONS, 4).set(COMBINER_ENABLED, "yes");
        assert_eq!(config.num_partitions().unwrap(), 8);
        assert_eq!(config.max_iterations().unwrap(), 4);
        assert!(config.combiner_enabled());
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let config = PregelConfig::new().set(GROUP_SIZE, "two");
        assert!(config.group_size().is_err());
        assert!(PregelConfig::new().group_size().is_err());
    }
}
