//! Runtime options.

use crate::error::ConfigError;

/// Options for a [`crate::Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Number of workers, each with its own pool and reducer map.
    pub nworkers: usize,
    /// Promote the worker's own deque on every reducer lookup, so that every
    /// strand runs with a fresh reducer map. Only valid with one worker.
    pub force_reduce: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            nworkers: num_cpus::get().max(1),
            force_reduce: false,
        }
    }
}

impl Options {
    pub const NWORKERS_VAR: &'static str = "STRAND_NWORKERS";
    pub const FORCE_REDUCE_VAR: &'static str = "STRAND_FORCE_REDUCE";

    /// Reads options from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads options through `lookup`, which maps a variable name to its value.
    ///
    /// Unset variables keep their defaults, except that requesting
    /// `force_reduce` without a worker count implies a single worker.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let force_reduce = match lookup(Self::FORCE_REDUCE_VAR) {
            Some(value) => parse_bool(Self::FORCE_REDUCE_VAR, &value)?,
            None => false,
        };
        let nworkers = match lookup(Self::NWORKERS_VAR) {
            Some(value) => value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                var: Self::NWORKERS_VAR,
                value,
            })?,
            None if force_reduce => 1,
            None => Self::default().nworkers,
        };

        let options = Self { nworkers, force_reduce };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nworkers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.force_reduce && self.nworkers != 1 {
            return Err(ConfigError::ForceReduceNeedsSingleWorker(self.nworkers));
        }
        Ok(())
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}
