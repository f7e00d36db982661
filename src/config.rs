//! Runtime configuration read from the environment

use log::LevelFilter;

/// Environment variable holding the log level (`error` .. `trace`, or `off`)
pub const LOG_LEVEL_VAR: &str = "TABCONV_LOG_LEVEL";

/// Environment variable holding the number of rows shown in failure previews
pub const PREVIEW_ROWS_VAR: &str = "TABCONV_PREVIEW_ROWS";

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum level emitted by the logger
    pub log_level: LevelFilter,

    /// Rows of the in-flight buffer shown when a conversion fails
    pub preview_rows: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            preview_rows: 5,
        }
    }
}

impl Config {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `TABCONV_LOG_LEVEL`: log level, `info` when unset or empty
    /// - `TABCONV_PREVIEW_ROWS`: failure preview rows
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(s) = lookup(LOG_LEVEL_VAR) {
            if let Ok(level) = s.trim().parse::<LevelFilter>() {
                cfg.log_level = level;
            }
        }

        if let Some(s) = lookup(PREVIEW_ROWS_VAR) {
            if let Ok(v) = s.trim().parse::<usize>() {
                cfg.preview_rows = v;
            }
        }

        cfg
    }

    /// Override the level (used by `--verbose` / `--quiet`)
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[]));
        assert_eq!(cfg.log_level, LevelFilter::Info);
        assert_eq!(cfg.preview_rows, 5);
    }

    #[test]
    fn test_empty_level_means_default() {
        let cfg = Config::from_lookup(lookup(&[(LOG_LEVEL_VAR, "")]));
        assert_eq!(cfg.log_level, LevelFilter::Info);
    }

    #[test]
    fn test_values_are_read() {
        let cfg = Config::from_lookup(lookup(&[
            (LOG_LEVEL_VAR, "DEBUG"),
            (PREVIEW_ROWS_VAR, "10"),
        ]));
        assert_eq!(cfg.log_level, LevelFilter::Debug);
        assert_eq!(cfg.preview_rows, 10);

        let cfg = Config::from_lookup(lookup(&[(PREVIEW_ROWS_VAR, "many")]));
        assert_eq!(cfg.preview_rows, 5);
    }
}
