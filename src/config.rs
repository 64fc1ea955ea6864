use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::engine::RankingPolicy;

/// Scheduling rules shared by every salon engine in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// New bookings may start this many minutes in the past (walk-ins being entered late).
    pub past_grace_minutes: i64,
    pub max_duration_minutes: i64,
    /// Grid step used when a slot query does not name one.
    pub grid_step_minutes: i64,
    /// Scheduled/confirmed appointments this far past their start become no-shows.
    /// `None` disables the sweeper.
    pub no_show_after_minutes: Option<i64>,
    pub ranking: RankingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            past_grace_minutes: 15,
            max_duration_minutes: 720,
            grid_step_minutes: 15,
            no_show_after_minutes: None,
            ranking: RankingPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mut ranking = defaults.ranking.clone();
        ranking.gap_weight = non_negative(&lookup, "SALONBOOK_RANK_GAP_WEIGHT", ranking.gap_weight);
        ranking.edge_penalty =
            non_negative(&lookup, "SALONBOOK_RANK_EDGE_PENALTY", ranking.edge_penalty);
        ranking.min_useful_gap_minutes = non_negative(
            &lookup,
            "SALONBOOK_RANK_MIN_USEFUL_GAP",
            ranking.min_useful_gap_minutes,
        );

        Self {
            past_grace_minutes: non_negative(
                &lookup,
                "SALONBOOK_PAST_GRACE_MINUTES",
                defaults.past_grace_minutes,
            ),
            max_duration_minutes: positive(
                &lookup,
                "SALONBOOK_MAX_DURATION_MINUTES",
                defaults.max_duration_minutes,
            ),
            grid_step_minutes: positive(
                &lookup,
                "SALONBOOK_GRID_STEP_MINUTES",
                defaults.grid_step_minutes,
            ),
            no_show_after_minutes: parsed_opt::<i64>(&lookup, "SALONBOOK_NO_SHOW_AFTER_MINUTES")
                .filter(|m| *m >= 0),
            ranking,
        }
    }
}

/// Process-level settings for the wire server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: parsed(&lookup, "SALONBOOK_PORT", 5433),
            bind: lookup("SALONBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("SALONBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("SALONBOOK_PASSWORD").unwrap_or_else(|| "salonbook".into()),
            max_connections: parsed(&lookup, "SALONBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: parsed(&lookup, "SALONBOOK_COMPACT_THRESHOLD", 1000),
            tls_cert: lookup("SALONBOOK_TLS_CERT"),
            tls_key: lookup("SALONBOOK_TLS_KEY"),
            metrics_port: parsed_opt(&lookup, "SALONBOOK_METRICS_PORT"),
            engine: EngineConfig::from_lookup(&lookup),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed_opt<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring invalid {key}={raw:?}");
            None
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    parsed_opt(lookup, key).unwrap_or(default)
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: i64) -> i64 {
    match parsed_opt::<i64>(lookup, key) {
        Some(v) if v > 0 => v,
        Some(v) => {
            warn!("{key} must be positive, got {v}; using {default}");
            default
        }
        None => default,
    }
}

fn non_negative(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: i64) -> i64 {
    match parsed_opt::<i64>(lookup, key) {
        Some(v) if v >= 0 => v,
        Some(v) => {
            warn!("{key} must not be negative, got {v}; using {default}");
            default
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[]));
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.engine, EngineConfig::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn values_are_read() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("SALONBOOK_PORT", "6000"),
            ("SALONBOOK_METRICS_PORT", "9100"),
            ("SALONBOOK_PAST_GRACE_MINUTES", "0"),
            ("SALONBOOK_GRID_STEP_MINUTES", "30"),
            ("SALONBOOK_NO_SHOW_AFTER_MINUTES", "20"),
            ("SALONBOOK_RANK_EDGE_PENALTY", "40"),
        ]));
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.engine.past_grace_minutes, 0);
        assert_eq!(cfg.engine.grid_step_minutes, 30);
        assert_eq!(cfg.engine.no_show_after_minutes, Some(20));
        assert_eq!(cfg.engine.ranking.edge_penalty, 40);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("SALONBOOK_GRID_STEP_MINUTES", "0"),
            ("SALONBOOK_MAX_DURATION_MINUTES", "lots"),
            ("SALONBOOK_PAST_GRACE_MINUTES", "-5"),
            ("SALONBOOK_NO_SHOW_AFTER_MINUTES", "-1"),
        ]));
        let defaults = EngineConfig::default();
        assert_eq!(cfg.grid_step_minutes, defaults.grid_step_minutes);
        assert_eq!(cfg.max_duration_minutes, defaults.max_duration_minutes);
        assert_eq!(cfg.past_grace_minutes, defaults.past_grace_minutes);
        assert_eq!(cfg.no_show_after_minutes, None);
    }
}
