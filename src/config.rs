//! Server settings, read once from `ROOST_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::OverlapPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Prometheus listener; disabled when unset.
    pub metrics_port: Option<u16>,
    pub overlap: OverlapPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5434,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roost".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            overlap: OverlapPolicy::default(),
        }
    }
}

impl Config {
    /// # Environment Variables
    /// - `ROOST_PORT` (default 5434)
    /// - `ROOST_BIND` (default `0.0.0.0`)
    /// - `ROOST_DATA_DIR` (default `./data`)
    /// - `ROOST_PASSWORD` (default `roost`)
    /// - `ROOST_MAX_CONNECTIONS` (default 256)
    /// - `ROOST_COMPACT_THRESHOLD` (default 1000)
    /// - `ROOST_TLS_CERT`, `ROOST_TLS_KEY` (both or neither)
    /// - `ROOST_METRICS_PORT` (optional)
    /// - `ROOST_OVERLAP_POLICY`: `closed` (default) or `endpoints`
    ///
    /// # Errors
    /// Returns a message naming the variable when a value does not parse.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_connections = parsed(&lookup, "ROOST_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err("ROOST_MAX_CONNECTIONS must be at least 1".into());
        }
        Ok(Self {
            port: parsed(&lookup, "ROOST_PORT")?.unwrap_or(defaults.port),
            bind: lookup("ROOST_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("ROOST_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("ROOST_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold: parsed(&lookup, "ROOST_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("ROOST_TLS_CERT"),
            tls_key: lookup("ROOST_TLS_KEY"),
            metrics_port: parsed(&lookup, "ROOST_METRICS_PORT")?,
            overlap: parsed(&lookup, "ROOST_OVERLAP_POLICY")?.unwrap_or(defaults.overlap),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{key}={raw:?}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5434");
        assert_eq!(cfg.overlap, OverlapPolicy::Closed);
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("ROOST_PORT", "6000"),
            ("ROOST_BIND", "127.0.0.1"),
            ("ROOST_DATA_DIR", "/var/lib/roost"),
            ("ROOST_PASSWORD", "s3cret"),
            ("ROOST_MAX_CONNECTIONS", "8"),
            ("ROOST_COMPACT_THRESHOLD", "50"),
            ("ROOST_METRICS_PORT", "9100"),
            ("ROOST_OVERLAP_POLICY", "Endpoints"),
        ])
        .unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6000");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/roost"));
        assert_eq!(cfg.password, "s3cret");
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.overlap, OverlapPolicy::Endpoints);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = config(&[("ROOST_PORT", "eighty")]).unwrap_err();
        assert!(err.contains("ROOST_PORT"));
        let err = config(&[("ROOST_OVERLAP_POLICY", "half-open")]).unwrap_err();
        assert!(err.contains("ROOST_OVERLAP_POLICY"));
        assert!(config(&[("ROOST_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn tls_paths_pass_through() {
        let cfg = config(&[("ROOST_TLS_CERT", "c.pem"), ("ROOST_TLS_KEY", "k.pem")]).unwrap();
        assert_eq!(cfg.tls_cert.as_deref(), Some("c.pem"));
        assert_eq!(cfg.tls_key.as_deref(), Some("k.pem"));
    }
}
