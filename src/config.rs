use std::str::FromStr;

use crate::model::{DayHours, DEFAULT_DAY_HOURS};

/// Runtime settings, read from `APPOINTD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: String,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Granularity for facilities created without an explicit one.
    pub default_slot_minutes: u32,
    pub default_hours: DayHours,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: "./data".into(),
            password: "appointd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            default_slot_minutes: 30,
            default_hours: DEFAULT_DAY_HOURS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        if let Some(v) = lookup("APPOINTD_PORT") {
            cfg.port = parse("APPOINTD_PORT", &v)?;
        }
        if let Some(v) = lookup("APPOINTD_BIND") {
            cfg.bind = v;
        }
        if let Some(v) = lookup("APPOINTD_DATA_DIR") {
            cfg.data_dir = v;
        }
        if let Some(v) = lookup("APPOINTD_PASSWORD") {
            cfg.password = v;
        }
        if let Some(v) = lookup("APPOINTD_MAX_CONNECTIONS") {
            cfg.max_connections = parse("APPOINTD_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("APPOINTD_COMPACT_THRESHOLD") {
            cfg.compact_threshold = parse("APPOINTD_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("APPOINTD_METRICS_PORT") {
            cfg.metrics_port = Some(parse("APPOINTD_METRICS_PORT", &v)?);
        }
        cfg.tls_cert = lookup("APPOINTD_TLS_CERT");
        cfg.tls_key = lookup("APPOINTD_TLS_KEY");
        if let Some(v) = lookup("APPOINTD_SLOT_MINUTES") {
            cfg.default_slot_minutes = parse("APPOINTD_SLOT_MINUTES", &v)?;
        }
        if let Some(v) = lookup("APPOINTD_OPEN") {
            cfg.default_hours.open_min = parse_hhmm(&v).ok_or(ConfigError::Invalid("APPOINTD_OPEN", v))?;
        }
        if let Some(v) = lookup("APPOINTD_CLOSE") {
            cfg.default_hours.close_min = parse_hhmm(&v).ok_or(ConfigError::Invalid("APPOINTD_CLOSE", v))?;
        }
        if cfg.default_hours.close_min <= cfg.default_hours.open_min {
            return Err(ConfigError::Invalid(
                "APPOINTD_CLOSE",
                "closing time must be after opening time".into(),
            ));
        }
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(key, raw.to_string()))
}

/// `HH:MM` → minutes after midnight. `24:00` is accepted as end of day.
pub fn parse_hhmm(raw: &str) -> Option<u32> {
    let (h, m) = raw.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(key, value) => write!(f, "invalid {key}: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}
