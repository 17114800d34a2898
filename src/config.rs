use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::filter::builtin_filters;

/// Errors that invalidate a single jail definition
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("jail '{jail}' references unknown filter '{filter}'")]
    UnknownFilter { jail: String, filter: String },

    #[error("jail '{0}' has no logpath")]
    MissingLogPath(String),

    #[error("filter '{filter}': invalid regex '{pattern}': {source}")]
    InvalidRegex {
        filter: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("filter '{filter}': failregex '{pattern}' has no <HOST> or (?P<host>..) capture")]
    MissingHostGroup { filter: String, pattern: String },

    #[error("filter '{0}' has no failregex")]
    EmptyFilter(String),

    #[error("filter '{filter}': invalid date format: {reason}")]
    InvalidDateFormat { filter: String, reason: String },

    #[error("jail '{jail}': invalid ignore_list entry '{entry}'")]
    InvalidIgnoreEntry { jail: String, entry: String },

    #[error("jail '{jail}': invalid {field}: {reason}")]
    InvalidValue {
        jail: String,
        field: &'static str,
        reason: String,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub enforcement: EnforcementConfig,

    /// Settings inherited by every jail unless overridden
    #[serde(default)]
    pub defaults: JailDefaults,

    /// User pattern sets; same-named entries replace built-ins
    #[serde(default)]
    pub filters: BTreeMap<String, FilterConfig>,

    #[serde(default)]
    pub jails: BTreeMap<String, JailSection>,
}

impl Default for Config {
    fn default() -> Self {
        let mut jails = BTreeMap::new();

        jails.insert(
            "sshd".to_string(),
            JailSection {
                enabled: Some(true),
                logpath: Some("/var/log/auth.log".to_string()),
                ..Default::default()
            },
        );

        jails.insert(
            "nginx-http-auth".to_string(),
            JailSection {
                enabled: Some(false),
                logpath: Some("/var/log/nginx/error.log".to_string()),
                ..Default::default()
            },
        );

        jails.insert(
            "nginx-access".to_string(),
            JailSection {
                enabled: Some(false),
                logpath: Some("/var/log/nginx/access.log".to_string()),
                findtime: Some(60),
                maxretry: Some(20),
                bantime: Some(600),
                ..Default::default()
            },
        );

        jails.insert(
            "postfix-sasl".to_string(),
            JailSection {
                enabled: Some(false),
                logpath: Some("/var/log/mail.log".to_string()),
                maxretry: Some(3),
                ..Default::default()
            },
        );

        jails.insert(
            "dovecot".to_string(),
            JailSection {
                enabled: Some(false),
                logpath: Some("/var/log/mail.log".to_string()),
                ..Default::default()
            },
        );

        Self {
            general: GeneralConfig::default(),
            enforcement: EnforcementConfig::default(),
            defaults: JailDefaults::default(),
            filters: BTreeMap::new(),
            jails,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Candidate config locations, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/banwarden/config.toml")];
        if let Some(dir) = dirs_next::config_dir() {
            paths.push(dir.join("banwarden/config.toml"));
        }
        paths.push(PathBuf::from("config.toml"));
        paths
    }

    /// Load config from default locations or fall back to built-in defaults.
    /// Returns the path the config came from, if any.
    pub fn load_or_default() -> Result<(Self, Option<PathBuf>)> {
        for path in Self::search_paths() {
            if path.exists() {
                return Ok((Self::load(&path)?, Some(path)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.general.db_path)
    }

    pub fn pid_path(&self) -> PathBuf {
        PathBuf::from(&self.general.pid_file)
    }

    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.general.socket_path)
    }

    /// Look up a pattern set by name, user filters shadowing built-ins
    pub fn filter(&self, name: &str) -> Option<FilterConfig> {
        self.filters
            .get(name)
            .cloned()
            .or_else(|| builtin_filters().remove(name))
    }

    /// Merge defaults and per-jail overrides into one resolved config per
    /// jail. Broken jails are reported individually and never block the rest.
    pub fn resolve(&self) -> ResolvedJails {
        let mut resolved = ResolvedJails::default();

        for (id, section) in &self.jails {
            match self.resolve_jail(id, section) {
                Ok(jail) => resolved.jails.push(jail),
                Err(e) => resolved.errors.push((id.clone(), e)),
            }
        }

        resolved
    }

    fn resolve_jail(&self, id: &str, section: &JailSection) -> Result<JailConfig, ConfigError> {
        let d = &self.defaults;

        let filter_name = section.filter.clone().unwrap_or_else(|| id.to_string());
        let filter = self.filter(&filter_name).ok_or_else(|| ConfigError::UnknownFilter {
            jail: id.to_string(),
            filter: filter_name.clone(),
        })?;

        let log_path = section
            .logpath
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingLogPath(id.to_string()))?;

        let findtime = section.findtime.unwrap_or(d.findtime);
        if findtime == 0 {
            return Err(ConfigError::InvalidValue {
                jail: id.to_string(),
                field: "findtime",
                reason: "must be greater than zero".to_string(),
            });
        }
        if findtime > MAX_FINDTIME_SECS {
            return Err(ConfigError::InvalidValue {
                jail: id.to_string(),
                field: "findtime",
                reason: format!("{} exceeds the maximum of {}s", findtime, MAX_FINDTIME_SECS),
            });
        }

        let maxretry = section.maxretry.unwrap_or(d.maxretry);
        if maxretry == 0 {
            return Err(ConfigError::InvalidValue {
                jail: id.to_string(),
                field: "maxretry",
                reason: "must be at least 1".to_string(),
            });
        }

        let bantime = BanTime::from_secs(section.bantime.unwrap_or(d.bantime)).ok_or_else(|| {
            ConfigError::InvalidValue {
                jail: id.to_string(),
                field: "bantime",
                reason: "must be positive, or negative for permanent bans".to_string(),
            }
        })?;

        let escalation = section.escalation.clone().unwrap_or_else(|| d.escalation.clone());
        escalation.validate(id)?;

        let ignore_entries = section.ignore_list.as_ref().unwrap_or(&d.ignore_list);
        let ignore_list = ignore_entries
            .iter()
            .map(|entry| {
                entry
                    .trim()
                    .parse::<IpNetwork>()
                    .map_err(|_| ConfigError::InvalidIgnoreEntry {
                        jail: id.to_string(),
                        entry: entry.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JailConfig {
            jail_id: id.to_string(),
            enabled: section.enabled.unwrap_or(true),
            log_path,
            filter_name,
            filter,
            findtime,
            maxretry,
            bantime,
            ignore_list,
            backfill: section.backfill.unwrap_or(d.backfill),
            escalation,
            permanent_after: section.permanent_after.or(d.permanent_after),
        })
    }
}

/// Output of [`Config::resolve`]
#[derive(Debug, Default)]
pub struct ResolvedJails {
    pub jails: Vec<JailConfig>,
    pub errors: Vec<(String, ConfigError)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path to the SQLite ban store
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Path to PID file
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Control socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds past expiry after which ban history is purged
    #[serde(default = "default_dbpurgeage")]
    pub dbpurgeage: u64,

    /// Unban scheduler scan interval
    #[serde(default = "default_unban_interval")]
    pub unban_interval_secs: u64,

    /// How often ban history is purged
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Upper bound for the failure window sweep interval
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Fallback poll interval for log sources
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Consecutive read failures before a source is reported DEGRADED
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,

    /// Longest backoff between log source retries
    #[serde(default = "default_tail_backoff_max")]
    pub tail_backoff_max_secs: u64,

    /// How long a graceful stop waits for in-flight work
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pid_file: default_pid_file(),
            socket_path: default_socket_path(),
            log_level: default_log_level(),
            dbpurgeage: default_dbpurgeage(),
            unban_interval_secs: default_unban_interval(),
            purge_interval_secs: default_purge_interval(),
            sweep_interval_secs: default_sweep_interval(),
            poll_interval_ms: default_poll_interval(),
            degraded_after: default_degraded_after(),
            tail_backoff_max_secs: default_tail_backoff_max(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl GeneralConfig {
    pub fn unban_interval(&self) -> Duration {
        Duration::from_secs(self.unban_interval_secs.max(1))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Nftables,
    Command,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Attempts per install/remove before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    #[serde(default)]
    pub nftables: NftablesConfig,

    #[serde(default)]
    pub command: CommandConfig,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            retry_attempts: default_retry_attempts(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            nftables: NftablesConfig::default(),
            command: CommandConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftablesConfig {
    /// Table name to use
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Chain name for input filtering
    #[serde(default = "default_chain_name")]
    pub chain_name: String,

    /// Set name for blocked IPv4 addresses
    #[serde(default = "default_set_v4")]
    pub set_v4: String,

    /// Set name for blocked IPv6 addresses
    #[serde(default = "default_set_v6")]
    pub set_v6: String,

    /// Priority for the chain (lower = earlier)
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl Default for NftablesConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            chain_name: default_chain_name(),
            set_v4: default_set_v4(),
            set_v6: default_set_v6(),
            priority: default_priority(),
        }
    }
}

/// Shell-out backend: `<ip>` is replaced with the address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_ban_command")]
    pub ban: String,

    #[serde(default = "default_unban_command")]
    pub unban: String,

    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ban: default_ban_command(),
            unban: default_unban_command(),
            timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailDefaults {
    /// Window length in seconds
    #[serde(default = "default_findtime")]
    pub findtime: u64,

    /// Failures within findtime that trigger a ban
    #[serde(default = "default_maxretry")]
    pub maxretry: u32,

    /// Ban duration in seconds (negative = permanent)
    #[serde(default = "default_bantime")]
    pub bantime: i64,

    /// Addresses and CIDR ranges exempt from banning
    #[serde(default = "default_ignore_list")]
    pub ignore_list: Vec<String>,

    /// Read log sources from the start instead of the end
    #[serde(default)]
    pub backfill: bool,

    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Prior bans after which a ban becomes permanent
    #[serde(default)]
    pub permanent_after: Option<u32>,
}

impl Default for JailDefaults {
    fn default() -> Self {
        Self {
            findtime: default_findtime(),
            maxretry: default_maxretry(),
            bantime: default_bantime(),
            ignore_list: default_ignore_list(),
            backfill: false,
            escalation: EscalationConfig::default(),
            permanent_after: None,
        }
    }
}

/// Repeat-offender policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prior bans needed before escalation applies
    #[serde(default = "default_escalation_threshold")]
    pub threshold: u32,

    /// Factor applied to bantime for repeat offenders
    #[serde(default = "default_escalation_multiplier")]
    pub multiplier: f64,

    /// Fixed bantime for repeat offenders; takes precedence over multiplier
    #[serde(default)]
    pub fixed_bantime: Option<u64>,

    /// Cap on the escalated bantime
    #[serde(default)]
    pub max_bantime: Option<u64>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_escalation_threshold(),
            multiplier: default_escalation_multiplier(),
            fixed_bantime: None,
            max_bantime: None,
        }
    }
}

impl EscalationConfig {
    fn validate(&self, jail: &str) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                jail: jail.to_string(),
                field: "escalation.multiplier",
                reason: format!("{} is not a finite factor >= 1", self.multiplier),
            });
        }
        if self.threshold == 0 {
            return Err(ConfigError::InvalidValue {
                jail: jail.to_string(),
                field: "escalation.threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// A pattern set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Failure rules, evaluated in order
    pub failregex: Vec<String>,

    /// Ignore rules, evaluated before any failure rule
    #[serde(default)]
    pub ignoreregex: Vec<String>,

    /// `auto`, `syslog`, `iso8601`, `clf`, `epoch`, or a chrono format string
    #[serde(default = "default_date_format")]
    pub date_format: String,

    /// Regex locating the timestamp for custom formats
    #[serde(default)]
    pub date_regex: Option<String>,
}

/// Per-jail overrides; unset fields inherit [`JailDefaults`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JailSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logpath: Option<String>,
    /// Pattern set name, defaults to the jail name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findtime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxretry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bantime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent_after: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanTime {
    Finite(u64),
    Permanent,
}

impl BanTime {
    /// Negative means permanent, zero is rejected
    pub fn from_secs(secs: i64) -> Option<Self> {
        match secs {
            0 => None,
            s if s < 0 => Some(BanTime::Permanent),
            s => Some(BanTime::Finite(s as u64)),
        }
    }
}

impl std::fmt::Display for BanTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BanTime::Finite(secs) => write!(f, "{}s", secs),
            BanTime::Permanent => write!(f, "permanent"),
        }
    }
}

/// Fully resolved jail configuration
#[derive(Debug, Clone, PartialEq)]
pub struct JailConfig {
    pub jail_id: String,
    pub enabled: bool,
    pub log_path: PathBuf,
    pub filter_name: String,
    pub filter: FilterConfig,
    pub findtime: u64,
    pub maxretry: u32,
    pub bantime: BanTime,
    pub ignore_list: Vec<IpNetwork>,
    pub backfill: bool,
    pub escalation: EscalationConfig,
    pub permanent_after: Option<u32>,
}

impl JailConfig {
    pub fn is_ignored(&self, ip: &std::net::IpAddr) -> bool {
        self.ignore_list.iter().any(|net| net.contains(*ip))
    }
}

// Default value functions
fn default_db_path() -> String {
    "/var/lib/banwarden/banwarden.db".to_string()
}

fn default_pid_file() -> String {
    "/run/banwarden.pid".to_string()
}

fn default_socket_path() -> String {
    "/run/banwarden/control.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dbpurgeage() -> u64 {
    86400 // 1 day
}

fn default_unban_interval() -> u64 {
    2
}

fn default_purge_interval() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_degraded_after() -> u32 {
    5
}

fn default_tail_backoff_max() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_backend() -> BackendKind {
    BackendKind::Nftables
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_ms() -> u64 {
    200
}

fn default_retry_max_ms() -> u64 {
    5000
}

fn default_table_name() -> String {
    "banwarden".to_string()
}

fn default_chain_name() -> String {
    "input".to_string()
}

fn default_set_v4() -> String {
    "blocked_v4".to_string()
}

fn default_set_v6() -> String {
    "blocked_v6".to_string()
}

fn default_priority() -> i32 {
    -100 // Before most other rules
}

fn default_ban_command() -> String {
    "nft add element inet filter banned { <ip> }".to_string()
}

fn default_unban_command() -> String {
    "nft delete element inet filter banned { <ip> }".to_string()
}

fn default_command_timeout() -> u64 {
    10
}

/// Longest accepted failure window (10 years)
pub const MAX_FINDTIME_SECS: u64 = 10 * 365 * 24 * 3600;

fn default_findtime() -> u64 {
    600 // 10 minutes
}

fn default_maxretry() -> u32 {
    5
}

fn default_bantime() -> i64 {
    3600 // 1 hour
}

fn default_ignore_list() -> Vec<String> {
    vec!["127.0.0.1/8".to_string(), "::1".to_string()]
}

fn default_escalation_threshold() -> u32 {
    3
}

fn default_escalation_multiplier() -> f64 {
    4.0
}

fn default_date_format() -> String {
    "auto".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.jails.contains_key("sshd"));
        assert_eq!(config.enforcement.nftables.table_name, "banwarden");

        let resolved = config.resolve();
        assert!(resolved.errors.is_empty(), "{:?}", resolved.errors);
        let sshd = resolved.jails.iter().find(|j| j.jail_id == "sshd").unwrap();
        assert!(sshd.enabled);
        assert_eq!(sshd.maxretry, 5);
        assert_eq!(sshd.bantime, BanTime::Finite(3600));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            parsed.enforcement.nftables.table_name,
            config.enforcement.nftables.table_name
        );
        assert_eq!(parsed.jails.len(), config.jails.len());
    }

    #[test]
    fn test_jail_overrides_defaults() {
        let config = Config::from_toml(
            r#"
            [defaults]
            findtime = 300
            maxretry = 4
            bantime = 120

            [jails.web]
            filter = "nginx-http-auth"
            logpath = "/var/log/nginx/error.log"
            maxretry = 2
            bantime = -1
            "#,
        )
        .unwrap();

        let resolved = config.resolve();
        assert!(resolved.errors.is_empty());
        let web = &resolved.jails[0];
        assert_eq!(web.findtime, 300);
        assert_eq!(web.maxretry, 2);
        assert_eq!(web.bantime, BanTime::Permanent);
        assert_eq!(web.filter_name, "nginx-http-auth");
    }

    #[test]
    fn test_broken_jail_does_not_block_others() {
        let config = Config::from_toml(
            r#"
            [jails.sshd]
            logpath = "/var/log/auth.log"

            [jails.mystery]
            logpath = "/var/log/mystery.log"
            filter = "does-not-exist"

            [jails.nopath]
            filter = "sshd"

            [jails.zero]
            logpath = "/var/log/auth.log"
            filter = "sshd"
            maxretry = 0
            "#,
        )
        .unwrap();

        let resolved = config.resolve();
        assert_eq!(resolved.jails.len(), 1);
        assert_eq!(resolved.jails[0].jail_id, "sshd");
        assert_eq!(resolved.errors.len(), 3);
        assert!(resolved
            .errors
            .iter()
            .any(|(id, e)| id == "mystery" && matches!(e, ConfigError::UnknownFilter { .. })));
        assert!(resolved
            .errors
            .iter()
            .any(|(id, e)| id == "nopath" && matches!(e, ConfigError::MissingLogPath(_))));
    }

    #[test]
    fn test_user_filter_shadows_builtin() {
        let config = Config::from_toml(
            r#"
            [filters.sshd]
            failregex = ['^custom failure from <HOST>$']

            [jails.sshd]
            logpath = "/var/log/auth.log"
            "#,
        )
        .unwrap();

        let jail = &config.resolve().jails[0];
        assert_eq!(jail.filter.failregex, vec!["^custom failure from <HOST>$"]);
    }

    #[test]
    fn test_ignore_list_cidr() {
        let config = Config::from_toml(
            r#"
            [jails.sshd]
            logpath = "/var/log/auth.log"
            ignore_list = ["10.0.0.0/8", "2001:db8::1"]
            "#,
        )
        .unwrap();

        let jail = &config.resolve().jails[0];
        assert!(jail.is_ignored(&"10.20.30.40".parse().unwrap()));
        assert!(jail.is_ignored(&"2001:db8::1".parse().unwrap()));
        assert!(!jail.is_ignored(&"203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_invalid_ignore_entry() {
        let config = Config::from_toml(
            r#"
            [jails.sshd]
            logpath = "/var/log/auth.log"
            ignore_list = ["not-an-address"]
            "#,
        )
        .unwrap();

        let resolved = config.resolve();
        assert!(matches!(
            resolved.errors[0].1,
            ConfigError::InvalidIgnoreEntry { .. }
        ));
    }

    #[test]
    fn test_findtime_out_of_range() {
        let config = Config::from_toml(
            r#"
            [jails.sshd]
            logpath = "/var/log/auth.log"
            findtime = 10000000000000

            [jails.nginx-http-auth]
            enabled = true
            logpath = "/var/log/nginx/error.log"
            findtime = 315360000
            "#,
        )
        .unwrap();

        let resolved = config.resolve();
        assert_eq!(resolved.errors.len(), 1);
        assert_eq!(resolved.errors[0].0, "sshd");
        assert!(matches!(
            resolved.errors[0].1,
            ConfigError::InvalidValue { field: "findtime", .. }
        ));
        assert_eq!(resolved.jails.len(), 1);
        assert_eq!(resolved.jails[0].findtime, MAX_FINDTIME_SECS);
    }

    #[test]
    fn test_bantime_sentinels() {
        assert_eq!(BanTime::from_secs(-1), Some(BanTime::Permanent));
        assert_eq!(BanTime::from_secs(60), Some(BanTime::Finite(60)));
        assert_eq!(BanTime::from_secs(0), None);
    }
}
