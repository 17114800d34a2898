use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A single line read from a log source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub source_id: String,
    pub raw_line: String,
    pub observed_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(source_id: impl Into<String>, raw_line: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            raw_line: raw_line.into(),
            observed_at: Utc::now(),
        }
    }

    pub fn observed(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Failure,
    Ignore,
}

/// Outcome of running a line through a jail's pattern set.
///
/// A `Failure` always carries an address. An `Ignore` carries one only when
/// the ignore rule captured it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEvent {
    pub jail_id: String,
    pub address: Option<IpAddr>,
    pub matched_at: DateTime<Utc>,
    pub rule_id: String,
    pub kind: MatchKind,
}

/// Source of the ban
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BanSource {
    /// Threshold crossed in the log stream
    Monitor,
    /// Issued through the control surface
    Manual,
    /// Re-asserted from the store after a restart
    Restored,
}

impl std::fmt::Display for BanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BanSource::Monitor => write!(f, "monitor"),
            BanSource::Manual => write!(f, "manual"),
            BanSource::Restored => write!(f, "restored"),
        }
    }
}

impl std::str::FromStr for BanSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monitor" => Ok(BanSource::Monitor),
            "manual" => Ok(BanSource::Manual),
            "restored" => Ok(BanSource::Restored),
            other => Err(format!("Unknown ban source: {}", other)),
        }
    }
}

/// A ban of one address within one jail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BanRecord {
    pub jail_id: String,
    pub address: IpAddr,
    pub banned_at: DateTime<Utc>,
    /// `None` for permanent bans
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifetime bans of this address in this jail, including this one
    pub ban_count: u32,
    /// Enforcement backend that holds the block
    pub action_ref: String,
    pub source: BanSource,
    pub reason: String,
    /// False while the backend has not confirmed the block (DEGRADED)
    pub enforced: bool,
}

impl BanRecord {
    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    /// Seconds left before expiry, `None` when permanent
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|exp| (exp - now).num_seconds().max(0))
    }
}

/// Bookkeeping state of an address within one jail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "failures", rename_all = "lowercase")]
pub enum AddressState {
    Clean,
    Watched(usize),
    Banned,
}

/// Health of a log source as seen by its tailer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SourceHealth {
    Starting,
    Healthy,
    Retrying { failures: u32 },
    Degraded { failures: u32, last_error: String },
}

impl SourceHealth {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SourceHealth::Degraded { .. })
    }
}

impl std::fmt::Display for SourceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceHealth::Starting => write!(f, "starting"),
            SourceHealth::Healthy => write!(f, "ok"),
            SourceHealth::Retrying { failures } => write!(f, "retrying ({})", failures),
            SourceHealth::Degraded { failures, last_error } => {
                write!(f, "DEGRADED ({} failures: {})", failures, last_error)
            }
        }
    }
}

/// Counters kept by each jail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JailCounters {
    pub lines_seen: u64,
    pub failures: u64,
    pub ignored: u64,
    pub bans: u64,
    pub unbans: u64,
}

/// Per-jail status for the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailStatus {
    pub jail_id: String,
    pub log_path: String,
    pub filter: String,
    pub source: SourceHealth,
    pub watched: usize,
    pub active_bans: usize,
    pub degraded_bans: usize,
    pub counters: JailCounters,
}

/// Daemon status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    pub uptime_secs: u64,
    pub backend: String,
    pub active_bans: u64,
    pub degraded_bans: u64,
    pub jails: Vec<JailStatus>,
    /// Jails whose configuration failed to load, with the error
    pub failed_jails: Vec<(String, String)>,
}

/// Outcome of applying a configuration to the running jails
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReloadReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: usize,
    /// Jails left on their previous configuration because the new one is broken
    pub kept: Vec<String>,
    pub failed: Vec<(String, String)>,
}
