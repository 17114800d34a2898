//! Jail coordinator
//!
//! A jail binds one log source and one pattern set to a ban policy. Each
//! jail runs as a single actor task: log batches from its tailer, control
//! requests, expiries and window sweeps all arrive on channels and are
//! handled one at a time, so the (jail, address) state never sees two
//! concurrent writers.
//!
//! Per address the state moves CLEAN -> WATCHED -> BANNED -> CLEAN. A ban is
//! persisted before it is installed; a ban the backend refuses stays
//! recorded as not enforced (DEGRADED) and is re-asserted later.

use chrono::{DateTime, Duration, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{BanTime, ConfigError, JailConfig};
use crate::enforcement::Enforcer;
use crate::error::{Error, Result};
use crate::filter::PatternMatcher;
use crate::models::{
    AddressState, BanRecord, BanSource, JailCounters, JailStatus, LogRecord, MatchEvent,
    MatchKind, SourceHealth,
};
use crate::store::BanStore;
use crate::window::WindowCounter;

pub struct Jail {
    config: JailConfig,
    matcher: PatternMatcher,
    window: WindowCounter,
    store: BanStore,
    enforcer: Arc<Enforcer>,
    counters: JailCounters,
    health: Option<watch::Receiver<SourceHealth>>,
}

impl Jail {
    pub fn new(
        config: JailConfig,
        store: BanStore,
        enforcer: Arc<Enforcer>,
    ) -> std::result::Result<Self, ConfigError> {
        let matcher = PatternMatcher::compile(&config.jail_id, &config.filter_name, &config.filter)?;

        Ok(Self {
            window: WindowCounter::new(config.findtime),
            matcher,
            config,
            store,
            enforcer,
            counters: JailCounters::default(),
            health: None,
        })
    }

    /// Source health reported in status
    pub fn with_health(mut self, health: watch::Receiver<SourceHealth>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.jail_id
    }

    pub fn config(&self) -> &JailConfig {
        &self.config
    }

    pub fn counters(&self) -> &JailCounters {
        &self.counters
    }

    /// Run one log line through the jail
    pub async fn handle_record(
        &mut self,
        record: &LogRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<BanRecord>> {
        self.counters.lines_seen += 1;
        match self.matcher.match_record(record) {
            Some(event) => self.handle_event(event, now).await,
            None => Ok(None),
        }
    }

    /// Apply a match event. Returns the ban it triggered, if any.
    pub async fn handle_event(
        &mut self,
        event: MatchEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<BanRecord>> {
        let ip = match (event.kind, event.address) {
            (MatchKind::Ignore, _) => {
                self.counters.ignored += 1;
                return Ok(None);
            }
            (MatchKind::Failure, Some(ip)) => ip,
            (MatchKind::Failure, None) => return Ok(None),
        };
        self.counters.failures += 1;

        if self.config.is_ignored(&ip) {
            debug!("{} is in the ignore list of jail {}", ip, self.config.jail_id);
            self.counters.ignored += 1;
            return Ok(None);
        }

        if self.window.cutoff(now).is_some_and(|cutoff| event.matched_at < cutoff) {
            debug!(
                "Stale failure for {} in jail {} at {}, not counted",
                ip, self.config.jail_id, event.matched_at
            );
            return Ok(None);
        }

        if self.store.get(&self.config.jail_id, &ip)?.is_some() {
            debug!("{} already banned in jail {}", ip, self.config.jail_id);
            return Ok(None);
        }

        let count = self.window.record(ip, event.matched_at);
        if count < self.config.maxretry as usize {
            debug!(
                "{} has {}/{} failures in jail {}",
                ip, count, self.config.maxretry, self.config.jail_id
            );
            return Ok(None);
        }

        let reason = format!(
            "{} failures within {}s ({})",
            count, self.config.findtime, event.rule_id
        );
        self.ban(ip, event.matched_at, BanSource::Monitor, reason)
            .await
            .map(Some)
    }

    /// Ban time for an address with `prior` earlier bans; `None` is permanent
    pub fn ban_duration(&self, prior: u32) -> Option<Duration> {
        if self.config.permanent_after.is_some_and(|n| prior >= n) {
            return None;
        }

        let BanTime::Finite(base) = self.config.bantime else {
            return None;
        };

        let esc = &self.config.escalation;
        let secs = if esc.enabled && prior >= esc.threshold {
            let escalated = esc
                .fixed_bantime
                .unwrap_or_else(|| (base as f64 * esc.multiplier).round() as u64);
            esc.max_bantime.map_or(escalated, |max| escalated.min(max))
        } else {
            base
        };

        // chrono durations top out at i64::MAX milliseconds
        Some(Duration::seconds(secs.min(i64::MAX as u64 / 1000) as i64))
    }

    async fn ban(
        &mut self,
        ip: IpAddr,
        at: DateTime<Utc>,
        source: BanSource,
        reason: String,
    ) -> Result<BanRecord> {
        let jail = self.config.jail_id.clone();
        let prior = self.store.ban_count(&jail, &ip)?;
        let duration = self.ban_duration(prior);

        let record = BanRecord {
            jail_id: jail.clone(),
            address: ip,
            banned_at: at,
            expires_at: duration.and_then(|d| at.checked_add_signed(d)),
            ban_count: prior + 1,
            action_ref: self.enforcer.backend_name().to_string(),
            source,
            reason,
            enforced: false,
        };

        let mut stored = self.store.upsert(&record)?;
        self.window.clear(&ip);
        self.counters.bans += 1;

        match self.enforcer.acquire(&jail, ip).await {
            Ok(()) => {
                self.store.set_enforced(&jail, &ip, true)?;
                stored.enforced = true;
                info!(
                    "Banned {} in jail {} until {} ({}, ban #{})",
                    ip,
                    jail,
                    stored
                        .expires_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "forever".to_string()),
                    stored.reason,
                    stored.ban_count
                );
            }
            Err(e) => {
                error!(
                    "Ban of {} in jail {} recorded but NOT enforced (DEGRADED): {}",
                    ip, jail, e
                );
            }
        }

        Ok(stored)
    }

    /// Ban immediately, bypassing the window. Banning an address that is
    /// already banned refreshes its expiry and never shortens it.
    pub async fn manual_ban(&mut self, ip: IpAddr, now: DateTime<Utc>) -> Result<BanRecord> {
        let jail = self.config.jail_id.clone();
        if self.config.is_ignored(&ip) {
            return Err(Error::Ignored(ip, jail));
        }

        if let Some(existing) = self.store.get(&jail, &ip)? {
            let duration = self.ban_duration(existing.ban_count.saturating_sub(1));
            let refreshed = BanRecord {
                expires_at: duration.and_then(|d| now.checked_add_signed(d)),
                ..existing
            };
            let stored = self.store.upsert(&refreshed)?;
            if !stored.enforced {
                self.reassert(ip).await?;
                return Ok(BanRecord {
                    enforced: true,
                    ..stored
                });
            }
            return Ok(stored);
        }

        self.ban(ip, now, BanSource::Manual, "manual ban".to_string())
            .await
    }

    /// Lift a ban now. Unbanning a clean address is a no-op. The record is
    /// only removed once the block is gone. `forget` also drops the ban
    /// history used for escalation.
    pub async fn unban(&mut self, ip: IpAddr, forget: bool) -> Result<bool> {
        let jail = self.config.jail_id.clone();
        self.window.clear(&ip);

        let banned = self.store.get(&jail, &ip)?.is_some();
        if banned {
            self.enforcer.release(&jail, ip).await?;
            self.store.remove(&jail, &ip)?;
            self.counters.unbans += 1;
            info!("Unbanned {} in jail {}", ip, jail);
        }

        if forget && self.store.forget_history(&jail, &ip)? {
            info!("Forgot ban history of {} in jail {}", ip, jail);
        }

        Ok(banned)
    }

    /// Scheduler-driven expiry
    pub async fn expire(&mut self, ip: IpAddr, now: DateTime<Utc>) -> Result<bool> {
        let removed = expire_ban(&self.store, &self.enforcer, &self.config.jail_id, ip, now).await?;
        if removed {
            self.counters.unbans += 1;
        }
        Ok(removed)
    }

    /// Retry installing a ban the backend has not confirmed
    pub async fn reassert(&mut self, ip: IpAddr) -> Result<bool> {
        let jail = self.config.jail_id.clone();
        match self.store.get(&jail, &ip)? {
            Some(record) if !record.enforced => {
                self.enforcer.acquire(&jail, ip).await?;
                self.store.set_enforced(&jail, &ip, true)?;
                info!("Ban of {} in jail {} is now enforced", ip, jail);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let released = self.window.sweep(now);
        if released > 0 {
            debug!(
                "Released {} idle addresses in jail {}",
                released, self.config.jail_id
            );
        }
        released
    }

    pub fn state_of(&self, ip: &IpAddr, now: DateTime<Utc>) -> Result<AddressState> {
        if self.store.get(&self.config.jail_id, ip)?.is_some() {
            return Ok(AddressState::Banned);
        }
        Ok(match self.window.count(ip, now) {
            0 => AddressState::Clean,
            n => AddressState::Watched(n),
        })
    }

    pub fn status(&self) -> Result<JailStatus> {
        let bans = self.store.list_for_jail(&self.config.jail_id)?;
        let source = self
            .health
            .as_ref()
            .map(|h| h.borrow().clone())
            .unwrap_or(SourceHealth::Starting);

        Ok(JailStatus {
            jail_id: self.config.jail_id.clone(),
            log_path: self.config.log_path.display().to_string(),
            filter: self.config.filter_name.clone(),
            source,
            watched: self.window.watched(),
            active_bans: bans.len(),
            degraded_bans: bans.iter().filter(|b| !b.enforced).count(),
            counters: self.counters.clone(),
        })
    }

    async fn handle_command(&mut self, command: JailCommand) {
        match command {
            JailCommand::Ban { ip, reply } => {
                let _ = reply.send(self.manual_ban(ip, Utc::now()).await);
            }
            JailCommand::Unban { ip, forget, reply } => {
                let _ = reply.send(self.unban(ip, forget).await);
            }
            JailCommand::Expire { ip, now } => {
                if let Err(e) = self.expire(ip, now).await {
                    warn!(
                        "Expiry of {} in jail {} failed, will retry: {}",
                        ip, self.config.jail_id, e
                    );
                }
            }
            JailCommand::Reassert { ip } => {
                if let Err(e) = self.reassert(ip).await {
                    debug!(
                        "Ban of {} in jail {} still not enforced: {}",
                        ip, self.config.jail_id, e
                    );
                }
            }
            JailCommand::State { ip, reply } => {
                let _ = reply.send(self.state_of(&ip, Utc::now()));
            }
            JailCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn handle_lines(&mut self, batch: Vec<LogRecord>) {
        let now = Utc::now();
        for record in &batch {
            if let Err(e) = self.handle_record(record, now).await {
                error!("Jail {} failed to process a line: {}", self.config.jail_id, e);
            }
        }
    }

    /// Actor loop. Ends when every command sender is gone; log batches
    /// already queued are processed first.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<JailCommand>,
        mut lines: mpsc::Receiver<Vec<LogRecord>>,
        sweep_every: std::time::Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut lines_open = true;

        info!(
            "Jail {} started ({} via {}, maxretry {} in {}s, bantime {})",
            self.config.jail_id,
            self.config.log_path.display(),
            self.config.filter_name,
            self.config.maxretry,
            self.config.findtime,
            self.config.bantime
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                batch = lines.recv(), if lines_open => match batch {
                    Some(batch) => self.handle_lines(batch).await,
                    None => lines_open = false,
                },
                _ = sweep.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }

        while let Ok(batch) = lines.try_recv() {
            self.handle_lines(batch).await;
        }

        info!("Jail {} stopped", self.config.jail_id);
    }
}

/// Remove an expired ban: release the block, then delete the record if it
/// is still expired. Shared by the jail actor and the scheduler's handling
/// of records left by jails that no longer exist.
pub async fn expire_ban(
    store: &BanStore,
    enforcer: &Enforcer,
    jail: &str,
    ip: IpAddr,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(record) = store.get(jail, &ip)? else {
        return Ok(false);
    };
    if !record.is_expired_at(now) {
        debug!("Ban of {} in jail {} was refreshed, keeping it", ip, jail);
        return Ok(false);
    }

    enforcer.release(jail, ip).await?;

    if store.remove_if_expired(jail, &ip, now)? {
        info!("Unbanned {} in jail {} (expired)", ip, jail);
        Ok(true)
    } else {
        // Refreshed between the check and the delete; put the block back
        warn!("Ban of {} in jail {} refreshed during expiry, re-installing", ip, jail);
        enforcer.acquire(jail, ip).await?;
        Ok(false)
    }
}

/// Requests handled by a jail actor
#[derive(Debug)]
pub enum JailCommand {
    Ban {
        ip: IpAddr,
        reply: oneshot::Sender<Result<BanRecord>>,
    },
    Unban {
        ip: IpAddr,
        forget: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    Expire {
        ip: IpAddr,
        now: DateTime<Utc>,
    },
    Reassert {
        ip: IpAddr,
    },
    State {
        ip: IpAddr,
        reply: oneshot::Sender<Result<AddressState>>,
    },
    Status {
        reply: oneshot::Sender<Result<JailStatus>>,
    },
}

/// Cloneable address of a running jail actor
#[derive(Debug, Clone)]
pub struct JailHandle {
    jail_id: String,
    tx: mpsc::Sender<JailCommand>,
}

impl JailHandle {
    pub fn new(jail_id: impl Into<String>, tx: mpsc::Sender<JailCommand>) -> Self {
        Self {
            jail_id: jail_id.into(),
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.jail_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> JailCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::JailClosed(self.jail_id.clone()))?;
        rx.await
            .map_err(|_| Error::JailClosed(self.jail_id.clone()))?
    }

    pub async fn ban(&self, ip: IpAddr) -> Result<BanRecord> {
        self.request(|reply| JailCommand::Ban { ip, reply }).await
    }

    pub async fn unban(&self, ip: IpAddr, forget: bool) -> Result<bool> {
        self.request(|reply| JailCommand::Unban { ip, forget, reply })
            .await
    }

    pub async fn state_of(&self, ip: IpAddr) -> Result<AddressState> {
        self.request(|reply| JailCommand::State { ip, reply }).await
    }

    pub async fn status(&self) -> Result<JailStatus> {
        self.request(|reply| JailCommand::Status { reply }).await
    }

    /// Queue an expiry without waiting; false when the actor is busy or gone
    pub fn expire(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        self.tx.try_send(JailCommand::Expire { ip, now }).is_ok()
    }

    pub fn reassert(&self, ip: IpAddr) -> bool {
        self.tx.try_send(JailCommand::Reassert { ip }).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::config::{Config, EscalationConfig};
    use crate::enforcement::MemoryBackend;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn jail_config() -> JailConfig {
        let config = Config::from_toml(
            r#"
            [filters.test]
            failregex = ['^auth failure from <HOST>$']
            ignoreregex = ['^auth failure from <HOST> \(probe\)$']

            [jails.test]
            logpath = "/var/log/test.log"
            findtime = 600
            maxretry = 5
            bantime = 3600
            ignore_list = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();
        config.resolve().jails.remove(0)
    }

    fn setup(config: JailConfig) -> (Arc<MemoryBackend>, BanStore, Jail) {
        let backend = Arc::new(MemoryBackend::new());
        let enforcer = Arc::new(Enforcer::new(backend.clone(), RetryPolicy::immediate(2)));
        let store = BanStore::open_memory().unwrap();
        let jail = Jail::new(config, store.clone(), enforcer).unwrap();
        (backend, store, jail)
    }

    fn failure(ip: &str, at: i64) -> MatchEvent {
        MatchEvent {
            jail_id: "test".to_string(),
            address: Some(ip.parse().unwrap()),
            matched_at: t(at),
            rule_id: "test:fail[0]".to_string(),
            kind: MatchKind::Failure,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_ban_at_maxretry() {
        let (backend, store, mut jail) = setup(jail_config());

        for at in [0, 100, 200, 300] {
            assert!(jail
                .handle_event(failure("203.0.113.7", at), t(at))
                .await
                .unwrap()
                .is_none());
        }
        assert_eq!(
            jail.state_of(&ip("203.0.113.7"), t(300)).unwrap(),
            AddressState::Watched(4)
        );

        let ban = jail
            .handle_event(failure("203.0.113.7", 400), t(400))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ban.banned_at, t(400));
        assert_eq!(ban.expires_at, Some(t(4000)));
        assert!(ban.enforced);
        assert!(backend.contains(&ip("203.0.113.7")));

        // Further failures are dropped
        assert!(jail
            .handle_event(failure("203.0.113.7", 500), t(500))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.list_active().unwrap().len(), 1);
        assert_eq!(
            jail.state_of(&ip("203.0.113.7"), t(500)).unwrap(),
            AddressState::Banned
        );
    }

    #[tokio::test]
    async fn test_spread_out_failures_never_ban() {
        let (_, store, mut jail) = setup(jail_config());
        for at in [0, 100, 200, 300, 900] {
            jail.handle_event(failure("203.0.113.7", at), t(at))
                .await
                .unwrap();
        }
        assert!(store.list_active().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_events_ignored() {
        let (_, store, mut jail) = setup(jail_config());
        for at in 0..10 {
            jail.handle_event(failure("203.0.113.7", at), t(5000))
                .await
                .unwrap();
        }
        assert!(store.list_active().unwrap().is_empty());
        assert_eq!(jail.counters().failures, 10);
    }

    #[tokio::test]
    async fn test_failures_spanning_exactly_findtime_ban() {
        let (backend, _, mut jail) = setup(jail_config());
        for at in [0, 150, 300, 450] {
            assert!(jail
                .handle_event(failure("203.0.113.7", at), t(at))
                .await
                .unwrap()
                .is_none());
        }
        let ban = jail
            .handle_event(failure("203.0.113.7", 600), t(600))
            .await
            .unwrap();
        assert!(ban.is_some());
        assert!(backend.contains(&ip("203.0.113.7")));
    }

    #[tokio::test]
    async fn test_event_exactly_findtime_old_still_counts() {
        let (_, _, mut jail) = setup(jail_config());
        jail.handle_event(failure("203.0.113.7", 0), t(600))
            .await
            .unwrap();
        assert_eq!(
            jail.state_of(&ip("203.0.113.7"), t(600)).unwrap(),
            AddressState::Watched(1)
        );

        jail.handle_event(failure("198.51.100.4", 0), t(601))
            .await
            .unwrap();
        assert_eq!(
            jail.state_of(&ip("198.51.100.4"), t(601)).unwrap(),
            AddressState::Clean
        );
    }

    #[tokio::test]
    async fn test_ignore_list_and_ignore_rules() {
        let (backend, _, mut jail) = setup(jail_config());

        for at in 0..10 {
            jail.handle_event(failure("10.1.2.3", at), t(at)).await.unwrap();
        }
        assert!(!backend.contains(&ip("10.1.2.3")));

        for at in 0..10 {
            let record = LogRecord::new("test", "auth failure from 203.0.113.7 (probe)");
            jail.handle_record(&record, t(at)).await.unwrap();
        }
        assert!(!backend.contains(&ip("203.0.113.7")));
        assert_eq!(jail.counters().lines_seen, 10);

        let err = jail.manual_ban(ip("10.9.9.9"), t(0)).await.unwrap_err();
        assert!(matches!(err, Error::Ignored(..)));
    }

    #[tokio::test]
    async fn test_manual_ban_is_idempotent() {
        let (_, store, mut jail) = setup(jail_config());
        let first = jail.manual_ban(ip("203.0.113.7"), t(100)).await.unwrap();
        let second = jail.manual_ban(ip("203.0.113.7"), t(50)).await.unwrap();

        assert_eq!(first.expires_at, Some(t(3700)));
        assert_eq!(second.expires_at, Some(t(3700)));
        assert_eq!(second.ban_count, 1);
        assert_eq!(store.list_active().unwrap().len(), 1);
        assert_eq!(first.source, BanSource::Manual);
    }

    #[tokio::test]
    async fn test_unban_and_noop_unban() {
        let (backend, store, mut jail) = setup(jail_config());
        jail.manual_ban(ip("203.0.113.7"), t(0)).await.unwrap();

        assert!(jail.unban(ip("203.0.113.7"), false).await.unwrap());
        assert!(!backend.contains(&ip("203.0.113.7")));
        assert!(store.get("test", &ip("203.0.113.7")).unwrap().is_none());
        assert_eq!(store.ban_count("test", &ip("203.0.113.7")).unwrap(), 1);

        assert!(!jail.unban(ip("203.0.113.7"), true).await.unwrap());
        assert_eq!(store.ban_count("test", &ip("203.0.113.7")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_escalation_for_repeat_offender() {
        let mut config = jail_config();
        config.escalation = EscalationConfig {
            enabled: true,
            threshold: 3,
            multiplier: 4.0,
            fixed_bantime: None,
            max_bantime: None,
        };
        let (_, store, mut jail) = setup(config);

        assert_eq!(jail.ban_duration(0), Some(Duration::seconds(3600)));
        assert_eq!(jail.ban_duration(2), Some(Duration::seconds(3600)));
        assert_eq!(jail.ban_duration(3), Some(Duration::seconds(14_400)));

        store
            .set_history("test", &ip("203.0.113.7"), 3, t(-10_000), Some(t(-9_000)))
            .unwrap();
        let ban = jail.manual_ban(ip("203.0.113.7"), t(0)).await.unwrap();
        assert_eq!(ban.ban_count, 4);
        assert_eq!(ban.expires_at, Some(t(14_400)));
    }

    #[tokio::test]
    async fn test_escalation_cap_and_permanent_after() {
        let mut config = jail_config();
        config.escalation = EscalationConfig {
            enabled: true,
            threshold: 1,
            multiplier: 100.0,
            fixed_bantime: None,
            max_bantime: Some(86_400),
        };
        config.permanent_after = Some(5);
        let (_, _, jail) = setup(config);

        assert_eq!(jail.ban_duration(1), Some(Duration::seconds(86_400)));
        assert_eq!(jail.ban_duration(4), Some(Duration::seconds(86_400)));
        assert_eq!(jail.ban_duration(5), None);
    }

    #[tokio::test]
    async fn test_permanent_bantime() {
        let mut config = jail_config();
        config.bantime = BanTime::Permanent;
        let (_, _, mut jail) = setup(config);

        let ban = jail.manual_ban(ip("203.0.113.7"), t(0)).await.unwrap();
        assert!(ban.is_permanent());
        assert!(!jail.expire(ip("203.0.113.7"), t(1_000_000_000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_respects_refresh() {
        let (backend, store, mut jail) = setup(jail_config());
        jail.manual_ban(ip("203.0.113.7"), t(0)).await.unwrap();

        assert!(!jail.expire(ip("203.0.113.7"), t(3599)).await.unwrap());
        assert!(backend.contains(&ip("203.0.113.7")));

        assert!(jail.expire(ip("203.0.113.7"), t(3600)).await.unwrap());
        assert!(!backend.contains(&ip("203.0.113.7")));
        assert!(store.list_active().unwrap().is_empty());
        assert_eq!(jail.counters().unbans, 1);
    }

    #[tokio::test]
    async fn test_degraded_ban_and_reassert() {
        let (backend, store, mut jail) = setup(jail_config());
        backend.set_failing(true);

        let ban = jail.manual_ban(ip("203.0.113.7"), t(0)).await.unwrap();
        assert!(!ban.enforced);
        assert_eq!(store.unenforced().unwrap().len(), 1);
        assert_eq!(jail.status().unwrap().degraded_bans, 1);

        assert!(jail.reassert(ip("203.0.113.7")).await.is_err());

        backend.set_failing(false);
        assert!(jail.reassert(ip("203.0.113.7")).await.unwrap());
        assert!(store.unenforced().unwrap().is_empty());
        assert!(backend.contains(&ip("203.0.113.7")));
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_record() {
        let (backend, store, mut jail) = setup(jail_config());
        jail.manual_ban(ip("203.0.113.7"), t(0)).await.unwrap();

        backend.set_failing(true);
        assert!(jail.expire(ip("203.0.113.7"), t(4000)).await.is_err());
        assert!(store.get("test", &ip("203.0.113.7")).unwrap().is_some());

        backend.set_failing(false);
        assert!(jail.expire(ip("203.0.113.7"), t(4000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_actor_round_trip() {
        let (backend, _, jail) = setup(jail_config());
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (line_tx, line_rx) = mpsc::channel(8);
        let handle = JailHandle::new("test", cmd_tx);

        let task = tokio::spawn(jail.run(cmd_rx, line_rx, std::time::Duration::from_secs(60)));

        let lines = (0..5)
            .map(|_| LogRecord::new("test", "auth failure from 198.51.100.4"))
            .collect();
        line_tx.send(lines).await.unwrap();

        // Commands and lines share one actor; poll until the batch is handled
        let addr = ip("198.51.100.4");
        for _ in 0..100 {
            if handle.state_of(addr).await.unwrap() == AddressState::Banned {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(backend.contains(&addr));

        let status = handle.status().await.unwrap();
        assert_eq!(status.active_bans, 1);
        assert_eq!(status.counters.bans, 1);

        assert!(handle.unban(addr, false).await.unwrap());
        assert!(!backend.contains(&addr));

        drop(handle);
        drop(line_tx);
        task.await.unwrap();
    }
}
