//! Daemon supervisor
//!
//! Owns the ban store, the enforcer and one running jail (tailer task plus
//! actor task) per enabled jail. Drives the unban scheduler and history
//! purge, answers control requests, and handles signals.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::config::{Config, ConfigError, JailConfig};
use crate::enforcement::{build_backend, EnforcementBackend, Enforcer};
use crate::error::Error;
use crate::ipc::{
    BansResponse, ErrorResponse, IpcMessage, IpcRequest, IpcServer, UnbanResponse,
};
use crate::jail::{expire_ban, Jail, JailHandle};
use crate::models::{BanRecord, DaemonStatus, ReloadReport, SourceHealth};
use crate::store::BanStore;
use crate::tailer::{run_tailer, LogTailer, TailOptions};

const LINE_QUEUE: usize = 64;
const COMMAND_QUEUE: usize = 256;

/// A jail's tasks and its command channel
struct RunningJail {
    config: JailConfig,
    handle: JailHandle,
    stop_tailer: watch::Sender<bool>,
    tailer: JoinHandle<()>,
    actor: JoinHandle<()>,
}

/// What restart recovery did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Unexpired bans re-asserted
    pub restored: usize,
    /// Restored bans the backend refused
    pub degraded: usize,
    /// Bans that expired while the daemon was down
    pub expired: usize,
}

pub struct Supervisor {
    config: Config,
    config_path: Option<PathBuf>,
    store: BanStore,
    enforcer: Arc<Enforcer>,
    jails: BTreeMap<String, RunningJail>,
    failed: Vec<(String, String)>,
    started_at: Instant,
}

impl Supervisor {
    /// Open the ban store and build the configured backend. A corrupt store
    /// is fatal.
    pub fn open(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let db_path = config.db_path();
        let store = BanStore::open(&db_path)
            .with_context(|| format!("Failed to open ban store {}", db_path.display()))?;
        store.set_purge_age(config.general.dbpurgeage)?;

        let backend = build_backend(&config.enforcement);
        Ok(Self::with_backend(config, config_path, store, backend))
    }

    pub fn with_backend(
        config: Config,
        config_path: Option<PathBuf>,
        store: BanStore,
        backend: Arc<dyn EnforcementBackend>,
    ) -> Self {
        let e = &config.enforcement;
        let policy = RetryPolicy::new(
            e.retry_attempts,
            Duration::from_millis(e.retry_initial_ms),
            Duration::from_millis(e.retry_max_ms),
        );

        Self {
            enforcer: Arc::new(Enforcer::new(backend, policy)),
            config,
            config_path,
            store,
            jails: BTreeMap::new(),
            failed: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn store(&self) -> &BanStore {
        &self.store
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }

    pub fn jail_ids(&self) -> Vec<String> {
        self.jails.keys().cloned().collect()
    }

    /// Bring the backend in line with the store after a restart. Expired
    /// bans are lifted, the rest re-installed. Runs before any jail starts.
    pub async fn recover(&self, now: DateTime<Utc>) -> crate::error::Result<RecoveryReport> {
        if let Err(e) = self.enforcer.init().await {
            error!(
                "Enforcement backend {} failed to initialize: {}",
                self.enforcer.backend_name(),
                e
            );
        }

        let (expired, active): (Vec<_>, Vec<_>) = self
            .store
            .list_active()?
            .into_iter()
            .partition(|ban| ban.is_expired_at(now));

        let reconciled = self.enforcer.reconcile(&active).await;
        for ban in &active {
            let enforced = !reconciled
                .failed
                .iter()
                .any(|(jail, ip)| *jail == ban.jail_id && *ip == ban.address);
            if ban.enforced != enforced {
                self.store.set_enforced(&ban.jail_id, &ban.address, enforced)?;
            }
        }

        let mut report = RecoveryReport {
            restored: active.len(),
            degraded: reconciled.failed.len(),
            expired: 0,
        };

        for ban in expired {
            match expire_ban(&self.store, &self.enforcer, &ban.jail_id, ban.address, now).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Could not lift expired ban of {} in jail {}: {}",
                    ban.address, ban.jail_id, e
                ),
            }
        }

        info!(
            "Recovered {} bans ({} degraded), lifted {} that expired while stopped",
            report.restored, report.degraded, report.expired
        );
        Ok(report)
    }

    /// Start every enabled jail of the current configuration
    pub async fn start_jails(&mut self) -> ReloadReport {
        let config = self.config.clone();
        self.apply_config(config).await
    }

    /// Re-read the configuration file and apply it
    pub async fn reload(&mut self) -> Result<ReloadReport> {
        let config = match &self.config_path {
            Some(path) => Config::load(path)?,
            None => Config::load_or_default()?.0,
        };
        Ok(self.apply_config(config).await)
    }

    /// Converge running jails on `config`. Unchanged jails keep running with
    /// their windows intact; changed ones restart. A jail whose new
    /// definition is broken keeps its last known good configuration.
    pub async fn apply_config(&mut self, config: Config) -> ReloadReport {
        let mut report = ReloadReport::default();
        let resolved = config.resolve();

        let mut broken = BTreeSet::new();
        for (id, err) in resolved.errors {
            if self.jails.contains_key(&id) {
                warn!("Jail {} keeps its previous configuration: {}", id, err);
                report.kept.push(id.clone());
            } else {
                error!("Jail {} not started: {}", id, err);
            }
            report.failed.push((id.clone(), err.to_string()));
            broken.insert(id);
        }

        let mut wanted = BTreeMap::new();
        for jail in resolved.jails.into_iter().filter(|j| j.enabled) {
            wanted.insert(jail.jail_id.clone(), jail);
        }

        // Drop jails that were removed or disabled
        let gone: Vec<String> = self
            .jails
            .keys()
            .filter(|id| !wanted.contains_key(*id) && !broken.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(running) = self.jails.remove(&id) {
                self.stop_jail(running).await;
                report.stopped.push(id);
            }
        }

        for (id, jail_config) in wanted {
            if self.jails.get(&id).is_some_and(|r| r.config == jail_config) {
                report.unchanged += 1;
                continue;
            }

            let jail = match self.build_jail(jail_config) {
                Ok(jail) => jail,
                Err(e) => {
                    if self.jails.contains_key(&id) {
                        warn!("Jail {} keeps its previous configuration: {}", id, e);
                        report.kept.push(id.clone());
                    } else {
                        error!("Jail {} not started: {}", id, e);
                    }
                    report.failed.push((id, e.to_string()));
                    continue;
                }
            };

            if let Some(running) = self.jails.remove(&id) {
                self.stop_jail(running).await;
                report.stopped.push(id.clone());
            }
            self.jails.insert(id.clone(), self.spawn_jail(jail));
            report.started.push(id);
        }

        self.failed = report.failed.clone();
        self.config = config;

        info!(
            "{} jails running ({} started, {} stopped, {} unchanged, {} failed)",
            self.jails.len(),
            report.started.len(),
            report.stopped.len(),
            report.unchanged,
            report.failed.len()
        );
        report
    }

    fn build_jail(&self, config: JailConfig) -> std::result::Result<Jail, ConfigError> {
        Jail::new(config, self.store.clone(), Arc::clone(&self.enforcer))
    }

    fn tail_options(&self) -> TailOptions {
        let g = &self.config.general;
        TailOptions {
            poll_interval: g.poll_interval(),
            degraded_after: g.degraded_after.max(1),
            backoff_max: Duration::from_secs(g.tail_backoff_max_secs.max(1)),
        }
    }

    fn spawn_jail(&self, jail: Jail) -> RunningJail {
        let config = jail.config().clone();
        let (health_tx, health_rx) = watch::channel(SourceHealth::Starting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (line_tx, line_rx) = mpsc::channel(LINE_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);

        let tailer = LogTailer::new(config.jail_id.clone(), config.log_path.clone(), config.backfill);
        let tailer = tokio::spawn(run_tailer(
            tailer,
            self.tail_options(),
            line_tx,
            health_tx,
            stop_rx,
        ));

        let sweep_every = Duration::from_secs(
            config
                .findtime
                .min(self.config.general.sweep_interval_secs)
                .max(1),
        );
        let actor = tokio::spawn(jail.with_health(health_rx).run(cmd_rx, line_rx, sweep_every));

        RunningJail {
            handle: JailHandle::new(config.jail_id.clone(), cmd_tx),
            config,
            stop_tailer: stop_tx,
            tailer,
            actor,
        }
    }

    /// Stop the tailer, let the actor drain queued lines, then wait for it
    async fn stop_jail(&self, running: RunningJail) {
        let RunningJail {
            config,
            handle,
            stop_tailer,
            mut tailer,
            mut actor,
        } = running;
        let timeout = self.config.general.shutdown_timeout();

        let _ = stop_tailer.send(true);
        if tokio::time::timeout(timeout, &mut tailer).await.is_err() {
            warn!("Tailer of jail {} did not stop in time", config.jail_id);
            tailer.abort();
        }

        drop(handle);
        if tokio::time::timeout(timeout, &mut actor).await.is_err() {
            warn!("Jail {} did not stop in time, aborting", config.jail_id);
            actor.abort();
        }
        debug!("Jail {} stopped", config.jail_id);
    }

    /// One unban scheduler pass: dispatch expiries to the owning jails and
    /// re-assert degraded bans. Bans of jails that no longer run are handled
    /// here directly.
    pub async fn tick(&self, now: DateTime<Utc>) -> crate::error::Result<()> {
        for ban in self.store.expiring_before(now)? {
            match self.jails.get(&ban.jail_id) {
                Some(running) => {
                    if !running.handle.expire(ban.address, now) {
                        debug!("Jail {} busy, expiry of {} deferred", ban.jail_id, ban.address);
                    }
                }
                None => {
                    if let Err(e) =
                        expire_ban(&self.store, &self.enforcer, &ban.jail_id, ban.address, now)
                            .await
                    {
                        warn!(
                            "Expiry of {} in removed jail {} failed, will retry: {}",
                            ban.address, ban.jail_id, e
                        );
                    }
                }
            }
        }

        for ban in self.store.unenforced()? {
            if ban.is_expired_at(now) {
                continue;
            }
            match self.jails.get(&ban.jail_id) {
                Some(running) => {
                    running.handle.reassert(ban.address);
                }
                None => {
                    if self.enforcer.acquire(&ban.jail_id, ban.address).await.is_ok() {
                        self.store.set_enforced(&ban.jail_id, &ban.address, true)?;
                        info!("Ban of {} in jail {} is now enforced", ban.address, ban.jail_id);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn purge(&self, now: DateTime<Utc>) -> crate::error::Result<usize> {
        Ok(self.store.purge(now)?)
    }

    pub async fn status(&self) -> crate::error::Result<DaemonStatus> {
        let mut jails = Vec::with_capacity(self.jails.len());
        for running in self.jails.values() {
            match running.handle.status().await {
                Ok(status) => jails.push(status),
                Err(e) => warn!("No status from jail {}: {}", running.config.jail_id, e),
            }
        }

        let (active_bans, degraded_bans) = self.store.counts()?;

        Ok(DaemonStatus {
            running: true,
            pid: std::process::id(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            backend: self.enforcer.backend_name().to_string(),
            active_bans,
            degraded_bans,
            jails,
            failed_jails: self.failed.clone(),
        })
    }

    pub fn list_bans(&self, jail: Option<&str>) -> crate::error::Result<Vec<BanRecord>> {
        Ok(match jail {
            Some(jail) => self.store.list_for_jail(jail)?,
            None => self.store.list_active()?,
        })
    }

    pub async fn ban(&self, jail: &str, ip: IpAddr) -> crate::error::Result<BanRecord> {
        let running = self
            .jails
            .get(jail)
            .ok_or_else(|| Error::UnknownJail(jail.to_string()))?;
        running.handle.ban(ip).await
    }

    /// Unban in one jail, or every jail holding the address. Returns the
    /// jails the address was unbanned from.
    pub async fn unban(
        &self,
        jail: Option<&str>,
        ip: IpAddr,
        forget: bool,
    ) -> crate::error::Result<Vec<String>> {
        let targets: BTreeSet<String> = match jail {
            Some(jail) => {
                let known = self.jails.contains_key(jail)
                    || self.store.get(jail, &ip)?.is_some();
                if !known {
                    return Err(Error::UnknownJail(jail.to_string()));
                }
                BTreeSet::from([jail.to_string()])
            }
            None => {
                let mut targets: BTreeSet<String> = self
                    .store
                    .list_for_address(&ip)?
                    .into_iter()
                    .map(|ban| ban.jail_id)
                    .collect();
                if forget {
                    targets.extend(self.jails.keys().cloned());
                }
                targets
            }
        };

        let mut unbanned = Vec::new();
        for target in targets {
            let removed = match self.jails.get(&target) {
                Some(running) => running.handle.unban(ip, forget).await?,
                None => self.unban_orphan(&target, ip, forget).await?,
            };
            if removed {
                unbanned.push(target);
            }
        }
        Ok(unbanned)
    }

    /// Unban in a jail that is not running
    async fn unban_orphan(&self, jail: &str, ip: IpAddr, forget: bool) -> crate::error::Result<bool> {
        let banned = self.store.get(jail, &ip)?.is_some();
        if banned {
            self.enforcer.release(jail, ip).await?;
            self.store.remove(jail, &ip)?;
            info!("Unbanned {} in removed jail {}", ip, jail);
        }
        if forget {
            self.store.forget_history(jail, &ip)?;
        }
        Ok(banned)
    }

    /// Answer one control request. The flag is set when the daemon should stop.
    pub async fn handle_request(&mut self, message: IpcMessage) -> (IpcMessage, bool) {
        let result = match message {
            IpcMessage::Ping => Ok(IpcMessage::Pong),
            IpcMessage::Status => self.status().await.map(IpcMessage::StatusResponse),
            IpcMessage::ListBans(req) => self
                .list_bans(req.jail.as_deref())
                .map(|bans| IpcMessage::BansResponse(BansResponse { bans })),
            IpcMessage::Ban(req) => self
                .ban(&req.jail, req.ip)
                .await
                .map(IpcMessage::BanResponse),
            IpcMessage::Unban(req) => self
                .unban(req.jail.as_deref(), req.ip, req.forget)
                .await
                .map(|jails| IpcMessage::UnbanResponse(UnbanResponse { ip: req.ip, jails })),
            IpcMessage::Reload => {
                return match self.reload().await {
                    Ok(report) => (IpcMessage::ReloadResponse(report), false),
                    Err(e) => {
                        error!("Reload failed: {:#}", e);
                        (
                            IpcMessage::Error(ErrorResponse::new("CONFIG_ERROR", format!("{:#}", e))),
                            false,
                        )
                    }
                }
            }
            IpcMessage::Stop => return (IpcMessage::Stopping, true),
            other => {
                return (
                    IpcMessage::Error(ErrorResponse::new(
                        "BAD_REQUEST",
                        format!("{:?} is not a request", other),
                    )),
                    false,
                )
            }
        };

        match result {
            Ok(response) => (response, false),
            Err(e) => (IpcMessage::Error(ErrorResponse::from(&e)), false),
        }
    }

    /// Stop every jail and flush the store
    pub async fn shutdown(&mut self) {
        for running in self.jails.values() {
            let _ = running.stop_tailer.send(true);
        }

        let jails = std::mem::take(&mut self.jails);
        for (_, running) in jails {
            self.stop_jail(running).await;
        }

        if let Err(e) = self.store.flush() {
            warn!("Failed to flush ban store: {}", e);
        }
        info!("All jails stopped");
    }

    /// Run the daemon until SIGTERM, SIGINT or a `Stop` request
    pub async fn run(mut self) -> Result<()> {
        let pid_path = self.config.pid_path();
        write_pid_file(&pid_path)?;

        self.recover(Utc::now()).await?;
        self.start_jails().await;

        let (request_tx, mut requests) = mpsc::channel::<IpcRequest>(64);
        let mut ipc = IpcServer::new(self.config.socket_path());
        if let Err(e) = ipc.start(request_tx).await {
            error!("Control socket unavailable: {:#}", e);
        }

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let mut unban_tick = tokio::time::interval(self.config.general.unban_interval());
        unban_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut purge_tick = tokio::time::interval(self.config.general.purge_interval());
        purge_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Daemon started with {} jails, enforcing through {}",
            self.jails.len(),
            self.enforcer.backend_name()
        );

        loop {
            tokio::select! {
                _ = unban_tick.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("Unban scheduler pass failed: {}", e);
                    }
                }
                _ = purge_tick.tick() => {
                    match self.purge(Utc::now()) {
                        Ok(n) if n > 0 => info!("Purged {} stale ban history entries", n),
                        Ok(_) => {}
                        Err(e) => error!("History purge failed: {}", e),
                    }
                }
                Some(request) = requests.recv() => {
                    let (response, stop) = self.handle_request(request.message).await;
                    let _ = request.response_tx.send(response);
                    if stop {
                        info!("Stop requested over control socket");
                        break;
                    }
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    if let Err(e) = self.reload().await {
                        error!("Reload failed: {:#}", e);
                    }
                }
            }
        }

        ipc.stop().await;
        self.shutdown().await;

        if let Err(e) = std::fs::remove_file(&pid_path) {
            debug!("Could not remove PID file {}: {}", pid_path.display(), e);
        }

        info!("Daemon stopped");
        Ok(())
    }
}

/// Write our PID, refusing to start over a live daemon
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(pid) = read_pid_file(path) {
        if pid != std::process::id() && process_alive(pid) {
            anyhow::bail!("Daemon already running with PID {}", pid);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Failed to write PID file {}", path.display()))?;
    Ok(())
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::MemoryBackend;
    use crate::models::BanSource;
    use chrono::Duration as ChronoDuration;
    use std::io::Write;
    use tempfile::TempDir;

    fn config_for(dir: &Path, jails: &str) -> Config {
        Config::from_toml(&format!(
            r#"
            [general]
            db_path = "{db}"
            pid_file = "{pid}"
            socket_path = "{sock}"
            poll_interval_ms = 20
            shutdown_timeout_secs = 5

            [enforcement]
            backend = "memory"
            retry_attempts = 1

            [filters.test]
            failregex = ['^auth failure from <HOST>$']

            {jails}
            "#,
            db = dir.join("bans.db").display(),
            pid = dir.join("banwarden.pid").display(),
            sock = dir.join("control.sock").display(),
            jails = jails,
        ))
        .unwrap()
    }

    fn jail_section(id: &str, log: &Path, maxretry: u32) -> String {
        format!(
            "[jails.{id}]\nfilter = \"test\"\nlogpath = \"{}\"\nmaxretry = {maxretry}\nfindtime = 600\nbantime = 3600\nbackfill = true\n",
            log.display()
        )
    }

    fn supervisor(config: Config) -> (Arc<MemoryBackend>, Supervisor) {
        let backend = Arc::new(MemoryBackend::new());
        let store = BanStore::open_memory().unwrap();
        let sup = Supervisor::with_backend(config, None, store, backend.clone());
        (backend, sup)
    }

    fn record(jail: &str, ip: &str, banned_at: DateTime<Utc>, secs: i64) -> BanRecord {
        BanRecord {
            jail_id: jail.to_string(),
            address: ip.parse().unwrap(),
            banned_at,
            expires_at: Some(banned_at + ChronoDuration::seconds(secs)),
            ban_count: 1,
            action_ref: "memory".to_string(),
            source: BanSource::Monitor,
            reason: "test".to_string(),
            enforced: true,
        }
    }

    #[tokio::test]
    async fn test_recovery_lifts_expired_and_restores_active() {
        let dir = TempDir::new().unwrap();
        let (backend, sup) = supervisor(config_for(dir.path(), ""));
        let now = Utc::now();

        sup.store()
            .upsert(&record("sshd", "203.0.113.7", now - ChronoDuration::seconds(4000), 3600))
            .unwrap();
        sup.store()
            .upsert(&record("sshd", "198.51.100.4", now, 3600))
            .unwrap();
        // Left over from before the restart with no ban behind it
        backend.install("192.0.2.99".parse().unwrap()).await.unwrap();

        let report = sup.recover(now).await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                restored: 1,
                degraded: 0,
                expired: 1
            }
        );
        assert_eq!(backend.snapshot(), vec!["198.51.100.4".parse::<IpAddr>().unwrap()]);
        assert_eq!(sup.store().list_active().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_marks_refused_bans_degraded() {
        let dir = TempDir::new().unwrap();
        let (backend, sup) = supervisor(config_for(dir.path(), ""));
        let now = Utc::now();
        sup.store()
            .upsert(&record("sshd", "198.51.100.4", now, 3600))
            .unwrap();

        backend.set_failing(true);
        let report = sup.recover(now).await.unwrap();
        assert_eq!(report.degraded, 1);
        assert_eq!(sup.store().unenforced().unwrap().len(), 1);

        // The next scheduler pass re-asserts it (no jail runs, handled directly)
        backend.set_failing(false);
        sup.tick(now).await.unwrap();
        assert!(sup.store().unenforced().unwrap().is_empty());
        assert!(backend.contains(&"198.51.100.4".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_orphaned_bans_expire_and_unban() {
        let dir = TempDir::new().unwrap();
        let (backend, sup) = supervisor(config_for(dir.path(), ""));
        let now = Utc::now();

        let old = record("gone", "203.0.113.7", now - ChronoDuration::seconds(100), 50);
        sup.store().upsert(&old).unwrap();
        sup.enforcer().acquire("gone", old.address).await.unwrap();

        sup.tick(now).await.unwrap();
        assert!(sup.store().list_active().unwrap().is_empty());
        assert!(!backend.contains(&old.address));

        let live = record("gone", "198.51.100.4", now, 3600);
        sup.store().upsert(&live).unwrap();
        sup.enforcer().acquire("gone", live.address).await.unwrap();
        assert_eq!(sup.unban(None, live.address, false).await.unwrap(), vec!["gone"]);
        assert!(!backend.contains(&live.address));
    }

    #[tokio::test]
    async fn test_jails_start_ban_and_report_status() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("auth.log");
        std::fs::write(&log, "").unwrap();

        let config = config_for(
            dir.path(),
            &format!(
                "{}\n[jails.broken]\nfilter = \"missing\"\nlogpath = \"/dev/null\"\n",
                jail_section("ssh", &log, 3)
            ),
        );
        let (backend, mut sup) = supervisor(config);
        let report = sup.start_jails().await;
        assert_eq!(report.started, vec!["ssh"]);
        assert_eq!(report.failed.len(), 1);

        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        for _ in 0..3 {
            writeln!(f, "auth failure from 203.0.113.7").unwrap();
        }
        drop(f);

        let addr: IpAddr = "203.0.113.7".parse().unwrap();
        for _ in 0..200 {
            if backend.contains(&addr) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(backend.contains(&addr));

        let status = sup.status().await.unwrap();
        assert_eq!(status.active_bans, 1);
        assert_eq!(status.jails.len(), 1);
        assert_eq!(status.jails[0].source, SourceHealth::Healthy);
        assert_eq!(status.failed_jails[0].0, "broken");

        let err = sup.ban("nope", addr).await.unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_JAIL");

        let (response, stop) = sup
            .handle_request(IpcMessage::Unban(crate::ipc::UnbanRequest {
                jail: None,
                ip: addr,
                forget: false,
            }))
            .await;
        assert!(!stop);
        match response {
            IpcMessage::UnbanResponse(r) => assert_eq!(r.jails, vec!["ssh"]),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(!backend.contains(&addr));

        sup.shutdown().await;
        assert!(sup.jail_ids().is_empty());
    }

    #[tokio::test]
    async fn test_reload_keeps_last_good_config() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("auth.log");
        std::fs::write(&log, "").unwrap();

        let (_, mut sup) = supervisor(config_for(dir.path(), &jail_section("ssh", &log, 3)));
        sup.start_jails().await;

        // Same config: nothing restarts
        let same = config_for(dir.path(), &jail_section("ssh", &log, 3));
        let report = sup.apply_config(same).await;
        assert_eq!(report.unchanged, 1);
        assert!(report.started.is_empty());

        // Broken filter reference: the running jail stays
        let broken = config_for(
            dir.path(),
            &format!("[jails.ssh]\nfilter = \"missing\"\nlogpath = \"{}\"\n", log.display()),
        );
        let report = sup.apply_config(broken).await;
        assert_eq!(report.kept, vec!["ssh"]);
        assert_eq!(sup.jail_ids(), vec!["ssh"]);

        // Changed threshold restarts; a new jail starts
        let other_log = dir.path().join("mail.log");
        std::fs::write(&other_log, "").unwrap();
        let changed = config_for(
            dir.path(),
            &format!(
                "{}{}",
                jail_section("ssh", &log, 5),
                jail_section("mail", &other_log, 3)
            ),
        );
        let report = sup.apply_config(changed).await;
        assert_eq!(report.stopped, vec!["ssh"]);
        assert_eq!(report.started, vec!["mail", "ssh"]);

        // Removed jail stops
        let report = sup
            .apply_config(config_for(dir.path(), &jail_section("mail", &other_log, 3)))
            .await;
        assert_eq!(report.stopped, vec!["ssh"]);
        assert_eq!(sup.jail_ids(), vec!["mail"]);

        sup.shutdown().await;
    }

    #[test]
    fn test_pid_file_refuses_live_process() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("banwarden.pid");

        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path), Some(std::process::id()));

        // PID 1 is always alive
        std::fs::write(&path, "1\n").unwrap();
        assert!(write_pid_file(&path).is_err());
    }
}
