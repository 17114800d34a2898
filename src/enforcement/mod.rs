//! Enforcement backends
//!
//! A backend installs and removes address blocks. The [`Enforcer`] wraps a
//! backend with retries, per-address serialization and reference counting:
//! an address banned by several jails stays blocked until the last of them
//! releases it.

pub mod command;
pub mod memory;
pub mod nftables;

pub use command::CommandBackend;
pub use memory::MemoryBackend;
pub use nftables::NftablesBackend;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::config::{BackendKind, EnforcementConfig};
use crate::models::BanRecord;

#[derive(Debug, Error)]
pub enum EnforcementError {
    /// Backend could not be reached at all
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// Backend answered and refused the change
    #[error("backend rejected {ip}: {reason}")]
    Rejected { ip: IpAddr, reason: String },

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A firewall (or anything else) able to block addresses
#[async_trait]
pub trait EnforcementBackend: Send + Sync {
    /// Identifier stored with each ban as its action reference
    fn name(&self) -> &str;

    /// Prepare backend state (tables, sets). Called once at startup.
    async fn init(&self) -> Result<(), EnforcementError> {
        Ok(())
    }

    /// Block an address. Installing an existing block succeeds.
    async fn install(&self, ip: IpAddr) -> Result<(), EnforcementError>;

    /// Unblock an address. Removing an absent block succeeds.
    async fn remove(&self, ip: IpAddr) -> Result<(), EnforcementError>;

    /// Addresses currently blocked, when the backend can list them
    async fn blocked(&self) -> Result<Option<Vec<IpAddr>>, EnforcementError> {
        Ok(None)
    }
}

/// Build the configured backend
pub fn build_backend(config: &EnforcementConfig) -> Arc<dyn EnforcementBackend> {
    match config.backend {
        BackendKind::Nftables => Arc::new(NftablesBackend::new(config.nftables.clone())),
        BackendKind::Command => Arc::new(CommandBackend::new(config.command.clone())),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    }
}

/// Outcome of a startup reconciliation
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub installed: usize,
    pub removed: usize,
    /// (jail, address) pairs whose block could not be installed
    pub failed: Vec<(String, IpAddr)>,
}

pub struct Enforcer {
    backend: Arc<dyn EnforcementBackend>,
    policy: RetryPolicy,
    /// Jails currently holding a ban on each address
    holders: Mutex<HashMap<IpAddr, BTreeSet<String>>>,
    /// Addresses the backend has confirmed
    installed: Mutex<HashSet<IpAddr>>,
    locks: Mutex<HashMap<IpAddr, Arc<tokio::sync::Mutex<()>>>>,
}

impl Enforcer {
    pub fn new(backend: Arc<dyn EnforcementBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            holders: Mutex::new(HashMap::new()),
            installed: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn init(&self) -> Result<(), EnforcementError> {
        let backend = Arc::clone(&self.backend);
        self.with_retry("init", None, move || {
            let backend = Arc::clone(&backend);
            async move { backend.init().await }
        })
        .await
    }

    /// Register `jail` as a holder and make sure the block is in place.
    /// The holder is kept even when installing fails, so a later
    /// re-assertion or release still sees it.
    pub async fn acquire(&self, jail: &str, ip: IpAddr) -> Result<(), EnforcementError> {
        let lock = self.lock_for(ip);
        let _guard = lock.lock().await;

        self.holders
            .lock()
            .entry(ip)
            .or_default()
            .insert(jail.to_string());

        if self.installed.lock().contains(&ip) {
            debug!("{} already blocked, {} joins as holder", ip, jail);
            return Ok(());
        }

        self.install_locked(ip).await
    }

    /// Drop `jail` as a holder. The block is removed only when no other
    /// jail holds it. Returns true when the backend no longer blocks the
    /// address, false when other holders keep it. On error the holder is
    /// kept and the caller must retain its ban record.
    pub async fn release(&self, jail: &str, ip: IpAddr) -> Result<bool, EnforcementError> {
        let lock = self.lock_for(ip);
        let result = {
            let _guard = lock.lock().await;
            self.release_locked(jail, ip).await
        };
        drop(lock);
        self.prune_lock(ip);
        result
    }

    async fn release_locked(&self, jail: &str, ip: IpAddr) -> Result<bool, EnforcementError> {
        let others = self
            .holders
            .lock()
            .get(&ip)
            .map(|set| set.iter().filter(|j| j.as_str() != jail).count())
            .unwrap_or(0);

        if others > 0 {
            if let Some(set) = self.holders.lock().get_mut(&ip) {
                set.remove(jail);
            }
            debug!("{} released by {}, still held by {} jail(s)", ip, jail, others);
            return Ok(false);
        }

        let backend = Arc::clone(&self.backend);
        self.with_retry("remove", Some(ip), move || {
            let backend = Arc::clone(&backend);
            async move { backend.remove(ip).await }
        })
        .await?;

        self.installed.lock().remove(&ip);
        self.holders.lock().remove(&ip);
        info!("Removed block on {}", ip);
        Ok(true)
    }

    /// Bring the backend in line with the stored bans: drop blocks no ban
    /// accounts for, install missing ones.
    pub async fn reconcile(&self, bans: &[BanRecord]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        {
            let mut holders = self.holders.lock();
            holders.clear();
            for ban in bans {
                holders
                    .entry(ban.address)
                    .or_default()
                    .insert(ban.jail_id.clone());
            }
        }
        let wanted: HashSet<IpAddr> = bans.iter().map(|b| b.address).collect();

        match self.backend.blocked().await {
            Ok(Some(present)) => {
                {
                    let mut installed = self.installed.lock();
                    installed.clear();
                    installed.extend(present.iter().filter(|ip| wanted.contains(ip)).copied());
                }

                for ip in present.into_iter().filter(|ip| !wanted.contains(ip)) {
                    match self.backend.remove(ip).await {
                        Ok(()) => {
                            info!("Removed stale block on {}", ip);
                            report.removed += 1;
                        }
                        Err(e) => warn!("Failed to remove stale block on {}: {}", ip, e),
                    }
                }
            }
            Ok(None) => {
                debug!("Backend {} cannot list blocks, re-installing all", self.backend.name());
                self.installed.lock().clear();
            }
            Err(e) => {
                warn!("Cannot list blocks from {}: {}", self.backend.name(), e);
                self.installed.lock().clear();
            }
        }

        for ip in wanted {
            if self.installed.lock().contains(&ip) {
                continue;
            }
            let lock = self.lock_for(ip);
            let _guard = lock.lock().await;
            match self.install_locked(ip).await {
                Ok(()) => report.installed += 1,
                Err(_) => {
                    for ban in bans.iter().filter(|b| b.address == ip) {
                        report.failed.push((ban.jail_id.clone(), ip));
                    }
                }
            }
        }

        info!(
            "Reconciled {} with {} stored bans: {} installed, {} stale removed, {} failed",
            self.backend.name(),
            bans.len(),
            report.installed,
            report.removed,
            report.failed.len()
        );
        report
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.installed.lock().contains(ip)
    }

    pub fn holders(&self, ip: &IpAddr) -> Vec<String> {
        self.holders
            .lock()
            .get(ip)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn install_locked(&self, ip: IpAddr) -> Result<(), EnforcementError> {
        let backend = Arc::clone(&self.backend);
        self.with_retry("install", Some(ip), move || {
            let backend = Arc::clone(&backend);
            async move { backend.install(ip).await }
        })
        .await?;

        self.installed.lock().insert(ip);
        Ok(())
    }

    fn lock_for(&self, ip: IpAddr) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(ip).or_default())
    }

    fn prune_lock(&self, ip: IpAddr) {
        let mut locks = self.locks.lock();
        let idle = locks
            .get(&ip)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle && !self.holders.lock().contains_key(&ip) {
            locks.remove(&ip);
        }
    }

    async fn with_retry<F, Fut>(
        &self,
        op: &str,
        ip: Option<IpAddr>,
        mut attempt_fn: F,
    ) -> Result<(), EnforcementError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), EnforcementError>>,
    {
        let mut backoff = self.policy.backoff();
        let target = ip.map(|ip| ip.to_string()).unwrap_or_else(|| "backend".to_string());
        let mut attempt = 1;

        loop {
            match attempt_fn().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.policy.attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        "{} {} failed (attempt {}/{}): {}, retrying in {:?}",
                        op, target, attempt, self.policy.attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "{} {} failed after {} attempts: {}",
                        op, target, attempt, e
                    );
                    return Err(e);
                }
            }
        }
    }
}
