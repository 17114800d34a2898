//! In-process backend
//!
//! Keeps blocks in a set. Used for dry runs and tests; failures can be
//! injected to exercise retry and degraded paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::{EnforcementBackend, EnforcementError};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    blocked: Mutex<HashSet<IpAddr>>,
    failing: AtomicBool,
    fail_next: AtomicU32,
    install_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation until switched off
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` install/remove calls
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.blocked.lock().contains(ip)
    }

    pub fn snapshot(&self) -> Vec<IpAddr> {
        let mut ips: Vec<_> = self.blocked.lock().iter().copied().collect();
        ips.sort();
        ips
    }

    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), EnforcementError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EnforcementError::Unreachable("memory backend offline".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EnforcementError::Unreachable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EnforcementBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn install(&self, ip: IpAddr) -> Result<(), EnforcementError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.blocked.lock().insert(ip);
        Ok(())
    }

    async fn remove(&self, ip: IpAddr) -> Result<(), EnforcementError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.blocked.lock().remove(&ip);
        Ok(())
    }

    async fn blocked(&self) -> Result<Option<Vec<IpAddr>>, EnforcementError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EnforcementError::Unreachable("memory backend offline".to_string()));
        }
        Ok(Some(self.snapshot()))
    }
}
