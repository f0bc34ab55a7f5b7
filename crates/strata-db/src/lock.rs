use std::fmt;
use std::time::{Duration, Instant};

use strata_common::{Error, Result};
use strata_config::{LockConfig, LockPolicyKind};
use tracing::{debug, info, warn};

use crate::driver::{Driver, SessionLock};

/// How to behave when another instance already holds the migration lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Poll until the holder releases, giving up after `timeout`.
    Wait {
        timeout: Duration,
        poll_interval: Duration,
    },
    /// Fail with `Error::LockBusy` on the first refusal.
    TryOnce,
}

impl LockPolicy {
    pub fn from_config(config: &LockConfig) -> Self {
        match config.policy {
            LockPolicyKind::Wait => LockPolicy::Wait {
                timeout: config.timeout(),
                poll_interval: config.poll_interval(),
            },
            LockPolicyKind::Try => LockPolicy::TryOnce,
        }
    }
}

/// Serializes engine invocations across processes sharing a database.
#[derive(Debug, Clone)]
pub struct LockManager {
    key: String,
    policy: LockPolicy,
}

impl LockManager {
    pub fn new(key: impl Into<String>, policy: LockPolicy) -> Self {
        Self {
            key: key.into(),
            policy,
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.key.clone(), LockPolicy::from_config(config))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn acquire<D: Driver + ?Sized>(&self, driver: &D) -> Result<LockGuard> {
        let started = Instant::now();

        let (timeout, poll_interval) = match self.policy {
            LockPolicy::TryOnce => (Duration::ZERO, Duration::ZERO),
            LockPolicy::Wait {
                timeout,
                poll_interval,
            } => (timeout, poll_interval),
        };

        let mut announced = false;
        loop {
            if let Some(handle) = driver.try_lock(&self.key)? {
                debug!(key = %self.key, waited = ?started.elapsed(), "migration lock acquired");
                return Ok(LockGuard {
                    key: self.key.clone(),
                    handle: Some(handle),
                    acquired_at: Instant::now(),
                });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::LockBusy {
                    key: self.key.clone(),
                    waited,
                });
            }
            if !announced {
                info!(key = %self.key, "another instance is migrating, waiting for the lock");
                announced = true;
            }
            std::thread::sleep(poll_interval.min(timeout - waited));
        }
    }
}

/// Proof of holding the migration lock. Released on `release` or drop.
pub struct LockGuard {
    key: String,
    handle: Option<Box<dyn SessionLock>>,
    acquired_at: Instant,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                handle.release()?;
                debug!(key = %self.key, held = ?self.held_for(), "migration lock released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held_for", &self.held_for())
            .field("released", &self.handle.is_none())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release() {
                warn!(key = %self.key, "failed to release migration lock: {e}");
            }
        }
    }
}
