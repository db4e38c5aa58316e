// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use pilot_computer::Computer;
use pilot_config::ComputerSpec;

use crate::Provisioner;

/// Upper bound on how long a health probe may hold the endpoint.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PoolError {
    /// No slot freed up within the acquire timeout, or the pool is closed.
    #[error("computer pool exhausted")]
    Exhausted,

    /// The provisioner could not open a computer.
    #[error("provisioning failed: {0}")]
    Provision(String),
}

/// An exclusive lease on one computer.  Dropping the lease without
/// [`ComputerPool::release`] permanently removes the slot's handle (the
/// permit still frees), so always hand leases back.
pub struct Lease {
    pub computer: Arc<dyn Computer>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn name(&self) -> &str {
        self.computer.name()
    }
}

/// Fixed-capacity pool of computer handles.
///
/// Capacity is a semaphore; the idle list is behind a mutex held only for
/// list mutations, never across I/O.  `acquire` prefers an idle handle
/// matching the spec, provisions a new one under capacity, and fails with
/// [`PoolError::Exhausted`] after the acquire timeout.
pub struct ComputerPool {
    provisioner: Arc<dyn Provisioner>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<dyn Computer>>>,
    acquire_timeout: Duration,
    size: usize,
}

impl ComputerPool {
    pub fn new(provisioner: Arc<dyn Provisioner>, size: usize, acquire_timeout: Duration) -> Self {
        Self {
            provisioner,
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::new()),
            acquire_timeout,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Is a slot free right now?  A cheap counter read; see [`probe`] for
    /// the health check that also exercises the provisioner.
    ///
    /// [`probe`]: Self::probe
    pub fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// Health probe: perform a real bounded acquire and hand the lease
    /// straight back.
    ///
    /// A free permit alone does not mean a run can start – opening a fresh
    /// handle goes through [`Provisioner::open`], and a dead provisioner
    /// must turn the health endpoint red.  A handle provisioned by the
    /// probe is released to the idle list, so repeated probes reuse it
    /// instead of opening more.
    pub async fn probe(&self, spec: &ComputerSpec) -> bool {
        let budget = PROBE_TIMEOUT.min(self.acquire_timeout);
        match tokio::time::timeout(budget, self.acquire(spec)).await {
            Ok(Ok(lease)) => {
                self.release(lease);
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "health probe acquire failed");
                false
            }
            Err(_) => {
                debug!("health probe timed out");
                false
            }
        }
    }

    pub async fn acquire(&self, spec: &ComputerSpec) -> Result<Lease, PoolError> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::Exhausted)?
        .map_err(|_| PoolError::Exhausted)?;

        // Reuse an idle handle when one matches the spec.
        let reused = {
            let mut idle = self.idle.lock().unwrap();
            idle.iter()
                .position(|c| spec.accepts(c.os_type(), c.provider_type(), c.name()))
                .map(|pos| idle.remove(pos))
        };

        let computer = match reused {
            Some(c) => {
                debug!(name = c.name(), "reusing idle computer");
                c
            }
            None => self
                .provisioner
                .open(spec)
                .await
                .map_err(|e| PoolError::Provision(e.to_string()))?,
        };

        Ok(Lease { computer, _permit: permit })
    }

    /// Return a lease; the handle goes back to the idle list for reuse.
    pub fn release(&self, lease: Lease) {
        debug!(name = lease.name(), "releasing computer to pool");
        self.idle.lock().unwrap().push(lease.computer);
        // The permit is freed when the lease drops.
    }

    /// Close every idle handle via the provisioner and refuse further
    /// acquires.  Safe to call more than once.
    pub async fn close_all(&self) {
        self.semaphore.close();
        let drained: Vec<Arc<dyn Computer>> =
            self.idle.lock().unwrap().drain(..).collect();
        for computer in drained {
            info!(name = computer.name(), "closing pooled computer");
            if let Err(e) = self.provisioner.close(computer.name()).await {
                tracing::warn!(name = computer.name(), error = %e, "close failed");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
