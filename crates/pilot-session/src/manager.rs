// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pilot_computer::Computer;
use pilot_config::ComputerSpec;

use crate::{ComputerPool, Lease, PoolError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// What a caller gets back from [`SessionManager::ensure_session`]: the
/// session id, the bound computer, and a child cancellation token for the
/// run.  Cancelling the session cancels every token handed out for it.
pub struct SessionHandle {
    pub session_id: String,
    pub computer: Arc<dyn Computer>,
    pub cancel: CancellationToken,
}

struct SessionEntry {
    lease: Option<Lease>,
    last_activity: Instant,
    /// Indices into the manager-owned task slab.  Tasks hold the session
    /// id string, never a back-pointer – this breaks the session↔task
    /// reference cycle.
    active_tasks: HashSet<u64>,
    cancel: CancellationToken,
}

struct TaskEntry {
    session_id: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionEntry>,
    tasks: HashMap<u64, TaskEntry>,
    next_task_id: u64,
    accepting: bool,
}

/// Per-client sessions over a shared computer pool.
///
/// A session binds at most one computer at a time; idle sessions are
/// evicted by the background sweeper; shutdown awaits active tasks up to
/// a deadline, cancels stragglers, and returns every handle.
///
/// The inner map mutex is held only across map mutations, never across
/// I/O – all awaiting happens outside the lock.
pub struct SessionManager {
    pool: Arc<ComputerPool>,
    idle_timeout: Duration,
    shutdown_deadline: Duration,
    inner: Mutex<Inner>,
    root_cancel: CancellationToken,
    shutdown_started: AtomicBool,
}

impl SessionManager {
    pub fn new(pool: Arc<ComputerPool>, idle_timeout: Duration, shutdown_deadline: Duration) -> Self {
        Self {
            pool,
            idle_timeout,
            shutdown_deadline,
            inner: Mutex::new(Inner { accepting: true, ..Default::default() }),
            root_cancel: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<ComputerPool> {
        &self.pool
    }

    /// Healthy iff a probe acquire for `spec` actually succeeds: the pool
    /// has a slot *and* the provisioner behind it answers.  See
    /// [`ComputerPool::probe`].
    pub async fn healthy(&self, spec: &ComputerSpec) -> bool {
        if self.shutdown_started.load(Ordering::SeqCst) {
            return false;
        }
        self.pool.probe(spec).await
    }

    /// Look up or create the session and make sure it holds a computer
    /// matching `spec`.
    pub async fn ensure_session(
        &self,
        requested_id: Option<String>,
        spec: &ComputerSpec,
    ) -> Result<SessionHandle, SessionError> {
        let session_id = requested_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Fast path under the lock: an existing session with a bound
        // computer.
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.accepting {
                return Err(SessionError::ShuttingDown);
            }
            if let Some(entry) = inner.sessions.get_mut(&session_id) {
                entry.last_activity = Instant::now();
                if let Some(lease) = &entry.lease {
                    return Ok(SessionHandle {
                        session_id,
                        computer: Arc::clone(&lease.computer),
                        cancel: entry.cancel.child_token(),
                    });
                }
            }
        }

        // Acquire outside the lock (pool acquire may wait on the
        // provisioner).  PoolExhausted surfaces before any run state is
        // created.
        let lease = self.pool.acquire(spec).await?;
        let computer = Arc::clone(&lease.computer);

        let mut inner = self.inner.lock().unwrap();
        if !inner.accepting {
            drop(inner);
            self.pool.release(lease);
            return Err(SessionError::ShuttingDown);
        }
        let entry = inner.sessions.entry(session_id.clone()).or_insert_with(|| {
            info!(%session_id, "session created");
            SessionEntry {
                lease: None,
                last_activity: Instant::now(),
                active_tasks: HashSet::new(),
                cancel: self.root_cancel.child_token(),
            }
        });
        entry.last_activity = Instant::now();
        match &entry.lease {
            // Lost a race: someone bound a computer meanwhile.  Hand ours
            // back and use theirs.
            Some(existing) => {
                let computer = Arc::clone(&existing.computer);
                let cancel = entry.cancel.child_token();
                drop(inner);
                self.pool.release(lease);
                Ok(SessionHandle { session_id, computer, cancel })
            }
            None => {
                entry.lease = Some(lease);
                let cancel = entry.cancel.child_token();
                Ok(SessionHandle { session_id, computer, cancel })
            }
        }
    }

    /// Spawn a run future as a tracked task of `session_id`.  The task is
    /// awaited on shutdown; when it finishes it unregisters itself and
    /// refreshes the session's activity stamp.
    pub fn spawn_task(
        self: &Arc<Self>,
        session_id: &str,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> u64 {
        let task_id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_task_id += 1;
            let task_id = inner.next_task_id;
            if let Some(entry) = inner.sessions.get_mut(session_id) {
                entry.active_tasks.insert(task_id);
            }
            task_id
        };

        let manager = Arc::clone(self);
        let sid = session_id.to_string();
        let handle = tokio::spawn(async move {
            fut.await;
            manager.finish_task(&sid, task_id);
        });

        self.inner
            .lock()
            .unwrap()
            .tasks
            .insert(task_id, TaskEntry { session_id: session_id.to_string(), handle });
        task_id
    }

    fn finish_task(&self, session_id: &str, task_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.remove(&task_id);
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.active_tasks.remove(&task_id);
            entry.last_activity = Instant::now();
        }
    }

    /// Cancel a session's runs and return its computer to the pool.
    pub fn close_session(&self, session_id: &str) {
        let lease = {
            let mut inner = self.inner.lock().unwrap();
            let Some(mut entry) = inner.sessions.remove(session_id) else { return };
            entry.cancel.cancel();
            entry.lease.take()
        };
        if let Some(lease) = lease {
            self.pool.release(lease);
        }
        info!(%session_id, "session closed");
    }

    /// Background sweeper: evicts sessions idle longer than the timeout.
    /// Runs until shutdown.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.idle_timeout.div_f32(4.0).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = manager.root_cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                for session_id in manager.idle_session_ids() {
                    debug!(%session_id, "evicting idle session");
                    manager.close_session(&session_id);
                }
            }
        })
    }

    fn idle_session_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .iter()
            .filter(|(_, e)| {
                e.active_tasks.is_empty() && e.last_activity.elapsed() > self.idle_timeout
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Graceful shutdown: stop intake, await active tasks up to the
    /// deadline, cancel the rest, return all handles, close the pool.
    /// Idempotent – the second call is a no-op.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("shutdown already performed");
            return;
        }
        info!("session manager shutting down");

        let handles: Vec<(u64, JoinHandle<()>)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.accepting = false;
            inner.tasks.drain().map(|(id, t)| (id, t.handle)).collect()
        };

        let deadline = Instant::now() + self.shutdown_deadline;
        let mut stragglers = Vec::new();
        for (task_id, handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(_) => {}
                Err(_) => stragglers.push(task_id),
            }
        }

        if !stragglers.is_empty() {
            warn!(count = stragglers.len(), "cancelling tasks past the shutdown deadline");
        }
        // Cancels every session token (and every run token derived from
        // them) in one sweep.
        self.root_cancel.cancel();

        let leases: Vec<Lease> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .sessions
                .drain()
                .filter_map(|(_, mut e)| e.lease.take())
                .collect()
        };
        for lease in leases {
            self.pool.release(lease);
        }
        self.pool.close_all().await;
        info!("session manager shut down");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
