// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Worker pool claiming due users and running their syncs.
//!
//! Any number of processes may run a pool against the same store. Mutual
//! exclusion comes entirely from the store's compare-and-swap claim; a
//! claimed run keeps its lock alive with a heartbeat task and stops at the
//! next step boundary once the heartbeat reports the lock gone.

use crate::db::SyncStore;
use crate::error::AppError;
use crate::models::{SyncLock, SyncStep};
use crate::services::sync::{SyncReport, UserSync};
use crate::time_utils::to_chrono;
use crate::AppState;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::Instrument;

/// Step and progress a run last reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunProgress {
    pub step: SyncStep,
    pub progress: Option<f32>,
}

/// The run's side of the heartbeat channel.
pub struct Heartbeat {
    tx: watch::Sender<RunProgress>,
    lost: Arc<AtomicBool>,
}

impl Heartbeat {
    pub fn new() -> (Self, watch::Receiver<RunProgress>) {
        let (tx, rx) = watch::channel(RunProgress {
            step: SyncStep::Locked,
            progress: None,
        });
        (
            Self {
                tx,
                lost: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// A heartbeat nobody renews; the lock is never reported lost.
    pub fn detached() -> Self {
        Self::new().0
    }

    pub fn report(&self, step: SyncStep, progress: Option<f32>) {
        self.tx.send_replace(RunProgress { step, progress });
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    fn lost_flag(&self) -> Arc<AtomicBool> {
        self.lost.clone()
    }
}

/// Renew the lock on every tick and on every step change, until the run
/// drops its [`Heartbeat`] or the lock turns out to be gone.
async fn renew_lock_loop(
    store: Arc<dyn SyncStore>,
    user_id: String,
    owner: String,
    mut rx: watch::Receiver<RunProgress>,
    lost: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut last_step = SyncStep::Locked;

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if rx.borrow_and_update().step == last_step {
                    continue;
                }
            }
            _ = ticker.tick() => {}
        }

        let current = *rx.borrow_and_update();
        last_step = current.step;
        match store
            .renew_lock(&user_id, &owner, current.step, current.progress, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(user_id = %user_id, owner = %owner, "Sync lock lost");
                lost.store(true, Ordering::Release);
                break;
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to renew sync lock");
            }
        }
    }
}

/// A run executing in this process.
#[derive(Debug)]
pub struct ActiveRun {
    pub owner: String,
    pub handle: AbortHandle,
    pub started_at: DateTime<Utc>,
}

/// Unique lock owner for one run.
pub fn new_owner_id(host: &str) -> String {
    format!("{}-{:016x}", host, rand::random::<u64>())
}

/// Run a user already claimed by `owner`.
///
/// On failure other than a lost lock, the lock is released and the user is
/// retried after the normal interval.
pub async fn run_claimed_user(
    state: &AppState,
    user_id: &str,
    owner: &str,
) -> Result<SyncReport, AppError> {
    let (heartbeat, rx) = Heartbeat::new();
    let renewer = tokio::spawn(renew_lock_loop(
        state.store.clone(),
        user_id.to_string(),
        owner.to_string(),
        rx,
        heartbeat.lost_flag(),
        state.config.heartbeat_interval,
    ));

    let span = tracing::info_span!("sync_user", user_id, owner);
    let result = async {
        let sync = UserSync::load(state, user_id, owner, &heartbeat).await?;
        sync.run().await
    }
    .instrument(span)
    .await;
    drop(heartbeat);
    let _ = renewer.await;

    match &result {
        Ok(report) => {
            tracing::debug!(user_id, uploads = report.uploads, "Run finished");
        }
        Err(AppError::LockLost(_)) => {
            tracing::warn!(user_id, owner, "Run abandoned after losing its lock");
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Sync run failed");
            let retry_at = Utc::now() + to_chrono(state.config.sync_interval);
            // Rescheduled while the lock is still ours; the release below
            // happens even if that fails.
            if let Err(e) = reschedule(state.store.as_ref(), user_id, retry_at).await {
                tracing::warn!(user_id, error = %e, "Failed to reschedule after failed run");
            }
            state.store.release_lock(user_id, owner).await?;
        }
    }
    result
}

async fn reschedule(
    store: &dyn SyncStore,
    user_id: &str,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    if let Some(mut user) = store.get_user(user_id).await? {
        user.schedule_at(at);
        store.upsert_user(&user).await?;
    }
    Ok(())
}

/// Claims due users and runs them with bounded concurrency.
pub struct Scheduler {
    state: Arc<AppState>,
    slots: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        let workers = state.config.sync_workers.max(1);
        Self {
            state,
            slots: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Release locks this host left behind when it last stopped.
    pub async fn release_stale_local_locks(&self) -> Result<usize, AppError> {
        let store = &self.state.store;
        let now = Utc::now();
        let mut released = 0;
        for lock in store.list_locks().await? {
            if lock.host != self.state.config.hostname
                || self.state.active_runs.contains_key(&lock.user_id)
            {
                continue;
            }
            if store.release_lock(&lock.user_id, &lock.owner).await? {
                store.schedule_user(&lock.user_id, now, false).await?;
                released += 1;
            }
        }
        if released > 0 {
            tracing::info!(released, "Released stale local sync locks");
        }
        Ok(released)
    }

    /// Claim as many due users as there are free workers. Returns the
    /// number of runs started.
    pub async fn poll_once(&self) -> Result<usize, AppError> {
        let available = self.slots.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let due = self.state.store.due_users(now, available).await?;
        let mut started = 0;
        for user_id in due {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let owner = new_owner_id(&self.state.config.hostname);
            let lock = SyncLock::new(&user_id, &owner, &self.state.config.hostname, now);
            if !self.state.store.try_claim_user(&lock).await? {
                tracing::debug!(user_id = %user_id, "Claim lost to another worker");
                continue;
            }
            self.spawn_run(user_id, owner, now, permit);
            started += 1;
        }
        Ok(started)
    }

    fn spawn_run(
        &self,
        user_id: String,
        owner: String,
        started_at: DateTime<Utc>,
        permit: OwnedSemaphorePermit,
    ) {
        let state = self.state.clone();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task_user = user_id.clone();
        let task_owner = owner.clone();

        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            if let Err(e) = run_claimed_user(&state, &task_user, &task_owner).await {
                tracing::debug!(user_id = %task_user, error = %e, "Run ended with error");
            }
            drop(permit);
            state
                .active_runs
                .remove_if(&task_user, |_, run| run.owner == task_owner);
        });

        self.state.active_runs.insert(
            user_id,
            ActiveRun {
                owner,
                handle: handle.abort_handle(),
                started_at,
            },
        );
        let _ = registered_tx.send(());
    }

    /// Poll forever.
    pub async fn run(self) {
        if let Err(e) = self.release_stale_local_locks().await {
            tracing::error!(error = %e, "Failed to release stale sync locks");
        }
        tracing::info!(workers = self.state.config.sync_workers, "Sync workers started");

        let mut ticker = tokio::time::interval(self.state.config.worker_poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                tracing::error!(error = %e, "Failed to poll due users");
            }
        }
    }
}
