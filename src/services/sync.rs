// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user synchronization run.
//!
//! A run is strictly sequential: list every connection into the canonical
//! set, then walk the canonical activities most recent first, downloading
//! each from one source and uploading it to every eligible destination.
//! State is read once in [`UserSync::load`] and written back by a single
//! owner-conditional commit in [`UserSync::run`]; the only early write is
//! marking UIDs delivered to a destination.

use crate::connectors::{
    ActivityExcludeException, Connector, ConnectorError, ServiceException,
};
use crate::db::RunCommit;
use crate::error::AppError;
use crate::models::connection::{sanitize_key, ExcludedActivity};
use crate::models::{
    Activity, ActivityRecord, ActivityStatistics, ConnectionRecord, ErrorScope, ReasonCode,
    ServiceData, SyncErrorEntry, SyncStep, User, UserException,
};
use crate::services::coalesce::{accumulate, AccumulateMode};
use crate::services::eligibility::{self, Candidate, Eligibility};
use crate::services::journal::SyncJournal;
use crate::services::sanity::{self, SanityError};
use crate::services::scheduler::Heartbeat;
use crate::time_utils::to_chrono;
use crate::AppState;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::Arc;

/// Result of one step of processing, matched explicitly by the run.
#[derive(Debug)]
pub enum StepOutcome<T> {
    Continue(T),
    /// Nothing to do; not counted as processed.
    Skip,
    /// This activity cannot proceed, for the given reason.
    Exclude(UserException),
    /// The connection reported a service error; its scope and `block`
    /// decide whether the connection stays in the run.
    Fatal(ServiceException),
}

/// Summary of a finished run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub activities: usize,
    pub processed: usize,
    pub uploads: usize,
    pub failed_uploads: usize,
    pub exhaustive: bool,
    pub pruned: usize,
}

/// A connection during one run.
struct RunConnection {
    record: ConnectionRecord,
    connector: Arc<dyn Connector>,
    /// Excluded for the rest of the run, and why.
    excluded: Option<UserException>,
    /// Skipped because of blocking errors from an earlier run.
    carried_over: bool,
    /// Listing postponed until a trigger or a destination needs it.
    deferred: bool,
    listed: bool,
}

pub struct UserSync<'a> {
    state: &'a AppState,
    heartbeat: &'a Heartbeat,
    owner: String,
    user: User,
    connections: Vec<RunConnection>,
    records: Vec<ActivityRecord>,
    activities: Vec<Activity>,
    journal: SyncJournal,
    exhaustive: bool,
    started_at: DateTime<Utc>,
}

impl<'a> UserSync<'a> {
    /// Read everything the run needs.
    pub async fn load(
        state: &'a AppState,
        user_id: &str,
        owner: &str,
        heartbeat: &'a Heartbeat,
    ) -> Result<Self, AppError> {
        let started_at = Utc::now();
        let user = state
            .store
            .get_user(user_id)
            .await?
            .unwrap_or_else(|| User::new(user_id));
        let mut records = state.store.get_activity_records(user_id).await?;
        let stored = state.store.get_connections(user_id).await?;

        // Connections removed since the last run.
        for record in &mut records {
            let gone: Vec<String> = record
                .presence()
                .keys()
                .chain(record.absence().keys())
                .filter(|id| !stored.iter().any(|c| &c.id == *id))
                .cloned()
                .collect();
            for id in gone {
                record.forget_connection(&id);
            }
        }

        let mut connections = Vec::new();
        for record in stored {
            let Some(connector) = state.registry.get(&record.service).cloned() else {
                tracing::warn!(
                    connection_id = %record.id,
                    service = %record.service,
                    "No connector registered for service"
                );
                continue;
            };
            let blocked = record.blocking_errors().next().map(|e| {
                e.user_exception
                    .clone()
                    .unwrap_or_else(|| UserException::new(ReasonCode::Other))
            });
            connections.push(RunConnection {
                carried_over: blocked.is_some(),
                excluded: blocked,
                record,
                connector,
                deferred: false,
                listed: false,
            });
        }

        let exhaustive = user.force_exhaustive || records.is_empty();

        Ok(Self {
            state,
            heartbeat,
            owner: owner.to_string(),
            user,
            connections,
            records,
            activities: Vec::new(),
            journal: SyncJournal::new(),
            exhaustive,
            started_at,
        })
    }

    /// Run to completion and commit.
    pub async fn run(mut self) -> Result<SyncReport, AppError> {
        tracing::info!(
            user_id = %self.user.id,
            connections = self.connections.len(),
            exhaustive = self.exhaustive,
            "Starting user sync"
        );

        self.check_credentials();
        self.subscribe_triggers().await;
        self.list_all().await;

        let mut report = SyncReport {
            activities: self.activities.len(),
            exhaustive: self.exhaustive,
            ..Default::default()
        };
        self.process_all(&mut report).await?;
        self.finalize(report).await
    }

    fn connection_index(&self, connection_id: &str) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| c.record.id == connection_id)
    }

    // ─── Error classification ─────────────────────────────────────

    /// Record a connection-level failure and exclude the connection (and,
    /// for service scope, its siblings) for the rest of the run.
    fn fail_connection(
        &mut self,
        idx: usize,
        exception: ServiceException,
        step: SyncStep,
        fallback: ReasonCode,
    ) -> UserException {
        let connection_id = self.connections[idx].record.id.clone();
        let service = self.connections[idx].record.service.clone();
        let mut reason = exception.reason_or(fallback);
        if reason.clear_group.is_none() {
            reason.clear_group = Some(format!("{}:{}", connection_id, reason.reason));
        }

        tracing::warn!(
            user_id = %self.user.id,
            connection_id = %connection_id,
            step = ?step,
            scope = ?exception.scope,
            block = exception.block,
            error = %exception.message,
            "Connection excluded for this run"
        );

        self.journal.record_error(
            &connection_id,
            SyncErrorEntry {
                message: exception.message,
                step,
                scope: exception.scope,
                block: exception.block,
                user_exception: Some(reason.clone()),
                trigger_exhaustive: exception.trigger_exhaustive,
                recorded_at: Utc::now(),
            },
        );

        self.connections[idx].excluded = Some(reason.clone());
        if exception.scope == ErrorScope::Service {
            for other in &mut self.connections {
                if other.record.service == service && other.excluded.is_none() {
                    other.excluded = Some(reason.clone());
                }
            }
        }
        reason
    }

    /// A failure while moving one activity. Only blocking or service-wide
    /// failures take the connection out of the run; anything else is
    /// journaled as non-blocking and costs just this activity.
    fn fail_for_activity(
        &mut self,
        idx: usize,
        exception: ServiceException,
        step: SyncStep,
        fallback: ReasonCode,
    ) -> UserException {
        if exception.block || exception.scope == ErrorScope::Service {
            return self.fail_connection(idx, exception, step, fallback);
        }
        let reason = exception.reason_or(fallback);
        self.record_warning(idx, exception, step, fallback);
        reason
    }

    fn record_warning(
        &mut self,
        idx: usize,
        exception: ServiceException,
        step: SyncStep,
        fallback: ReasonCode,
    ) {
        let connection_id = self.connections[idx].record.id.clone();
        tracing::info!(
            user_id = %self.user.id,
            connection_id = %connection_id,
            step = ?step,
            warning = %exception.message,
            "Connector warning"
        );
        let reason = exception.reason_or(fallback);
        self.journal.record_error(
            &connection_id,
            SyncErrorEntry {
                message: exception.message,
                step,
                scope: exception.scope,
                block: false,
                user_exception: Some(reason),
                trigger_exhaustive: exception.trigger_exhaustive,
                recorded_at: Utc::now(),
            },
        );
    }

    /// Exclude one activity on a connection, keyed by `id` once sanitized.
    fn record_activity_exclusion(&mut self, idx: usize, id: &str, exception: ActivityExcludeException) {
        let connection_id = self.connections[idx].record.id.clone();
        tracing::info!(
            user_id = %self.user.id,
            connection_id = %connection_id,
            activity = id,
            permanent = exception.permanent,
            reason = %exception.user_exception.reason,
            "Activity excluded"
        );
        self.journal.record_exclusion(
            &connection_id,
            sanitize_key(id),
            ExcludedActivity {
                external_id: id.to_string(),
                message: exception.message,
                reason: exception.user_exception,
                permanent: exception.permanent,
                effective_at: Utc::now(),
            },
        );
    }

    fn handle_connection_error(
        &mut self,
        idx: usize,
        error: ConnectorError,
        step: SyncStep,
        fallback: ReasonCode,
    ) {
        match error {
            ConnectorError::Warning(e) => self.record_warning(idx, e, step, fallback),
            ConnectorError::Exclude(e) => match e.external_id.clone() {
                Some(external_id) => self.record_activity_exclusion(idx, &external_id, e),
                None => self.record_warning(
                    idx,
                    ServiceException::new(e.message).with_user_exception(e.user_exception),
                    step,
                    fallback,
                ),
            },
            other => {
                self.fail_connection(idx, other.into_service_exception(fallback), step, fallback);
            }
        }
    }

    // ─── Listing ──────────────────────────────────────────────────

    fn check_credentials(&mut self) {
        for idx in 0..self.connections.len() {
            let conn = &self.connections[idx];
            if conn.excluded.is_none()
                && conn.connector.capabilities().requires_extended_authorization
                && conn.record.extended_authorization.is_none()
            {
                let exception = ServiceException::new("Stored credentials are missing")
                    .blocking()
                    .with_user_exception(UserException::new(ReasonCode::MissingCredentials));
                self.fail_connection(
                    idx,
                    exception,
                    SyncStep::Listing,
                    ReasonCode::MissingCredentials,
                );
            }
        }
    }

    /// Bring trigger subscriptions in line with what each connector needs.
    async fn subscribe_triggers(&mut self) {
        for idx in 0..self.connections.len() {
            let conn = &self.connections[idx];
            let wanted = conn.connector.capabilities().partial_sync_requires_trigger;
            if conn.excluded.is_some() || wanted == conn.record.partial_sync_trigger_subscribed {
                continue;
            }
            let connector = conn.connector.clone();
            let result = if wanted {
                connector.subscribe_partial_sync_trigger(&conn.record).await
            } else {
                connector.unsubscribe_partial_sync_trigger(&conn.record).await
            };
            match result {
                Ok(()) => {
                    tracing::info!(
                        connection_id = %conn.record.id,
                        subscribed = wanted,
                        "Partial sync trigger subscription changed"
                    );
                    self.connections[idx].record.partial_sync_trigger_subscribed = wanted;
                }
                Err(e) => {
                    self.handle_connection_error(idx, e, SyncStep::Listing, ReasonCode::ListingError)
                }
            }
        }
    }

    /// Whether a trigger-driven connection must be listed in this run.
    fn should_list(&self, conn: &RunConnection, now: DateTime<Utc>) -> bool {
        if !conn.connector.capabilities().partial_sync_requires_trigger {
            return true;
        }
        let force_poll_after = to_chrono(self.state.config.trigger_force_poll_after);
        self.exhaustive
            || conn.record.force_exhaustive
            || conn.record.trigger_pending
            || conn
                .record
                .last_listed_at
                .is_none_or(|t| now - t >= force_poll_after)
    }

    async fn list_connection(&mut self, idx: usize, mode: AccumulateMode) {
        self.connections[idx].deferred = false;
        let conn = &self.connections[idx];
        let exhaustive = self.exhaustive || conn.record.force_exhaustive;
        let connector = conn.connector.clone();

        match connector.list_activities(&conn.record, exhaustive).await {
            Ok(listing) => {
                let connection_id = conn.record.id.clone();
                for exclusion in listing.exclusions {
                    match exclusion.external_id.clone() {
                        Some(external_id) => {
                            self.record_activity_exclusion(idx, &external_id, exclusion)
                        }
                        // Nothing to key it by.
                        None => self.record_warning(
                            idx,
                            ServiceException::new(exclusion.message)
                                .with_user_exception(exclusion.user_exception),
                            SyncStep::Listing,
                            ReasonCode::ListingError,
                        ),
                    }
                }
                let count = listing.activities.len();
                accumulate(
                    &mut self.activities,
                    &connection_id,
                    listing.activities,
                    mode,
                    &self.state.config.coalesce,
                );

                let conn = &mut self.connections[idx];
                conn.listed = true;
                conn.record.last_listed_at = Some(Utc::now());
                conn.record.trigger_pending = false;
                if exhaustive {
                    conn.record.force_exhaustive = false;
                }
                tracing::info!(
                    user_id = %self.user.id,
                    connection_id = %connection_id,
                    count,
                    exhaustive,
                    mode = ?mode,
                    "Listed connection"
                );
            }
            Err(e) => {
                self.handle_connection_error(idx, e, SyncStep::Listing, ReasonCode::ListingError)
            }
        }
    }

    async fn list_all(&mut self) {
        self.heartbeat.report(SyncStep::Listing, None);
        let now = Utc::now();
        let total = self.connections.len();

        for idx in 0..total {
            let conn = &self.connections[idx];
            if conn.excluded.is_some() {
                continue;
            }
            if !conn.connector.capabilities().supplies_activities {
                self.connections[idx].listed = true;
                continue;
            }
            if !self.should_list(conn, now) {
                tracing::debug!(connection_id = %conn.record.id, "Listing deferred until triggered");
                self.connections[idx].deferred = true;
                continue;
            }
            self.list_connection(idx, AccumulateMode::Full).await;
            self.heartbeat
                .report(SyncStep::Listing, Some((idx + 1) as f32 / total as f32));
        }
    }

    // ─── Processing ───────────────────────────────────────────────

    async fn process_all(&mut self, report: &mut SyncReport) -> Result<(), AppError> {
        self.activities
            .sort_by(|a, b| b.start.sort_key().cmp(&a.start.sort_key()));
        let total = self.activities.len();

        for idx in 0..total {
            if self.heartbeat.is_lost() {
                return Err(AppError::LockLost(self.user.id.clone()));
            }
            self.heartbeat
                .report(SyncStep::Downloading, Some(idx as f32 / total as f32));

            match self.process_activity(idx, report).await? {
                StepOutcome::Continue(()) => report.processed += 1,
                StepOutcome::Skip => {}
                StepOutcome::Exclude(reason) => {
                    tracing::debug!(reason = %reason.reason, "Activity not processed");
                }
                StepOutcome::Fatal(e) => {
                    tracing::warn!(error = %e, "Activity aborted");
                }
            }
        }
        Ok(())
    }

    /// Match the activity to its record, creating one on first sight.
    fn touch_record(&mut self, idx: usize, now: DateTime<Utc>) -> usize {
        let activity = &self.activities[idx];
        let pos = match self.records.iter().position(|r| r.matches(activity)) {
            Some(pos) => {
                self.records[pos].update_from(activity);
                pos
            }
            None => {
                self.records
                    .push(ActivityRecord::from_activity(&self.user.id, activity));
                self.records.len() - 1
            }
        };
        for holder in activity.holders() {
            self.records[pos].set_presence(holder, now, None);
        }
        pos
    }

    fn resolve(&self, idx: usize, record_idx: usize) -> Eligibility {
        let activity = &self.activities[idx];
        let origin = self.records[record_idx]
            .origin()
            .filter(|id| self.connection_index(id).is_some())
            .or_else(|| activity.holders().next())
            .cloned();

        let candidates: Vec<Candidate<'_>> = self
            .connections
            .iter()
            .map(|c| Candidate {
                connection: &c.record,
                connector: c.connector.as_ref(),
                blocked: c.excluded.as_ref(),
                run_exclusions: self.journal.exclusions(&c.record.id),
            })
            .collect();

        eligibility::resolve(
            activity,
            origin.as_deref(),
            &candidates,
            &self.user.flow_exceptions,
        )
    }

    async fn process_activity(
        &mut self,
        idx: usize,
        report: &mut SyncReport,
    ) -> Result<StepOutcome<()>, AppError> {
        let now = Utc::now();
        let record_idx = self.touch_record(idx, now);
        let mut eligibility = self.resolve(idx, record_idx);

        let deferred: Vec<usize> = eligibility
            .eligible
            .iter()
            .filter_map(|id| self.connection_index(id))
            .filter(|&c| self.connections[c].deferred)
            .collect();
        if !deferred.is_empty() {
            for c in deferred {
                self.list_connection(c, AccumulateMode::UpdateOnly).await;
            }
            self.touch_record(idx, now);
            eligibility = self.resolve(idx, record_idx);
        }

        let record = &mut self.records[record_idx];
        for (connection_id, exception) in &eligibility.rejected {
            record.set_absence(connection_id, exception.clone(), now);
        }
        if eligibility.eligible.is_empty() {
            return Ok(StepOutcome::Skip);
        }
        for connection_id in &eligibility.eligible {
            record.clear_absence(connection_id);
        }

        let payload = match self.download(idx).await {
            StepOutcome::Continue(payload) => payload,
            StepOutcome::Skip => return Ok(StepOutcome::Skip),
            StepOutcome::Exclude(reason) => {
                for connection_id in &eligibility.eligible {
                    self.records[record_idx].set_absence(connection_id, reason.clone(), now);
                }
                return Ok(StepOutcome::Exclude(reason));
            }
            StepOutcome::Fatal(e) => {
                let reason = e.reason_or(ReasonCode::DownloadError);
                for connection_id in &eligibility.eligible {
                    self.records[record_idx].set_absence(connection_id, reason.clone(), now);
                }
                return Ok(StepOutcome::Fatal(e));
            }
        };

        self.heartbeat.report(SyncStep::Uploading, None);
        for connection_id in &eligibility.eligible {
            let Some(c) = self.connection_index(connection_id) else {
                continue;
            };
            // A sibling may have failed for the whole service meanwhile.
            if let Some(reason) = self.connections[c].excluded.clone() {
                self.records[record_idx].set_absence(connection_id, reason, now);
                continue;
            }

            match self.upload(c, &payload).await {
                StepOutcome::Continue(external_id) => {
                    report.uploads += 1;
                    let uids: Vec<String> = self.activities[idx].uids.iter().cloned().collect();
                    self.state
                        .store
                        .mark_synchronized(connection_id, &uids)
                        .await?;
                    self.connections[c]
                        .record
                        .synchronized_activities
                        .extend(uids);
                    self.records[record_idx].set_presence(connection_id, now, Some(now));
                    if let Some(external_id) = external_id {
                        self.activities[idx]
                            .service_data
                            .insert(connection_id.clone(), ServiceData::new(external_id));
                    }
                    tracing::info!(
                        user_id = %self.user.id,
                        connection_id = %connection_id,
                        "Activity uploaded"
                    );
                }
                StepOutcome::Skip => {}
                StepOutcome::Exclude(reason) => {
                    report.failed_uploads += 1;
                    self.records[record_idx].set_absence(connection_id, reason, now);
                }
                StepOutcome::Fatal(exception) => {
                    report.failed_uploads += 1;
                    let reason = self.fail_for_activity(
                        c,
                        exception,
                        SyncStep::Uploading,
                        ReasonCode::UploadError,
                    );
                    self.records[record_idx].set_absence(connection_id, reason, now);
                }
            }
        }

        Ok(StepOutcome::Continue(()))
    }

    /// Exclusion of the activity with `external_id` on a source connection.
    fn source_exclusion(&self, idx: usize, external_id: &str) -> Option<UserException> {
        let connection = &self.connections[idx].record;
        self.journal
            .exclusions(&connection.id)
            .and_then(|run| run.get(&sanitize_key(external_id)))
            .or_else(|| connection.exclusion_for(external_id))
            .map(|e| e.reason.clone())
    }

    /// Fetch the full activity from the first source that yields a sane one.
    async fn download(&mut self, idx: usize) -> StepOutcome<Activity> {
        self.heartbeat.report(SyncStep::Downloading, None);
        let canonical = self.activities[idx].clone();

        let mut sources: Vec<usize> = canonical
            .holders()
            .filter_map(|id| self.connection_index(id))
            .filter(|&c| {
                let conn = &self.connections[c];
                conn.excluded.is_none() && conn.connector.capabilities().supplies_activities
            })
            .collect();
        sources.sort_by_key(|&c| {
            let record = &self.connections[c].record;
            (
                self.state.registry.download_rank(&record.service),
                record.id.clone(),
            )
        });

        let mut last_reason = None;
        for c in sources {
            // A failure on an earlier source may have excluded this one.
            if let Some(reason) = self.connections[c].excluded.clone() {
                last_reason = Some(reason);
                continue;
            }
            let connection_id = self.connections[c].record.id.clone();
            let Some(external_id) = canonical
                .service_data
                .get(&connection_id)
                .map(|d| d.external_id.clone())
            else {
                continue;
            };
            if let Some(reason) = self.source_exclusion(c, &external_id) {
                last_reason = Some(reason);
                continue;
            }

            let connector = self.connections[c].connector.clone();
            match connector
                .download_activity(&self.connections[c].record, &canonical)
                .await
            {
                Ok(downloaded) => match prepare_payload(&canonical, downloaded) {
                    Ok(payload) => return StepOutcome::Continue(payload),
                    Err(err) => {
                        let reason = UserException::new(err.reason());
                        let exclusion =
                            ActivityExcludeException::new(err.to_string(), err.reason(), true)
                                .with_external_id(&external_id);
                        self.record_activity_exclusion(c, &external_id, exclusion);
                        last_reason = Some(reason);
                    }
                },
                Err(ConnectorError::Exclude(e)) => {
                    last_reason = Some(e.user_exception.clone());
                    self.record_activity_exclusion(c, &external_id, e);
                }
                Err(ConnectorError::Warning(e)) => {
                    last_reason = Some(e.reason_or(ReasonCode::DownloadError));
                    self.record_warning(c, e, SyncStep::Downloading, ReasonCode::DownloadError);
                }
                Err(err) => {
                    let exception = err.into_service_exception(ReasonCode::DownloadError);
                    last_reason = Some(self.fail_for_activity(
                        c,
                        exception,
                        SyncStep::Downloading,
                        ReasonCode::DownloadError,
                    ));
                }
            }
        }

        StepOutcome::Exclude(
            last_reason.unwrap_or_else(|| UserException::new(ReasonCode::DownloadError)),
        )
    }

    async fn upload(&mut self, idx: usize, payload: &Activity) -> StepOutcome<Option<String>> {
        let connector = self.connections[idx].connector.clone();
        match connector
            .upload_activity(&self.connections[idx].record, payload)
            .await
        {
            Ok(external_id) => StepOutcome::Continue(Some(external_id)),
            Err(ConnectorError::Warning(e)) => {
                self.record_warning(idx, e, SyncStep::Uploading, ReasonCode::UploadError);
                StepOutcome::Continue(None)
            }
            Err(ConnectorError::Exclude(e)) => {
                let reason = e.user_exception.clone();
                let key = payload
                    .uids
                    .iter()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| payload.calculate_uid());
                self.record_activity_exclusion(idx, &key, e);
                StepOutcome::Exclude(reason)
            }
            Err(err) => StepOutcome::Fatal(err.into_service_exception(ReasonCode::UploadError)),
        }
    }

    // ─── Finalizing ───────────────────────────────────────────────

    fn next_sync_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let jitter = self.state.config.sync_jitter.as_secs() as i64;
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        now + to_chrono(self.state.config.sync_interval) + Duration::seconds(offset)
    }

    async fn finalize(mut self, mut report: SyncReport) -> Result<SyncReport, AppError> {
        self.heartbeat.report(SyncStep::Finalizing, None);
        if self.heartbeat.is_lost() {
            return Err(AppError::LockLost(self.user.id.clone()));
        }
        let now = Utc::now();

        let complete = self.exhaustive
            && self
                .connections
                .iter()
                .all(|c| c.excluded.is_none() && !c.deferred && c.listed);
        let mut pruned_record_ids = Vec::new();
        if complete {
            self.records.retain(|r| {
                if !r.touched {
                    pruned_record_ids.push(r.id.clone());
                }
                r.touched
            });
        }
        report.pruned = pruned_record_ids.len();

        for conn in &mut self.connections {
            self.journal.write_back(&mut conn.record, conn.carried_over);
        }

        let new_blocking = self.journal.has_blocking_errors();
        self.user.blocking_error_count = self
            .connections
            .iter()
            .map(|c| c.record.blocking_errors().count() as u32)
            .sum();
        self.user.nonblocking_error_count = self.journal.nonblocking_error_count();
        self.user.exclusion_count = self
            .connections
            .iter()
            .map(|c| c.record.excluded_activities.len() as u32)
            .sum::<u32>()
            + self.journal.temporary_exclusion_count();
        self.user.last_synchronized = Some(now);
        self.user.force_exhaustive = new_blocking || self.journal.triggers_exhaustive();
        if new_blocking {
            self.user.schedule_at(now);
        } else {
            let next = self.next_sync_time(now);
            self.user.schedule_at(next);
        }

        let user_id = self.user.id.clone();
        let next_sync = self.user.next_sync;
        let commit = RunCommit {
            user: self.user,
            connections: self.connections.into_iter().map(|c| c.record).collect(),
            records: self.records,
            pruned_record_ids,
            started_at: self.started_at,
        };
        self.state.store.finalize_run(&self.owner, commit).await?;

        tracing::info!(
            user_id = %user_id,
            activities = report.activities,
            processed = report.processed,
            uploads = report.uploads,
            failed_uploads = report.failed_uploads,
            pruned = report.pruned,
            next_sync = ?next_sync,
            "User sync complete"
        );
        Ok(report)
    }
}

/// Build the upload payload from a download, keeping the canonical identity.
fn prepare_payload(canonical: &Activity, downloaded: Activity) -> Result<Activity, SanityError> {
    let mut payload = downloaded;
    sanity::resolve_timezone(&mut payload, canonical)?;

    payload.activity_type = canonical.activity_type;
    payload.name = canonical.name.clone();
    payload.notes = canonical.notes.clone();
    payload.private = canonical.private;
    payload.stationary = canonical.stationary.or(payload.stationary);
    payload.gps = payload.gps.or(canonical.gps);
    payload.service_data = canonical.service_data.clone();
    payload.uids = canonical.uids.clone();
    payload.sources = canonical.sources.clone();
    if payload.stats == ActivityStatistics::default() {
        payload.stats = canonical.stats.clone();
    }

    sanity::check(&mut payload)?;
    Ok(payload)
}
