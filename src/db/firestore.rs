// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper implementing [`SyncStore`].
//!
//! Collections:
//! - `users` (scheduling state, keyed by user id)
//! - `connections` (linked accounts and their journals)
//! - `activity_records` (one per canonical activity)
//! - `sync_locks` (one per locked user; creation is the claim)

use crate::db::{collections, RunCommit, SyncStore};
use crate::error::AppError;
use crate::models::{ActivityRecord, ConnectionRecord, SyncLock, SyncStep, User};
use crate::time_utils::format_utc_rfc3339;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use std::collections::HashSet;

const MAX_CONCURRENT_DB_OPS: usize = 50;
// Firestore limits batch/transaction writes to 500 operations.
// We use a safe limit of 400 to allow headroom.
const BATCH_SIZE: usize = 400;

/// One write in a finalize commit.
enum PendingWrite<'a> {
    User(&'a User),
    Connection(&'a ConnectionRecord),
    Record(&'a ActivityRecord),
    DeleteRecord(&'a str),
    DeleteLock(&'a str),
}

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a mock Firestore client for testing (offline mode).
    ///
    /// All database operations will return an error if called.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }

    async fn get_connection(&self, connection_id: &str) -> Result<ConnectionRecord, AppError> {
        let connection: Option<ConnectionRecord> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::CONNECTIONS)
            .obj()
            .one(connection_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        connection.ok_or_else(|| AppError::NotFound(format!("connection {}", connection_id)))
    }

    async fn write_lock(&self, lock: &SyncLock) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::SYNC_LOCKS)
            .document_id(&lock.user_id)
            .object(lock)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    /// Commit writes in transactions of at most `BATCH_SIZE` operations.
    async fn commit_writes(&self, writes: &[PendingWrite<'_>]) -> Result<(), AppError> {
        let client = self.get_client()?;

        for chunk in writes.chunks(BATCH_SIZE) {
            let mut transaction = client
                .begin_transaction()
                .await
                .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

            for write in chunk {
                let added = match write {
                    PendingWrite::User(user) => client
                        .fluent()
                        .update()
                        .in_col(collections::USERS)
                        .document_id(&user.id)
                        .object(*user)
                        .add_to_transaction(&mut transaction)
                        .map(|_| ()),
                    PendingWrite::Connection(connection) => client
                        .fluent()
                        .update()
                        .in_col(collections::CONNECTIONS)
                        .document_id(&connection.id)
                        .object(*connection)
                        .add_to_transaction(&mut transaction)
                        .map(|_| ()),
                    PendingWrite::Record(record) => client
                        .fluent()
                        .update()
                        .in_col(collections::ACTIVITY_RECORDS)
                        .document_id(&record.id)
                        .object(*record)
                        .add_to_transaction(&mut transaction)
                        .map(|_| ()),
                    PendingWrite::DeleteRecord(id) => client
                        .fluent()
                        .delete()
                        .from(collections::ACTIVITY_RECORDS)
                        .document_id(*id)
                        .add_to_transaction(&mut transaction)
                        .map(|_| ()),
                    PendingWrite::DeleteLock(user_id) => client
                        .fluent()
                        .delete()
                        .from(collections::SYNC_LOCKS)
                        .document_id(*user_id)
                        .add_to_transaction(&mut transaction)
                        .map(|_| ()),
                };
                added.map_err(|e| {
                    AppError::Database(format!("Failed to add write to transaction: {}", e))
                })?;
            }

            transaction
                .commit()
                .await
                .map_err(|e| AppError::Database(format!("Transaction commit failed: {}", e)))?;
        }

        Ok(())
    }
}

#[async_trait]
impl SyncStore for FirestoreDb {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::USERS)
            .document_id(&user.id)
            .object(user)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_connections(&self, user_id: &str) -> Result<Vec<ConnectionRecord>, AppError> {
        let user_id = user_id.to_string();
        let mut connections: Vec<ConnectionRecord> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::CONNECTIONS)
            .filter(move |q| q.for_all([q.field("user_id").eq(user_id.clone())]))
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        connections.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(connections)
    }

    async fn upsert_connection(&self, connection: &ConnectionRecord) -> Result<(), AppError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::CONNECTIONS)
            .document_id(&connection.id)
            .object(connection)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn find_connections(
        &self,
        service: &str,
        external_ids: &[String],
    ) -> Result<Vec<ConnectionRecord>, AppError> {
        let client = self.get_client()?;

        let found = stream::iter(external_ids.to_vec())
            .map(|external_id| {
                let service = service.to_string();
                async move {
                    client
                        .fluent()
                        .select()
                        .from(collections::CONNECTIONS)
                        .filter(move |q| {
                            q.for_all([
                                q.field("service").eq(service.clone()),
                                q.field("external_id").eq(external_id.clone()),
                            ])
                        })
                        .obj::<ConnectionRecord>()
                        .query()
                        .await
                        .map_err(|e| AppError::Database(e.to_string()))
                }
            })
            .buffer_unordered(MAX_CONCURRENT_DB_OPS)
            .collect::<Vec<Result<Vec<ConnectionRecord>, AppError>>>()
            .await
            .into_iter()
            .collect::<Result<Vec<Vec<ConnectionRecord>>, AppError>>()?;

        Ok(found.into_iter().flatten().collect())
    }

    async fn flag_connection_triggered(
        &self,
        connection_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut connection = self.get_connection(connection_id).await?;
        connection.mark_triggered(at);
        self.upsert_connection(&connection).await
    }

    async fn mark_synchronized(&self, connection_id: &str, uids: &[String]) -> Result<(), AppError> {
        let mut connection = self.get_connection(connection_id).await?;
        connection
            .synchronized_activities
            .extend(uids.iter().cloned());
        self.upsert_connection(&connection).await
    }

    async fn get_activity_records(&self, user_id: &str) -> Result<Vec<ActivityRecord>, AppError> {
        let user_id = user_id.to_string();
        self.get_client()?
            .fluent()
            .select()
            .from(collections::ACTIVITY_RECORDS)
            .filter(move |q| q.for_all([q.field("user_id").eq(user_id.clone())]))
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn due_users(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, AppError> {
        let locked: HashSet<String> = self
            .list_locks()
            .await?
            .into_iter()
            .map(|l| l.user_id)
            .collect();
        let now_key = format_utc_rfc3339(now);

        let users: Vec<User> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::USERS)
            .filter(move |q| q.for_all([q.field("next_sync_key").less_than_or_equal(now_key.clone())]))
            .order_by([("next_sync_key", firestore::FirestoreQueryDirection::Ascending)])
            .limit((limit + locked.len()) as u32)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(users
            .into_iter()
            .filter(|u| !locked.contains(&u.id))
            .take(limit)
            .map(|u| u.id)
            .collect())
    }

    async fn schedule_user(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        force_exhaustive: bool,
    ) -> Result<(), AppError> {
        let mut user = self
            .get_user(user_id)
            .await?
            .unwrap_or_else(|| User::new(user_id));
        if user.next_sync.is_none_or(|t| t > at) {
            user.schedule_at(at);
        }
        user.force_exhaustive |= force_exhaustive;
        self.upsert_user(&user).await
    }

    async fn get_lock(&self, user_id: &str) -> Result<Option<SyncLock>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::SYNC_LOCKS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn list_locks(&self) -> Result<Vec<SyncLock>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::SYNC_LOCKS)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn try_claim_user(&self, lock: &SyncLock) -> Result<bool, AppError> {
        // Creating the lock document fails if it already exists.
        let created: Result<(), firestore::errors::FirestoreError> = self
            .get_client()?
            .fluent()
            .insert()
            .into(collections::SYNC_LOCKS)
            .document_id(&lock.user_id)
            .object(lock)
            .execute()
            .await;

        match created {
            Ok(()) => Ok(true),
            Err(firestore::errors::FirestoreError::DataConflictError(_)) => {
                tracing::debug!(user_id = %lock.user_id, "Lost claim race");
                Ok(false)
            }
            Err(e) => Err(AppError::Database(e.to_string())),
        }
    }

    async fn renew_lock(
        &self,
        user_id: &str,
        owner: &str,
        step: SyncStep,
        progress: Option<f32>,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        match self.get_lock(user_id).await? {
            Some(mut lock) if lock.owner == owner => {
                lock.step = step;
                lock.progress = progress;
                lock.heartbeat_at = at;
                self.write_lock(&lock).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, user_id: &str, owner: &str) -> Result<bool, AppError> {
        match self.get_lock(user_id).await? {
            Some(lock) if lock.owner == owner => {
                self.get_client()?
                    .fluent()
                    .delete()
                    .from(collections::SYNC_LOCKS)
                    .document_id(user_id)
                    .execute()
                    .await
                    .map_err(|e| AppError::Database(e.to_string()))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_run(&self, owner: &str, mut commit: RunCommit) -> Result<(), AppError> {
        let user_id = commit.user.id.clone();
        match self.get_lock(&user_id).await? {
            Some(lock) if lock.owner == owner => {}
            _ => return Err(AppError::LockLost(user_id)),
        }

        let stored = self.get_connections(&user_id).await?;
        commit.reconcile_concurrent_triggers(&stored, Utc::now());

        let mut writes: Vec<PendingWrite<'_>> = Vec::new();
        writes.extend(commit.pruned_record_ids.iter().map(|id| PendingWrite::DeleteRecord(id)));
        writes.extend(commit.records.iter().map(PendingWrite::Record));
        writes.extend(commit.connections.iter().map(PendingWrite::Connection));
        writes.push(PendingWrite::User(&commit.user));
        // Last, so a partial commit leaves the user locked for the watchdog.
        writes.push(PendingWrite::DeleteLock(&user_id));

        self.commit_writes(&writes).await?;

        tracing::info!(
            user_id = %user_id,
            records = commit.records.len(),
            pruned = commit.pruned_record_ids.len(),
            "Run committed"
        );
        Ok(())
    }
}
