// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory connector for local development and tests.
//!
//! Accounts are keyed by the connection's external id. Failures can be
//! scripted per account and operation.

use crate::connectors::{
    ActivityExcludeException, Connector, ConnectorCapabilities, ConnectorError, ListResult,
    ServiceException,
};
use crate::models::{Activity, ConnectionRecord, ServiceData};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Operation a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxOp {
    List,
    Download,
    Upload,
}

/// A failure to return instead of performing an operation.
#[derive(Debug, Clone)]
pub enum SandboxFailure {
    Service(ServiceException),
    Warning(ServiceException),
    Exclude(ActivityExcludeException),
    Unclassified(String),
}

impl SandboxFailure {
    fn to_error(&self) -> ConnectorError {
        match self {
            SandboxFailure::Service(e) => ConnectorError::Service(e.clone()),
            SandboxFailure::Warning(e) => ConnectorError::Warning(e.clone()),
            SandboxFailure::Exclude(e) => ConnectorError::Exclude(e.clone()),
            SandboxFailure::Unclassified(msg) => {
                ConnectorError::Unclassified(anyhow::anyhow!(msg.clone()))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredActivity {
    external_id: String,
    activity: Activity,
}

pub struct SandboxConnector {
    service: String,
    capabilities: ConnectorCapabilities,
    /// Receiving requires `config.folder` to be set
    requires_folder: bool,
    accounts: DashMap<String, Vec<StoredActivity>>,
    failures: DashMap<(String, SandboxOp), SandboxFailure>,
    /// Consumed by the first matching call
    one_shot_failures: DashMap<(String, SandboxOp), SandboxFailure>,
    poll_results: DashMap<u32, Vec<String>>,
    listing_exclusions: DashMap<String, Vec<ActivityExcludeException>>,
    next_id: AtomicUsize,
    list_calls: AtomicUsize,
    upload_calls: AtomicUsize,
}

impl SandboxConnector {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_capabilities(service, ConnectorCapabilities::default())
    }

    pub fn with_capabilities(service: impl Into<String>, capabilities: ConnectorCapabilities) -> Self {
        Self {
            service: service.into(),
            capabilities,
            requires_folder: false,
            accounts: DashMap::new(),
            failures: DashMap::new(),
            one_shot_failures: DashMap::new(),
            poll_results: DashMap::new(),
            listing_exclusions: DashMap::new(),
            next_id: AtomicUsize::new(1),
            list_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
        }
    }

    pub fn requiring_folder(mut self) -> Self {
        self.requires_folder = true;
        self
    }

    /// Seed an activity into an account; returns its external id.
    pub fn add_activity(&self, account: &str, activity: Activity) -> String {
        let external_id = format!(
            "{}-{}",
            self.service,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        self.accounts
            .entry(account.to_string())
            .or_default()
            .push(StoredActivity {
                external_id: external_id.clone(),
                activity,
            });
        external_id
    }

    /// Activities currently held by an account.
    pub fn activities(&self, account: &str) -> Vec<Activity> {
        self.accounts
            .get(account)
            .map(|stored| stored.iter().map(|s| s.activity.clone()).collect())
            .unwrap_or_default()
    }

    pub fn fail(&self, account: &str, op: SandboxOp, failure: SandboxFailure) {
        self.failures.insert((account.to_string(), op), failure);
    }

    /// Fail only the next `op` on `account`.
    pub fn fail_once(&self, account: &str, op: SandboxOp, failure: SandboxFailure) {
        self.one_shot_failures.insert((account.to_string(), op), failure);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
        self.one_shot_failures.clear();
    }

    /// Report `exclusion` with every listing of `account`.
    pub fn add_listing_exclusion(&self, account: &str, exclusion: ActivityExcludeException) {
        self.listing_exclusions
            .entry(account.to_string())
            .or_default()
            .push(exclusion);
    }

    pub fn set_poll_result(&self, index: u32, external_ids: Vec<String>) {
        self.poll_results.insert(index, external_ids);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self, account: &str, op: SandboxOp) -> Result<(), ConnectorError> {
        let key = (account.to_string(), op);
        if let Some((_, failure)) = self.one_shot_failures.remove(&key) {
            return Err(failure.to_error());
        }
        match self.failures.get(&key) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connector for SandboxConnector {
    fn service(&self) -> &str {
        &self.service
    }

    fn capabilities(&self) -> &ConnectorCapabilities {
        &self.capabilities
    }

    async fn list_activities(
        &self,
        connection: &ConnectionRecord,
        _exhaustive: bool,
    ) -> Result<ListResult, ConnectorError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(&connection.external_id, SandboxOp::List)?;

        let activities = self
            .accounts
            .get(&connection.external_id)
            .map(|stored| {
                stored
                    .iter()
                    .map(|s| {
                        let mut listed = s.activity.clone();
                        listed.waypoints.clear();
                        listed.uids.clear();
                        listed.service_data.clear();
                        listed
                            .service_data
                            .insert(connection.id.clone(), ServiceData::new(&s.external_id));
                        listed
                    })
                    .collect()
            })
            .unwrap_or_default();

        let exclusions = self
            .listing_exclusions
            .get(&connection.external_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        Ok(ListResult {
            activities,
            exclusions,
        })
    }

    async fn download_activity(
        &self,
        connection: &ConnectionRecord,
        activity: &Activity,
    ) -> Result<Activity, ConnectorError> {
        self.check_failure(&connection.external_id, SandboxOp::Download)?;

        let external_id = activity
            .service_data
            .get(&connection.id)
            .map(|d| d.external_id.clone())
            .ok_or_else(|| {
                ConnectorError::Unclassified(anyhow::anyhow!(
                    "activity has no service data for {}",
                    connection.id
                ))
            })?;

        let stored = self
            .accounts
            .get(&connection.external_id)
            .and_then(|stored| {
                stored
                    .iter()
                    .find(|s| s.external_id == external_id)
                    .map(|s| s.activity.clone())
            })
            .ok_or_else(|| {
                ConnectorError::Unclassified(anyhow::anyhow!("activity {} not found", external_id))
            })?;

        let mut downloaded = activity.clone();
        downloaded.start = stored.start;
        downloaded.end = stored.end;
        downloaded.waypoints = stored.waypoints;
        downloaded.stats = stored.stats;
        if downloaded.gps.is_none() {
            downloaded.gps = stored.gps;
        }
        Ok(downloaded)
    }

    async fn upload_activity(
        &self,
        connection: &ConnectionRecord,
        activity: &Activity,
    ) -> Result<String, ConnectorError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(&connection.external_id, SandboxOp::Upload)?;

        let mut uploaded = activity.clone();
        uploaded.service_data.clear();
        uploaded.uids.clear();
        Ok(self.add_activity(&connection.external_id, uploaded))
    }

    fn requires_configuration(&self, connection: &ConnectionRecord) -> bool {
        self.requires_folder && connection.config.folder.is_none()
    }

    async fn poll_partial_sync_trigger(&self, index: u32) -> Result<Vec<String>, ConnectorError> {
        Ok(self
            .poll_results
            .remove(&index)
            .map(|(_, ids)| ids)
            .unwrap_or_default())
    }

    /// Expects `{"accounts": ["<external id>", ...]}`.
    fn service_record_ids_for_partial_sync_trigger(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Vec<String>, ConnectorError> {
        let accounts = payload
            .get("accounts")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                ConnectorError::Unclassified(anyhow::anyhow!("trigger payload missing accounts"))
            })?;
        Ok(accounts
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActivityType;
    use chrono::{TimeZone, Utc};

    fn connection() -> ConnectionRecord {
        ConnectionRecord::new("conn-1", "user-1", "sandbox", "acct-1")
    }

    #[tokio::test]
    async fn test_list_and_upload() {
        let sandbox = SandboxConnector::new("sandbox");
        let act = Activity::new(
            Utc.with_ymd_and_hms(2021, 5, 1, 8, 0, 0).unwrap(),
            ActivityType::Running,
        );
        let ext = sandbox.add_activity("acct-1", act.clone());

        let listed = sandbox.list_activities(&connection(), true).await.unwrap();
        assert_eq!(listed.activities.len(), 1);
        assert_eq!(listed.activities[0].service_data["conn-1"].external_id, ext);

        let uploaded = sandbox.upload_activity(&connection(), &act).await.unwrap();
        assert_ne!(uploaded, ext);
        assert_eq!(sandbox.activities("acct-1").len(), 2);
        assert_eq!(sandbox.upload_calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let sandbox = SandboxConnector::new("sandbox");
        sandbox.fail(
            "acct-1",
            SandboxOp::List,
            SandboxFailure::Service(ServiceException::new("expired").blocking()),
        );
        let err = sandbox.list_activities(&connection(), false).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Service(ref e) if e.block));

        sandbox.clear_failures();
        assert!(sandbox.list_activities(&connection(), false).await.is_ok());
    }

    #[test]
    fn test_trigger_payload_mapping() {
        let sandbox = SandboxConnector::new("sandbox");
        let ids = sandbox
            .service_record_ids_for_partial_sync_trigger(&serde_json::json!({"accounts": ["a", "b"]}))
            .unwrap();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(sandbox
            .service_record_ids_for_partial_sync_trigger(&serde_json::json!({}))
            .is_err());
    }
}
