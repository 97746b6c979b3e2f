// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User-facing explanations for why an activity or connection did not sync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of reasons shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReasonCode {
    Authorization,
    AccountFull,
    AccountExpired,
    AccountUnpaid,
    FlowException,
    Private,
    NotTriggered,
    MissingCredentials,
    NotConfigured,
    StationaryUnsupported,
    NonGPSUnsupported,
    TypeUnsupported,
    DownloadError,
    ListingError,
    UploadError,
    SanityError,
    Corrupt,
    Untagged,
    LiveTracking,
    UnknownTZ,
    Other,
}

impl ReasonCode {
    /// Reasons the user has to act on before anything changes.
    pub fn requires_intervention(self) -> bool {
        matches!(
            self,
            ReasonCode::Authorization
                | ReasonCode::AccountFull
                | ReasonCode::AccountExpired
                | ReasonCode::AccountUnpaid
                | ReasonCode::MissingCredentials
                | ReasonCode::NotConfigured
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How far an upstream failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// Only the connection that raised it.
    Account,
    /// Every connection of the same service for this user.
    Service,
}

/// A classified reason attached to an activity, record or connection outcome.
///
/// Never persisted on its own; it lives inside whatever it explains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserException {
    pub reason: ReasonCode,
    #[serde(default)]
    pub intervention_required: bool,
    /// Errors sharing a clear group are dismissed together.
    #[serde(default)]
    pub clear_group: Option<String>,
}

impl UserException {
    pub fn new(reason: ReasonCode) -> Self {
        Self {
            reason,
            intervention_required: reason.requires_intervention(),
            clear_group: None,
        }
    }

    pub fn with_intervention(mut self, required: bool) -> Self {
        self.intervention_required = required;
        self
    }

    pub fn with_clear_group(mut self, group: impl Into<String>) -> Self {
        self.clear_group = Some(group.into());
        self
    }
}

impl From<ReasonCode> for UserException {
    fn from(reason: ReasonCode) -> Self {
        UserException::new(reason)
    }
}
