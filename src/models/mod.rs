// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod activity;
pub mod connection;
pub mod exception;
pub mod record;
pub mod stats;
pub mod user;

pub use activity::{Activity, ActivityTime, ActivityType, ConnectionId, ServiceData, Waypoint};
pub use connection::{
    Authorization, ConnectionConfig, ConnectionRecord, ExcludedActivity, FlowException,
    SyncErrorEntry,
};
pub use exception::{ErrorScope, ReasonCode, UserException};
pub use record::{Absence, ActivityRecord, Presence};
pub use stats::{ActivityStatistic, ActivityStatistics, StatUnit};
pub use user::{SyncLock, SyncStep, User};
