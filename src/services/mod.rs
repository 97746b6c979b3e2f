// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod coalesce;
pub mod eligibility;
pub mod journal;
pub mod sanity;
pub mod scheduler;
pub mod sync;
pub mod trigger;
pub mod watchdog;

pub use coalesce::{accumulate, AccumulateMode, CoalesceTolerances};
pub use scheduler::{run_claimed_user, Heartbeat, Scheduler};
pub use sync::{SyncReport, UserSync};
