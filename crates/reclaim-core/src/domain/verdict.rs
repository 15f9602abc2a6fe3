//! Verdict: reclamation decision for one live resource.
//!
//! This module is the pure half of the reaper: given what the registry says about
//! a session and the current time, decide whether its resource must go.
//! Executing the decision (stop, key cleanup) belongs to `app::reaper`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::records::{Lease, StatusRecord};

/// Why a resource is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimReason {
    /// The worker wrote a terminal status record.
    TaskDone,
    /// No lease: the worker crashed, hung before its first heartbeat, or is partitioned.
    HeartbeatLost,
    /// The worker is heartbeating but exceeded its wall-clock budget.
    Timeout,
}

impl ReclaimReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReclaimReason::TaskDone => "task_done",
            ReclaimReason::HeartbeatLost => "heartbeat_lost",
            ReclaimReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time limits the verdict is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Lease TTL. A resource younger than this may still be booting its worker.
    pub heartbeat_ttl: Duration,
    /// Wall-clock budget measured from `Lease::started_at`.
    pub max_turn_timeout: Duration,
}

/// Decide whether a resource must be reclaimed.
///
/// Priority, first match wins:
/// 1. terminal status record → `TaskDone` (lease state is irrelevant)
/// 2. no lease and the resource is older than `heartbeat_ttl` → `HeartbeatLost`
/// 3. `now - lease.started_at > max_turn_timeout` → `Timeout`
///
/// A healthy heartbeat never exempts a worker from the wall-clock budget.
/// A resource without a lease inside its first `heartbeat_ttl` is left alone:
/// its worker has not had the chance to write one yet.
pub fn evaluate(
    status: Option<&StatusRecord>,
    lease: Option<&Lease>,
    resource_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    limits: Limits,
) -> Option<ReclaimReason> {
    if status.is_some() {
        return Some(ReclaimReason::TaskDone);
    }
    let Some(lease) = lease else {
        if elapsed(resource_created_at, now) > limits.heartbeat_ttl {
            return Some(ReclaimReason::HeartbeatLost);
        }
        return None;
    };
    if elapsed(lease.started_at, now) > limits.max_turn_timeout {
        return Some(ReclaimReason::Timeout);
    }
    None
}

/// A start time in the future (clock skew) counts as zero.
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
