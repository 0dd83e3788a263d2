// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timeouts and stall detection for work items.
//!
//! Three limits guard a triggered item:
//!
//! | Limit | Measured from | Applies while |
//! |-------|---------------|---------------|
//! | pickup | `trigger_time` | the item still sits in `Init`/`InitDelete` |
//! | abort | `abort_requested_at` | an abort was requested |
//! | progressing | `init_time` | the item is in an active phase |
//!
//! [`StallDetector`] only decides; it never writes. The caller records the
//! failure with [`WorkItem::fail`](crate::work_item::WorkItem::fail).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::work_item::WorkItem;

/// Slack added to the remaining time so the requeue lands after the deadline.
pub const REQUEUE_MARGIN: Duration = Duration::from_secs(5);

/// Default pickup timeout (5 minutes).
pub const DEFAULT_PICKUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default abort timeout (5 minutes).
pub const DEFAULT_ABORT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default progressing timeout (10 minutes).
pub const DEFAULT_PROGRESSING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A limit that can be switched off with `"none"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeout {
    Disabled,
    After(Duration),
}

impl Timeout {
    /// The limit, if enabled.
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::After(limit) => Some(limit),
        }
    }
}

impl FromStr for Timeout {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("none") {
            return Ok(Self::Disabled);
        }
        let limit = parse_duration(s)?;
        if limit.is_zero() {
            Ok(Self::Disabled)
        } else {
            Ok(Self::After(limit))
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("none"),
            Self::After(limit) => write!(f, "{}", humantime::format_duration(*limit)),
        }
    }
}

impl From<Timeout> for String {
    fn from(timeout: Timeout) -> Self {
        timeout.to_string()
    }
}

impl TryFrom<String> for Timeout {
    type Error = humantime::DurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Parse a duration such as `500ms`, `5m` or `1h30m`. A bare integer is
/// read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    let input = raw.trim();
    match input.parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(input),
    }
}

/// Limits applied by the [`StallDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub pickup: Timeout,
    pub abort: Timeout,
    /// Used when the item carries no override of its own.
    pub progressing_default: Timeout,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            pickup: Timeout::After(DEFAULT_PICKUP_TIMEOUT),
            abort: Timeout::After(DEFAULT_ABORT_TIMEOUT),
            progressing_default: Timeout::After(DEFAULT_PROGRESSING_TIMEOUT),
        }
    }
}

/// Which limit an item exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    Pickup { timeout: Duration },
    Abort { timeout: Duration },
    Progressing { timeout: Duration },
}

impl StallReason {
    /// Machine readable reason written to the item's last error.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Pickup { .. } => "PickupTimeout",
            Self::Abort { .. } => "AbortingTimeout",
            Self::Progressing { .. } => "ProgressingTimeout",
        }
    }

    /// The operation that was waiting when the limit hit.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Pickup { .. } => "WaitingForPickup",
            Self::Abort { .. } => "WaitingForAbort",
            Self::Progressing { .. } => "WaitingForCompletion",
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Self::Pickup { timeout } | Self::Abort { timeout } | Self::Progressing { timeout } => {
                *timeout
            }
        }
    }
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = humantime::format_duration(self.timeout());
        match self {
            Self::Pickup { .. } => write!(
                f,
                "no worker picked up the item within {} of being triggered",
                limit
            ),
            Self::Abort { .. } => write!(
                f,
                "the item was not aborted within {} of the abort request",
                limit
            ),
            Self::Progressing { .. } => {
                write!(f, "the item did not finish within {} of starting", limit)
            }
        }
    }
}

/// Outcome of a stall check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCheck {
    /// No limit applies in the item's current state.
    NotApplicable,
    /// A limit applies but has not been reached yet.
    Pending { requeue_after: Duration },
    /// A limit has been exceeded.
    Stalled(StallReason),
}

impl StallCheck {
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Pending { requeue_after } => Some(*requeue_after),
            _ => None,
        }
    }
}

/// Decides whether a work item exceeded one of its limits.
#[derive(Debug, Clone, Default)]
pub struct StallDetector {
    config: TimeoutConfig,
}

impl StallDetector {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Evaluate the limits in order: pickup, abort, progressing.
    pub fn check(&self, item: &WorkItem, now: DateTime<Utc>) -> StallCheck {
        if item.is_finished() {
            return StallCheck::NotApplicable;
        }

        if item.phase.is_awaiting_pickup() {
            return match self.config.pickup {
                Timeout::After(timeout) => measure(
                    item.trigger_time,
                    timeout,
                    now,
                    StallReason::Pickup { timeout },
                ),
                Timeout::Disabled => StallCheck::NotApplicable,
            };
        }

        if let Some(requested_at) = item.abort_requested_at
            && let Timeout::After(timeout) = self.config.abort
        {
            return measure(
                Some(requested_at),
                timeout,
                now,
                StallReason::Abort { timeout },
            );
        }

        let progressing = item
            .progressing_timeout
            .unwrap_or(self.config.progressing_default);
        if let Timeout::After(timeout) = progressing
            && item.phase.is_active()
        {
            return measure(
                item.init_time,
                timeout,
                now,
                StallReason::Progressing { timeout },
            );
        }

        StallCheck::NotApplicable
    }

    /// Convenience form of [`check`](Self::check).
    pub fn is_stalled(&self, item: &WorkItem, now: DateTime<Utc>) -> (bool, Option<StallReason>) {
        match self.check(item, now) {
            StallCheck::Stalled(reason) => (true, Some(reason)),
            _ => (false, None),
        }
    }
}

fn measure(
    since: Option<DateTime<Utc>>,
    limit: Duration,
    now: DateTime<Utc>,
    reason: StallReason,
) -> StallCheck {
    let Some(since) = since else {
        return StallCheck::NotApplicable;
    };
    // Clock skew between replicas can put `since` in the future.
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= limit {
        StallCheck::Stalled(reason)
    } else {
        StallCheck::Pending {
            requeue_after: limit - elapsed + REQUEUE_MARGIN,
        }
    }
}
