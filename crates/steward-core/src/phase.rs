// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase state machine for work items.
//!
//! ```text
//!  Init ──► Progressing ──► Completing ──► Succeeded
//!                │               │
//!                └───────┬───────┘
//!                        ▼
//!                      Failed
//!
//!  InitDelete ──► TriggerDelete ──► Deleting ──► Succeeded
//!                                      │
//!                                      ▼
//!                                 DeleteFailed
//! ```
//!
//! Deploy items skip `Completing` and `TriggerDelete`. A new job id always
//! restarts an item at `Init` (or `InitDelete`); otherwise transitions only
//! move forward.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::work_item::{ItemKind, WorkItem};

/// Lifecycle phase of a work item or parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Init,
    Progressing,
    Completing,
    Succeeded,
    Failed,
    InitDelete,
    TriggerDelete,
    Deleting,
    DeleteFailed,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Init,
        Phase::Progressing,
        Phase::Completing,
        Phase::Succeeded,
        Phase::Failed,
        Phase::InitDelete,
        Phase::TriggerDelete,
        Phase::Deleting,
        Phase::DeleteFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Progressing => "Progressing",
            Self::Completing => "Completing",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::InitDelete => "InitDelete",
            Self::TriggerDelete => "TriggerDelete",
            Self::Deleting => "Deleting",
            Self::DeleteFailed => "DeleteFailed",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::DeleteFailed)
    }

    pub fn is_deletion(self) -> bool {
        matches!(
            self,
            Self::InitDelete | Self::TriggerDelete | Self::Deleting | Self::DeleteFailed
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed | Self::DeleteFailed)
    }

    /// Triggered but not yet picked up.
    pub fn is_awaiting_pickup(self) -> bool {
        matches!(self, Self::Init | Self::InitDelete)
    }

    /// Picked up and doing work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Progressing | Self::Completing | Self::TriggerDelete | Self::Deleting
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| PhaseError::Unknown(s.to_string()))
    }
}

impl ItemKind {
    /// Whether items of this kind ever enter `phase`.
    pub fn allows(self, phase: Phase) -> bool {
        match self {
            Self::DeployItem => !matches!(phase, Phase::Completing | Phase::TriggerDelete),
            Self::Installation | Self::Execution => true,
        }
    }
}

/// Phase errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PhaseError {
    /// The item sits in a phase its kind never uses.
    #[error("phase {phase} is not valid for {kind} items")]
    NotInSubset { kind: ItemKind, phase: Phase },

    #[error("unknown phase '{0}'")]
    Unknown(String),
}

/// What the worker reports about the item's current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Running,
    Completed,
    Failed,
}

/// Observations the machine needs besides the item itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseInput {
    /// Dependencies (or, when deleting, dependents) allow the item to start.
    pub dependencies_ready: bool,
    pub work: WorkState,
    /// A restart should enter the deletion track.
    pub delete_requested: bool,
}

impl PhaseInput {
    pub fn new(dependencies_ready: bool, work: WorkState) -> Self {
        Self {
            dependencies_ready,
            work,
            delete_requested: false,
        }
    }

    pub fn deleting(mut self) -> Self {
        self.delete_requested = true;
        self
    }
}

/// Result of [`PhaseMachine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    /// The item was reset for a new job.
    pub restarted: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.restarted || self.from != self.to
    }
}

/// Computes phase transitions for one item kind.
#[derive(Debug, Clone, Copy)]
pub struct PhaseMachine {
    kind: ItemKind,
}

impl PhaseMachine {
    pub fn new(kind: ItemKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    /// The phase `item` should move to for `job_id`.
    pub fn next_phase(
        &self,
        item: &WorkItem,
        job_id: &str,
        input: PhaseInput,
    ) -> Result<Phase, PhaseError> {
        if !self.kind.allows(item.phase) {
            return Err(PhaseError::NotInSubset {
                kind: self.kind,
                phase: item.phase,
            });
        }

        if item.job_id != job_id {
            return Ok(if input.delete_requested {
                Phase::InitDelete
            } else {
                Phase::Init
            });
        }

        if item.job_id_finished == job_id {
            return Ok(item.phase);
        }

        let next = match (item.phase, input.work) {
            (Phase::Init, _) if input.dependencies_ready => Phase::Progressing,
            (Phase::Init, _) => Phase::Init,

            (Phase::Progressing, WorkState::Running) => Phase::Progressing,
            (Phase::Progressing, WorkState::Completed) if self.kind.allows(Phase::Completing) => {
                Phase::Completing
            }
            (Phase::Progressing, WorkState::Completed) => Phase::Succeeded,
            (Phase::Progressing | Phase::Completing, WorkState::Failed) => Phase::Failed,

            (Phase::Completing, WorkState::Running) => Phase::Completing,
            (Phase::Completing, WorkState::Completed) => Phase::Succeeded,

            (Phase::InitDelete, _) if !input.dependencies_ready => Phase::InitDelete,
            (Phase::InitDelete, _) if self.kind.allows(Phase::TriggerDelete) => {
                Phase::TriggerDelete
            }
            (Phase::InitDelete, _) => Phase::Deleting,

            (Phase::TriggerDelete, WorkState::Failed) => Phase::DeleteFailed,
            (Phase::TriggerDelete, _) => Phase::Deleting,

            (Phase::Deleting, WorkState::Running) => Phase::Deleting,
            (Phase::Deleting, WorkState::Completed) => Phase::Succeeded,
            (Phase::Deleting, WorkState::Failed) => Phase::DeleteFailed,

            (phase, _) => phase,
        };
        Ok(next)
    }

    /// Compute the next phase and write it into `item`.
    pub fn step(
        &self,
        item: &mut WorkItem,
        job_id: &str,
        input: PhaseInput,
        now: DateTime<Utc>,
    ) -> Result<Transition, PhaseError> {
        let from = item.phase;
        let to = self.next_phase(item, job_id, input)?;

        if item.job_id != job_id {
            item.trigger(job_id, now, to == Phase::InitDelete);
            return Ok(Transition {
                from,
                to,
                restarted: true,
            });
        }

        item.apply_phase(to, now);
        Ok(Transition {
            from,
            to,
            restarted: false,
        })
    }
}
