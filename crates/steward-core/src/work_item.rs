// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work items, their parents and the records the store keeps for them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::CompletionPolicy;
use crate::lock::TargetRef;
use crate::phase::Phase;
use crate::timeout::{StallReason, Timeout};

/// Kind of a lockable, phase-driven resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    Installation,
    Execution,
    DeployItem,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installation => "Installation",
            Self::Execution => "Execution",
            Self::DeployItem => "DeployItem",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Installation" => Ok(Self::Installation),
            "Execution" => Ok(Self::Execution),
            "DeployItem" => Ok(Self::DeployItem),
            other => Err(format!("unknown item kind '{}'", other)),
        }
    }
}

/// Kind of a resource that owns a graph of work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParentKind {
    /// Owns sub-installations.
    Installation,
    /// Owns deploy items.
    Execution,
}

impl ParentKind {
    /// Kind used for the parent's own phase and lock.
    pub fn item_kind(self) -> ItemKind {
        match self {
            Self::Installation => ItemKind::Installation,
            Self::Execution => ItemKind::Execution,
        }
    }

    /// Kind of the items the parent owns.
    pub fn child_kind(self) -> ItemKind {
        match self {
            Self::Installation => ItemKind::Installation,
            Self::Execution => ItemKind::DeployItem,
        }
    }

    /// Policy a dependency must meet before its dependents start.
    pub fn default_completion_policy(self) -> CompletionPolicy {
        match self {
            Self::Installation => CompletionPolicy::AllSucceeded,
            Self::Execution => CompletionPolicy::AllSucceeded,
        }
    }
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.item_kind().as_str())
    }
}

impl FromStr for ParentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Installation" => Ok(Self::Installation),
            "Execution" => Ok(Self::Execution),
            other => Err(format!("unknown parent kind '{}'", other)),
        }
    }
}

/// Last failure recorded on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemError {
    pub operation: String,
    pub reason: String,
    pub message: String,
}

/// A unit of work inside a parent's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub phase: Phase,
    /// Job the item currently works on.
    #[serde(default)]
    pub job_id: String,
    /// Last job the item finished.
    #[serde(default)]
    pub job_id_finished: String,
    #[serde(default)]
    pub trigger_time: Option<DateTime<Utc>>,
    /// When a worker picked the item up.
    #[serde(default)]
    pub init_time: Option<DateTime<Utc>>,
    /// When the item started waiting for its work to wind down.
    #[serde(default)]
    pub wait_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub abort_requested_at: Option<DateTime<Utc>>,
    /// Overrides the configured progressing timeout.
    #[serde(default)]
    pub progressing_timeout: Option<Timeout>,
    #[serde(default)]
    pub last_error: Option<WorkItemError>,
}

impl WorkItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            phase: Phase::Init,
            job_id: String::new(),
            job_id_finished: String::new(),
            trigger_time: None,
            init_time: None,
            wait_time: None,
            finished_time: None,
            abort_requested_at: None,
            progressing_timeout: None,
            last_error: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = depends_on.into_iter().map(Into::into).collect();
        self
    }

    /// The item reached a final phase for its current job.
    pub fn is_finished(&self) -> bool {
        self.phase.is_final() && self.job_id_finished == self.job_id
    }

    /// Start `job_id`, resetting the item to the head of its track.
    pub fn trigger(&mut self, job_id: &str, now: DateTime<Utc>, delete: bool) {
        self.job_id = job_id.to_string();
        self.phase = if delete { Phase::InitDelete } else { Phase::Init };
        self.trigger_time = Some(now);
        self.init_time = None;
        self.wait_time = None;
        self.finished_time = None;
        self.abort_requested_at = None;
        self.last_error = None;
    }

    /// Move to `phase`, stamping the timestamps that phase implies.
    pub fn apply_phase(&mut self, phase: Phase, now: DateTime<Utc>) {
        if phase == self.phase {
            return;
        }
        let previous = self.phase;
        self.phase = phase;

        if previous.is_awaiting_pickup() && !phase.is_awaiting_pickup() && self.init_time.is_none()
        {
            self.init_time = Some(now);
        }
        if matches!(phase, Phase::Completing | Phase::Deleting) {
            self.wait_time = Some(now);
        }
        if phase.is_final() {
            self.finished_time = Some(now);
            self.job_id_finished = self.job_id.clone();
            self.abort_requested_at = None;
        }
    }

    /// Ask the worker to stop; the abort timeout runs from the first request.
    pub fn request_abort(&mut self, now: DateTime<Utc>) {
        if self.abort_requested_at.is_none() {
            self.abort_requested_at = Some(now);
        }
    }

    /// Record a stall and finish the current job as failed.
    pub fn fail(&mut self, reason: &StallReason, now: DateTime<Utc>) {
        self.fail_with(reason.operation(), reason.reason(), reason.to_string(), now);
    }

    pub fn fail_with(
        &mut self,
        operation: &str,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let phase = if self.phase.is_deletion() {
            Phase::DeleteFailed
        } else {
            Phase::Failed
        };
        self.apply_phase(phase, now);
        self.last_error = Some(WorkItemError {
            operation: operation.to_string(),
            reason: reason.to_string(),
            message: message.into(),
        });
    }
}

/// A parent resource as kept by the store; `status` carries its own phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRecord {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub kind: ParentKind,
    pub status: WorkItem,
    pub deletion_requested: bool,
    /// Store-assigned version token; 0 until first stored.
    pub version: u64,
}

impl ParentRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: ParentKind) -> Self {
        let name = name.into();
        Self {
            namespace: namespace.into(),
            uid: uuid::Uuid::new_v4().to_string(),
            kind,
            status: WorkItem::new(name.clone()),
            name,
            deletion_requested: false,
            version: 0,
        }
    }

    pub fn target(&self) -> TargetRef {
        TargetRef::new(
            self.kind.item_kind(),
            self.namespace.clone(),
            self.name.clone(),
            self.uid.clone(),
        )
    }

    pub fn job_id(&self) -> &str {
        &self.status.job_id
    }

    /// Run the item graph for a new job.
    pub fn start_job(&mut self, job_id: &str, now: DateTime<Utc>) {
        self.deletion_requested = false;
        self.status.trigger(job_id, now, false);
    }

    /// Abort the running job. Running items are asked to stop and nothing
    /// new is triggered; the abort timeout runs from the first request.
    pub fn request_abort(&mut self, now: DateTime<Utc>) {
        self.status.request_abort(now);
    }

    /// Tear the item graph down under a new job.
    pub fn request_deletion(&mut self, job_id: &str, now: DateTime<Utc>) {
        self.deletion_requested = true;
        self.status.trigger(job_id, now, true);
    }
}

/// A work item as kept by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub namespace: String,
    /// Name of the owning parent.
    pub parent: String,
    pub uid: String,
    pub item: WorkItem,
    /// Store-assigned version token; 0 until first stored.
    pub version: u64,
}

impl StoredItem {
    pub fn new(namespace: impl Into<String>, parent: impl Into<String>, item: WorkItem) -> Self {
        Self {
            namespace: namespace.into(),
            parent: parent.into(),
            uid: uuid::Uuid::new_v4().to_string(),
            item,
            version: 0,
        }
    }

    /// Namespace-unique name: `<parent>/<item>`.
    pub fn resource_name(&self) -> String {
        format!("{}/{}", self.parent, self.item.name)
    }

    pub fn target(&self, kind: ItemKind) -> TargetRef {
        TargetRef::new(
            kind,
            self.namespace.clone(),
            self.resource_name(),
            self.uid.clone(),
        )
    }
}

/// Split a `<parent>/<item>` resource name.
pub fn split_resource_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('/')
        .filter(|(parent, item)| !parent.is_empty() && !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    #[test]
    fn test_trigger_resets_item() {
        let now = Utc::now();
        let mut item = WorkItem::new("a");
        item.trigger("job-1", now, false);
        item.apply_phase(Phase::Progressing, now);
        item.fail_with("Deploy", "Crashed", "boom", now);
        assert!(item.is_finished());

        let later = now + ChronoDuration::seconds(10);
        item.trigger("job-2", later, false);
        assert_eq!(item.phase, Phase::Init);
        assert_eq!(item.trigger_time, Some(later));
        assert_eq!(item.init_time, None);
        assert_eq!(item.last_error, None);
        assert_eq!(item.job_id_finished, "job-1");
        assert!(!item.is_finished());
    }

    #[test]
    fn test_apply_phase_stamps_times() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);
        let t2 = t0 + ChronoDuration::seconds(2);
        let t3 = t0 + ChronoDuration::seconds(3);
        let mut item = WorkItem::new("a");
        item.trigger("job-1", t0, false);

        item.apply_phase(Phase::Progressing, t1);
        assert_eq!(item.init_time, Some(t1));

        item.apply_phase(Phase::Completing, t2);
        assert_eq!(item.wait_time, Some(t2));
        assert_eq!(item.init_time, Some(t1));

        item.apply_phase(Phase::Succeeded, t3);
        assert_eq!(item.finished_time, Some(t3));
        assert_eq!(item.job_id_finished, "job-1");
    }

    #[test]
    fn test_fail_during_deletion_uses_delete_failed() {
        let now = Utc::now();
        let mut item = WorkItem::new("a");
        item.trigger("job-1", now, true);
        item.apply_phase(Phase::Deleting, now);

        let reason = StallReason::Progressing {
            timeout: Duration::from_secs(60),
        };
        item.fail(&reason, now);
        assert_eq!(item.phase, Phase::DeleteFailed);
        let error = item.last_error.unwrap();
        assert_eq!(error.reason, "ProgressingTimeout");
        assert_eq!(error.operation, "WaitingForCompletion");
    }

    #[test]
    fn test_request_abort_keeps_first_time() {
        let now = Utc::now();
        let mut item = WorkItem::new("a");
        item.request_abort(now);
        item.request_abort(now + ChronoDuration::minutes(1));
        assert_eq!(item.abort_requested_at, Some(now));
    }

    #[test]
    fn test_new_job_clears_parent_abort() {
        let now = Utc::now();
        let mut parent = ParentRecord::new("default", "exec", ParentKind::Execution);
        parent.start_job("job-1", now);
        parent.request_abort(now);
        assert_eq!(parent.status.abort_requested_at, Some(now));

        parent.start_job("job-2", now);
        assert_eq!(parent.status.abort_requested_at, None);
    }

    #[test]
    fn test_work_item_json_shape() {
        let item = WorkItem::new("b").with_dependencies(["a"]);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["dependsOn"][0], "a");
        assert_eq!(json["phase"], "Init");

        let parsed: WorkItem = serde_json::from_str(r#"{"name":"c"}"#).unwrap();
        assert_eq!(parsed, WorkItem::new("c"));
    }

    #[test]
    fn test_resource_names() {
        let stored = StoredItem::new("ns", "exec", WorkItem::new("deploy"));
        assert_eq!(stored.resource_name(), "exec/deploy");
        assert_eq!(split_resource_name("exec/deploy"), Some(("exec", "deploy")));
        assert_eq!(split_resource_name("exec"), None);
        assert_eq!(split_resource_name("/deploy"), None);
    }

    #[test]
    fn test_parent_kind_table() {
        assert_eq!(ParentKind::Execution.child_kind(), ItemKind::DeployItem);
        assert_eq!(ParentKind::Installation.child_kind(), ItemKind::Installation);
        assert_eq!(
            ParentKind::Execution.default_completion_policy(),
            CompletionPolicy::AllSucceeded
        );
        assert_eq!("Execution".parse::<ParentKind>(), Ok(ParentKind::Execution));
        assert!("DeployItem".parse::<ParentKind>().is_err());
    }
}
