// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency graph of the work items owned by one parent.
//!
//! Items live in an arena (`Vec<WorkItem>`) and refer to each other by
//! name; the graph resolves names to indices once. Validation reports every
//! problem it finds instead of stopping at the first one, except for
//! duplicate names, which make the remaining checks meaningless.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::phase::Phase;
use crate::work_item::{ParentKind, WorkItem};

/// When a finished dependency lets its dependents start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPolicy {
    /// Every dependency must have succeeded.
    #[default]
    AllSucceeded,
    /// Every dependency must have finished, successfully or not.
    AnyTerminal,
}

impl CompletionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllSucceeded => "all-succeeded",
            Self::AnyTerminal => "any-terminal",
        }
    }

    /// Whether `dependency` finished `job_id` in a way this policy accepts.
    pub fn is_satisfied_by(self, dependency: &WorkItem, job_id: &str) -> bool {
        if dependency.job_id != job_id || !dependency.is_finished() {
            return false;
        }
        match self {
            Self::AllSucceeded => dependency.phase == Phase::Succeeded,
            Self::AnyTerminal => true,
        }
    }
}

impl fmt::Display for CompletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all-succeeded" | "AllSucceeded" => Ok(Self::AllSucceeded),
            "any-terminal" | "AnyTerminal" => Ok(Self::AnyTerminal),
            other => Err(format!(
                "unknown completion policy '{}' (expected all-succeeded or any-terminal)",
                other
            )),
        }
    }
}

/// Completion policy per parent kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPolicies {
    pub installation: CompletionPolicy,
    pub execution: CompletionPolicy,
}

impl Default for CompletionPolicies {
    fn default() -> Self {
        Self {
            installation: ParentKind::Installation.default_completion_policy(),
            execution: ParentKind::Execution.default_completion_policy(),
        }
    }
}

impl CompletionPolicies {
    pub fn for_kind(&self, kind: ParentKind) -> CompletionPolicy {
        match kind {
            ParentKind::Installation => self.installation,
            ParentKind::Execution => self.execution,
        }
    }
}

/// Structural problems in a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GraphError {
    #[error("item name '{name}' is used more than once")]
    DuplicateName { name: String },

    #[error("item '{item}' depends on undefined item '{dependency}'")]
    UndefinedDependency { item: String, dependency: String },

    /// Names on the cycle, starting at the item that closes it.
    #[error("dependency cycle: {}", display_cycle(.cycle))]
    Cycle { cycle: Vec<String> },
}

fn display_cycle(cycle: &[String]) -> String {
    let mut out = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        out.push_str(" -> ");
        out.push_str(first);
    }
    out
}

/// Join graph errors into one message.
pub fn join_errors(errors: &[GraphError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Items bucketed by what the scheduler should do with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub running: Vec<usize>,
    pub succeeded: Vec<usize>,
    pub failed: Vec<usize>,
    /// Ready to be triggered for the current job.
    pub runnable: Vec<usize>,
    /// Waiting for other items.
    pub pending: Vec<usize>,
}

impl Classification {
    pub fn has_running_items(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn has_failed_items(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn has_runnable_items(&self) -> bool {
        !self.runnable.is_empty()
    }

    pub fn has_pending_items(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Nothing left to run and nothing failed.
    pub fn all_succeeded(&self) -> bool {
        self.running.is_empty()
            && self.failed.is_empty()
            && self.runnable.is_empty()
            && self.pending.is_empty()
    }
}

/// Arena of work items with a name index.
#[derive(Debug, Clone, Default)]
pub struct WorkItemGraph {
    items: Vec<WorkItem>,
    index: HashMap<String, usize>,
}

impl WorkItemGraph {
    pub fn new(items: Vec<WorkItem>) -> Self {
        let mut index = HashMap::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            index.entry(item.name.clone()).or_insert(i);
        }
        Self { items, index }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn item(&self, index: usize) -> &WorkItem {
        &self.items[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&WorkItem> {
        self.index_of(name).map(|i| &self.items[i])
    }

    pub fn into_items(self) -> Vec<WorkItem> {
        self.items
    }

    /// All structural errors; empty for a valid graph.
    pub fn validate(&self) -> Vec<GraphError> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        for item in &self.items {
            if !seen.insert(item.name.as_str()) && reported.insert(item.name.as_str()) {
                errors.push(GraphError::DuplicateName {
                    name: item.name.clone(),
                });
            }
        }
        if !errors.is_empty() {
            return errors;
        }

        for item in &self.items {
            for dependency in &item.depends_on {
                if !self.index.contains_key(dependency) {
                    errors.push(GraphError::UndefinedDependency {
                        item: item.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let mut done = vec![false; self.items.len()];
        let mut on_path = vec![false; self.items.len()];
        let mut path = Vec::new();
        for start in 0..self.items.len() {
            if !done[start] {
                self.find_cycles(start, &mut path, &mut on_path, &mut done, &mut errors);
            }
        }

        errors
    }

    fn find_cycles(
        &self,
        current: usize,
        path: &mut Vec<usize>,
        on_path: &mut [bool],
        done: &mut [bool],
        errors: &mut Vec<GraphError>,
    ) {
        path.push(current);
        on_path[current] = true;

        for dependency in &self.items[current].depends_on {
            let Some(&next) = self.index.get(dependency) else {
                continue;
            };
            if on_path[next] {
                if let Some(start) = path.iter().position(|&i| i == next) {
                    errors.push(GraphError::Cycle {
                        cycle: path[start..]
                            .iter()
                            .map(|&i| self.items[i].name.clone())
                            .collect(),
                    });
                }
                continue;
            }
            if !done[next] {
                self.find_cycles(next, path, on_path, done, errors);
            }
        }

        path.pop();
        on_path[current] = false;
        done[current] = true;
    }

    /// Indices in dependency order; ties go to the earlier item.
    pub fn topological_order(&self) -> Result<Vec<usize>, Vec<GraphError>> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut in_degree: Vec<usize> = self.items.iter().map(|i| i.depends_on.len()).collect();
        let dependents = self.dependents_table();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.items.len());
        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &dependent in &dependents[current] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        Ok(order)
    }

    /// Items that list `index` as a dependency.
    pub fn dependents(&self, index: usize) -> Vec<usize> {
        let name = &self.items[index].name;
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.depends_on.iter().any(|d| d == name))
            .map(|(i, _)| i)
            .collect()
    }

    // One entry per edge, so duplicated dependencies balance the in-degree.
    fn dependents_table(&self) -> Vec<Vec<usize>> {
        let mut table = vec![Vec::new(); self.items.len()];
        for (i, item) in self.items.iter().enumerate() {
            for dependency in &item.depends_on {
                if let Some(&d) = self.index.get(dependency) {
                    table[d].push(i);
                }
            }
        }
        table
    }

    /// Whether every dependency of `index` meets `policy` for `job_id`.
    pub fn dependencies_ready(
        &self,
        index: usize,
        job_id: &str,
        policy: CompletionPolicy,
    ) -> Result<bool, GraphError> {
        let item = &self.items[index];
        for dependency in &item.depends_on {
            let Some(&d) = self.index.get(dependency) else {
                return Err(GraphError::UndefinedDependency {
                    item: item.name.clone(),
                    dependency: dependency.clone(),
                });
            };
            if !policy.is_satisfied_by(&self.items[d], job_id) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether another item still depends on `index`.
    pub fn has_dependents(&self, index: usize) -> bool {
        let name = &self.items[index].name;
        self.items
            .iter()
            .any(|item| item.depends_on.iter().any(|d| d == name))
    }

    /// Bucket items for running `job_id` forward.
    pub fn classify(
        &self,
        job_id: &str,
        policy: CompletionPolicy,
    ) -> Result<Classification, GraphError> {
        let mut classification = Classification::default();
        for (i, item) in self.items.iter().enumerate() {
            if item.job_id == job_id {
                if !item.is_finished() {
                    classification.running.push(i);
                } else if item.phase == Phase::Succeeded {
                    classification.succeeded.push(i);
                } else {
                    classification.failed.push(i);
                }
            } else if self.dependencies_ready(i, job_id, policy)? {
                classification.runnable.push(i);
            } else {
                classification.pending.push(i);
            }
        }
        Ok(classification)
    }

    /// Bucket items for tearing the graph down under `job_id`.
    ///
    /// Deleted items leave the graph, so an item becomes deletable once no
    /// remaining item depends on it. Items that finished deleting count as
    /// running until they disappear.
    pub fn classify_for_delete(&self, job_id: &str) -> Classification {
        let mut classification = Classification::default();
        for (i, item) in self.items.iter().enumerate() {
            if item.job_id == job_id {
                if item.is_finished() && item.phase.is_failed() {
                    classification.failed.push(i);
                } else {
                    classification.running.push(i);
                }
            } else if self.has_dependents(i) {
                classification.pending.push(i);
            } else {
                classification.runnable.push(i);
            }
        }
        classification
    }
}
