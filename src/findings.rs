use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Confidence attached to a finding; `High` sorts greatest.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Priority {
    Low,
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        };
        f.write_str(label)
    }
}

/// Method a finding is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct MethodId {
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// One pattern match.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Finding {
    pub(crate) pattern_id: &'static str,
    pub(crate) priority: Priority,
    pub(crate) class_name: String,
    /// `None` for class-level findings.
    pub(crate) method: Option<MethodId>,
    pub(crate) line: Option<u32>,
    pub(crate) offset: Option<u32>,
    pub(crate) message: String,
    /// Free-form `key=value` notes such as the field or callee involved.
    pub(crate) annotations: Vec<String>,
    pub(crate) artifact_index: i64,
}

impl Finding {
    pub(crate) fn annotate(mut self, annotation: impl Into<String>) -> Self {
        self.annotations.push(annotation.into());
        self
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Class-local buffer of findings. Nothing reaches a sink before [`flush`].
///
/// [`flush`]: FindingAccumulator::flush
#[derive(Debug, Default)]
pub(crate) struct FindingAccumulator {
    pending: Vec<Finding>,
}

impl FindingAccumulator {
    pub(crate) fn record(&mut self, finding: Finding) {
        self.pending.push(finding);
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Position to roll back to if the current method turns out unanalysable.
    pub(crate) fn mark(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn rollback(&mut self, mark: usize) {
        self.pending.truncate(mark);
    }

    /// Drain the buffer, collapsing findings that share
    /// `(pattern, method, line)` into the highest-priority one. First-seen
    /// order is kept.
    pub(crate) fn flush(&mut self) -> Vec<Finding> {
        let mut kept: Vec<Finding> = Vec::with_capacity(self.pending.len());
        let mut index_by_key = HashMap::new();
        for finding in self.pending.drain(..) {
            let key = (finding.pattern_id, finding.method.clone(), finding.line);
            match index_by_key.get(&key) {
                Some(&index) => {
                    let existing: &mut Finding = &mut kept[index];
                    if finding.priority > existing.priority {
                        *existing = finding;
                    }
                }
                None => {
                    index_by_key.insert(key, kept.len());
                    kept.push(finding);
                }
            }
        }
        kept
    }
}

/// Destination for flushed findings; shared by every worker.
pub(crate) trait FindingSink: Sync {
    fn accept(&self, findings: Vec<Finding>);
}

/// Sink that appends under a lock and drops findings below `min_priority`.
pub(crate) struct CollectingSink {
    min_priority: Priority,
    findings: Mutex<Vec<Finding>>,
}

impl CollectingSink {
    pub(crate) fn new(min_priority: Priority) -> Self {
        Self {
            min_priority,
            findings: Mutex::new(Vec::new()),
        }
    }

    /// Collected findings in a deterministic order independent of scheduling.
    pub(crate) fn into_findings(self) -> Vec<Finding> {
        let mut findings = self
            .findings
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        findings.sort_by(|a, b| {
            (a.artifact_index, &a.class_name, &a.method, a.line, a.pattern_id, a.offset).cmp(&(
                b.artifact_index,
                &b.class_name,
                &b.method,
                b.line,
                b.pattern_id,
                b.offset,
            ))
        });
        findings
    }
}

impl FindingSink for CollectingSink {
    fn accept(&self, findings: Vec<Finding>) {
        let min_priority = self.min_priority;
        let mut guard = self.findings.lock().unwrap_or_else(PoisonError::into_inner);
        guard.extend(
            findings
                .into_iter()
                .filter(|finding| finding.priority >= min_priority),
        );
    }
}
