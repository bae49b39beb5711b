//! Operation records
//!
//! A `Record` is the durable log entry describing one executed plan. The
//! leader opens it in the `Running` state and closes it exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Human-visible description of one command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// Commander name, e.g. `image-pull`
    pub name: String,

    /// What the command acts on (nodes, image, certificate target, ...)
    pub target: String,
}

impl CommandDescriptor {
    /// Build a descriptor
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.target)
    }
}

/// Record state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Plan is executing
    #[default]
    Running,
    /// All commands succeeded
    Completed,
    /// Execution was cancelled (shutdown, admin request, orphaned by a lost leader)
    Cancelled,
    /// A command failed
    Error,
}

impl RecordStatus {
    /// Whether the record has been closed
    pub fn is_final(&self) -> bool {
        !matches!(self, RecordStatus::Running)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordStatus::Running => "running",
            RecordStatus::Completed => "completed",
            RecordStatus::Cancelled => "cancelled",
            RecordStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persisted log entry for one plan execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Strictly increasing identifier assigned by the leader
    pub id: i64,

    /// Operation (plan) name
    pub operation: String,

    /// Commands of the plan, in execution order
    pub commands: Vec<CommandDescriptor>,

    /// Current state
    pub status: RecordStatus,

    /// When execution began
    pub started_at: DateTime<Utc>,

    /// When the record was closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Error message when `status` is `error`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Session id of the leader that opened the record
    #[serde(default)]
    pub leader: String,
}

impl Record {
    /// Open a running record. The id is assigned by the KV gateway.
    pub fn new(
        operation: impl Into<String>,
        commands: Vec<CommandDescriptor>,
        leader: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            operation: operation.into(),
            commands,
            status: RecordStatus::Running,
            started_at: now,
            ended_at: None,
            error: String::new(),
            leader: leader.into(),
        }
    }

    /// Close as completed
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.close(RecordStatus::Completed, String::new(), now);
    }

    /// Close as failed with a human-readable message
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.close(RecordStatus::Error, error.into(), now);
    }

    /// Close as cancelled
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.close(RecordStatus::Cancelled, String::new(), now);
    }

    fn close(&mut self, status: RecordStatus, error: String, now: DateTime<Utc>) {
        // A closed record is immutable.
        if self.status.is_final() {
            return;
        }
        self.status = status;
        self.error = error;
        self.ended_at = Some(now);
    }
}
