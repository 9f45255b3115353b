//! Shared types used across modules
//!
//! The classification triple, the operation lifecycle and the reasoning
//! records that every component of the pipeline reads or writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the result of an operation goes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Stream,
    File,
    Process,
}

/// Who consumes the result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Consumer {
    Human,
    Machine,
}

/// What running the operation means
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Semantics {
    Read,
    Interpret,
    Execute,
}

impl Destination {
    pub const ALL: [Destination; 3] = [Destination::Stream, Destination::File, Destination::Process];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Stream => "stream",
            Destination::File => "file",
            Destination::Process => "process",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "stream" => Some(Destination::Stream),
            "file" => Some(Destination::File),
            "process" => Some(Destination::Process),
            _ => None,
        }
    }
}

impl Consumer {
    pub const ALL: [Consumer; 2] = [Consumer::Human, Consumer::Machine];

    pub fn as_str(&self) -> &'static str {
        match self {
            Consumer::Human => "human",
            Consumer::Machine => "machine",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" => Some(Consumer::Human),
            "machine" => Some(Consumer::Machine),
            _ => None,
        }
    }
}

impl Semantics {
    pub const ALL: [Semantics; 3] = [Semantics::Read, Semantics::Interpret, Semantics::Execute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Semantics::Read => "read",
            Semantics::Interpret => "interpret",
            Semantics::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "read" => Some(Semantics::Read),
            "interpret" => Some(Semantics::Interpret),
            "execute" => Some(Semantics::Execute),
            _ => None,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for Semantics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The classification triple
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Classification {
    pub destination: Destination,
    pub consumer: Consumer,
    pub semantics: Semantics,
}

impl Classification {
    pub fn new(destination: Destination, consumer: Consumer, semantics: Semantics) -> Self {
        Self { destination, consumer, semantics }
    }

    /// Parse `destination/consumer/semantics`, e.g. `file/human/execute`
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(['/', ',']);
        let destination = Destination::parse(parts.next()?)?;
        let consumer = Consumer::parse(parts.next()?)?;
        let semantics = Semantics::parse(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(destination, consumer, semantics))
    }

    /// Pure reads streamed to a human have no side effects at all
    pub fn is_pure_read(&self) -> bool {
        self.semantics == Semantics::Read
    }

    pub fn is_mutating(&self) -> bool {
        self.semantics == Semantics::Execute
            && matches!(self.destination, Destination::File | Destination::Process)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.destination, self.consumer, self.semantics)
    }
}

/// One of the three classification axes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Destination,
    Consumer,
    Semantics,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::Destination, Axis::Consumer, Axis::Semantics];
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Destination => write!(f, "destination"),
            Axis::Consumer => write!(f, "consumer"),
            Axis::Semantics => write!(f, "semantics"),
        }
    }
}

/// A rejected candidate on one axis, kept for training-set construction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alternative {
    pub axis: Axis,
    pub candidate: String,
    pub confidence: f64,
}

/// Reasoning for a single axis
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AxisReasoning {
    /// Indicators that matched for the winning candidate
    pub indicators: Vec<String>,
    pub confidence: f64,
    pub explanation: String,
}

/// Full reasoning for one classification pass. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationReasoning {
    pub destination: AxisReasoning,
    pub consumer: AxisReasoning,
    pub semantics: AxisReasoning,
    pub alternatives: Vec<Alternative>,
    /// Name of the strategy that produced this reasoning
    pub strategy: String,
    /// Set when a prior requester correction overrode the rule outcome
    pub corrected_from: Option<Classification>,
}

impl ClassificationReasoning {
    pub fn axis(&self, axis: Axis) -> &AxisReasoning {
        match axis {
            Axis::Destination => &self.destination,
            Axis::Consumer => &self.consumer,
            Axis::Semantics => &self.semantics,
        }
    }
}

/// Operation lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Classifying,
    AwaitingApproval,
    Executing,
    Complete,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Classifying => "classifying",
            OperationStatus::AwaitingApproval => "awaiting_approval",
            OperationStatus::Executing => "executing",
            OperationStatus::Complete => "complete",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "classifying" => Some(OperationStatus::Classifying),
            "awaiting_approval" => Some(OperationStatus::AwaitingApproval),
            "executing" => Some(OperationStatus::Executing),
            "complete" => Some(OperationStatus::Complete),
            "failed" => Some(OperationStatus::Failed),
            "cancelled" => Some(OperationStatus::Cancelled),
            _ => None,
        }
    }

    /// Edges of the lifecycle graph.
    ///
    /// `classifying -> failed` covers classification failure and
    /// `awaiting_approval -> failed` covers verification failure.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Classifying, AwaitingApproval)
                | (Classifying, Failed)
                | (AwaitingApproval, Executing)
                | (AwaitingApproval, Cancelled)
                | (AwaitingApproval, Failed)
                | (Executing, Complete)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Complete | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why an operation ended in `failed`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Classification,
    Verification,
    Execution,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Classification => "classification",
            FailureKind::Verification => "verification",
            FailureKind::Execution => "execution",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "classification" => Some(FailureKind::Classification),
            "verification" => Some(FailureKind::Verification),
            "execution" => Some(FailureKind::Execution),
            _ => None,
        }
    }
}

/// A single directive moving through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub directive: String,
    pub requester: String,
    pub classification: Option<Classification>,
    pub confidence: f64,
    pub status: OperationStatus,
    pub failure: Option<FailureKind>,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub request_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(directive: &str, requester: &str, request_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            directive: directive.to_string(),
            requester: requester.to_string(),
            classification: None,
            confidence: 0.0,
            status: OperationStatus::Classifying,
            failure: None,
            parent_id: None,
            children: Vec::new(),
            request_hash,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_composite(&self) -> bool {
        !self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_parse_and_display() {
        let c = Classification::parse("file/human/execute").unwrap();
        assert_eq!(c.destination, Destination::File);
        assert_eq!(c.consumer, Consumer::Human);
        assert_eq!(c.semantics, Semantics::Execute);
        assert_eq!(c.to_string(), "file/human/execute");

        assert!(Classification::parse("file/human").is_none());
        assert!(Classification::parse("disk/human/read").is_none());
        assert!(Classification::parse("file/human/read/extra").is_none());
    }

    #[test]
    fn test_status_graph() {
        use OperationStatus::*;
        assert!(Classifying.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(Executing));
        assert!(AwaitingApproval.can_transition_to(Cancelled));
        assert!(Executing.can_transition_to(Complete));
        assert!(Executing.can_transition_to(Failed));

        assert!(!Classifying.can_transition_to(Executing));
        assert!(!Complete.can_transition_to(Executing));
        assert!(!Cancelled.can_transition_to(AwaitingApproval));
        assert!(!Executing.can_transition_to(Cancelled));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for s in ["classifying", "awaiting_approval", "executing", "complete", "failed", "cancelled"] {
            assert_eq!(OperationStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(OperationStatus::parse("running").is_none());
    }
}
