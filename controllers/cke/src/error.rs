//! Controller-specific error types.
//!
//! `ControllerError` is what the leader loop, the KV gateway and the HTTP
//! surface deal in. `CommandError` is what a single command returns; the
//! executor turns it into the error message of the operation record.

use cluster_model::ModelError;
use host_client::HostError;
use kv_client::KvError;
use thiserror::Error;

/// Errors that can occur in the CKE controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Replicated KV store error
    #[error("KV error: {0}")]
    Kv(#[from] KvError),

    /// Host (ssh / container engine) error
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// A command of the executing plan failed
    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    /// Compare-and-swap precondition failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Expected key or object is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// The leader guard no longer holds
    #[error("Leadership lost")]
    LeadershipLost,

    /// Invalid configuration (config file, flags or cluster document)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// X.509 generation or parsing failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Work abandoned because of shutdown or an admin request
    #[error("Cancelled")]
    Cancelled,

    /// HTTP surface error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<ModelError> for ControllerError {
    fn from(e: ModelError) -> Self {
        ControllerError::InvalidConfig(e.to_string())
    }
}

impl From<rcgen::RcgenError> for ControllerError {
    fn from(e: rcgen::RcgenError) -> Self {
        ControllerError::Certificate(e.to_string())
    }
}

/// Coarse classification used for logging, metrics and HTTP status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// CAS precondition failed
    Conflict,
    /// Missing key or object
    NotFound,
    /// Store or host could not be reached in time
    Transport,
    /// A command failed
    Command,
    /// This instance is no longer the leader
    LeadershipLost,
    /// Bad configuration
    Config,
    /// Shutdown or admin cancel
    Cancelled,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transport => "transport",
            ErrorKind::Command => "command",
            ErrorKind::LeadershipLost => "leadership_lost",
            ErrorKind::Config => "config",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl ControllerError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Kv(KvError::Conflict(_)) | ControllerError::Conflict(_) => ErrorKind::Conflict,
            ControllerError::Kv(KvError::NotFound(_)) | ControllerError::NotFound(_) => ErrorKind::NotFound,
            ControllerError::Kv(KvError::LeaseExpired(_)) | ControllerError::LeadershipLost => {
                ErrorKind::LeadershipLost
            }
            ControllerError::Kv(KvError::Cancelled) | ControllerError::Cancelled => ErrorKind::Cancelled,
            ControllerError::Kv(e) if e.is_transport() => ErrorKind::Transport,
            ControllerError::Host(e) if e.is_connection() => ErrorKind::Transport,
            ControllerError::Command(e) if e.is_leadership_lost() => ErrorKind::LeadershipLost,
            ControllerError::Command(CommandError::Cancelled) => ErrorKind::Cancelled,
            ControllerError::Command(_) => ErrorKind::Command,
            ControllerError::InvalidConfig(_) => ErrorKind::Config,
            _ => ErrorKind::Internal,
        }
    }
}

/// Errors returned by a single command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Failure on one node of a fan-out
    #[error("{address}: {source}")]
    Node {
        /// Node address
        address: String,
        /// Underlying failure
        #[source]
        source: Box<CommandError>,
    },

    /// Host operation failed
    #[error("{0}")]
    Host(#[from] HostError),

    /// KV or etcd member operation failed
    #[error("{0}")]
    Kv(#[from] KvError),

    /// Controller storage or vault failure
    #[error("{0}")]
    Storage(Box<ControllerError>),

    /// Certificate could not be produced
    #[error("certificate: {0}")]
    Certificate(String),

    /// Generic failure with a message
    #[error("{0}")]
    Failed(String),

    /// Command exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Command was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl From<ControllerError> for CommandError {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::Cancelled => CommandError::Cancelled,
            ControllerError::Command(inner) => inner,
            other => CommandError::Storage(Box::new(other)),
        }
    }
}

impl CommandError {
    /// Attach a node address, leaving cancellation and existing node context alone
    pub fn on_node(address: &str, error: CommandError) -> Self {
        match error {
            CommandError::Cancelled | CommandError::Node { .. } => error,
            other => CommandError::Node {
                address: address.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Whether the failure is (or wraps) a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            CommandError::Cancelled => true,
            CommandError::Node { source, .. } => source.is_cancelled(),
            CommandError::Storage(e) => matches!(**e, ControllerError::Cancelled),
            _ => false,
        }
    }

    /// Whether the failure came from a leader guard that no longer holds
    pub fn is_leadership_lost(&self) -> bool {
        match self {
            CommandError::Node { source, .. } => source.is_leadership_lost(),
            CommandError::Storage(e) => matches!(**e, ControllerError::LeadershipLost),
            CommandError::Kv(KvError::LeaseExpired(_)) => true,
            _ => false,
        }
    }
}
