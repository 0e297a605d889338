//! Typed error taxonomy for the per-epoch control loop.
//!
//! None of these are fatal once the loop is running: the epoch driver logs
//! them, bumps a metric labelled with [`kind`](TransportError::kind), and
//! moves on. Startup paths wrap them in `anyhow` instead.

use thiserror::Error;

use crate::fabric::SwitchId;
use crate::sched::GroupKey;

/// Controller unreachable, timed out, or answered with something unusable.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("requesting {path}: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} from {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("decoding response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed payload from {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("encoding request body: {0}")]
    Encode(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { source, .. } if source.is_timeout() => "timeout",
            Self::Request { .. } => "request",
            Self::Status { .. } => "status",
            Self::Decode { .. } => "decode",
            Self::Malformed { .. } => "malformed",
            Self::Encode(_) => "encode",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A single flow or port record is missing a field or carries a bad value.
/// The record is dropped, the rest of the payload is kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{record}: missing field {field}")]
    MissingField {
        record: &'static str,
        field: &'static str,
    },

    #[error("{record}: invalid {field} value {value:?}")]
    InvalidField {
        record: &'static str,
        field: &'static str,
        value: String,
    },
}

impl SchemaError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
        }
    }
}

/// Topology does not cover a group key this epoch.
#[derive(Error, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigurationError {
    #[error("no candidate ports for group key {0}")]
    EmptyCandidateSet(GroupKey),

    #[error("group key {0} is not covered by the topology")]
    UnknownGroupKey(GroupKey),

    #[error("switch {0} is not in the topology")]
    UnknownSwitch(SwitchId),
}

impl ConfigurationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyCandidateSet(_) => "empty_candidate_set",
            Self::UnknownGroupKey(_) => "unknown_group_key",
            Self::UnknownSwitch(_) => "unknown_switch",
        }
    }
}
