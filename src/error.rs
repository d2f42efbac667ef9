// File: error.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaceError {
    #[error("address resolution failed for {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("{host} resolves to {available} addresses, need {required} for connect_mode=different")]
    InsufficientAddresses {
        host: String,
        available: usize,
        required: usize,
    },

    #[error("transport error while {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("{barrier} barrier did not fill at position {position}")]
    BarrierTimeout {
        barrier: &'static str,
        position: usize,
    },

    #[error("callback failed: {reason}")]
    Callback { reason: String },

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("run aborted: {reason}")]
    Aborted { reason: String },
}

impl RaceError {
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        RaceError::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        RaceError::Protocol {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        RaceError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> RaceErrorKind {
        match self {
            RaceError::Resolution { .. } | RaceError::InsufficientAddresses { .. } => {
                RaceErrorKind::ResolutionFailure
            }
            RaceError::Transport { .. } => RaceErrorKind::TransportFailure,
            RaceError::Protocol { .. } => RaceErrorKind::ProtocolFailure,
            RaceError::BarrierTimeout { .. } => RaceErrorKind::BarrierTimeout,
            RaceError::Callback { .. } => RaceErrorKind::CallbackFailure,
            RaceError::Configuration { .. } => RaceErrorKind::ConfigurationFailure,
            RaceError::Aborted { .. } => RaceErrorKind::Aborted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RaceErrorKind {
    ResolutionFailure,
    TransportFailure,
    ProtocolFailure,
    BarrierTimeout,
    CallbackFailure,
    ConfigurationFailure,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub kind: RaceErrorKind,
    pub message: String,
}

impl From<&RaceError> for FailureRecord {
    fn from(err: &RaceError) -> Self {
        FailureRecord {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<RaceError> for FailureRecord {
    fn from(err: RaceError) -> Self {
        FailureRecord::from(&err)
    }
}
