// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

/// Errors surfaced by a coordination backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no node at {0}")]
    NoNode(String),
    #[error("node already exists at {0}")]
    NodeExists(String),
    #[error("connection to the coordinator was lost")]
    ConnectionLoss,
    #[error("coordinator session expired")]
    SessionExpired,
    #[error("coordinator error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The coordinator cannot resolve a name. Raised at lookup time.
    #[error("failed to resolve {0}")]
    LookupFailure(String),
    /// The coordinator rejected a registration or timed out. The container shuts down.
    #[error("registration of {0} failed: {1}")]
    RegistrationFailure(String, String),
    #[error("invalid version '{0}': {1}")]
    InvalidVersion(String, String),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("failed to serialize instance data: {0}")]
    Serialization(String),
}
