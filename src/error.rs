//! Error types for the module store.

use crate::types::{Hash, ModulePath};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    PathNotFound(ModulePath),

    #[error("Content not found: {0}")]
    ContentNotFound(Hash),

    #[error("Commit not found: {0}")]
    CommitNotFound(Hash),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("No such route: {0}")]
    RouteNotFound(String),

    #[error("Branch has no commits: {0}")]
    NoCommits(String),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Branch is protected: {0}")]
    ProtectedBranch(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid branch name: {0}")]
    InvalidBranchName(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: Hash, got: Hash },
}

/// Coarse error classes surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Malformed,
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Malformed => 400,
            ErrorKind::Internal => 500,
        }
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::PathNotFound(_)
            | StoreError::ContentNotFound(_)
            | StoreError::CommitNotFound(_)
            | StoreError::BranchNotFound(_)
            | StoreError::NoCommits(_)
            | StoreError::RouteNotFound(_) => ErrorKind::NotFound,
            StoreError::BranchExists(_) | StoreError::ProtectedBranch(_) => ErrorKind::Conflict,
            StoreError::Unauthorized(_) => ErrorKind::Unauthorized,
            StoreError::InvalidPath(_)
            | StoreError::InvalidHash(_)
            | StoreError::InvalidBranchName(_)
            | StoreError::InvalidRequest(_) => ErrorKind::Malformed,
            StoreError::Io(_)
            | StoreError::Serialization(_)
            | StoreError::Deserialization(_)
            | StoreError::Corruption(_)
            | StoreError::Locked
            | StoreError::NotInitialized
            | StoreError::InvalidFormat(_)
            | StoreError::ChecksumMismatch { .. }
            | StoreError::HashMismatch { .. } => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
