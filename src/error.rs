//! Error taxonomy shared by every validator and the core facade
//!
//! Each variant carries a short human-readable description. Only the
//! tag and the description cross the RPC boundary.

use serde::Serialize;
use thiserror::Error;

/// Reasons a block, transaction or administrative request is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("malformed structure: {0}")]
    MalformedStructure(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("double spend: {0}")]
    DoubleSpend(String),
    #[error("fee below minimum: {0}")]
    BelowMinFee(String),
    #[error("lock time not reached: {0}")]
    LockTimeNotReached(String),
    #[error("amount overflow: {0}")]
    Overflow(String),
    #[error("invalid proof of work: {0}")]
    InvalidProofOfWork(String),
    #[error("invalid difficulty: {0}")]
    InvalidDifficulty(String),
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(String),
    #[error("size exceeded: {0}")]
    SizeExceeded(String),
    #[error("stale parent: {0}")]
    StaleParent(String),
    #[error("unknown parent: {0}")]
    UnknownParent(String),
    #[error("storage corruption: {0}")]
    StorageCorruption(String),
    #[error("rollback refused: {0}")]
    RollbackRefused(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

/// Fieldless tag of a [`CoreError`], stable across the RPC boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    MalformedStructure,
    InvalidSignature,
    DoubleSpend,
    BelowMinFee,
    LockTimeNotReached,
    Overflow,
    InvalidProofOfWork,
    InvalidDifficulty,
    TimestampOutOfRange,
    SizeExceeded,
    StaleParent,
    UnknownParent,
    StorageCorruption,
    RollbackRefused,
    AlreadyExists,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::MalformedStructure(_) => ErrorKind::MalformedStructure,
            CoreError::InvalidSignature(_) => ErrorKind::InvalidSignature,
            CoreError::DoubleSpend(_) => ErrorKind::DoubleSpend,
            CoreError::BelowMinFee(_) => ErrorKind::BelowMinFee,
            CoreError::LockTimeNotReached(_) => ErrorKind::LockTimeNotReached,
            CoreError::Overflow(_) => ErrorKind::Overflow,
            CoreError::InvalidProofOfWork(_) => ErrorKind::InvalidProofOfWork,
            CoreError::InvalidDifficulty(_) => ErrorKind::InvalidDifficulty,
            CoreError::TimestampOutOfRange(_) => ErrorKind::TimestampOutOfRange,
            CoreError::SizeExceeded(_) => ErrorKind::SizeExceeded,
            CoreError::StaleParent(_) => ErrorKind::StaleParent,
            CoreError::UnknownParent(_) => ErrorKind::UnknownParent,
            CoreError::StorageCorruption(_) => ErrorKind::StorageCorruption,
            CoreError::RollbackRefused(_) => ErrorKind::RollbackRefused,
            CoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
        }
    }

    /// Short description without the tag prefix
    pub fn detail(&self) -> &str {
        match self {
            CoreError::MalformedStructure(s)
            | CoreError::InvalidSignature(s)
            | CoreError::DoubleSpend(s)
            | CoreError::BelowMinFee(s)
            | CoreError::LockTimeNotReached(s)
            | CoreError::Overflow(s)
            | CoreError::InvalidProofOfWork(s)
            | CoreError::InvalidDifficulty(s)
            | CoreError::TimestampOutOfRange(s)
            | CoreError::SizeExceeded(s)
            | CoreError::StaleParent(s)
            | CoreError::UnknownParent(s)
            | CoreError::StorageCorruption(s)
            | CoreError::RollbackRefused(s)
            | CoreError::AlreadyExists(s) => s,
        }
    }

    /// Only storage corruption stops the node from accepting writes
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::StorageCorruption(_))
    }

    /// True when the submitter provably sent invalid data. Races such as
    /// a stale parent, a missing parent or a duplicate are not misbehavior.
    pub fn is_peer_misbehavior(&self) -> bool {
        !matches!(
            self,
            CoreError::StaleParent(_)
                | CoreError::UnknownParent(_)
                | CoreError::AlreadyExists(_)
                | CoreError::StorageCorruption(_)
                | CoreError::RollbackRefused(_)
                | CoreError::LockTimeNotReached(_)
        )
    }
}

impl ErrorKind {
    /// JSON-RPC error code for this kind
    pub fn rpc_code(self) -> i32 {
        match self {
            ErrorKind::MalformedStructure => -1,
            ErrorKind::InvalidSignature => -2,
            ErrorKind::DoubleSpend => -3,
            ErrorKind::BelowMinFee => -4,
            ErrorKind::LockTimeNotReached => -5,
            ErrorKind::Overflow => -6,
            ErrorKind::InvalidProofOfWork => -7,
            ErrorKind::InvalidDifficulty => -8,
            ErrorKind::TimestampOutOfRange => -9,
            ErrorKind::SizeExceeded => -10,
            ErrorKind::StaleParent => -11,
            ErrorKind::UnknownParent => -12,
            ErrorKind::StorageCorruption => -13,
            ErrorKind::RollbackRefused => -14,
            ErrorKind::AlreadyExists => -15,
        }
    }
}

/// Result type used across the core
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_corruption_is_fatal() {
        assert!(CoreError::StorageCorruption("x".into()).is_fatal());
        assert!(!CoreError::DoubleSpend("x".into()).is_fatal());
    }

    #[test]
    fn test_races_are_not_misbehavior() {
        assert!(!CoreError::StaleParent("x".into()).is_peer_misbehavior());
        assert!(!CoreError::AlreadyExists("x".into()).is_peer_misbehavior());
        assert!(CoreError::InvalidProofOfWork("x".into()).is_peer_misbehavior());
    }

    #[test]
    fn test_detail_strips_tag() {
        let err = CoreError::BelowMinFee("fee 99 < 100".into());
        assert_eq!(err.detail(), "fee 99 < 100");
        assert_eq!(err.to_string(), "fee below minimum: fee 99 < 100");
        assert_eq!(err.kind(), ErrorKind::BelowMinFee);
    }
}
