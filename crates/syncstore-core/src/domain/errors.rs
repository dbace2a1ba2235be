//! エラー型と分類
//!
//! 回復可能な失敗はすべて [`SyncError`] として、最寄りの `Store` に載る。
//!
//! # ErrorKind
//! - Transient: ネットワーク起因。ユーザー操作の再 refresh で直る可能性あり
//! - Permanent: payload が期待する形をしていない
//! - Infrastructure: 永続ストアが書き込みを拒否した
//! - Cancelled: 購読者がいなくなり中断された

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
    Cancelled,
}

/// リモート取得の失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("device is offline")]
    Offline,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// 永続ストアの失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("record serialization error: {0}")]
    Serde(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("constraint violated on {entity}:{id}: {message}")]
    Constraint {
        entity: String,
        id: String,
        message: String,
    },

    #[error("record not found: {entity}:{id}")]
    NotFound { entity: String, id: String },
}

/// `Store::error` で購読者に見えるエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(#[from] FetchError),

    #[error("could not decode {entity} payload: {message}")]
    Decode { entity: String, message: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistError),

    #[error("refresh was cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn decode(entity: &str, error: impl std::fmt::Display) -> Self {
        SyncError::Decode {
            entity: entity.to_string(),
            message: error.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) => ErrorKind::Transient,
            SyncError::Decode { .. } => ErrorKind::Permanent,
            SyncError::Persistence(_) => ErrorKind::Infrastructure,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SyncError::Network(FetchError::Offline), ErrorKind::Transient)]
    #[case(SyncError::decode("course", "missing field `id`"), ErrorKind::Permanent)]
    #[case(SyncError::Persistence(PersistError::Storage("disk full".into())), ErrorKind::Infrastructure)]
    #[case(SyncError::Cancelled, ErrorKind::Cancelled)]
    fn errors_are_classified(#[case] error: SyncError, #[case] kind: ErrorKind) {
        assert_eq!(error.kind(), kind);
    }

    #[test]
    fn messages_name_the_failing_layer() {
        let error: SyncError = FetchError::Status {
            status: 503,
            message: "maintenance".into(),
        }
        .into();
        assert_eq!(
            error.to_string(),
            "network error: server responded with status 503: maintenance"
        );
    }
}
