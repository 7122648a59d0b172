use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuillErrorCode {
    NotCommitted,
    TransactionTooOld,
    CommitUnknownResult,
    CollectionMetadataChanged,
    MetadataChangedNonisolated,
    IndexWrongBuildId,
    IndexAlreadyExists,
    IndexNameTaken,
    UnsupportedOperation,
    Decode,
    InvalidPlan,
    EndOfStream,
    OperationCancelled,
}

impl QuillErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            QuillErrorCode::NotCommitted => "not_committed",
            QuillErrorCode::TransactionTooOld => "transaction_too_old",
            QuillErrorCode::CommitUnknownResult => "commit_unknown_result",
            QuillErrorCode::CollectionMetadataChanged => "collection_metadata_changed",
            QuillErrorCode::MetadataChangedNonisolated => "metadata_changed_nonisolated",
            QuillErrorCode::IndexWrongBuildId => "index_wrong_build_id",
            QuillErrorCode::IndexAlreadyExists => "index_already_exists",
            QuillErrorCode::IndexNameTaken => "index_name_taken",
            QuillErrorCode::UnsupportedOperation => "unsupported_operation",
            QuillErrorCode::Decode => "decode",
            QuillErrorCode::InvalidPlan => "invalid_plan",
            QuillErrorCode::EndOfStream => "end_of_stream",
            QuillErrorCode::OperationCancelled => "operation_cancelled",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuillError {
    /// A conflicting write committed after this transaction's snapshot.
    #[error("transaction not committed: {0}")]
    NotCommitted(String),
    /// The transaction outlived its configured timeout.
    #[error("transaction too old")]
    TransactionTooOld,
    /// The commit may or may not have been applied. Never retried automatically.
    #[error("commit result unknown")]
    CommitUnknownResult,
    #[error("collection storage location changed during execution")]
    CollectionMetadataChanged,
    #[error("collection metadata changed in a way the plan cannot tolerate")]
    MetadataChangedNonisolated,
    #[error("index build id does not match the running build")]
    IndexWrongBuildId,
    #[error("index with the same key spec already exists: {0}")]
    IndexAlreadyExists(String),
    #[error("index name '{0}' is taken by an index with a different key spec")]
    IndexNameTaken(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    /// Control signal terminating a document stream. Never user-visible.
    #[error("end of stream")]
    EndOfStream,
    /// Control signal sent to the final sink after a checkpoint stop. Never
    /// escapes the engine.
    #[error("operation cancelled")]
    OperationCancelled,
}

impl QuillError {
    pub fn code(&self) -> QuillErrorCode {
        match self {
            QuillError::NotCommitted(_) => QuillErrorCode::NotCommitted,
            QuillError::TransactionTooOld => QuillErrorCode::TransactionTooOld,
            QuillError::CommitUnknownResult => QuillErrorCode::CommitUnknownResult,
            QuillError::CollectionMetadataChanged => QuillErrorCode::CollectionMetadataChanged,
            QuillError::MetadataChangedNonisolated => QuillErrorCode::MetadataChangedNonisolated,
            QuillError::IndexWrongBuildId => QuillErrorCode::IndexWrongBuildId,
            QuillError::IndexAlreadyExists(_) => QuillErrorCode::IndexAlreadyExists,
            QuillError::IndexNameTaken(_) => QuillErrorCode::IndexNameTaken,
            QuillError::UnsupportedOperation(_) => QuillErrorCode::UnsupportedOperation,
            QuillError::Decode(_) => QuillErrorCode::Decode,
            QuillError::InvalidPlan(_) => QuillErrorCode::InvalidPlan,
            QuillError::EndOfStream => QuillErrorCode::EndOfStream,
            QuillError::OperationCancelled => QuillErrorCode::OperationCancelled,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True for failures that a transaction-owning wrapper may hand to
    /// `on_error` and re-execute. `commit_unknown_result` is deliberately
    /// not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuillError::NotCommitted(_) | QuillError::TransactionTooOld
        )
    }
}
