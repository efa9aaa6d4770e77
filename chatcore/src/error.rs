use thiserror::Error;

/// Status code reported for a successful operation.
pub const SUCCESS: i32 = 0;

pub const INVALID_CONVERSATION: i32 = 39001;
pub const TASK_CANCELLED: i32 = 39002;
pub const LIST_NOT_READY: i32 = 39003;
pub const CONVERSATION_NOT_FOUND: i32 = 39004;
pub const TOO_MANY_FILES: i32 = 39005;

/// Result-level error of every exposed operation.
///
/// Transport failures are carried through as their opaque status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("invalid conversation parameter")]
    InvalidConversation,
    #[error("task was cancelled")]
    TaskCancelled,
    #[error("conversation list is not ready yet")]
    ListNotReady,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("too many files in one batch (max {max})")]
    TooManyFiles { max: usize },
    #[error("transport error (code {0})")]
    Transport(i32),
}

impl SyncError {
    pub fn code(&self) -> i32 {
        match self {
            SyncError::InvalidConversation => INVALID_CONVERSATION,
            SyncError::TaskCancelled => TASK_CANCELLED,
            SyncError::ListNotReady => LIST_NOT_READY,
            SyncError::ConversationNotFound => CONVERSATION_NOT_FOUND,
            SyncError::TooManyFiles { .. } => TOO_MANY_FILES,
            SyncError::Transport(code) => *code,
        }
    }

    /// Maps a raw status code back onto the taxonomy.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            SUCCESS => None,
            INVALID_CONVERSATION => Some(SyncError::InvalidConversation),
            TASK_CANCELLED => Some(SyncError::TaskCancelled),
            LIST_NOT_READY => Some(SyncError::ListNotReady),
            CONVERSATION_NOT_FOUND => Some(SyncError::ConversationNotFound),
            other => Some(SyncError::Transport(other)),
        }
    }
}

/// Collapses a result into its status code.
pub fn status_code<T>(result: &Result<T, SyncError>) -> i32 {
    match result {
        Ok(_) => SUCCESS,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_taxonomy() {
        assert_eq!(SyncError::from_code(SUCCESS), None);
        assert_eq!(
            SyncError::from_code(TASK_CANCELLED),
            Some(SyncError::TaskCancelled)
        );
        assert_eq!(SyncError::from_code(30001), Some(SyncError::Transport(30001)));
        assert_eq!(SyncError::Transport(30001).code(), 30001);
    }

    #[test]
    fn test_status_code_of_result() {
        let ok: Result<(), SyncError> = Ok(());
        let err: Result<(), SyncError> = Err(SyncError::ListNotReady);
        assert_eq!(status_code(&ok), SUCCESS);
        assert_eq!(status_code(&err), LIST_NOT_READY);
    }
}
