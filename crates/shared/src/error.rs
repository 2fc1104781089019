use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    domain::{ConversationId, InboxId},
    protocol::InstallationRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SignerUnavailable,
    InstallationLimitExceeded,
    Unreachable,
    RecipientNotRegistered,
    MembershipNotYetPublished,
    ProtocolCoreInstability,
    NotInitialized,
    InvalidRequest,
    Fatal,
    Unknown,
}

/// How the UI should render an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserFacingState {
    /// Still being retried; show a syncing indicator.
    Syncing,
    /// Needs a decision only the user can make.
    ActionRequired,
    /// Crypto core trouble; offer retry and "reset and re-authenticate".
    ConnectionIssue,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("no signer available to create a messaging identity")]
    SignerUnavailable,
    #[error("inbox {inbox_id} already has {} of {max} installations registered", installations.len())]
    InstallationLimitExceeded {
        inbox_id: InboxId,
        max: usize,
        installations: Vec<InstallationRef>,
    },
    #[error("messaging network unreachable: {0}")]
    Unreachable(String),
    #[error("recipient {0} is not registered on the messaging network")]
    RecipientNotRegistered(InboxId),
    #[error("group membership for conversation {0} is not yet published")]
    MembershipNotYetPublished(ConversationId),
    #[error("protocol core instability: {0}")]
    ProtocolCoreInstability(String),
    #[error("messaging session is not initialized")]
    NotInitialized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0}; restart the client process")]
    Fatal(String),
    #[error("{0}")]
    Unknown(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::SignerUnavailable => ErrorCode::SignerUnavailable,
            ProtocolError::InstallationLimitExceeded { .. } => ErrorCode::InstallationLimitExceeded,
            ProtocolError::Unreachable(_) => ErrorCode::Unreachable,
            ProtocolError::RecipientNotRegistered(_) => ErrorCode::RecipientNotRegistered,
            ProtocolError::MembershipNotYetPublished(_) => ErrorCode::MembershipNotYetPublished,
            ProtocolError::ProtocolCoreInstability(_) => ErrorCode::ProtocolCoreInstability,
            ProtocolError::NotInitialized => ErrorCode::NotInitialized,
            ProtocolError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ProtocolError::Fatal(_) => ErrorCode::Fatal,
            ProtocolError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::Unreachable(_) | ProtocolError::MembershipNotYetPublished(_)
        )
    }

    pub fn user_facing(&self) -> UserFacingState {
        match self {
            ProtocolError::Unreachable(_) | ProtocolError::MembershipNotYetPublished(_) => {
                UserFacingState::Syncing
            }
            ProtocolError::ProtocolCoreInstability(_) => UserFacingState::ConnectionIssue,
            ProtocolError::Fatal(_) => UserFacingState::Fatal,
            ProtocolError::SignerUnavailable
            | ProtocolError::InstallationLimitExceeded { .. }
            | ProtocolError::RecipientNotRegistered(_)
            | ProtocolError::NotInitialized
            | ProtocolError::InvalidRequest(_)
            | ProtocolError::Unknown(_) => UserFacingState::ActionRequired,
        }
    }
}

/// Serializable error shape handed to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub state: UserFacingState,
    pub message: String,
}

impl From<&ProtocolError> for ApiError {
    fn from(value: &ProtocolError) -> Self {
        Self {
            code: value.code(),
            state: value.user_facing(),
            message: value.to_string(),
        }
    }
}
