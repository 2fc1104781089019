//! Maps raw protocol-library failures onto the engine's error taxonomy.
//!
//! This is the only place that knows what the underlying library's error
//! messages look like. Typed [`ProtocolError`]s anywhere in an error chain
//! win over text matching.

use serde::Serialize;
use shared::{
    domain::{ConversationId, InboxId},
    error::ProtocolError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    TransientNetwork,
    /// Not a fault: handed to the readiness reconciler.
    MembershipPropagation,
    ProtocolCoreInstability,
    InstallationLimit,
    Unknown,
}

// Checked in this order; the first table with a hit decides.
const INSTALLATION_PATTERNS: &[&str] = &[
    "too many installations",
    "installation limit",
    "cannot register a new installation",
];

const INSTABILITY_PATTERNS: &[&str] = &[
    "unreachable executed",
    "unreachable code",
    "panicked at",
    "memory access out of bounds",
    "recursive use of an object",
    "null pointer passed to rust",
    "already mutably borrowed",
    "already borrowed",
    "runtimeerror",
    "wasm trap",
    "rwlock poisoned",
    "mutex poisoned",
    "sqlcipher",
    "database disk image is malformed",
];

const MEMBERSHIP_PATTERNS: &[&str] = &[
    "membership not yet published",
    "not yet published",
    "group is not ready",
    "missing group membership",
    "epoch not yet available",
];

const RECIPIENT_PATTERNS: &[&str] = &[
    "not registered",
    "no inbox id",
    "cannot message",
    "is not on the network",
];

const NETWORK_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "network",
    "connection",
    "fetch failed",
    "unavailable",
    "dns",
    "transport",
    "econnreset",
    "broken pipe",
];

/// Classifies free-form error text.
pub fn classify_text(text: &str) -> FaultClass {
    let text = text.to_ascii_lowercase();
    let hit = |patterns: &[&str]| patterns.iter().any(|p| text.contains(p));

    if hit(INSTALLATION_PATTERNS) {
        FaultClass::InstallationLimit
    } else if hit(INSTABILITY_PATTERNS) {
        FaultClass::ProtocolCoreInstability
    } else if hit(MEMBERSHIP_PATTERNS) {
        FaultClass::MembershipPropagation
    } else if hit(NETWORK_PATTERNS) {
        FaultClass::TransientNetwork
    } else {
        FaultClass::Unknown
    }
}

/// True when the text looks like crypto-core/runtime corruption.
pub fn is_instability_marker(text: &str) -> bool {
    classify_text(text) == FaultClass::ProtocolCoreInstability
}

pub fn class_of(error: &ProtocolError) -> FaultClass {
    match error {
        ProtocolError::Unreachable(_) => FaultClass::TransientNetwork,
        ProtocolError::MembershipNotYetPublished(_) => FaultClass::MembershipPropagation,
        ProtocolError::ProtocolCoreInstability(_) => FaultClass::ProtocolCoreInstability,
        ProtocolError::InstallationLimitExceeded { .. } => FaultClass::InstallationLimit,
        ProtocolError::SignerUnavailable
        | ProtocolError::RecipientNotRegistered(_)
        | ProtocolError::NotInitialized
        | ProtocolError::InvalidRequest(_)
        | ProtocolError::Fatal(_)
        | ProtocolError::Unknown(_) => FaultClass::Unknown,
    }
}

/// Errors that need a decision from the caller; retrying cannot help.
pub fn surfaces_immediately(error: &ProtocolError) -> bool {
    matches!(
        error,
        ProtocolError::SignerUnavailable
            | ProtocolError::RecipientNotRegistered(_)
            | ProtocolError::InstallationLimitExceeded { .. }
            | ProtocolError::InvalidRequest(_)
            | ProtocolError::Fatal(_)
    )
}

/// Converts a facade error into the taxonomy. `conversation_id` is used for
/// membership errors that arrive as plain text.
pub fn to_protocol_error(
    err: &anyhow::Error,
    conversation_id: Option<&ConversationId>,
) -> ProtocolError {
    if let Some(typed) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ProtocolError>())
    {
        return typed.clone();
    }

    let text = format!("{err:#}");
    match classify_text(&text) {
        FaultClass::InstallationLimit => ProtocolError::InstallationLimitExceeded {
            inbox_id: InboxId::from("unknown"),
            max: parse_installation_max(&text).unwrap_or_default(),
            installations: Vec::new(),
        },
        FaultClass::ProtocolCoreInstability => ProtocolError::ProtocolCoreInstability(text),
        FaultClass::MembershipPropagation => match conversation_id {
            Some(id) => ProtocolError::MembershipNotYetPublished(id.clone()),
            None => ProtocolError::Unknown(text),
        },
        FaultClass::TransientNetwork => ProtocolError::Unreachable(text),
        FaultClass::Unknown => {
            let lowered = text.to_ascii_lowercase();
            if RECIPIENT_PATTERNS.iter().any(|p| lowered.contains(p)) {
                ProtocolError::RecipientNotRegistered(InboxId::from("unknown"))
            } else {
                ProtocolError::Unknown(text)
            }
        }
    }
}

/// Pulls the cap out of messages like "... has 10/10 installations".
fn parse_installation_max(text: &str) -> Option<usize> {
    text.split_whitespace().find_map(|token| {
        let token = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '/');
        let (count, max) = token.split_once('/')?;
        count.parse::<usize>().ok()?;
        max.parse::<usize>().ok()
    })
}

#[cfg(test)]
#[path = "tests/fault_tests.rs"]
mod tests;
