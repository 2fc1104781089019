use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(InboxId);
id_newtype!(InstallationId);

const PROVISIONAL_PREFIX: &str = "local-";

impl MessageId {
    /// Id for an outbound message the network has not accepted yet.
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkEnv {
    Production,
    #[default]
    Dev,
    Local,
}

impl NetworkEnv {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkEnv::Production => "production",
            NetworkEnv::Dev => "dev",
            NetworkEnv::Local => "local",
        }
    }
}

impl fmt::Display for NetworkEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkEnv {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(NetworkEnv::Production),
            "dev" | "development" => Ok(NetworkEnv::Dev),
            "local" => Ok(NetworkEnv::Local),
            other => Err(format!("unknown network environment '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

/// Participants of a conversation. The variant is the protocol-supplied kind
/// discriminant; nothing else decides whether a conversation is direct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Membership {
    Direct { peer: InboxId },
    Group { members: BTreeSet<InboxId> },
}

impl Membership {
    pub fn kind(&self) -> ConversationKind {
        match self {
            Membership::Direct { .. } => ConversationKind::Direct,
            Membership::Group { .. } => ConversationKind::Group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    #[default]
    Unknown,
    Allowed,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Position in a conversation's backward history walk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "cursor", rename_all = "snake_case")]
pub enum HistoryCursor {
    #[default]
    NotStarted,
    At(String),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub membership: Membership,
    pub consent: ConsentState,
    /// Always true for direct conversations.
    pub membership_published: bool,
    pub created_at_ns: i64,
    pub cursor: HistoryCursor,
}

impl Conversation {
    pub fn kind(&self) -> ConversationKind {
        self.membership.kind()
    }

    /// True when the protocol-visible fields differ; the local cursor is ignored.
    pub fn differs_from(&self, other: &Conversation) -> bool {
        self.membership != other.membership
            || self.consent != other.consent
            || self.membership_published != other.membership_published
            || self.created_at_ns != other.created_at_ns
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: InboxId,
    pub content: String,
    pub sent_at_ns: i64,
    pub status: DeliveryStatus,
}

impl Message {
    pub fn sort_key(&self) -> (i64, &str) {
        (self.sent_at_ns, self.id.as_str())
    }
}
