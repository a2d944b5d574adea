//! Core data models used throughout ReplyHub.
//!
//! These types represent the knowledge chunks that feed retrieval and the
//! per-customer conversation state that drives bot/human handoff.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============ Channels ============

/// A customer-contact surface that can independently enable a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Public comments on page posts.
    Facebook,
    /// Private Messenger conversations.
    Messenger,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Facebook, Channel::Messenger];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Facebook => "facebook",
            Channel::Messenger => "messenger",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    /// Parses a channel name. Unknown names are rejected rather than
    /// normalized, so typos surface at the boundary.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "facebook" => Ok(Channel::Facebook),
            "messenger" => Ok(Channel::Messenger),
            other => bail!("unknown channel: '{}'. Use facebook or messenger.", other),
        }
    }
}

/// Per-channel visibility flags for a chunk.
///
/// Serializes as `{"facebook": true, "messenger": false}`. Unknown keys
/// fail deserialization; missing keys default to enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ChannelSet {
    pub facebook: bool,
    pub messenger: bool,
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self {
            facebook: true,
            messenger: true,
        }
    }
}

impl ChannelSet {
    pub fn none() -> Self {
        Self {
            facebook: false,
            messenger: false,
        }
    }

    pub fn only(channel: Channel) -> Self {
        let mut set = Self::none();
        set.set(channel, true);
        set
    }

    pub fn get(&self, channel: Channel) -> bool {
        match channel {
            Channel::Facebook => self.facebook,
            Channel::Messenger => self.messenger,
        }
    }

    pub fn set(&mut self, channel: Channel, enabled: bool) {
        match channel {
            Channel::Facebook => self.facebook = enabled,
            Channel::Messenger => self.messenger = enabled,
        }
    }
}

// ============ Knowledge chunks ============

/// Stable deduplication key of a chunk, unique per tenant.
///
/// Either the source URL of externally synced data, or a content hash
/// (scoped by page) for manual uploads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// Key for content without an external identifier: `content:<sha256>`
    /// over the page id and the content.
    pub fn from_content(page_id: &str, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(page_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        Self(format!("content:{}", hex::encode(hasher.finalize())))
    }

    /// Wraps an already-computed key, e.g. one read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of company knowledge with its embedding and visibility flags.
///
/// An empty `embedding` is a valid degraded state: ranking falls back to
/// text overlap for this chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub tenant_id: String,
    pub page_id: String,
    pub natural_key: NaturalKey,
    pub content: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Ingestion tag, e.g. `"crm"` or `"upload"`.
    pub source: String,
    #[serde(default)]
    pub channels: ChannelSet,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds, refreshed on every upsert.
    pub updated_at: i64,
}

impl DocumentChunk {
    /// A manually uploaded chunk keyed by its content.
    pub fn upload(tenant_id: &str, page_id: &str, content: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            tenant_id: tenant_id.to_string(),
            page_id: page_id.to_string(),
            natural_key: NaturalKey::from_content(page_id, content),
            content: content.to_string(),
            embedding: Vec::new(),
            source: "upload".to_string(),
            channels: ChannelSet::default(),
            is_active: true,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A chunk synced from an external URL.
    pub fn synced(tenant_id: &str, page_id: &str, url: &str, source: &str, content: &str) -> Self {
        Self {
            natural_key: NaturalKey::from_url(url),
            source: source.to_string(),
            ..Self::upload(tenant_id, page_id, content)
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_channels(mut self, channels: ChannelSet) -> Self {
        self.channels = channels;
        self
    }
}

// ============ Customers and agents ============

/// Identity of one customer conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerKey {
    pub tenant_id: String,
    pub page_id: String,
    pub customer_id: String,
}

impl CustomerKey {
    pub fn new(tenant_id: &str, page_id: &str, customer_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            page_id: page_id.to_string(),
            customer_id: customer_id.to_string(),
        }
    }
}

impl fmt::Display for CustomerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.page_id, self.customer_id)
    }
}

/// Who controls a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    Bot,
    HumanRequested,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::Bot => "bot",
            ConversationMode::HumanRequested => "human_requested",
        }
    }
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bot" => Ok(ConversationMode::Bot),
            "human_requested" => Ok(ConversationMode::HumanRequested),
            other => bail!("unknown conversation mode: '{}'", other),
        }
    }
}

/// An agent acting on a conversation (from the caller's session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl AgentIdentity {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            email: None,
        }
    }
}

/// The agent currently owning a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedAgent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

impl AssignedAgent {
    pub fn from_identity(agent: &AgentIdentity, assigned_at: DateTime<Utc>) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            email: agent.email.clone(),
            assigned_at,
        }
    }
}

impl fmt::Display for AssignedAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Persisted handoff state of one customer conversation.
///
/// `requested_at` is present iff `mode == HumanRequested`;
/// `assigned_agent` may only be set while `mode == HumanRequested`.
/// `version` increments on every successful write and is the
/// compare-and-swap token for concurrent transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerState {
    #[serde(flatten)]
    pub key: CustomerKey,
    pub mode: ConversationMode,
    pub requested_at: Option<DateTime<Utc>>,
    pub assigned_agent: Option<AssignedAgent>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerState {
    pub fn new(key: CustomerKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            mode: ConversationMode::Bot,
            requested_at: None,
            assigned_agent: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_assigned_to(&self, agent_id: &str) -> bool {
        self.assigned_agent
            .as_ref()
            .is_some_and(|a| a.id == agent_id)
    }
}
