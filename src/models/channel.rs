use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire dialect an upstream (or client) speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    MessagesStyle,
    OpenaiStyle,
    GeminiStyle,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::MessagesStyle => "messages-style",
            ServiceType::OpenaiStyle => "openai-style",
            ServiceType::GeminiStyle => "gemini-style",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Suspended,
}

/// An upstream provider endpoint, as declared in the config file.
///
/// Lifecycle is owned by an external config manager; this crate only
/// ever observes immutable snapshots of it (see [`crate::config::ChannelRegistry`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub service_type: ServiceType,
    pub base_urls: Vec<String>,
    pub api_keys: Vec<String>,
    pub priority: i64,
    pub status: ChannelStatus,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub promotion_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub low_quality: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Channel {
    pub fn is_active(&self) -> bool {
        matches!(self.status, ChannelStatus::Active)
    }

    pub fn is_promoted(&self, now: DateTime<Utc>) -> bool {
        self.promotion_until.map(|t| t > now).unwrap_or(false)
    }

    /// Upstream model name for a client-requested model, falling back to
    /// the requested name when no mapping entry exists.
    pub fn map_model<'a>(&'a self, client_model: &'a str) -> &'a str {
        self.model_mapping
            .get(client_model)
            .map(String::as_str)
            .unwrap_or(client_model)
    }
}

/// All channels configured for one API type (messages / responses / gemini),
/// in configured order. Priority ordering is a property of [`Channel::priority`],
/// not of list position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSet {
    pub channels: Vec<Channel>,
}

impl ChannelSet {
    pub fn active_candidates(&self, failed_indices: &[usize]) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(idx, ch)| ch.is_active() && !failed_indices.contains(idx))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }
}
