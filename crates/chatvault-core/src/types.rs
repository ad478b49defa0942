use serde::{Deserialize, Serialize};

/// Kind of a top-level server entry. Direct message groups and individual
/// direct messages are stored alongside real servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Server,
    Group,
    DirectMessage,
    Unknown,
}

impl ServerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerKind::Server => "SERVER",
            ServerKind::Group => "GROUP",
            ServerKind::DirectMessage => "DM",
            ServerKind::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "SERVER" => ServerKind::Server,
            "GROUP" => ServerKind::Group,
            "DM" => ServerKind::DirectMessage,
            _ => ServerKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub kind: ServerKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub server: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub position: Option<i64>,
    pub topic: Option<String>,
    pub nsfw: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub avatar_url: Option<String>,
    pub discriminator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender: i64,
    pub channel: i64,
    pub text: String,
    pub timestamp: i64,
    pub edit_timestamp: Option<i64>,
    pub replied_to_id: Option<i64>,
    pub attachments: Vec<Attachment>,
    pub embeds: Vec<Embed>,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub name: String,
    pub kind: Option<String>,
    pub url: String,
    pub size: i64,
}

/// Raw embed payload, kept as the JSON text the ingestion side produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji_id: Option<i64>,
    pub emoji_name: Option<String>,
    pub emoji_flags: i64,
    pub count: i64,
}

/// Persisted outcome of one attachment fetch, keyed by url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub url: String,
    pub status: i64,
    pub data: Option<Vec<u8>>,
}

impl Download {
    pub const STATUS_NOT_STARTED: i64 = 0;
    pub const STATUS_GENERIC_ERROR: i64 = -1;
    pub const STATUS_SUCCESS: i64 = 200;

    pub fn success(url: String, data: Vec<u8>) -> Self {
        Self {
            url,
            status: Self::STATUS_SUCCESS,
            data: Some(data),
        }
    }

    pub fn failure(url: String, status: i64) -> Self {
        Self {
            url,
            status,
            data: None,
        }
    }
}

/// A queued unit of work for the download worker. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
}

impl DownloadItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Snapshot of row counts per entity kind, republished after every mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_servers: i64,
    pub total_channels: i64,
    pub total_users: i64,
    pub total_messages: i64,
}
