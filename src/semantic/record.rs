use serde::{Deserialize, Serialize};

/// A past message as stored next to its embedding.
///
/// Display fields are opaque strings; nothing here interprets them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub date: String,
    /// Where the message came from. Kept for the indexer, never sent.
    #[serde(default)]
    pub path: String,
}
