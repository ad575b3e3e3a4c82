// ABOUTME: Publication - the unit handed from the tailer to the publisher
// ABOUTME: Builds channel names, JSON payloads and deterministic dedupe tokens

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::oplog::{ChangeEntry, OpTimestamp, Operation};

/// One message bound for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub channel: String,
    pub payload: Vec<u8>,
    pub timestamp: OpTimestamp,
    /// Identical for every re-read of the same oplog entry and channel
    pub dedupe_token: String,
}

impl Publication {
    /// Redis key marking this publication as handled.
    pub fn dedupe_key(&self, metadata_prefix: &str) -> String {
        format!("{}processed::{}", metadata_prefix, self.dedupe_token)
    }
}

#[derive(Debug, Serialize)]
struct Message {
    op: &'static str,
    ns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

/// Expand an entry into its publications: always the namespace-wide channel,
/// plus the document channel when the entry names a document.
pub fn publications_for(entry: &ChangeEntry) -> Result<Vec<Publication>> {
    let payload = encode_message(entry)?;
    let namespace = entry.namespace.to_string();

    let mut publications = Vec::with_capacity(2);
    publications.push(Publication {
        dedupe_token: dedupe_token(entry, &namespace),
        channel: namespace.clone(),
        payload: payload.clone(),
        timestamp: entry.timestamp,
    });

    if let Some(key) = entry.document_key() {
        let channel = format!("{}::{}", namespace, key);
        publications.push(Publication {
            dedupe_token: dedupe_token(entry, &channel),
            channel,
            payload,
            timestamp: entry.timestamp,
        });
    }

    Ok(publications)
}

fn encode_message(entry: &ChangeEntry) -> Result<Vec<u8>> {
    let data = match entry.operation {
        Operation::Delete => None,
        _ => entry
            .data
            .clone()
            .map(|d| bson::Bson::Document(d).into_relaxed_extjson()),
    };
    let message = Message {
        op: entry.operation.as_str(),
        ns: entry.namespace.to_string(),
        id: entry
            .document_id
            .clone()
            .map(|id| id.into_relaxed_extjson()),
        fields: entry.changed_fields(),
        data,
    };
    serde_json::to_vec(&message).with_context(|| {
        format!(
            "Failed to encode {} message for {}",
            entry.operation, entry.namespace
        )
    })
}

/// Hash of everything that identifies one publication of one oplog entry.
fn dedupe_token(entry: &ChangeEntry, channel: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.namespace.to_string().as_bytes());
    hasher.update([0u8]);
    if let Some(key) = entry.document_key() {
        hasher.update(key.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(entry.timestamp.as_u64().to_be_bytes());
    hasher.update(entry.sequence.to_be_bytes());
    hasher.update(channel.as_bytes());
    format!("{:x}", hasher.finalize())
}
