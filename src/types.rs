//! Wire payloads carried on the stream and in the delay queue.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Payload stored in the single `message` field of a stream entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Member of the delay sorted set.
///
/// `uniqid` makes two enqueues of an identical `(body, headers, due-at)`
/// distinct sorted-set members, so `ZADD NX` accepts both and `ZPOPMIN`
/// always makes progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DelayedEntry {
    pub body: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub uniqid: String,
}

/// A message handed out by [`Connection::get`](crate::Connection::get).
///
/// `message` is the raw JSON of the entry's `message` field
/// (`{"body": ..., "headers": {...}}`); decoding the envelope is the
/// serializer layer's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Server-assigned stream id (`<ms>-<seq>`), used for `ack` / `reject`.
    pub id: String,
    /// Raw JSON payload of the entry.
    pub message: String,
}
