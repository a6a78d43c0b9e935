//! The transport connection: producer, consumer, reclaimer and admin sides
//! of one stream/group pair.
//!
//! A `Connection` serves one logical consumer. Several connections (in the
//! same process or across hosts) may share a stream and group; they
//! coordinate exclusively through the server's atomic primitives, so the
//! struct itself takes `&mut self` and carries no locks.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use redis::streams::StreamReadReply;
use redis::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::RedisClient;
use crate::error::{Error, Result};
use crate::options::ConnectionOptions;
use crate::score;
use crate::types::{DelayedEntry, ReceivedMessage, StreamPayload};

/// Suffix of the sorted set holding delayed entries.
const QUEUE_SUFFIX: &str = "__queue";

/// How many entries an `XRANGE` page of the count fallback requests.
const COUNT_PAGE_SIZE: u64 = 100;

pub struct Connection {
    client: RedisClient,
    stream: String,
    queue: String,
    group: String,
    consumer: String,
    auto_setup: bool,
    delete_after_ack: bool,
    delete_after_reject: bool,
    stream_max_entries: u64,
    /// Idle time in ms before another consumer's pending entry is claimable.
    redeliver_timeout: u64,
    /// Seconds between reclaim cycles.
    claim_interval: f64,
    /// Cursor mode: `true` re-scans this consumer's pending entries (`"0"`),
    /// `false` fetches new entries (`">"`). Starts `true` so entries left
    /// over from a previous run drain first.
    could_have_pending_messages: bool,
    /// Epoch seconds before which the reclaimer stays quiet.
    next_claim: f64,
    /// Latches to `false` the first time UNLINK fails; `cleanup` then uses
    /// per-key DEL.
    unlink_supported: bool,
}

impl Connection {
    /// Connect with the given options.
    pub async fn new(options: ConnectionOptions) -> Result<Self> {
        options.validate()?;
        let client = RedisClient::connect(&options).await?;
        let queue = format!("{}{}", options.stream, QUEUE_SUFFIX);
        Ok(Self {
            client,
            queue,
            stream: options.stream,
            group: options.group,
            consumer: options.consumer,
            auto_setup: options.auto_setup,
            delete_after_ack: options.delete_after_ack,
            delete_after_reject: options.delete_after_reject,
            stream_max_entries: options.stream_max_entries,
            redeliver_timeout: options.redeliver_timeout,
            claim_interval: options.claim_interval,
            could_have_pending_messages: true,
            next_claim: 0.0,
            unlink_supported: true,
        })
    }

    /// Connect from a `predis://` DSN.
    pub async fn from_dsn(dsn: &str) -> Result<Self> {
        Self::new(ConnectionOptions::from_dsn(dsn)?).await
    }

    /// Append a message, either to the stream (no delay) or to the delay
    /// queue. Returns the server-assigned stream id, or the generated unique
    /// id for a delayed message.
    pub async fn add(
        &mut self,
        body: &str,
        headers: &HashMap<String, String>,
        delay_ms: u64,
    ) -> Result<String> {
        if self.auto_setup {
            self.setup().await?;
        }

        if delay_ms > 0 {
            let uniqid = Uuid::new_v4().to_string();
            let member = serde_json::to_string(&DelayedEntry {
                body: body.to_string(),
                headers: headers.clone(),
                uniqid: uniqid.clone(),
            })?;
            let score = score::delayed_score(delay_ms)?;

            let added = self.client.zadd_nx(&self.queue, &score, &member).await?;
            if added == 0 {
                return Err(Error::transport(
                    "Could not add a message to the redis stream.",
                ));
            }
            debug!(queue = %self.queue, score = %score, delay_ms = delay_ms, "scheduled delayed message");
            return Ok(uniqid);
        }

        let payload = serde_json::to_string(&StreamPayload {
            body: body.to_string(),
            headers: headers.clone(),
        })?;
        let id = self
            .client
            .xadd(&self.stream, self.stream_max_entries, "message", &payload)
            .await?;
        if id.is_empty() {
            return Err(Error::transport(
                "Could not add a message to the redis stream.",
            ));
        }
        debug!(stream = %self.stream, id = %id, "appended message");
        Ok(id)
    }

    /// Fetch the next message for this consumer, or `None` when nothing is
    /// available.
    ///
    /// Each call promotes due delayed entries, runs a reclaim cycle when one
    /// is due, then reads through the consumer group. Pending entries drain
    /// before new ones: the pending cursor is tried until it comes back
    /// empty, at which point the cursor flips to new entries and the read is
    /// retried once.
    pub async fn get(&mut self) -> Result<Option<ReceivedMessage>> {
        if self.auto_setup {
            self.setup().await?;
        }

        self.promote_delayed_messages().await?;

        if !self.could_have_pending_messages && self.next_claim <= unix_time() {
            self.claim_old_pending_messages().await?;
        }

        let mut retried = false;
        loop {
            let cursor = if self.could_have_pending_messages {
                "0"
            } else {
                ">"
            };
            let reply = self
                .client
                .xreadgroup(&self.group, &self.consumer, &self.stream, cursor)
                .await?;

            let entries = stream_entries(reply, &self.stream);
            let message = entries
                .into_iter()
                .find_map(|(id, mut fields)| {
                    fields
                        .remove("message")
                        .map(|message| ReceivedMessage { id, message })
                });
            if message.is_some() {
                return Ok(message);
            }

            // The pending cursor came back empty: this consumer's backlog is
            // drained, switch to new entries and try once more.
            if self.could_have_pending_messages && !retried {
                self.could_have_pending_messages = false;
                retried = true;
                continue;
            }
            return Ok(None);
        }
    }

    /// Acknowledge a delivered message, deleting it from the stream when
    /// `delete_after_ack` is enabled.
    pub async fn ack(&mut self, id: &str) -> Result<()> {
        let mut acknowledged = self.client.xack(&self.stream, &self.group, id).await? > 0;
        if self.delete_after_ack {
            acknowledged = self.client.xdel(&self.stream, id).await? > 0;
        }
        if !acknowledged {
            return Err(Error::transport(format!(
                "Could not acknowledge redis message \"{id}\"."
            )));
        }
        debug!(stream = %self.stream, id = %id, "acknowledged message");
        Ok(())
    }

    /// Reject a delivered message, deleting it from the stream when
    /// `delete_after_reject` is enabled.
    pub async fn reject(&mut self, id: &str) -> Result<()> {
        let mut rejected = self.client.xack(&self.stream, &self.group, id).await? > 0;
        if self.delete_after_reject {
            rejected = self.client.xdel(&self.stream, id).await? > 0 && rejected;
        }
        if !rejected {
            return Err(Error::transport(format!(
                "Could not delete message \"{id}\" from the redis stream."
            )));
        }
        debug!(stream = %self.stream, id = %id, "rejected message");
        Ok(())
    }

    /// Create the consumer group (and the stream with it). An existing group
    /// is fine; anything else aborts.
    ///
    /// When `delete_after_ack` or `delete_after_reject` is enabled the
    /// stream must not be read by any other group: deleting on disposition
    /// would drop entries the other groups have not consumed yet.
    pub async fn setup(&mut self) -> Result<()> {
        if let Err(e) = self
            .client
            .xgroup_create_mkstream(&self.stream, &self.group)
            .await
        {
            if e.code() != Some("BUSYGROUP") {
                return Err(Error::transport_with(
                    format!("Failed to create the consumer group \"{}\".", self.group),
                    e,
                ));
            }
            debug!(stream = %self.stream, group = %self.group, "consumer group already exists");
        }

        if self.delete_after_ack || self.delete_after_reject {
            let groups = self.client.xinfo_groups(&self.stream).await?;
            if groups.len() > 1 {
                return Err(Error::logic(format!(
                    "More than one group exists for stream \"{}\", delete_after_ack and \
                     delete_after_reject cannot be enabled as it risks deleting messages \
                     before all groups could consume them.",
                    self.stream
                )));
            }
        }

        self.auto_setup = false;
        Ok(())
    }

    /// Remove the stream and the delay queue.
    ///
    /// UNLINK is preferred; the first failure (or a reply that removed
    /// nothing) latches this connection onto per-key DEL, which stays safe
    /// on clusters where the two keys may live in different slots.
    pub async fn cleanup(&mut self) -> Result<()> {
        if self.unlink_supported {
            match self
                .client
                .unlink(&[self.stream.as_str(), self.queue.as_str()])
                .await
            {
                Ok(removed) if removed > 0 => return Ok(()),
                Ok(_) => {
                    self.unlink_supported = false;
                }
                Err(e) => {
                    self.unlink_supported = false;
                    warn!(error = %e, "UNLINK failed, falling back to DEL");
                }
            }
        }
        self.client.del(&self.stream).await?;
        self.client.del(&self.queue).await?;
        Ok(())
    }

    /// Number of messages the group has not consumed yet.
    ///
    /// Servers that report `lag` (Redis 7+) answer directly; older ones are
    /// counted by walking `XRANGE` from the group's last delivered id.
    pub async fn get_message_count(&mut self) -> Result<u64> {
        let groups = self.client.xinfo_groups(&self.stream).await?;
        let Some(group) = groups
            .iter()
            .find(|info| value_as_string(info.get("name")).as_deref() == Some(self.group.as_str()))
        else {
            return Ok(0);
        };

        if let Some(lag) = value_as_u64(group.get("lag")) {
            return Ok(lag);
        }

        let Some(mut cursor) = value_as_string(group.get("last-delivered-id")) else {
            return Ok(0);
        };

        let mut total = 0;
        loop {
            let page = self
                .client
                .xrange(&self.stream, &cursor, COUNT_PAGE_SIZE)
                .await?;
            let Some((last_id, _)) = page.last() else {
                return Ok(total);
            };
            total += page.len() as u64;
            match next_range_cursor(last_id) {
                Some(next) => cursor = next,
                None => return Ok(total),
            }
        }
    }

    /// Move every due entry from the delay queue onto the stream.
    ///
    /// `ZPOPMIN` races with other consumers doing the same; popping an entry
    /// that turns out not to be due yet (their clock is ahead of ours) is
    /// resolved by putting it back and giving up for this cycle.
    async fn promote_delayed_messages(&mut self) -> Result<()> {
        let now = score::now_score();
        let due = self.client.zcount(&self.queue, "0", &now).await?;

        for _ in 0..due {
            let popped = self.client.zpopmin(&self.queue, 1).await?;
            let Some((member, popped_score)) = popped.into_iter().next() else {
                break;
            };

            if score::is_after(&popped_score, &now) {
                let _ = self
                    .client
                    .zadd_nx(&self.queue, &popped_score, &member)
                    .await?;
                warn!(queue = %self.queue, score = %popped_score, "popped entry not due yet, re-inserted");
                break;
            }

            let entry: DelayedEntry = serde_json::from_str(&member)?;
            self.add(&entry.body, &entry.headers, 0).await?;
        }
        Ok(())
    }

    /// Claim pending entries that other consumers abandoned.
    ///
    /// When the oldest pending entry already belongs to this consumer the
    /// cursor flag is raised and `next_claim` is deliberately left alone, so
    /// the next `get()` re-checks immediately instead of waiting out the
    /// claim interval.
    async fn claim_old_pending_messages(&mut self) -> Result<()> {
        let pending = self.client.xpending(&self.stream, &self.group, 1).await?;

        let mut claimable = Vec::new();
        for (id, owner, idle_ms, _deliveries) in pending {
            if owner == self.consumer {
                self.could_have_pending_messages = true;
                return Ok(());
            }
            if idle_ms >= self.redeliver_timeout as i64 {
                claimable.push(id);
            }
        }

        if !claimable.is_empty() {
            let claimed = self
                .client
                .xclaim_justid(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.redeliver_timeout,
                    &claimable,
                )
                .await?;
            debug!(
                stream = %self.stream,
                consumer = %self.consumer,
                claimed = claimed.len(),
                "claimed abandoned pending messages"
            );
            self.could_have_pending_messages = true;
        }

        self.next_claim = unix_time() + self.claim_interval;
        Ok(())
    }
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn value_as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Int(n) if *n >= 0 => Some(*n as u64),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        _ => None,
    }
}

/// Flatten an `XREADGROUP` reply into `(id, fields)` pairs for `stream`.
///
/// Entries whose field map comes back empty are skipped: the pending cursor
/// still lists ids whose data was deleted from the stream, and those
/// tombstones carry nothing to deliver. Non-string field values are ignored.
fn stream_entries(reply: StreamReadReply, stream: &str) -> Vec<(String, HashMap<String, String>)> {
    let mut out = Vec::new();
    for key in reply.keys {
        if key.key != stream {
            continue;
        }
        for entry in key.ids {
            let mut fields = HashMap::new();
            for (field, value) in entry.map {
                let value = match value {
                    Value::BulkString(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Value::SimpleString(s) => s,
                    _ => continue,
                };
                fields.insert(field, value);
            }
            if fields.is_empty() {
                continue;
            }
            out.push((entry.id, fields));
        }
    }
    out
}

/// Canonical successor of a stream id for paging: `(ms, seq + 1)`, rolling
/// into `(ms + 1, 0)` at the sequence limit.
fn next_range_cursor(id: &str) -> Option<String> {
    let (ms, seq) = id.split_once('-')?;
    let ms: u64 = ms.parse().ok()?;
    let seq: u64 = seq.parse().ok()?;
    Some(match seq.checked_add(1) {
        Some(next) => format!("{ms}-{next}"),
        None => format!("{}-0", ms.checked_add(1)?),
    })
}
