//! # Courier Redis
//!
//! Durable, delayed, at-least-once message queue transport on top of a
//! Redis-compatible server.
//!
//! ## Design
//!
//! - **Redis Streams** carry the main log; a **consumer group** distributes
//!   entries between named consumers and tracks what each one still owes an
//!   acknowledgment for.
//! - A **sorted set** (`<stream>__queue`) acts as the timer wheel for
//!   delayed messages; due entries are promoted onto the stream on every
//!   `get()`.
//! - Pending entries abandoned by a crashed consumer are **reclaimed** via
//!   `XCLAIM` once they have idled past the redeliver timeout.
//! - Acknowledge/reject optionally **delete** the entry, which is only
//!   allowed while a single group reads the stream.
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_redis::Connection;
//! use std::collections::HashMap;
//!
//! # async fn example() -> courier_redis::Result<()> {
//! let mut connection =
//!     Connection::from_dsn("predis://127.0.0.1:6379?stream=orders&consumer=worker-1").await?;
//!
//! connection
//!     .add("{\"order\":42}", &HashMap::new(), 0)
//!     .await?;
//!
//! if let Some(message) = connection.get().await? {
//!     // ... process the payload ...
//!     connection.ack(&message.id).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod error;
mod options;
mod score;
mod types;

pub use client::RedisClient;
pub use connection::Connection;
pub use error::{Error, Result};
pub use options::ConnectionOptions;
pub use types::{ReceivedMessage, StreamPayload};
