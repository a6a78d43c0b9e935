//! Redis client adapter.
//!
//! One handle over the three supported topologies: a single host behind a
//! [`ConnectionManager`], a cluster, or a sentinel-monitored master. The
//! connection lives behind [`RedisClient::query`], which executes any
//! prepared command; the typed wrappers below cover the command shapes the
//! transport needs.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{
    cmd, AsyncCommands, Cmd, ConnectionAddr, ConnectionInfo, FromRedisValue, RedisConnectionInfo,
    RedisResult, Value,
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::options::ConnectionOptions;

enum Backend {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Opaque handle to a Redis-compatible server.
pub struct RedisClient {
    backend: Backend,
}

impl RedisClient {
    /// Connect according to the configured topology.
    ///
    /// A non-empty `sentinel_master` makes the hosts sentinels to query for
    /// the master address; `cluster` seeds a cluster client with all hosts;
    /// otherwise the first host is dialed directly.
    pub async fn connect(options: &ConnectionOptions) -> Result<Self> {
        let backend = if options.cluster {
            Self::connect_cluster(options).await?
        } else if let Some(master) = options.sentinel_master.clone() {
            let (host, port) = resolve_sentinel_master(options, &master).await?;
            Self::connect_single(&host, port, options).await?
        } else {
            let hosts = options.host_list();
            let first = hosts
                .first()
                .ok_or_else(|| Error::config("at least one host must be configured"))?;
            let (host, port) = split_host_port(first)?;
            Self::connect_single(&host, port, options).await?
        };
        Ok(Self { backend })
    }

    async fn connect_single(host: &str, port: u16, options: &ConnectionOptions) -> Result<Backend> {
        let client = redis::Client::open(connection_info(host, port, options))?;

        let mut config = ConnectionManagerConfig::new();
        if options.timeout > 0.0 {
            config = config.set_connection_timeout(Duration::from_secs_f64(options.timeout));
        }
        if options.read_timeout > 0.0 {
            config = config.set_response_timeout(Duration::from_secs_f64(options.read_timeout));
        }

        let mut conn = ConnectionManager::new_with_config(client, config).await?;
        cmd("PING").query_async::<()>(&mut conn).await?;
        debug!(host = %host, port = port, "connected to redis");
        Ok(Backend::Single(conn))
    }

    async fn connect_cluster(options: &ConnectionOptions) -> Result<Backend> {
        let mut nodes = Vec::new();
        for entry in options.host_list() {
            let (host, port) = split_host_port(&entry)?;
            nodes.push(connection_info(&host, port, options));
        }

        let mut builder = ClusterClientBuilder::new(nodes);
        if options.timeout > 0.0 {
            builder = builder.connection_timeout(Duration::from_secs_f64(options.timeout));
        }
        if options.read_timeout > 0.0 {
            builder = builder.response_timeout(Duration::from_secs_f64(options.read_timeout));
        }

        let conn = builder.build()?.get_async_connection().await?;
        debug!("connected to redis cluster");
        Ok(Backend::Cluster(conn))
    }

    /// Execute a prepared command against whichever connection backs the
    /// handle.
    pub async fn query<T: FromRedisValue>(&mut self, command: &Cmd) -> RedisResult<T> {
        match &mut self.backend {
            Backend::Single(conn) => command.query_async(conn).await,
            Backend::Cluster(conn) => command.query_async(conn).await,
        }
    }

    /// `XADD`, trimming approximately to `max_entries` when it is non-zero.
    /// Returns the server-assigned entry id.
    pub async fn xadd(
        &mut self,
        stream: &str,
        max_entries: u64,
        field: &str,
        value: &str,
    ) -> RedisResult<String> {
        let mut command = cmd("XADD");
        command.arg(stream);
        if max_entries > 0 {
            command.arg("MAXLEN").arg("~").arg(max_entries);
        }
        command.arg("*").arg(field).arg(value);
        self.query(&command).await
    }

    /// `ZADD NX`; returns the number of members added (0 when the member
    /// already existed).
    pub async fn zadd_nx(&mut self, key: &str, score: &str, member: &str) -> RedisResult<i64> {
        self.query(cmd("ZADD").arg(key).arg("NX").arg(score).arg(member))
            .await
    }

    /// `ZPOPMIN`; returns `(member, score)` pairs, smallest score first.
    pub async fn zpopmin(&mut self, key: &str, count: u64) -> RedisResult<Vec<(String, String)>> {
        self.query(cmd("ZPOPMIN").arg(key).arg(count)).await
    }

    /// `ZCOUNT` over an inclusive score range.
    pub async fn zcount(&mut self, key: &str, min: &str, max: &str) -> RedisResult<u64> {
        self.query(cmd("ZCOUNT").arg(key).arg(min).arg(max)).await
    }

    /// `XREADGROUP ... COUNT 1 BLOCK 1`. `cursor` is either `"0"` (re-scan
    /// this consumer's pending entries) or `">"` (new entries only).
    pub async fn xreadgroup(
        &mut self,
        group: &str,
        consumer: &str,
        stream: &str,
        cursor: &str,
    ) -> RedisResult<StreamReadReply> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(1);
        match &mut self.backend {
            Backend::Single(conn) => conn.xread_options(&[stream], &[cursor], &options).await,
            Backend::Cluster(conn) => conn.xread_options(&[stream], &[cursor], &options).await,
        }
    }

    /// `XACK`; returns the number of entries acknowledged.
    pub async fn xack(&mut self, stream: &str, group: &str, id: &str) -> RedisResult<i64> {
        self.query(cmd("XACK").arg(stream).arg(group).arg(id)).await
    }

    /// `XDEL`; returns the number of entries deleted.
    pub async fn xdel(&mut self, stream: &str, id: &str) -> RedisResult<i64> {
        self.query(cmd("XDEL").arg(stream).arg(id)).await
    }

    /// `XGROUP CREATE ... 0 MKSTREAM`.
    pub async fn xgroup_create_mkstream(&mut self, stream: &str, group: &str) -> RedisResult<()> {
        self.query(
            cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(group)
                .arg(0)
                .arg("MKSTREAM"),
        )
        .await
    }

    /// `XINFO GROUPS`, one field map per group.
    pub async fn xinfo_groups(&mut self, stream: &str) -> RedisResult<Vec<HashMap<String, Value>>> {
        self.query(cmd("XINFO").arg("GROUPS").arg(stream)).await
    }

    /// Extended `XPENDING` over the whole range; returns
    /// `(id, consumer, idle_ms, delivery_count)` tuples, oldest first.
    pub async fn xpending(
        &mut self,
        stream: &str,
        group: &str,
        count: u64,
    ) -> RedisResult<Vec<(String, String, i64, i64)>> {
        self.query(
            cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .arg("-")
                .arg("+")
                .arg(count),
        )
        .await
    }

    /// `XCLAIM ... JUSTID`; returns the claimed ids.
    pub async fn xclaim_justid(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> RedisResult<Vec<String>> {
        let mut command = cmd("XCLAIM");
        command.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for id in ids {
            command.arg(id);
        }
        command.arg("JUSTID");
        self.query(&command).await
    }

    /// One `XRANGE` page of at most `count` entries starting at `start`
    /// (inclusive); fields are returned unparsed.
    pub async fn xrange(
        &mut self,
        stream: &str,
        start: &str,
        count: u64,
    ) -> RedisResult<Vec<(String, Value)>> {
        self.query(
            cmd("XRANGE")
                .arg(stream)
                .arg(start)
                .arg("+")
                .arg("COUNT")
                .arg(count),
        )
        .await
    }

    /// Multi-key `UNLINK`; returns the number of keys removed.
    pub async fn unlink(&mut self, keys: &[&str]) -> RedisResult<i64> {
        let mut command = cmd("UNLINK");
        for key in keys {
            command.arg(key);
        }
        self.query(&command).await
    }

    /// Single-key `DEL` (kept per-key so a cluster fallback never crosses
    /// slots).
    pub async fn del(&mut self, key: &str) -> RedisResult<i64> {
        self.query(cmd("DEL").arg(key)).await
    }
}

fn connection_info(host: &str, port: u16, options: &ConnectionOptions) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: RedisConnectionInfo {
            db: options.dbindex,
            username: options.username.clone(),
            password: options.password.clone(),
            ..Default::default()
        },
    }
}

pub(crate) fn split_host_port(entry: &str) -> Result<(String, u16)> {
    match entry.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::config(format!("invalid host entry \"{entry}\"")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((entry.to_string(), 6379)),
    }
}

/// Ask the configured sentinels for the master address.
///
/// Each round walks the candidate list; when `sentinel_update` is enabled,
/// sentinels announced by an answering one join the candidates for later
/// rounds. Sentinels are dialed without credentials; the resolved master is
/// dialed with the configured ones.
async fn resolve_sentinel_master(
    options: &ConnectionOptions,
    master_name: &str,
) -> Result<(String, u16)> {
    let mut candidates = options.host_list();
    let rounds = options.sentinel_retry_limit.max(1);
    let wait = Duration::from_millis(options.sentinel_retry_wait);

    for round in 0..rounds {
        for entry in candidates.clone() {
            let Ok((host, port)) = split_host_port(&entry) else {
                continue;
            };
            let info = ConnectionInfo {
                addr: ConnectionAddr::Tcp(host, port),
                redis: RedisConnectionInfo::default(),
            };
            let Ok(client) = redis::Client::open(info) else {
                continue;
            };
            let mut conn = match client.get_multiplexed_async_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(sentinel = %entry, error = %e, "sentinel unreachable");
                    continue;
                }
            };

            let reply: Option<(String, String)> = match cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master_name)
                .query_async(&mut conn)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(sentinel = %entry, error = %e, "sentinel query failed");
                    continue;
                }
            };
            let Some((master_host, master_port)) = reply else {
                continue;
            };
            let Ok(master_port) = master_port.parse::<u16>() else {
                continue;
            };

            if options.sentinel_update {
                let peers: Vec<HashMap<String, String>> = cmd("SENTINEL")
                    .arg("sentinels")
                    .arg(master_name)
                    .query_async(&mut conn)
                    .await
                    .unwrap_or_default();
                for peer in peers {
                    if let (Some(ip), Some(port)) = (peer.get("ip"), peer.get("port")) {
                        let address = format!("{ip}:{port}");
                        if !candidates.contains(&address) {
                            candidates.push(address);
                        }
                    }
                }
            }

            info!(
                master = master_name,
                host = %master_host,
                port = master_port,
                "resolved sentinel master"
            );
            return Ok((master_host, master_port));
        }

        if round + 1 < rounds {
            tokio::time::sleep(wait).await;
        }
    }

    Err(Error::transport(format!(
        "Failed to retrieve master information from sentinel \"{master_name}\"."
    )))
}
