use std::collections::HashMap;
use std::time::Duration;

use courier_redis::{Connection, ConnectionOptions, Error, StreamPayload};
use serial_test::serial;
use tokio::time::sleep;
use uuid::Uuid;

// These tests require a running Redis instance.
// Run with: docker run -d -p 6379:6379 redis:7
// Override the host with REDIS_HOST=host:port.

fn redis_host() -> String {
    std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1:6379".to_string())
}

fn test_options(stream: &str, consumer: &str) -> ConnectionOptions {
    let mut options = ConnectionOptions::default();
    options.hosts = vec![redis_host()];
    options.stream = stream.to_string();
    options.group = "g".to_string();
    options.consumer = consumer.to_string();
    options
}

fn unique_stream() -> String {
    format!("courier-test-{}", Uuid::new_v4())
}

fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn raw_client() -> redis::aio::MultiplexedConnection {
    let client = redis::Client::open(format!("redis://{}/", redis_host()))
        .expect("Failed to create raw Redis client");
    client
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect raw Redis client")
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn round_trip_via_dsn() {
    let stream = unique_stream();
    let dsn = format!(
        "predis://{}?stream={}&group=g&consumer=c&auto_setup=1",
        redis_host(),
        stream
    );
    let mut connection = Connection::from_dsn(&dsn).await.expect("connect failed");

    let id = connection
        .add("hello", &headers(&[("type", "T")]), 0)
        .await
        .expect("add failed");

    let message = connection
        .get()
        .await
        .expect("get failed")
        .expect("expected a message");
    assert_eq!(message.id, id);
    assert_eq!(
        message.message,
        r#"{"body":"hello","headers":{"type":"T"}}"#
    );

    connection.ack(&message.id).await.expect("ack failed");
    assert!(connection.get().await.expect("get failed").is_none());

    connection.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn round_trip_with_delays() {
    let stream = unique_stream();
    let mut connection = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");

    for delay in [0u64, 50, 500] {
        let body = format!("payload-{delay}");
        connection
            .add(&body, &headers(&[("k", "v")]), delay)
            .await
            .expect("add failed");

        sleep(Duration::from_millis(delay + 150)).await;

        let message = connection
            .get()
            .await
            .expect("get failed")
            .expect("expected a message");
        let payload: StreamPayload =
            serde_json::from_str(&message.message).expect("payload should be JSON");
        assert_eq!(payload.body, body);
        assert_eq!(payload.headers.get("k").map(String::as_str), Some("v"));

        connection.ack(&message.id).await.expect("ack failed");
    }

    connection.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn delayed_message_is_invisible_until_due() {
    let stream = unique_stream();
    let mut connection = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");

    connection
        .add("later", &HashMap::new(), 300)
        .await
        .expect("add failed");

    assert!(
        connection.get().await.expect("get failed").is_none(),
        "the message must stay hidden before its due time"
    );

    sleep(Duration::from_millis(400)).await;

    let message = connection
        .get()
        .await
        .expect("get failed")
        .expect("the message should be due by now");
    let payload: StreamPayload = serde_json::from_str(&message.message).unwrap();
    assert_eq!(payload.body, "later");

    connection.ack(&message.id).await.expect("ack failed");
    connection.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn delayed_messages_are_delivered_in_due_order() {
    let stream = unique_stream();
    let mut connection = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");

    connection
        .add("first", &HashMap::new(), 50)
        .await
        .expect("add failed");
    connection
        .add("second", &HashMap::new(), 500)
        .await
        .expect("add failed");

    sleep(Duration::from_millis(700)).await;

    for expected in ["first", "second"] {
        let message = connection
            .get()
            .await
            .expect("get failed")
            .expect("expected a message");
        let payload: StreamPayload = serde_json::from_str(&message.message).unwrap();
        assert_eq!(payload.body, expected);
        connection.ack(&message.id).await.expect("ack failed");
    }

    connection.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn abandoned_message_is_reclaimed_by_another_consumer() {
    let stream = unique_stream();

    let mut options = test_options(&stream, "c1");
    options.redeliver_timeout = 1_000;
    let mut first = Connection::new(options).await.expect("connect failed");

    first
        .add("orphan", &HashMap::new(), 0)
        .await
        .expect("add failed");
    let taken = first
        .get()
        .await
        .expect("get failed")
        .expect("expected a message");
    // c1 walks away without acknowledging.
    drop(first);

    let mut options = test_options(&stream, "c2");
    options.redeliver_timeout = 1_000;
    let mut second = Connection::new(options).await.expect("connect failed");

    assert!(
        second.get().await.expect("get failed").is_none(),
        "the message still belongs to c1's pending list"
    );

    sleep(Duration::from_millis(1_200)).await;

    let reclaimed = second
        .get()
        .await
        .expect("get failed")
        .expect("the idle message should have been claimed");
    assert_eq!(reclaimed.id, taken.id);
    assert_eq!(reclaimed.message, taken.message);

    second.ack(&reclaimed.id).await.expect("ack failed");
    second.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn pending_entries_drain_before_new_ones() {
    let stream = unique_stream();
    let mut connection = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");

    connection
        .add("pending", &HashMap::new(), 0)
        .await
        .expect("add failed");
    let first = connection
        .get()
        .await
        .expect("get failed")
        .expect("expected a message");
    // Not acknowledged: the entry stays in this consumer's pending list.

    connection
        .add("fresh", &HashMap::new(), 0)
        .await
        .expect("add failed");

    // A restarted consumer with the same name sees its own backlog first.
    let mut restarted = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");

    let redelivered = restarted
        .get()
        .await
        .expect("get failed")
        .expect("expected the pending entry");
    assert_eq!(redelivered.id, first.id);
    restarted.ack(&redelivered.id).await.expect("ack failed");

    let fresh = restarted
        .get()
        .await
        .expect("get failed")
        .expect("expected the new entry");
    let payload: StreamPayload = serde_json::from_str(&fresh.message).unwrap();
    assert_eq!(payload.body, "fresh");
    restarted.ack(&fresh.id).await.expect("ack failed");

    restarted.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn setup_is_idempotent() {
    let stream = unique_stream();
    let mut connection = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");

    connection.setup().await.expect("first setup failed");
    connection
        .setup()
        .await
        .expect("second setup should absorb BUSYGROUP");

    connection.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn delete_after_ack_refuses_a_second_group() {
    let stream = unique_stream();

    let mut options = test_options(&stream, "c");
    options.delete_after_ack = false;
    options.delete_after_reject = false;
    let mut connection = Connection::new(options).await.expect("connect failed");
    connection.setup().await.expect("setup failed");

    let mut raw = raw_client().await;
    let _: () = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(&stream)
        .arg("other-group")
        .arg(0)
        .arg("MKSTREAM")
        .query_async(&mut raw)
        .await
        .expect("creating the second group failed");

    let mut second = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");
    let err = second
        .setup()
        .await
        .expect_err("setup must refuse delete_after_ack with two groups");
    assert!(matches!(err, Error::Logic(_)), "got: {err}");

    connection.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn stream_is_trimmed_approximately() {
    let stream = unique_stream();
    let mut options = test_options(&stream, "c");
    options.stream_max_entries = 10;
    let mut connection = Connection::new(options).await.expect("connect failed");

    for i in 0..500 {
        connection
            .add(&format!("m{i}"), &HashMap::new(), 0)
            .await
            .expect("add failed");
    }

    let mut raw = raw_client().await;
    let len: u64 = redis::cmd("XLEN")
        .arg(&stream)
        .query_async(&mut raw)
        .await
        .expect("XLEN failed");
    assert!(len >= 10, "trimming must keep at least the cap, got {len}");
    assert!(len < 500, "the stream should have been trimmed, got {len}");

    connection.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn message_count_tracks_the_group_backlog() {
    let stream = unique_stream();
    let mut connection = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");

    for i in 0..3 {
        connection
            .add(&format!("m{i}"), &HashMap::new(), 0)
            .await
            .expect("add failed");
    }
    assert_eq!(connection.get_message_count().await.expect("count failed"), 3);

    let message = connection
        .get()
        .await
        .expect("get failed")
        .expect("expected a message");
    connection.ack(&message.id).await.expect("ack failed");
    assert_eq!(connection.get_message_count().await.expect("count failed"), 2);

    connection.cleanup().await.expect("cleanup failed");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn cleanup_removes_stream_and_delay_queue() {
    let stream = unique_stream();
    let mut connection = Connection::new(test_options(&stream, "c"))
        .await
        .expect("connect failed");

    connection
        .add("now", &HashMap::new(), 0)
        .await
        .expect("add failed");
    connection
        .add("later", &HashMap::new(), 60_000)
        .await
        .expect("add failed");

    connection.cleanup().await.expect("cleanup failed");

    let mut raw = raw_client().await;
    let remaining: i64 = redis::cmd("EXISTS")
        .arg(&stream)
        .arg(format!("{stream}__queue"))
        .query_async(&mut raw)
        .await
        .expect("EXISTS failed");
    assert_eq!(remaining, 0);

    // A second pass finds nothing to UNLINK and exercises the DEL fallback.
    connection.cleanup().await.expect("repeat cleanup failed");
}
