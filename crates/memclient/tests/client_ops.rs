//! End-to-end command round-trips against in-process binary-protocol
//! servers: single-key commands, quiet writes, CAS, batched multi-key
//! operations spanning servers, and per-server commands.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::FakeMemcached;
use memclient::{MemcachedClient, ValueWithCas};

async fn client_for(servers: &[&FakeMemcached]) -> MemcachedClient {
    common::init_tracing();
    MemcachedClient::builder("test-cache")
        .servers(servers.iter().map(|server| server.server_address()))
        .min_connections_per_server(1)
        .max_connections_per_server(4)
        .connect_timeout(Some(Duration::from_secs(1)))
        .write_timeout(Some(Duration::from_secs(1)))
        .response_timeout(Some(Duration::from_secs(1)))
        .failover(false)
        .health_check_interval(None)
        .build()
        .await
}

#[tokio::test(flavor = "multi_thread")]
async fn set_get_delete_round_trip() {
    let server = FakeMemcached::start().await;
    let client = client_for(&[&server]).await;

    assert!(client.set("greeting", &"hello".to_string(), 60, false).await);
    let value: Option<String> = client.get("greeting").await;
    assert_eq!(value.as_deref(), Some("hello"));

    assert!(client.delete("greeting", false).await);
    let value: Option<String> = client.get("greeting").await;
    assert_eq!(value, None);
    // Deleting a missing key reports the nothing-happened value.
    assert!(!client.delete("greeting", false).await);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn add_replace_append_prepend() {
    let server = FakeMemcached::start().await;
    let client = client_for(&[&server]).await;

    assert!(!client.replace("key", &"v".to_string(), 0, false).await);
    assert!(client.add("key", &"core".to_string(), 0, false).await);
    assert!(!client.add("key", &"other".to_string(), 0, false).await);
    assert!(client.replace("key", &"core".to_string(), 0, false).await);

    assert!(client.append("key", &"-tail".to_string(), false).await);
    assert!(client.prepend("key", &"head-".to_string(), false).await);
    let value: Option<String> = client.get("key").await;
    assert_eq!(value.as_deref(), Some("head-core-tail"));

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn quiet_writes_complete_on_write_success() {
    let server = FakeMemcached::start().await;
    let client = client_for(&[&server]).await;

    // The quiet set produces no response; the following get on the same
    // connection exercises the no-reply skip in the parser.
    assert!(client.set("quiet", &"payload".to_string(), 0, true).await);
    let value: Option<String> = client.get("quiet").await;
    assert_eq!(value.as_deref(), Some("payload"));

    assert!(client.delete("quiet", true).await);
    assert!(
        common::wait_until(Duration::from_secs(1), || !server.contains_key(b"quiet")).await,
        "quiet delete never reached the server"
    );

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cas_succeeds_only_with_the_current_token() {
    let server = FakeMemcached::start().await;
    let client = client_for(&[&server]).await;

    assert!(client.set("entry", &"one".to_string(), 0, false).await);
    let read: ValueWithCas<String> = client.gets("entry").await.expect("gets hit");
    assert_eq!(read.value, "one");
    assert!(read.cas != 0);

    assert!(client.cas("entry", &"two".to_string(), 0, read.cas, false).await);
    // The token moved on; the stale one must lose.
    assert!(!client.cas("entry", &"three".to_string(), 0, read.cas, false).await);
    let value: Option<String> = client.get("entry").await;
    assert_eq!(value.as_deref(), Some("two"));

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn counters_increment_and_decrement() {
    let server = FakeMemcached::start().await;
    let client = client_for(&[&server]).await;

    assert_eq!(client.incr("hits", 1, 10, 0, false).await, 10);
    assert_eq!(client.incr("hits", 5, 0, 0, false).await, 15);
    assert_eq!(client.decr("hits", 3, 0, 0, false).await, 12);
    // Floored at zero, never negative.
    assert_eq!(client.decr("hits", 100, 0, 0, false).await, 0);

    // A counter seeded through the value codec is server-incrementable and
    // reads back as an integer.
    assert!(client.set("seeded", &5u64, 0, false).await);
    assert_eq!(client.incr("seeded", 2, 0, 0, false).await, 7);
    let current: Option<u64> = client.get("seeded").await;
    assert_eq!(current, Some(7));

    // A non-numeric value cannot be incremented.
    assert!(client.set("text", &"abc".to_string(), 0, false).await);
    assert_eq!(client.incr("text", 1, 0, 0, false).await, -1);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn touch_and_get_and_touch() {
    let server = FakeMemcached::start().await;
    let client = client_for(&[&server]).await;

    assert!(!client.touch("missing", 30).await);
    assert!(client.set("entry", &"v".to_string(), 1, false).await);
    assert!(client.touch("entry", 300).await);
    let value: Option<String> = client.gat("entry", 600).await;
    assert_eq!(value.as_deref(), Some("v"));

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_key_operations_span_servers() {
    let first = FakeMemcached::start().await;
    let second = FakeMemcached::start().await;
    let client = client_for(&[&first, &second]).await;

    let entries: HashMap<String, String> =
        (0..50).map(|index| (format!("key-{index}"), format!("value-{index}"))).collect();
    let stored = client.set_multi(&entries, 0).await;
    assert_eq!(stored.len(), 50);
    assert!(stored.values().all(|ok| *ok));

    // Consistent hashing spreads the keys over both servers.
    assert_eq!(first.item_count() + second.item_count(), 50);
    assert!(first.item_count() > 0, "first server got no keys");
    assert!(second.item_count() > 0, "second server got no keys");

    let keys: Vec<String> = entries.keys().cloned().collect();
    let fetched: HashMap<String, String> = client.get_multi(&keys).await;
    assert_eq!(fetched.len(), 50);
    for (key, value) in &entries {
        assert_eq!(fetched.get(key), Some(value));
    }

    // Unknown keys are simply absent from the result.
    let sparse: Vec<String> = vec!["key-3".into(), "nope".into(), "key-7".into()];
    let fetched: HashMap<String, String> = client.get_multi(&sparse).await;
    assert_eq!(fetched.len(), 2);

    let with_cas: HashMap<String, ValueWithCas<String>> = client.gets_multi(&keys).await;
    assert_eq!(with_cas.len(), 50);
    let updates: HashMap<String, ValueWithCas<String>> = with_cas
        .into_iter()
        .map(|(key, read)| {
            (key.clone(), ValueWithCas { value: format!("updated-{key}"), cas: read.cas })
        })
        .collect();
    let swapped = client.cas_multi(&updates, 0).await;
    assert_eq!(swapped.len(), 50);

    let deleted = client.delete_multi(&keys).await;
    assert_eq!(deleted.len(), 50);
    assert_eq!(first.item_count() + second.item_count(), 0);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn per_server_commands() {
    let server = FakeMemcached::start().await;
    let client = client_for(&[&server]).await;
    let address = server.server_address();

    assert!(client.noop(&address).await);
    assert_eq!(client.version(&address).await.as_deref(), Some("1.6.99-fake"));
    assert!(client.verbosity(&address, 1).await);

    assert!(client.set("a", &"1".to_string(), 0, false).await);
    assert!(client.set("b", &"2".to_string(), 0, false).await);
    let stats = client.stats(&address).await;
    assert_eq!(stats.get("pid").map(String::as_str), Some("4242"));
    assert_eq!(stats.get("curr_items").map(String::as_str), Some("2"));

    assert!(client.flush(&address, 0).await);
    assert_eq!(server.item_count(), 0);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn response_timeout_discards_the_connection() {
    let server = FakeMemcached::start().await;
    common::init_tracing();
    let client = MemcachedClient::builder("stall-cache")
        .servers([server.server_address()])
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .response_timeout(Some(Duration::from_millis(200)))
        .failover(false)
        .health_check_interval(None)
        .build()
        .await;
    let address = server.server_address();
    assert_eq!(client.pool_size(&address), 1);

    server.set_stalled(true);
    let value: Option<String> = client.get("key").await;
    assert_eq!(value, None);
    // The timed-out connection cannot be reused: positional correlation
    // would be broken by the late response.
    assert_eq!(client.pool_size(&address), 0);

    server.set_stalled(false);
    assert!(client.set("key", &"v".to_string(), 0, false).await);
    assert_eq!(client.pool_size(&address), 1);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_caller_discards_the_connection() {
    let server = FakeMemcached::start().await;
    common::init_tracing();
    let client = MemcachedClient::builder("cancel-cache")
        .servers([server.server_address()])
        .min_connections_per_server(1)
        .max_connections_per_server(2)
        .response_timeout(Some(Duration::from_secs(10)))
        .failover(false)
        .health_check_interval(None)
        .build()
        .await;
    let address = server.server_address();
    assert_eq!(client.pool_size(&address), 1);

    // Park a get on a server that never answers, then abandon it.
    server.set_stalled(true);
    let caller = {
        let client = client.clone();
        tokio::spawn(async move {
            let _: Option<String> = client.get("key").await;
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    caller.abort();
    let _ = caller.await;

    // The abandoned attempt leaves the in-flight order indeterminate, so
    // the connection must be removed rather than returned to the pool.
    assert!(
        common::wait_until(Duration::from_secs(2), || client.pool_size(&address) == 0).await,
        "abandoned connection was not discarded"
    );

    server.set_stalled(false);
    assert!(client.set("key", &"v".to_string(), 0, false).await);
    assert_eq!(client.pool_size(&address), 1);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn values_keep_their_flags() {
    let server = FakeMemcached::start().await;
    let client = client_for(&[&server]).await;

    let raw: Vec<u8> = vec![0, 159, 146, 150];
    assert!(client.set("blob", &raw, 0, false).await);
    let bytes: Option<Vec<u8>> = client.get("blob").await;
    assert_eq!(bytes, Some(raw));

    // A raw blob that is not UTF-8 refuses to decode as a string.
    let text: Option<String> = client.get("blob").await;
    assert_eq!(text, None);

    client.shutdown().await;
}
