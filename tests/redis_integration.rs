//! Redis-backed durability tests
//!
//! Need a running server. Run with:
//! TAGBOX_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::time::{SystemTime, UNIX_EPOCH};

use tagbox::config::StoreConfig;
use tagbox::{Config, RedisStore, TagStore, TagSystem};

fn redis_url() -> String {
    std::env::var("TAGBOX_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Prefix unique to this run so parallel runs do not collide
fn unique_prefix(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("tagbox_test:{}:{}:", name, nanos)
}

#[tokio::test]
#[ignore]
async fn test_store_primitives() {
    let config = StoreConfig {
        url: redis_url(),
        ..StoreConfig::default()
    };
    let store = RedisStore::connect(&config).await.expect("Redis not reachable");
    let prefix = unique_prefix("primitives");

    for i in 0..20 {
        store
            .set(&format!("{}t{}", prefix, i), &[i as u8])
            .await
            .unwrap();
    }
    let keys = store.scan_prefix(&prefix).await.unwrap();
    assert_eq!(keys.len(), 20);

    assert_eq!(
        store.get(&format!("{}t3", prefix)).await.unwrap(),
        Some(vec![3])
    );
    for key in keys {
        store.delete(&key).await.unwrap();
    }
    assert!(store.scan_prefix(&prefix).await.unwrap().is_empty());
    assert!(store.metrics().commands_executed > 0);

    store.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_shutdown_then_recover() {
    let prefix = unique_prefix("recover");
    let config = Config::with_url(redis_url())
        .key_prefix(prefix.clone())
        .auto_replicate(false);

    let system = TagSystem::connect(config.clone()).await.expect("Redis not reachable");
    system.batch_add_tags(1, &["vip", "male"]);
    system.batch_add_tags(2, &["vip", "female"]);
    system.shutdown().await.unwrap();

    let restored = TagSystem::connect(config).await.unwrap();
    assert_eq!(restored.recover_all().await.unwrap(), 3);
    assert!(restored.has_tag(2, "female"));
    assert_eq!(restored.tag_cardinality("vip"), 2);

    // Empty the tags so the replicas are deleted again
    for (id, tag) in [(1, "vip"), (1, "male"), (2, "vip"), (2, "female")] {
        restored.remove_tag(id, tag);
    }
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    restored.shutdown().await.unwrap();
}
