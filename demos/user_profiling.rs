//! User profiling demo
//!
//! Tags a handful of users and answers typical segmentation questions.
//! Connects to Redis when `TAGBOX_STORE_URL` (or the default URL) is
//! reachable, otherwise falls back to the in-process store.
//!
//! Run with: RUST_LOG=tagbox=debug cargo run --example user_profiling

use std::sync::Arc;

use tagbox::{count, object_ids, Config, MemoryStore, QueryOp, TagSystem};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> tagbox::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tagbox=info")),
        )
        .init();

    let config = Config::from_env();
    let system = match TagSystem::connect(config.clone()).await {
        Ok(system) => system,
        Err(e) => {
            warn!(error = %e, "Redis unavailable, using in-memory store");
            TagSystem::with_store(config, Arc::new(MemoryStore::new())).await?
        },
    };

    println!("=== Setting up user profiles ===");
    let users: [(u32, &str, &[&str]); 6] = [
        (1001, "Alice", &["premium", "active", "mobile", "30days"]),
        (1002, "Bob", &["free", "inactive", "desktop", "90days"]),
        (1003, "Charlie", &["premium", "active", "mobile", "7days"]),
        (1004, "Diana", &["premium", "inactive", "mobile", "60days"]),
        (1005, "Eve", &["free", "active", "desktop", "30days"]),
        (1006, "Frank", &["premium", "active", "desktop", "30days"]),
    ];
    for (id, name, tags) in users {
        system.batch_add_tags(id, tags);
        println!("User {} ({}): {:?}", id, name, tags);
    }

    println!("\n=== Active premium users ===");
    let result = system.query_and(&["premium", "active"]);
    println!("Premium AND active: {:?} ({} users)", object_ids(&result), count(&result));

    println!("\n=== At-risk users ===");
    let result = system.query_and(&["premium", "inactive"]);
    println!("Premium AND inactive: {:?}", object_ids(&result));

    println!("\n=== Churn risk ===");
    let result = system.query_or(&["inactive", "90days"]);
    println!("Inactive OR 90days: {:?}", object_ids(&result));

    println!("\n=== Cross-platform users ===");
    let result = system.query_and(&["mobile", "desktop"]);
    println!("Mobile AND desktop (empty expected): {:?}", object_ids(&result));

    println!("\n=== Desktop-only premium users ===");
    let result = system.query_difference("premium", "mobile");
    println!("Premium but not mobile: {:?}", object_ids(&result));

    println!("\n=== Complex segmentation ===");
    let result = system.complex_query(&[
        QueryOp::and(["premium"]),
        QueryOp::or(["30days", "60days"]),
        QueryOp::not("desktop"),
    ])?;
    println!(
        "Premium AND (30days OR 60days) AND NOT desktop: {:?}",
        object_ids(&result)
    );

    println!("\n=== System statistics ===");
    let stats = system.stats();
    println!("Total tags: {}", stats.total_tags);
    println!("Total tagged objects: {}", stats.unique_objects);
    println!("Memory usage: {:.2} KB", stats.memory_usage as f64 / 1024.0);
    if let Some(tag) = &stats.largest_tag {
        println!("Largest segment: {} ({} users)", tag, stats.largest_tag_size);
    }

    println!("\n=== Per-tag statistics ===");
    let mut tags = system.tag_names();
    tags.sort();
    for tag in tags {
        println!("  {}: {} users", tag, system.tag_cardinality(&tag));
    }

    system.shutdown().await?;
    info!("Demo finished");
    Ok(())
}
