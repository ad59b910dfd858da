// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic tiered-cache usage example.
//!
//! Demonstrates:
//! 1. Connecting to Redis (L2), or an in-memory stand-in when none is set
//! 2. Writing tagged JSON entries and reading them back
//! 3. get_or_set with a slow loader
//! 4. Tag invalidation across both tiers
//! 5. A distributed lock around a critical section
//! 6. Stats, health and raw metrics
//!
//! # Run
//!
//! ```bash
//! # In-memory L2
//! cargo run --example basic_usage
//!
//! # Real Redis
//! docker run -d -p 6379:6379 redis:7-alpine
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tiered_cache::{InMemoryStore, SetOptions, TieredCache, TieredCacheConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the cache emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║            tiered-cache: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and connect
    // ─────────────────────────────────────────────────────────────────────────
    let mut config = TieredCacheConfig::default();
    config.l1.max_entries = 1_000;
    config.l2.prefix = Some("demo:".into());
    config.key_prefix.insert("user".into(), "usr:".into());

    let cache = match std::env::var("REDIS_URL") {
        Ok(url) => {
            println!("📦 Connecting to Redis at {}...", url);
            config.l2.redis_url = Some(url);
            TieredCache::connect(config).await?
        }
        Err(_) => {
            println!("📦 REDIS_URL not set, using an in-memory L2");
            TieredCache::with_store(config, Arc::new(InMemoryStore::new()))
        }
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write tagged entries, read them back
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing 5 entries...");
    let entries = vec![
        ("alice", json!({"name": "Alice", "role": "admin"})),
        ("bob", json!({"name": "Bob", "role": "user"})),
        ("carol", json!({"name": "Carol", "role": "user"})),
    ];
    for (id, data) in &entries {
        let key = cache.config().key("user", id);
        cache.set(&key, data, SetOptions::new().category("user").tags(["user", "people"])).await;
        println!("   └─ {} → {}", key, data);
    }
    cache.set("config:app", &json!({"theme": "dark"}), SetOptions::new().tag("config")).await;
    cache.set("stats:daily", &json!({"requests": 42000}), SetOptions::l2_only().ttl_secs(60)).await;

    println!("\n📖 Reading back (with timing)...");
    for key in ["usr:alice", "usr:bob", "config:app", "stats:daily", "nobody"] {
        let start = Instant::now();
        let value: Option<serde_json::Value> = cache.get(key).await;
        println!("   └─ {} → {:?} ({:?})", key, value, start.elapsed());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. get_or_set: the loader runs once
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🐢 get_or_set with a slow loader...");
    for attempt in 1..=2 {
        let start = Instant::now();
        let report: Option<String> = cache
            .get_or_set(
                "report:q3",
                || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, std::io::Error>(Some("Q3: up and to the right".to_string()))
                },
                SetOptions::new().tag("report"),
            )
            .await?;
        println!("   └─ attempt {}: {:?} ({:?})", attempt, report, start.elapsed());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Tag invalidation
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🏷️  Invalidating tag 'people'...");
    let removed = cache.delete_by_tag("people").await;
    println!("   └─ removed {} entries", removed);
    let alice: Option<serde_json::Value> = cache.get("usr:alice").await;
    println!("   └─ usr:alice now → {:?}", alice);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Distributed lock
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔒 Running a critical section under 'payout:7'...");
    let paid = cache
        .with_lock("payout:7", Duration::from_secs(10), || async { "paid once" })
        .await?;
    println!("   └─ {}", paid);

    let guard = cache.lock("payout:8").await?;
    println!("   └─ holding payout:8, second acquire → {:?}",
        cache.acquire_lock("payout:8", Duration::from_secs(10)).await);
    guard.release().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Stats, health, metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Stats:");
    println!("{}", serde_json::to_string_pretty(&cache.stats())?);

    println!("\n🩺 Health:");
    println!("{}", serde_json::to_string_pretty(&cache.health_check().await)?);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🧹 Clearing the demo namespace...");
    cache.clear().await;

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("   │  └─ {}{} count={} avg={:.6}", name, labels, count, avg);
        }
    }

    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
