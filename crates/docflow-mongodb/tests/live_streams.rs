//! Integration tests for query streams against a live server.
//!
//! These tests require a MongoDB server to be running.
//! Set MONGODB_URI and run with: cargo test -p docflow-mongodb -- --ignored

use bson::{doc, Document};
use docflow_mongodb::{ClientRegistry, MongoStreams, PoolConfig};
use docflow_stream::{handler, void_handler, Context, FlowConfig, ReadStream};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn uri() -> String {
    std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017/docflow_test".to_string())
}

async fn wait_for(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Test streaming a find with pauses, checking order and a single end
#[tokio::test]
#[ignore] // Only run with --ignored flag when a server is available
async fn test_find_stream_with_pauses() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = ClientRegistry::new();
    let conn = registry
        .acquire("streams", &uri(), PoolConfig::default())
        .await
        .unwrap();
    let collection = conn.collection("flow_find");
    collection.drop().await.unwrap();
    let docs: Vec<Document> = (0..500).map(|i| doc! { "n": i }).collect();
    collection.insert_many(docs).await.unwrap();

    let ctx = Context::new();
    let streams = MongoStreams::new(ctx.clone(), FlowConfig::default());
    let options = mongodb::options::FindOptions::builder()
        .sort(doc! { "n": 1 })
        .build();
    let stream = Arc::new(streams.find_stream(&collection, doc! {}, Some(options)));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let ends = Arc::new(AtomicUsize::new(0));
    let (s, toggle) = (Arc::clone(&seen), Arc::clone(&stream));
    stream.handler(handler(move |doc: Document| {
        let count = {
            let mut seen = s.lock();
            seen.push(doc.get_i32("n").unwrap());
            seen.len()
        };
        if count % 50 == 0 {
            toggle.pause();
            let resume = Arc::clone(&toggle);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                resume.resume();
            });
        }
    }));
    let e = Arc::clone(&ends);
    stream.end_handler(void_handler(move || {
        e.fetch_add(1, Ordering::SeqCst);
    }));

    wait_for(|| ends.load(Ordering::SeqCst) == 1).await;
    assert_eq!(*seen.lock(), (0..500).collect::<Vec<_>>());

    collection.drop().await.unwrap();
    assert!(registry.release("streams").await.unwrap());
}

/// Test streaming an aggregation pipeline
#[tokio::test]
#[ignore] // Only run with --ignored flag when a server is available
async fn test_aggregate_stream() {
    let registry = ClientRegistry::new();
    let conn = registry
        .acquire("streams", &uri(), PoolConfig::default())
        .await
        .unwrap();
    let collection = conn.collection("flow_aggregate");
    collection.drop().await.unwrap();
    let docs: Vec<Document> = (0..100)
        .map(|i| doc! { "n": i, "even": i % 2 == 0 })
        .collect();
    collection.insert_many(docs).await.unwrap();

    let ctx = Context::new();
    let streams = MongoStreams::new(ctx.clone(), FlowConfig::default());
    let pipeline = vec![
        doc! { "$match": { "even": true } },
        doc! { "$sort": { "n": 1 } },
    ];
    let stream = streams.aggregate_stream(&collection, pipeline, None);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let ends = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    stream.handler(handler(move |doc: Document| s.lock().push(doc.get_i32("n").unwrap())));
    let e = Arc::clone(&ends);
    stream.end_handler(void_handler(move || {
        e.fetch_add(1, Ordering::SeqCst);
    }));

    wait_for(|| ends.load(Ordering::SeqCst) == 1).await;
    assert_eq!(*seen.lock(), (0..100).step_by(2).collect::<Vec<_>>());

    collection.drop().await.unwrap();
    assert!(registry.release("streams").await.unwrap());
}
