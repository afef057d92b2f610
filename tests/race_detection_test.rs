// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for mediafetch
//!
//! These tests hammer one fetch manager from many tasks on a multi-threaded
//! runtime and check that the scheduler ends in a consistent state.
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;

use mediafetch::fetch::{
    ActivationPolicy, FetchCategory, FetchLocation, FetchManager, FetchRequest, InMemoryBackend,
    LocationKey, MediaResource, MessageId, NoopHook, PeerId, ResourceKind,
};

// Test configuration
const CONCURRENCY_LEVEL: usize = 50;
const ITERATIONS_PER_TASK: usize = 40;
const RESOURCE_COUNT: usize = 5;
const TEST_TIMEOUT_SECS: u64 = 30;

const PEER: PeerId = PeerId(7);

fn resource(index: usize) -> MediaResource {
    MediaResource::new(format!("res-{}", index % RESOURCE_COUNT), ResourceKind::Photo)
}

fn location_key(index: usize) -> LocationKey {
    LocationKey::Message(MessageId::new(PEER, (index % RESOURCE_COUNT) as i32))
}

fn request(index: usize, flavour: usize) -> FetchRequest {
    let request = FetchRequest::new(
        FetchCategory::Image,
        FetchLocation::Chat(PEER),
        location_key(index),
        resource(index),
    );
    match flavour % 3 {
        0 => request,
        1 => request.elevated(),
        _ => request.user_initiated(),
    }
}

async fn run_churn(policy: ActivationPolicy) {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = FetchManager::with_hook(backend.clone(), policy, Arc::new(NoopHook));
    let mut handles = vec![];

    for i in 0..CONCURRENCY_LEVEL {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let mut held = Vec::new();
            for j in 0..ITERATIONS_PER_TASK {
                let index = i + j;
                match j % 5 {
                    0 | 1 => held.push(manager.interactively_fetched(request(index, i + j))),
                    2 => {
                        if let Some(fetch) = held.pop() {
                            fetch.cancel();
                        }
                    }
                    3 => manager.cancel_interactive_fetches(
                        FetchCategory::Image,
                        FetchLocation::Chat(PEER),
                        location_key(index),
                        &resource(index),
                    ),
                    _ => {
                        let status = manager.fetch_status(
                            FetchCategory::Image,
                            FetchLocation::Chat(PEER),
                            location_key(index),
                            &resource(index),
                        );
                        drop(status);
                    }
                }
                if j % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    // Wait for all tasks with timeout
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - possible deadlock");

    // Every guard has been dropped, so every entry must be gone.
    let snapshot = manager.snapshot().await.expect("snapshot");
    assert!(snapshot.is_idle(), "scheduler leaked state: {:?}", snapshot.categories);
    assert_eq!(snapshot.open_tickets, 0);
    assert!(backend.started() > 0);

    manager.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetch_churn_all_pending() {
    run_churn(ActivationPolicy::AllPending).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetch_churn_top_priority_only() {
    run_churn(ActivationPolicy::TopPriorityOnly).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_status_subscribers() {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = FetchManager::new(backend.clone());
    let target = resource(0);

    let mut watchers = vec![];
    for _ in 0..CONCURRENCY_LEVEL {
        let mut status = manager.fetch_status(
            FetchCategory::Image,
            FetchLocation::Chat(PEER),
            location_key(0),
            &target,
        );
        watchers.push(tokio::spawn(async move {
            let mut last = None;
            while let Some(update) = status.next().await {
                last = Some(update);
            }
            last
        }));
    }

    let fetch = manager.interactively_fetched(request(0, 0));
    manager.snapshot().await.expect("snapshot");
    backend.complete(&target.id);

    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for watcher in watchers {
            let last = watcher.await.expect("Task panicked");
            assert_eq!(last, Some(mediafetch::ResourceStatus::Local));
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out - status streams did not end");

    drop(fetch);
    let snapshot = manager.snapshot().await.expect("snapshot");
    assert!(snapshot.category(FetchCategory::Image).map_or(true, |c| c.entries.is_empty()));
}
