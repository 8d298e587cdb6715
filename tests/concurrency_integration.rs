mod support;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cachegate::CacheOutcome;
use cachegate::protocol::CacheRequest;

use support::*;

const CLIENTS: usize = 8;

fn run_concurrently(
    cache: &cachegate::ResponseCache,
    handler: &Arc<ScriptedHandler>,
    req: &CacheRequest,
) -> Vec<(CacheOutcome, Vec<u8>)> {
    let barrier = Arc::new(Barrier::new(CLIENTS));
    let workers: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let cache = cache.clone();
            let handler = handler.clone();
            let barrier = barrier.clone();
            let req = req.clone();
            thread::spawn(move || {
                barrier.wait();
                let (outcome, resp) = fetch(&cache, &req, handler.as_ref());
                (outcome, resp.body().to_vec())
            })
        })
        .collect();
    workers
        .into_iter()
        .map(|worker| worker.join().expect("worker panicked"))
        .collect()
}

#[test]
fn only_one_request_fills_a_resource() {
    let (cache, store, _clock) = memory_cache(16);
    let handler = Arc::new(
        ScriptedHandler::ok(b"slow body")
            .with_header("cache-control", "max-age=60")
            .with_delay(Duration::from_millis(200)),
    );
    let req = CacheRequest::get("h", "/slow");

    let results = run_concurrently(&cache, &handler, &req);

    let filled = results
        .iter()
        .filter(|(outcome, _)| *outcome == CacheOutcome::Filled)
        .count();
    assert_eq!(filled, 1);
    for (outcome, body) in &results {
        assert!(
            matches!(
                outcome,
                CacheOutcome::Filled | CacheOutcome::Miss | CacheOutcome::Hit
            ),
            "unexpected outcome {outcome:?}"
        );
        assert_eq!(body, b"slow body");
    }
    // One stored copy regardless of how many requests passed through.
    assert_eq!(store.allocated_blocks(), 1);

    let calls = handler.calls();
    assert_eq!(fetch(&cache, &req, handler.as_ref()).0, CacheOutcome::Hit);
    assert_eq!(handler.calls(), calls);
}

#[test]
fn stale_entry_is_served_while_one_request_revalidates() {
    let (cache, _store, clock) = memory_cache(16);
    let handler = Arc::new(
        ScriptedHandler::ok(b"versioned")
            .with_header("cache-control", "max-age=60")
            .with_header("etag", "\"v\"")
            .honoring_validators()
            .with_delay(Duration::from_millis(200)),
    );
    let req = CacheRequest::get("h", "/stale");
    fetch(&cache, &req, handler.as_ref());
    clock.advance(Duration::from_secs(61));

    let results = run_concurrently(&cache, &handler, &req);

    assert_eq!(handler.calls(), 2);
    let revalidated = results
        .iter()
        .filter(|(outcome, _)| *outcome == CacheOutcome::Revalidated)
        .count();
    assert_eq!(revalidated, 1);
    assert!(results.iter().all(|(_, body)| body == b"versioned"));
    assert_eq!(fetch(&cache, &req, handler.as_ref()).0, CacheOutcome::Hit);
}

#[test]
fn clearing_during_traffic_leaves_no_blocks_behind() {
    let (cache, store, _clock) = memory_cache(4);
    let handler = Arc::new(
        ScriptedHandler::ok(&[7u8; 1500]).with_header("cache-control", "max-age=60"),
    );

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let cache = cache.clone();
            let handler = handler.clone();
            thread::spawn(move || {
                for round in 0..50 {
                    let req = CacheRequest::get("h", format!("/{}", (worker + round) % 6));
                    let (_, resp) = fetch(&cache, &req, handler.as_ref());
                    assert_eq!(resp.body().len(), 1500);
                    if round % 10 == 0 {
                        cache.clear();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    cache.clear();
    assert_eq!(store.allocated_blocks(), 0);
}
