//! Concurrency limiter ordering and bounds under contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai_reliability::config::ConcurrencyConfig;
use ai_reliability::{Limiter, LimiterRegistry};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn task_after_limit_waits_for_a_completion() {
    let limiter = Arc::new(Limiter::new(3));
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..4u64 {
        let limiter = limiter.clone();
        let events = events.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .run(|| async move {
                    events.lock().unwrap().push(format!("start {i}"));
                    sleep(Duration::from_millis(10 * (i + 1))).await;
                    events.lock().unwrap().push(format!("end {i}"));
                })
                .await
                .unwrap();
        }));
        // deterministic submission order
        tokio::task::yield_now().await;
    }
    for h in handles {
        h.await.unwrap();
    }

    let events = events.lock().unwrap();
    let start_3 = events.iter().position(|e| e == "start 3").unwrap();
    let end_0 = events.iter().position(|e| e == "end 0").unwrap();
    assert!(end_0 < start_3, "fourth task started before a slot freed: {events:?}");
}

#[tokio::test]
async fn high_water_mark_never_exceeds_limit() {
    let registry = Arc::new(LimiterRegistry::new(ConcurrencyConfig::default()));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..24 {
        let registry = registry.clone();
        let running = running.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let limiter = registry.limiter("chat", Some("u1"));
            let _permit = limiter.acquire().await.unwrap();
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            sleep(Duration::from_millis(2)).await;
            running.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(registry.total_active(), 0);
    assert_eq!(registry.total_queued(None), 0);
}

#[tokio::test(start_paused = true)]
async fn queued_work_runs_in_submission_order() {
    let limiter = Arc::new(Limiter::new(1));
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = limiter.acquire().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let task_limiter = limiter.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            task_limiter
                .run(|| async move { order.lock().unwrap().push(i) })
                .await
                .unwrap();
        }));
        while limiter.queued() < i + 1 {
            tokio::task::yield_now().await;
        }
    }

    drop(gate);
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_gives_its_turn_to_the_next() {
    let limiter = Arc::new(Limiter::new(1));
    let gate = limiter.acquire().await.unwrap();

    let impatient = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            tokio::time::timeout(Duration::from_millis(5), limiter.acquire())
                .await
                .is_err()
        })
    };
    let patient = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.run(|| async { "ran" }).await.unwrap() })
    };

    assert!(impatient.await.unwrap());
    drop(gate);
    assert_eq!(patient.await.unwrap(), "ran");
    assert_eq!(limiter.queued(), 0);
    assert_eq!(limiter.active(), 0);
}
