//! Lease exclusivity and crash recovery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use audit_queue::{JobStatus, JobStore, MemoryStore, NewJob};
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

const LEASE: Duration = Duration::from_secs(30);

async fn enqueue(store: &MemoryStore, n: usize) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        ids.push(
            store
                .enqueue(NewJob::new("site_audit", json!({ "n": i })), None)
                .await
                .unwrap(),
        );
    }
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_job() {
    let store = Arc::new(MemoryStore::new());
    let ids = enqueue(&store, 50).await;

    let mut handles = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{}", w);
            let mut claimed = Vec::new();
            while let Some(job) = store.claim(&worker_id, LEASE).await.unwrap() {
                assert_eq!(job.locked_by.as_deref(), Some(worker_id.as_str()));
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen, ids.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn expired_lease_is_reclaimable_only_after_expiry() {
    let store = MemoryStore::new();
    let id = store
        .enqueue(NewJob::new("site_audit", json!({})), None)
        .await
        .unwrap();

    let first = store.claim("worker-a", LEASE).await.unwrap().unwrap();
    assert_eq!(first.attempt, 1);

    // worker-a crashes and never renews
    assert!(store.claim("worker-b", LEASE).await.unwrap().is_none());
    store.advance(Duration::from_secs(29)).await;
    assert!(store.claim("worker-b", LEASE).await.unwrap().is_none());

    store.advance(Duration::from_secs(2)).await;
    let second = store.claim("worker-b", LEASE).await.unwrap().unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.attempt, 2);
    assert_eq!(second.locked_by.as_deref(), Some("worker-b"));

    // The crashed worker can no longer touch the job
    assert!(!store.renew_lease(id, "worker-a", LEASE).await.unwrap());
    assert!(!store.complete(id, "worker-a", json!({})).await.unwrap());
    assert!(store.complete(id, "worker-b", json!({})).await.unwrap());
}

#[tokio::test]
async fn renewal_prevents_reclaim() {
    let store = MemoryStore::new();
    let id = store
        .enqueue(NewJob::new("site_audit", json!({})), None)
        .await
        .unwrap();
    store.claim("worker-a", LEASE).await.unwrap().unwrap();

    for _ in 0..4 {
        store.advance(Duration::from_secs(15)).await;
        assert!(store.renew_lease(id, "worker-a", LEASE).await.unwrap());
        assert!(store.claim("worker-b", LEASE).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn expired_final_attempt_is_rerun() {
    let store = MemoryStore::new();
    let id = store
        .enqueue(
            NewJob::new("site_audit", json!({})).with_max_attempts(1),
            None,
        )
        .await
        .unwrap();
    store.claim("worker-a", LEASE).await.unwrap().unwrap();
    store.advance(Duration::from_secs(31)).await;

    // The crashed final attempt runs again under the same number
    let job = store.claim("worker-b", LEASE).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some("worker-b"));
    assert!(job.last_error.is_none());

    assert!(!store.complete(id, "worker-a", json!({})).await.unwrap());
    assert!(store.complete(id, "worker-b", json!({})).await.unwrap());
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn reclaim_stops_counting_at_the_cap() {
    let store = MemoryStore::new();
    let id = store
        .enqueue(
            NewJob::new("site_audit", json!({})).with_max_attempts(2),
            None,
        )
        .await
        .unwrap();

    let mut attempts = Vec::new();
    for worker in ["worker-a", "worker-b", "worker-c", "worker-d"] {
        let job = store.claim(worker, LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        attempts.push(job.attempt);
        store.advance(Duration::from_secs(31)).await;
    }
    assert_eq!(attempts, vec![1, 2, 2, 2]);
}

#[derive(Debug, Clone)]
enum Op {
    Claim(usize),
    Renew(usize),
    Complete(usize),
    Advance(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..4usize).prop_map(Op::Claim),
        2 => (0..4usize).prop_map(Op::Renew),
        1 => (0..4usize).prop_map(Op::Complete),
        2 => (1..40u64).prop_map(Op::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A claim never hands out a job whose current lease is still valid.
    #[test]
    fn claim_respects_live_leases(jobs in 1..5usize, ops in prop::collection::vec(op(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let store = MemoryStore::new();
            enqueue(&store, jobs).await;
            let lease_chrono = chrono::Duration::from_std(LEASE).unwrap();

            // job -> (holder, lease end) as last observed
            let mut holders: HashMap<Uuid, (String, DateTime<Utc>)> = HashMap::new();
            let workers: Vec<String> = (0..4).map(|w| format!("worker-{}", w)).collect();

            for op in ops {
                match op {
                    Op::Claim(w) => {
                        if let Some(job) = store.claim(&workers[w], LEASE).await.unwrap() {
                            let until = job.locked_until.unwrap();
                            let claimed_at = until - lease_chrono;
                            if let Some((_, previous_until)) = holders.get(&job.id) {
                                assert!(
                                    *previous_until < claimed_at,
                                    "job {} reclaimed while its lease was valid",
                                    job.id
                                );
                            }
                            holders.insert(job.id, (workers[w].clone(), until));
                        }
                    }
                    Op::Renew(w) => {
                        for (id, (holder, until)) in holders.iter_mut() {
                            let renewed = store.renew_lease(*id, &workers[w], LEASE).await.unwrap();
                            if renewed {
                                assert_eq!(holder, &workers[w]);
                                *until = store.get(*id).await.unwrap().unwrap().locked_until.unwrap();
                            }
                        }
                    }
                    Op::Complete(w) => {
                        let held: Vec<Uuid> = holders
                            .iter()
                            .filter(|(_, (holder, _))| holder == &workers[w])
                            .map(|(id, _)| *id)
                            .collect();
                        for id in held {
                            if store.complete(id, &workers[w], json!({})).await.unwrap() {
                                holders.remove(&id);
                            }
                        }
                    }
                    Op::Advance(secs) => store.advance(Duration::from_secs(secs)).await,
                }

                for job in store.jobs().await {
                    assert!(job.attempt <= job.max_attempts);
                }
            }
        });
    }
}
