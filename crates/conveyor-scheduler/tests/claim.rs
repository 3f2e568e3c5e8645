use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use conveyor_scheduler::types::now;
use conveyor_scheduler::{JobRecord, JobStatus, JobStore, NewJob, SqliteJobStore};

fn seed(store: &dyn JobStore, tenant: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|_| {
            let job = JobRecord::from_new(NewJob::new(tenant, "noop"), now());
            store.insert(&job).unwrap();
            job.id
        })
        .collect()
}

/// Drain the queue from several threads; every job is claimed exactly once.
fn drain(
    stores: Vec<Arc<dyn JobStore>>,
    tenant: &'static str,
    threads_per_store: usize,
) -> Vec<String> {
    let mut handles = Vec::new();
    for store in stores {
        for _ in 0..threads_per_store {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_highest_priority_queued(tenant).unwrap() {
                    assert_eq!(job.status, JobStatus::ToBeRun);
                    claimed.push(job.id);
                }
                claimed
            }));
        }
    }
    handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
}

#[test]
fn concurrent_claims_on_one_connection_never_overlap() {
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
    let seeded = seed(store.as_ref(), "acme", 50);

    let claimed = drain(vec![store], "acme", 8);

    assert_eq!(claimed.len(), seeded.len());
    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(unique.len(), seeded.len());
}

#[test]
fn concurrent_claims_across_connections_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let first: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&path).unwrap());
    let second: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&path).unwrap());
    let seeded = seed(first.as_ref(), "acme", 40);

    let claimed = drain(vec![first, Arc::clone(&second)], "acme", 3);

    assert_eq!(claimed.len(), seeded.len());
    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(unique.len(), seeded.len());
    assert!(second.find_by_status("acme", JobStatus::Queued).unwrap().is_empty());
}

#[test]
fn claims_follow_priority_then_submission_order() {
    let store = SqliteJobStore::open_in_memory().unwrap();
    let mut submitted = Vec::new();
    for priority in [10, 100, 50, 100, 10] {
        let job = JobRecord::from_new(NewJob::new("acme", "noop").with_priority(priority), now());
        store.insert(&job).unwrap();
        submitted.push((priority, job.id));
    }

    let order: Vec<String> =
        std::iter::from_fn(|| store.claim_highest_priority_queued("acme").unwrap())
            .map(|job| job.id)
            .collect();

    let expected = vec![
        submitted[1].1.clone(),
        submitted[3].1.clone(),
        submitted[2].1.clone(),
        submitted[0].1.clone(),
        submitted[4].1.clone(),
    ];
    assert_eq!(order, expected);
}

#[test]
fn tenants_do_not_share_queues() {
    let store = SqliteJobStore::open_in_memory().unwrap();
    seed(&store, "acme", 2);
    assert!(store.claim_highest_priority_queued("globex").unwrap().is_none());
    assert!(store.claim_highest_priority_queued("acme").unwrap().is_some());
}
