//! Concurrent claims from independent store connections.
//!
//! Every thread opens its own `Store` on the same database file, waits on a
//! barrier, then claims. Exactly one claim per unit may succeed.

use std::sync::{Arc, Barrier};
use std::thread;

use foreman::core::types::{JobMeta, StepSpec, SubtaskSpec, UnitStatus};
use foreman::io::store::Store;

const WORKERS: usize = 8;

fn race<T, F>(db: &std::path::Path, claim: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&mut Store) -> Option<T> + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(WORKERS));
    let claim = Arc::new(claim);
    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let claim = Arc::clone(&claim);
            let db = db.to_path_buf();
            thread::spawn(move || {
                let mut store = Store::open(&db).expect("open store");
                barrier.wait();
                claim(&mut store)
            })
        })
        .collect();
    handles
        .into_iter()
        .filter_map(|handle| handle.join().expect("worker thread"))
        .collect()
}

#[test]
fn one_worker_wins_each_job() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = temp.path().join("data/foreman.sqlite");
    let store = Store::open(&db).expect("open store");
    for n in 0..3 {
        store
            .create_job(&format!("job {n}"), "do it", &JobMeta::default())
            .expect("create job");
    }

    let claimed = race(&db, |store| store.claim_next_job().expect("claim"));
    assert_eq!(claimed.len(), 3, "each queued job is claimed once");
    let mut ids: Vec<i64> = claimed.iter().map(|job| job.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "no job is claimed twice");
    assert!(claimed.iter().all(|job| job.status == UnitStatus::Running));
}

#[test]
fn only_one_step_of_a_job_runs_at_a_time() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = temp.path().join("foreman.sqlite");
    let mut store = Store::open(&db).expect("open store");
    let job = store
        .create_job("steps", "do it", &JobMeta::default())
        .expect("create job");
    let specs = [StepSpec::new("first"), StepSpec::new("second")];
    store.create_steps(job.id, &specs).expect("create steps");

    let job_id = job.id;
    let claimed = race(&db, move |store| {
        store.claim_next_step(job_id).expect("claim step")
    });
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].index, 1);

    // The sibling guard holds until the running step is marked.
    assert!(store.claim_next_step(job.id).expect("claim").is_none());
    store
        .mark_step_status(claimed[0].id, UnitStatus::Done, None, None)
        .expect("mark");
    let next = store.claim_next_step(job.id).expect("claim").expect("second step");
    assert_eq!(next.index, 2);
}

#[test]
fn subtask_race_claims_lowest_index_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = temp.path().join("foreman.sqlite");
    let mut store = Store::open(&db).expect("open store");
    let job = store
        .create_job("subtasks", "do it", &JobMeta::default())
        .expect("create job");
    store
        .create_steps(job.id, &[StepSpec::new("only")])
        .expect("create steps");
    let step = store.list_steps(job.id).expect("steps").remove(0);
    let specs = [
        SubtaskSpec::new("a", "do a"),
        SubtaskSpec::new("b", "do b"),
        SubtaskSpec::new("c", "do c"),
    ];
    store.create_subtasks(step.id, &specs).expect("create subtasks");

    let step_id = step.id;
    let claimed = race(&db, move |store| {
        store.claim_next_subtask(step_id).expect("claim subtask")
    });
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].title, "a");

    let step = store.get_step(step.id).expect("get").expect("step");
    assert_eq!(step.status, UnitStatus::Running);
}
