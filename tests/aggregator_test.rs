//! Integration tests for aggregators: weighted counters, log forwarding,
//! cancellation fan-out, first-failure propagation and concurrent use.

use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use jobs_rs::{Aggregator, Error, Job, JobKind, JobState};

fn noop(name: &str) -> Job {
    Job::new(name, |_| Ok(()))
}

fn tokio_worker(rt: &tokio::runtime::Runtime) -> Arc<dyn jobs_rs::Worker> {
    Arc::new(rt.handle().clone())
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[test]
fn fresh_aggregator_is_empty() {
    let agg = Aggregator::new("empty");
    assert_eq!(agg.kind(), JobKind::Aggregator);
    assert_eq!(agg.state(), JobState::Waiting);
    assert_eq!(agg.work_units(), (0, 0));
    assert!(agg.sub_jobs().is_empty());
}

#[test]
fn half_weight_adds_fifty_units() {
    let agg = Aggregator::new("half");
    agg.add(&noop("j"), 0.5).unwrap();
    assert_eq!(agg.total_work_units(), 50);
}

#[test]
fn two_half_weight_jobs_report_in_quarters() {
    let agg = Aggregator::new("a");
    let j1 = noop("j1");
    let j2 = noop("j2");
    agg.add(&j1, 0.5).unwrap();
    agg.add(&j2, 0.5).unwrap();
    assert_eq!(agg.work_units(), (0, 100));

    j1.done_work(50);
    assert_eq!(agg.work_units(), (25, 100));

    j2.done_work(100);
    assert_eq!(agg.done_work_units(), 75);

    j1.done_work(100);
    assert_eq!(agg.done_work_units(), 100);
    assert_eq!(agg.progress(), 1.0);
}

#[test]
fn uneven_weights_scale_progress() {
    let agg = Aggregator::new("weighted");
    let light = noop("light");
    let heavy = noop("heavy");
    agg.add(&light, 0.5).unwrap();
    agg.add(&heavy, 1.5).unwrap();
    assert_eq!(agg.total_work_units(), 200);

    heavy.done_work(50);
    assert_eq!(agg.done_work_units(), 75);

    light.done_work(100);
    assert_eq!(agg.done_work_units(), 125);
}

#[test]
fn existing_progress_is_counted_on_add() {
    let agg = Aggregator::new("late");
    let job = noop("half-done");
    job.done_work(40);
    agg.add(&job, 1.0).unwrap();
    assert_eq!(agg.work_units(), (40, 100));
}

#[test]
fn progress_moving_backwards_is_reflected() {
    let agg = Aggregator::new("rewind");
    let job = noop("j");
    agg.add(&job, 1.0).unwrap();

    job.done_work(80);
    job.done_work(20);
    assert_eq!(agg.done_work_units(), 20);
}

#[test]
fn total_flipping_between_zero_and_nonzero_adjusts_the_aggregate() {
    let agg = Aggregator::new("flip");
    let measured = noop("measured");
    let unmeasured = noop("unmeasured");
    unmeasured.set_total_work_units(0);

    agg.add(&measured, 1.0).unwrap();
    agg.add(&unmeasured, 1.0).unwrap();
    assert_eq!(agg.total_work_units(), 100);

    unmeasured.set_total_work_units(10);
    assert_eq!(agg.total_work_units(), 200);

    unmeasured.done_work(5);
    assert_eq!(agg.done_work_units(), 50);

    unmeasured.set_total_work_units(0);
    assert_eq!(agg.work_units(), (0, 100));
}

#[test]
fn changing_a_nonzero_total_rescales_the_contribution() {
    let agg = Aggregator::new("rescale");
    let job = noop("j");
    agg.add(&job, 1.0).unwrap();

    job.done_work(50);
    assert_eq!(agg.done_work_units(), 50);

    job.set_total_work_units(200);
    assert_eq!(agg.work_units(), (25, 100));
}

#[test]
fn aggregate_done_never_exceeds_total() {
    let agg = Aggregator::new("bounded");
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    agg.add_done_work_hook(move |job, _| sink.lock().unwrap().push(job.work_units()));

    let job = noop("j");
    agg.add(&job, 1.0).unwrap();
    for units in [10, 90, 100, 30, 100] {
        job.done_work(units);
    }
    job.set_total_work_units(0);

    for (done, total) in seen.lock().unwrap().iter() {
        assert!(*total == 0 || done <= total, "{done} > {total}");
    }
}

#[test]
fn nested_aggregators_propagate_progress() {
    let outer = Aggregator::new("outer");
    let inner = Aggregator::new("inner");
    let leaf = noop("leaf");
    let sibling = noop("sibling");

    inner.add(&leaf, 1.0).unwrap();
    outer.add(&inner, 1.0).unwrap();
    outer.add(&sibling, 1.0).unwrap();
    assert_eq!(outer.work_units(), (0, 200));

    leaf.done_work(50);
    assert_eq!(inner.work_units(), (50, 100));
    assert_eq!(outer.work_units(), (50, 200));

    let snapshot = outer.snapshot();
    assert_eq!(snapshot.sub_jobs.len(), 2);
    assert_eq!(snapshot.sub_jobs[0].sub_jobs[0].name, "leaf");
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[test]
fn sub_job_logs_are_forwarded_with_a_prefix() {
    let agg = Aggregator::new("agg");
    let job = noop("reader");
    job.log("before");
    agg.add(&job, 1.0).unwrap();
    job.log("after");

    assert_eq!(
        agg.logs(),
        vec!["[reader] before".to_string(), "[reader] after".to_string()]
    );
    assert_eq!(job.logs(), vec!["before".to_string(), "after".to_string()]);
}

#[test]
fn nested_logs_carry_every_prefix() {
    let outer = Aggregator::new("outer");
    let inner = Aggregator::new("inner");
    let leaf = noop("leaf");
    inner.add(&leaf, 1.0).unwrap();
    outer.add(&inner, 1.0).unwrap();

    leaf.log("hello");
    assert_eq!(outer.logs(), vec!["[inner] [leaf] hello".to_string()]);
}

#[test]
fn every_sub_job_line_reaches_the_top() {
    let n = 4;
    let outer = Aggregator::new("outer");
    let inner = Aggregator::new("inner");
    let jobs: Vec<Job> = (0..n)
        .map(|i| {
            Job::new(format!("series-{i}"), |job| {
                job.log("open");
                job.log("write");
                job.log("close");
                Ok(())
            })
        })
        .collect();
    for job in &jobs {
        inner.add(job, 1.0).unwrap();
    }
    outer.add(&inner, 1.0).unwrap();
    for job in &jobs {
        outer.add(job, 1.0).unwrap();
    }
    inner.log("inner done");

    outer.run().unwrap().get().unwrap();

    assert_eq!(inner.logs().len(), 3 * n + 1);
    // Lines arrive once through the inner aggregator and once directly.
    assert_eq!(outer.logs().len(), (3 * n + 1) + 3 * n);
}

// ---------------------------------------------------------------------------
// add() validation
// ---------------------------------------------------------------------------

#[test]
fn adding_itself_is_rejected() {
    let agg = Aggregator::new("self");
    assert!(matches!(agg.add(&agg, 1.0), Err(Error::SelfAggregation(_))));
}

#[test]
fn adding_twice_is_rejected() {
    let agg = Aggregator::new("dup");
    let job = noop("j");
    agg.add(&job, 1.0).unwrap();
    assert!(matches!(
        agg.add(&job, 1.0),
        Err(Error::AlreadyRegistered { .. })
    ));
    assert_eq!(agg.total_work_units(), 100);
}

#[test]
fn adding_an_ancestor_is_rejected() {
    let outer = Aggregator::new("outer");
    let inner = Aggregator::new("inner");
    outer.add(&inner, 1.0).unwrap();
    assert!(matches!(inner.add(&outer, 1.0), Err(Error::Cycle { .. })));
}

#[test]
fn invalid_weights_are_rejected() {
    let agg = Aggregator::new("weights");
    for weight in [-0.5, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            agg.add(&noop("j"), weight),
            Err(Error::InvalidWeight(_))
        ));
    }
    agg.add(&noop("free"), 0.0).unwrap();
    assert_eq!(agg.total_work_units(), 0);
}

#[test]
fn weights_overflowing_the_work_units_are_rejected() {
    let agg = Aggregator::new("huge");
    let first = noop("first");
    let second = noop("second");

    agg.add(&first, 1e17).unwrap();
    let total = agg.total_work_units();
    assert!(matches!(
        agg.add(&second, 1e17),
        Err(Error::WeightOverflow { ref sub, .. }) if sub == "second"
    ));

    // The rejected job is not registered and left untouched.
    assert_eq!(agg.sub_jobs(), vec![first.clone()]);
    assert_eq!(agg.total_work_units(), total);
    second.done_work(50);
    second.log("not forwarded");
    assert_eq!(agg.done_work_units(), 0);
    assert!(agg.logs().is_empty());

    // The aggregator keeps working for the accepted job.
    first.done();
    assert_eq!(agg.work_units(), (total, total));
}

#[test]
fn overflowing_weight_from_a_single_add_is_rejected() {
    let agg = Aggregator::new("huge");
    agg.add(&noop("j"), 1.0).unwrap();
    assert!(matches!(
        agg.add(&noop("k"), 1e300),
        Err(Error::WeightOverflow { .. })
    ));
    assert_eq!(agg.sub_jobs().len(), 1);
}

#[test]
fn adding_after_finish_or_cancel_is_rejected() {
    let finished = Aggregator::new("finished");
    finished.run().unwrap().get().unwrap();
    assert_eq!(finished.state(), JobState::Finished);
    assert!(matches!(
        finished.add(&noop("j"), 1.0),
        Err(Error::InvalidState { state: JobState::Finished, .. })
    ));

    let canceled = Aggregator::new("canceled");
    canceled.cancel();
    assert!(matches!(
        canceled.add(&noop("j"), 1.0),
        Err(Error::InvalidState { state: JobState::Canceled, .. })
    ));
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

#[test]
fn run_completes_every_sub_job() {
    let agg = Aggregator::new("all");
    let jobs: Vec<Job> = (0..3)
        .map(|i| {
            Job::new(format!("j{i}"), |job| {
                job.done();
                Ok(())
            })
        })
        .collect();
    for job in &jobs {
        agg.add(job, 1.0).unwrap();
    }

    agg.run().unwrap().get().unwrap();
    assert_eq!(agg.state(), JobState::Finished);
    assert_eq!(agg.progress(), 1.0);
    assert!(jobs.iter().all(|job| job.state() == JobState::Finished));
}

#[test]
fn first_failure_wins_and_siblings_are_unaffected() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let agg = Aggregator::new("a");

    let j1 = Job::with_worker(
        "j1",
        |_: &Job| {
            thread::sleep(Duration::from_millis(20));
            anyhow::bail!("E")
        },
        tokio_worker(&rt),
    );
    let j2 = Job::with_worker(
        "j2",
        |job: &Job| {
            job.done();
            Ok(())
        },
        tokio_worker(&rt),
    );
    let j3 = Job::with_worker("j3", |_: &Job| anyhow::bail!("later"), tokio_worker(&rt));
    agg.add(&j1, 0.5).unwrap();
    agg.add(&j2, 0.5).unwrap();
    agg.add(&j3, 0.5).unwrap();

    let failure = agg.run().unwrap().get().unwrap_err();
    let original = j1.run().unwrap_err();
    assert!(matches!(original, Error::AlreadyStarted(_)));

    assert_eq!(failure.job(), "j1");
    assert_eq!(failure.to_string(), "job j1 failed: E");
    assert!(failure.same_as(&j1.cancel().get().unwrap_err()));
    assert_eq!(j2.progress(), 1.0);
    assert_eq!(j2.state(), JobState::Finished);
    assert_eq!(j1.state(), JobState::Failed);
    // The aggregator itself finishes; the failure only travels through get().
    assert_eq!(agg.state(), JobState::Finished);
}

#[test]
fn failed_sub_job_reraises_through_nested_aggregators() {
    let outer = Aggregator::new("outer");
    let inner = Aggregator::new("inner");
    let broken = Job::new("broken", |_| anyhow::bail!("bad header"));
    inner.add(&broken, 1.0).unwrap();
    outer.add(&inner, 1.0).unwrap();

    let failure = outer.run().unwrap().get().unwrap_err();
    assert_eq!(failure.job(), "broken");
    assert!(failure.same_as(&broken.cancel().get().unwrap_err()));
    assert!(failure.same_as(&inner.cancel().get().unwrap_err()));

    assert_eq!(broken.state(), JobState::Failed);
    assert_eq!(inner.state(), JobState::Finished);
    assert_eq!(outer.state(), JobState::Finished);
    // wait() on a finished aggregator does not re-raise.
    outer.wait().unwrap();
}

#[test]
fn canceled_aggregator_with_a_failed_sub_job_ends_canceled() {
    let agg = Aggregator::new("a");
    let broken = Job::new("broken", |_| anyhow::bail!("E"));
    let observer = jobs_rs::Observer::new("pending");
    agg.add(&broken, 1.0).unwrap();
    agg.add(&observer, 1.0).unwrap();

    let future = agg.run().unwrap();
    assert!(!future.is_ready());
    assert_eq!(broken.state(), JobState::Failed);

    agg.cancel();
    assert!(future.is_ready());
    assert_eq!(agg.state(), JobState::Canceled);
    assert_eq!(future.get().unwrap_err().job(), "broken");
}

#[test]
fn cancel_fans_out_without_touching_counters() {
    let agg = Aggregator::new("a");
    let j1 = noop("j1");
    let j2 = noop("j2");
    agg.add(&j1, 0.5).unwrap();
    agg.add(&j2, 0.5).unwrap();
    j1.done_work(30);

    agg.cancel();
    assert!(j1.cancel_requested());
    assert!(j2.cancel_requested());
    assert_eq!(j1.done_work_units(), 30);
    assert_eq!(j2.done_work_units(), 0);
    assert_eq!(agg.state(), JobState::Canceled);
}

#[test]
fn canceling_a_running_tree_waits_for_sub_jobs() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let agg = Aggregator::new("spinning");
    let (started_tx, started_rx) = mpsc::channel();

    for i in 0..3 {
        let started = started_tx.clone();
        let job = Job::with_worker(
            format!("j{i}"),
            move |job: &Job| {
                started.send(()).unwrap();
                while !job.cancel_requested() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            },
            tokio_worker(&rt),
        );
        agg.add(&job, 1.0).unwrap();
    }

    let future = agg.run().unwrap();
    for _ in 0..3 {
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert_eq!(agg.state(), JobState::Running);

    agg.cancel();
    assert!(future.wait_timeout(Duration::from_secs(5)));
    assert!(future.get().is_ok());
    assert_eq!(agg.state(), JobState::Canceled);
    assert!(
        agg.sub_jobs()
            .iter()
            .all(|job| job.state() == JobState::Canceled)
    );
}

#[test]
fn a_sub_job_already_running_is_joined_not_rerun() {
    let agg = Aggregator::new("join");
    let job = Job::new("started", |job| {
        job.done();
        Ok(())
    });
    job.run().unwrap();
    agg.add(&job, 1.0).unwrap();

    agg.run().unwrap().get().unwrap();
    assert_eq!(agg.state(), JobState::Finished);
}

#[test]
fn empty_aggregator_finishes_immediately() {
    let agg = Aggregator::new("empty");
    let future = agg.run().unwrap();
    assert!(future.is_ready());
    assert_eq!(agg.state(), JobState::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_tree_joins_asynchronously() {
    let worker: Arc<dyn jobs_rs::Worker> = Arc::new(tokio::runtime::Handle::current());
    let outer = Aggregator::new("outer");
    let inner = Aggregator::new("inner");
    for i in 0..3 {
        let job = Job::with_worker(
            format!("leaf-{i}"),
            |job: &Job| {
                for step in 1..=10 {
                    thread::sleep(Duration::from_millis(1));
                    job.done_work(step * 10);
                }
                Ok(())
            },
            Arc::clone(&worker),
        );
        inner.add(&job, 1.0).unwrap();
    }
    outer.add(&inner, 2.0).unwrap();

    outer.run().unwrap().join().await.unwrap();
    assert_eq!(inner.state(), JobState::Finished);
    assert_eq!(outer.state(), JobState::Finished);
    assert_eq!(outer.work_units(), (200, 200));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_adds_are_all_counted() {
    let agg = Aggregator::new("stress");
    let barrier = Arc::new(Barrier::new(10));

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let agg = agg.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let job = noop(&format!("job-{i}"));
                barrier.wait();
                agg.add(&job, 0.1).unwrap();
                job
            })
        })
        .collect();
    let jobs: Vec<Job> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(agg.total_work_units(), 100);
    assert_eq!(agg.sub_jobs().len(), 10);
    for job in &jobs {
        assert!(agg.sub_jobs().contains(job));
    }
}

#[test]
fn concurrent_progress_settles_on_the_exact_sum() {
    let agg = Aggregator::new("reporting");
    let jobs: Vec<Job> = (0..8).map(|i| noop(&format!("job-{i}"))).collect();
    for job in &jobs {
        agg.add(job, 1.0).unwrap();
    }

    let barrier = Arc::new(Barrier::new(jobs.len()));
    let handles: Vec<_> = jobs
        .iter()
        .cloned()
        .map(|job| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for units in 0..=100 {
                    job.done_work(units);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(agg.work_units(), (800, 800));
}

#[test]
fn dropping_the_aggregator_leaves_sub_jobs_usable() {
    let job = noop("survivor");
    {
        let agg = Aggregator::new("short-lived");
        agg.add(&job, 1.0).unwrap();
    }
    job.done_work(50);
    job.log("still here");
    assert_eq!(job.done_work_units(), 50);
}
