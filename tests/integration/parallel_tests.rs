//! Parallel executor: dispatch, failure propagation and output ordering

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stevedore::error::StevedoreError;
use tokio::sync::Notify;
use stevedore::parallel::{do_tasks, CapturedOutput, DoTasksOptions};

fn options(workers: usize, live: bool) -> DoTasksOptions {
    DoTasksOptions {
        max_number_of_workers: workers,
        is_live_output_on: live,
    }
}

#[tokio::test]
async fn seven_tasks_on_three_workers_run_once() {
    let captured = CapturedOutput::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let task_seen = seen.clone();
    do_tasks(7, options(3, false), captured.sink(), move |output, task_id| {
        let seen = task_seen.clone();
        async move {
            seen.lock().unwrap().push(task_id);
            output.line(format!("task {} start", task_id));
            tokio::time::sleep(Duration::from_millis(5)).await;
            output.line(format!("task {} end", task_id));
            Ok(())
        }
    })
    .await
    .unwrap();

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, (0..7).collect::<Vec<_>>());

    // Buffered chunks are flushed whole, so lines of one task stay adjacent
    let contents = captured.contents();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 14);
    for pair in lines.chunks(2) {
        let task = pair[0].trim_end_matches(" start");
        assert_eq!(pair[1], format!("{} end", task));
    }
}

#[tokio::test]
async fn failing_task_error_is_returned() {
    let started = Arc::new(AtomicUsize::new(0));

    let task_started = started.clone();
    let err = do_tasks(
        6,
        options(2, false),
        CapturedOutput::new().sink(),
        move |output, task_id| {
            let started = task_started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                output.line(format!("task {}", task_id));
                if task_id == 0 {
                    return Err(StevedoreError::Internal("task 0 broke".to_string()));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StevedoreError::Internal(ref m) if m == "task 0 broke"));
    // Worker 0 stops after its first task, worker 1 at most finishes its shard
    assert!(started.load(Ordering::SeqCst) < 6);
}

#[tokio::test]
async fn live_worker_output_precedes_held_output() {
    let captured = CapturedOutput::new();

    do_tasks(7, options(3, true), captured.sink(), move |output, task_id| async move {
        // Worker 0 owns tasks 0..3 and is the slow one
        if output.is_live() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        output.line(format!("task {}", task_id));
        Ok(())
    })
    .await
    .unwrap();

    let contents = captured.contents();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 7);
    assert_eq!(&lines[..3], &["task 0", "task 1", "task 2"]);

    let mut rest: Vec<&str> = lines[3..].to_vec();
    rest.sort();
    assert_eq!(rest, vec!["task 3", "task 4", "task 5", "task 6"]);
}

#[tokio::test]
async fn one_worker_per_task_when_unbounded() {
    let captured = CapturedOutput::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (task_running, task_peak) = (running.clone(), peak.clone());
    do_tasks(4, options(0, false), captured.sink(), move |_output, _task_id| {
        let running = task_running.clone();
        let peak = task_peak.clone();
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    assert!(peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_failure_flushes_other_workers_first() {
    for round in 0..50 {
        let captured = CapturedOutput::new();
        let written = Arc::new(Notify::new());
        let running = Arc::new(Notify::new());

        let (task_written, task_running) = (written.clone(), running.clone());
        let err = do_tasks(3, options(3, false), captured.sink(), move |output, task_id| {
            let written = task_written.clone();
            let running = task_running.clone();
            async move {
                match task_id {
                    0 => {
                        output.line("task 0 done");
                        written.notify_one();
                        Ok(())
                    }
                    1 => {
                        output.line("task 1 started");
                        written.notified().await;
                        running.notified().await;
                        output.line("task 1 failing");
                        Err(StevedoreError::Internal("task 1 broke".to_string()))
                    }
                    _ => {
                        output.line("task 2 running");
                        running.notify_one();
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    }
                }
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StevedoreError::Internal(ref m) if m == "task 1 broke"));
        let contents = captured.contents();
        assert!(
            contents.ends_with("task 1 started\ntask 1 failing\n"),
            "round {}: {:?}",
            round,
            contents
        );
        assert!(contents.contains("task 0 done\n"), "round {}: {:?}", round, contents);
        assert!(contents.contains("task 2 running\n"), "round {}: {:?}", round, contents);
    }
}

#[tokio::test]
async fn live_failure_suppresses_held_output() {
    let captured = CapturedOutput::new();

    let err = do_tasks(3, options(3, true), captured.sink(), move |output, task_id| async move {
        if output.is_live() {
            output.line("live task");
            tokio::time::sleep(Duration::from_millis(30)).await;
            return Err(StevedoreError::Internal("live task broke".to_string()));
        }
        output.line(format!("held task {}", task_id));
        Ok(())
    })
    .await
    .unwrap_err();

    assert!(matches!(err, StevedoreError::Internal(ref m) if m == "live task broke"));
    assert_eq!(captured.contents(), "live task\n");
}

#[tokio::test]
async fn buffered_failure_mutes_live_worker_and_flushes_held() {
    let captured = CapturedOutput::new();
    let live_started = Arc::new(Notify::new());
    let held_done = Arc::new(Notify::new());

    let (task_live_started, task_held_done) = (live_started.clone(), held_done.clone());
    let err = do_tasks(3, options(3, true), captured.sink(), move |output, task_id| {
        let live_started = task_live_started.clone();
        let held_done = task_held_done.clone();
        async move {
            match task_id {
                0 => {
                    output.line("live start");
                    live_started.notify_one();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    output.line("live end");
                    Ok(())
                }
                1 => {
                    output.line("held 1");
                    held_done.notify_one();
                    Ok(())
                }
                _ => {
                    live_started.notified().await;
                    held_done.notified().await;
                    output.line("failing 2");
                    Err(StevedoreError::Internal("task 2 broke".to_string()))
                }
            }
        }
    })
    .await
    .unwrap_err();

    assert!(matches!(err, StevedoreError::Internal(ref m) if m == "task 2 broke"));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(captured.contents(), "live start\nheld 1\nfailing 2\n");
}
