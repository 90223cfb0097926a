mod common;

use cluster_controller::infrastructure::config::ControllerSettings;
use cluster_controller::protocol::{EngineReply, EngineRequest};
use cluster_controller::registry::TargetSelector;
use cluster_controller::tasks::{Comparison, Dependency, TaskError, TaskQueueError, TaskStatus};
use cluster_controller::{Bindings, ControllerError, EngineId, FailureKind, Task, TaskState};
use common::Cluster;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn task_pushes_runs_and_pulls() {
    let cluster = Cluster::start(1).await;
    let task = Task::new("y = x\ny += 1\nprint y")
        .with_push("x", json!(41))
        .with_pull(["y"]);
    let task_id = cluster.handle.submit(task).await.unwrap();

    let result = cluster.handle.result(task_id, true).await.unwrap().unwrap();
    assert_eq!(result.state(), TaskState::Completed);
    assert_eq!(result.engine_id, Some(EngineId::new(0)));
    assert_eq!(result.attempts, 1);
    let output = result.outcome.unwrap();
    assert_eq!(output.results.get("y"), Some(&json!(42)));
    assert_eq!(output.stdout, "42\n");
}

#[tokio::test]
async fn tasks_run_in_submission_order_on_one_engine() {
    let cluster = Cluster::start(1).await;
    let mut log = Bindings::new();
    log.insert("log".into(), json!([]));
    cluster.handle.push(EngineId::new(0), log).await.unwrap();

    let mut ids = Vec::new();
    for index in 0..4 {
        let task = Task::new(format!("log += [{index}]"));
        ids.push(cluster.handle.submit(task).await.unwrap());
    }
    let results = cluster.handle.barrier(&ids).await.unwrap();
    assert!(results.iter().all(|result| result.outcome.is_ok()));

    let outcomes = cluster.handle.pull(EngineId::new(0), ["log"]).await.unwrap();
    assert_eq!(
        outcomes.get(EngineId::new(0)).unwrap().as_ref().unwrap(),
        &EngineReply::Pulled {
            values: vec![json!([0, 1, 2, 3])]
        }
    );
}

#[tokio::test]
async fn failed_attempt_retries_on_another_engine() {
    let cluster = Cluster::start(2).await;
    let mut marker = Bindings::new();
    marker.insert("ready".into(), json!(true));
    cluster.handle.push(EngineId::new(1), marker).await.unwrap();

    let task = Task::new("ok = ready").with_pull(["ok"]).with_retries(1);
    let task_id = cluster.handle.submit(task).await.unwrap();

    let result = cluster.handle.result(task_id, true).await.unwrap().unwrap();
    assert_eq!(result.state(), TaskState::Completed);
    assert_eq!(result.engine_id, Some(EngineId::new(1)));
    assert_eq!(result.attempts, 2);
}

#[tokio::test]
async fn exhausted_retries_fail_with_the_last_error() {
    let settings = ControllerSettings {
        default_retries: 2,
        ..ControllerSettings::default()
    };
    let cluster = Cluster::with_settings(settings, 1).await;
    let task_id = cluster
        .handle
        .submit(Task::new("raise nope"))
        .await
        .unwrap();

    let result = cluster.handle.result(task_id, true).await.unwrap().unwrap();
    assert_eq!(result.state(), TaskState::Failed);
    assert_eq!(result.attempts, 3);
    match result.outcome.unwrap_err() {
        TaskError::Call(failure) => {
            assert_eq!(failure.kind, FailureKind::ExecutionError);
            assert!(failure.detail.contains("nope"));
        }
        TaskError::Aborted => panic!("task was not aborted"),
    }
}

#[tokio::test]
async fn recovery_task_runs_after_failure() {
    let cluster = Cluster::start(1).await;
    let task = Task::new("raise first try")
        .with_recovery(Task::new("fallback = 7").with_pull(["fallback"]));
    let task_id = cluster.handle.submit(task).await.unwrap();

    let result = cluster.handle.result(task_id, true).await.unwrap().unwrap();
    assert_eq!(result.task_id, task_id);
    let output = result.outcome.unwrap();
    assert_eq!(output.results.get("fallback"), Some(&json!(7)));
}

#[tokio::test]
async fn clear_flags_reset_the_namespace() {
    let cluster = Cluster::start(1).await;
    cluster.handle.execute(EngineId::new(0), "stale = 1").await.unwrap();

    let task = Task::new("fresh = 2").clear_before().clear_after();
    let task_id = cluster.handle.submit(task).await.unwrap();
    cluster.handle.result(task_id, true).await.unwrap().unwrap().outcome.unwrap();

    let keys = cluster.handle.keys(EngineId::new(0)).await.unwrap();
    assert_eq!(
        keys.get(EngineId::new(0)).unwrap().as_ref().unwrap(),
        &EngineReply::Keys { names: vec![] }
    );
}

#[tokio::test]
async fn engine_loss_requeues_without_spending_retries() {
    let mut cluster = Cluster::start(0).await;
    let silent = cluster.add_silent().await;

    let task_id = cluster
        .handle
        .submit(Task::new("done = 1").with_pull(["done"]))
        .await
        .unwrap();
    let requests = silent.wait_for_requests(1).await;
    assert!(matches!(requests[0].1, EngineRequest::Execute { .. }));

    silent.disconnect("crashed");
    cluster.add_engine().await;

    let result = cluster.handle.result(task_id, true).await.unwrap().unwrap();
    assert_eq!(result.state(), TaskState::Completed);
    assert_eq!(result.engine_id, Some(EngineId::new(0)));
}

#[tokio::test]
async fn abort_queued_task() {
    let cluster = Cluster::start(0).await;
    let task_id = cluster.handle.submit(Task::new("a = 1")).await.unwrap();
    assert!(cluster.handle.result(task_id, false).await.unwrap().is_none());

    cluster.handle.abort(task_id).await.unwrap();
    let result = cluster.handle.result(task_id, false).await.unwrap().unwrap();
    assert_eq!(result.outcome, Err(TaskError::Aborted));

    let err = cluster.handle.abort(task_id).await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Task(TaskQueueError::AlreadyFinished(_))
    ));
}

#[tokio::test]
async fn status_counts_and_discard() {
    let mut cluster = Cluster::start(0).await;
    let done = cluster.handle.submit(Task::new("a = 1")).await.unwrap();
    let failing = cluster.handle.submit(Task::new("raise x")).await.unwrap();
    assert_eq!(
        cluster.handle.task_status().await.unwrap(),
        TaskStatus {
            queued: 2,
            ..TaskStatus::default()
        }
    );

    let err = cluster.handle.discard(done).await.unwrap_err();
    assert!(matches!(err, ControllerError::Task(TaskQueueError::NotFinished(_))));

    cluster.add_engine().await;
    cluster.handle.barrier(&[done, failing]).await.unwrap();
    assert_eq!(
        cluster.handle.task_status().await.unwrap(),
        TaskStatus {
            completed: 1,
            failed: 1,
            ..TaskStatus::default()
        }
    );

    cluster.handle.discard(done).await.unwrap();
    let err = cluster.handle.result(done, false).await.unwrap_err();
    assert!(matches!(err, ControllerError::Task(TaskQueueError::UnknownTask(_))));
}

#[tokio::test]
async fn spin_is_harmless_when_idle() {
    let cluster = Cluster::start(1).await;
    cluster.handle.spin().unwrap();
    let task_id = cluster.handle.submit(Task::new("a = 1")).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), cluster.handle.result(task_id, true))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(result.outcome.is_ok());
}

#[tokio::test]
async fn timed_out_engine_gets_no_task_until_it_answers() {
    let settings = ControllerSettings {
        default_call_timeout_ms: Some(200),
        ..ControllerSettings::default()
    };
    let cluster = Cluster::with_settings(settings, 0).await;
    let silent = cluster.add_silent().await;

    let first = cluster
        .handle
        .submit(Task::new("a = 1").with_retries(0))
        .await
        .unwrap();
    let result = cluster.handle.result(first, true).await.unwrap().unwrap();
    match result.outcome {
        Err(TaskError::Call(failure)) => assert_eq!(failure.kind, FailureKind::Timeout),
        other => panic!("unexpected outcome {other:?}"),
    }

    let second = cluster
        .handle
        .submit(Task::new("b = 1").with_retries(0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(silent.requests().len(), 1);
    assert_eq!(cluster.handle.task_status().await.unwrap().queued, 1);

    let executed = || {
        Ok(EngineReply::Executed {
            stdout: String::new(),
            stderr: String::new(),
        })
    };
    let (late, _) = silent.requests()[0].clone();
    silent.reply(late, executed());

    let requests = silent.wait_for_requests(2).await;
    assert_eq!(
        requests[1].1,
        EngineRequest::Execute {
            code: "b = 1".into()
        }
    );
    silent.reply(requests[1].0, executed());
    let result = cluster.handle.result(second, true).await.unwrap().unwrap();
    assert!(result.outcome.is_ok());
    assert_eq!(result.engine_id, Some(silent.engine_id));
}

#[tokio::test]
async fn dependencies_pick_matching_engines_without_blocking_the_queue() {
    let mut cluster = Cluster::start(1).await;
    let mut gpus = Bindings::new();
    gpus.insert("gpus".into(), json!(2));
    let big = cluster.add_engine_with(gpus).await;

    let needs_four = cluster
        .handle
        .submit(
            Task::new("a = 1")
                .with_dependency(Dependency::new("gpus", json!(4)).with_test(Comparison::Ge)),
        )
        .await
        .unwrap();
    let needs_two = cluster
        .handle
        .submit(
            Task::new("b = 1")
                .with_dependency(Dependency::new("gpus", json!(2)).with_test(Comparison::Ge)),
        )
        .await
        .unwrap();
    let plain = cluster.handle.submit(Task::new("c = 1")).await.unwrap();

    let results = cluster.handle.barrier(&[needs_two, plain]).await.unwrap();
    assert_eq!(results[0].engine_id, Some(big));
    assert!(results.iter().all(|result| result.outcome.is_ok()));
    assert!(cluster.handle.result(needs_four, false).await.unwrap().is_none());
    assert_eq!(cluster.handle.task_status().await.unwrap().queued, 1);

    let mut more = Bindings::new();
    more.insert("gpus".into(), json!(4));
    cluster
        .handle
        .set_properties(EngineId::new(0), more)
        .await
        .unwrap();
    let result = cluster.handle.result(needs_four, true).await.unwrap().unwrap();
    assert_eq!(result.engine_id, Some(EngineId::new(0)));
    assert!(result.outcome.is_ok());
}

#[tokio::test]
async fn pinned_tasks_keep_order_while_other_engines_are_busy() {
    let mut cluster = Cluster::start(0).await;
    let mut role = Bindings::new();
    role.insert("role".into(), json!("pinned"));
    let pinned = cluster.add_engine_with(role).await;
    cluster.add_engine().await;
    cluster.add_engine().await;
    let first_other = EngineId::new(1);
    let second_other = EngineId::new(2);

    let mut log = Bindings::new();
    log.insert("log".into(), json!([]));
    cluster.handle.push(TargetSelector::All, log).await.unwrap();

    let tasks = async {
        let mut ids = Vec::new();
        for step in 0..5 {
            let code = format!(
                "log += [{}]\nlog += [{}]\nlog += [{}]",
                step * 10,
                step * 10 + 1,
                step * 10 + 2
            );
            let task = Task::new(code).with_dependency(Dependency::new("role", json!("pinned")));
            ids.push(cluster.handle.submit(task).await.unwrap());
        }
        cluster.handle.barrier(&ids).await.unwrap()
    };
    let traffic = async {
        for round in 0..20 {
            let code = format!("log += [{round}]");
            let (first, second) = tokio::join!(
                cluster.handle.execute(first_other, code.clone()),
                cluster.handle.push(second_other, {
                    let mut value = Bindings::new();
                    value.insert(format!("v{round}"), json!(round));
                    value
                })
            );
            assert!(first.unwrap().all_succeeded());
            assert!(second.unwrap().all_succeeded());
        }
    };
    let (results, ()) = tokio::join!(tasks, traffic);
    assert!(results
        .iter()
        .all(|result| result.engine_id == Some(pinned) && result.outcome.is_ok()));

    let expected: Vec<u32> = (0..5)
        .flat_map(|step| [step * 10, step * 10 + 1, step * 10 + 2])
        .collect();
    let outcomes = cluster.handle.pull(pinned, ["log"]).await.unwrap();
    assert_eq!(
        outcomes.get(pinned).unwrap().as_ref().unwrap(),
        &EngineReply::Pulled {
            values: vec![json!(expected)]
        }
    );

    let outcomes = cluster.handle.pull(first_other, ["log"]).await.unwrap();
    let rounds: Vec<u32> = (0..20).collect();
    assert_eq!(
        outcomes.get(first_other).unwrap().as_ref().unwrap(),
        &EngineReply::Pulled {
            values: vec![json!(rounds)]
        }
    );
    let keys = cluster.handle.keys(second_other).await.unwrap();
    match keys.get(second_other).unwrap().as_ref().unwrap() {
        EngineReply::Keys { names } => assert_eq!(names.len(), 21),
        other => panic!("unexpected reply {other:?}"),
    }
}
