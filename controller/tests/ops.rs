mod common;

use cluster_controller::engine::ENGINE_ID_BINDING;
use cluster_controller::infrastructure::config::ControllerSettings;
use cluster_controller::ops::ScatterStyle;
use cluster_controller::protocol::{EngineReply, EngineRequest};
use cluster_controller::registry::{EngineState, RegistryError, TargetSelector};
use cluster_controller::{Bindings, ControllerError, EngineId, FailureKind};
use common::Cluster;
use serde_json::{json, Value};
use std::time::Duration;

fn ids(raw: &[u32]) -> Vec<EngineId> {
    raw.iter().copied().map(EngineId::new).collect()
}

fn bind(name: &str, value: Value) -> Bindings {
    let mut bindings = Bindings::new();
    bindings.insert(name.to_string(), value);
    bindings
}

fn pulled(reply: &EngineReply) -> Vec<Value> {
    match reply {
        EngineReply::Pulled { values } => values.clone(),
        other => panic!("expected pulled values, got {other:?}"),
    }
}

#[tokio::test]
async fn engines_get_lowest_free_ids_and_know_them() {
    let cluster = Cluster::start(3).await;
    let assigned: Vec<EngineId> = cluster.engines.iter().map(|e| e.engine_id()).collect();
    assert_eq!(assigned, ids(&[0, 1, 2]));

    let outcomes = cluster
        .handle
        .pull(TargetSelector::All, [ENGINE_ID_BINDING])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    for (engine_id, outcome) in outcomes.iter() {
        let values = pulled(outcome.as_ref().unwrap());
        assert_eq!(values, vec![json!(engine_id.as_u32())]);
    }
}

#[tokio::test]
async fn execute_then_pull_on_one_engine() {
    let cluster = Cluster::start(2).await;
    let outcomes = cluster
        .handle
        .execute(EngineId::new(1), "a = [1, 2]\nprint a")
        .await
        .unwrap();
    assert_eq!(
        outcomes.get(EngineId::new(1)).unwrap().as_ref().unwrap(),
        &EngineReply::Executed {
            stdout: "[1,2]\n".into(),
            stderr: String::new()
        }
    );
    assert!(outcomes.get(EngineId::new(0)).is_none());

    let outcomes = cluster.handle.pull(ids(&[0, 1]), ["a"]).await.unwrap();
    assert_eq!(
        outcomes.get(EngineId::new(0)).unwrap().as_ref().unwrap_err().kind,
        FailureKind::NameError
    );
    assert_eq!(
        pulled(outcomes.get(EngineId::new(1)).unwrap().as_ref().unwrap()),
        vec![json!([1, 2])]
    );
}

#[tokio::test]
async fn execution_failure_is_per_engine() {
    let cluster = Cluster::start(2).await;
    cluster.handle.push(EngineId::new(0), bind("x", json!(1))).await.unwrap();

    let outcomes = cluster.handle.execute(TargetSelector::All, "y = x").await.unwrap();
    assert!(outcomes.get(EngineId::new(0)).unwrap().is_ok());
    let failure = outcomes.get(EngineId::new(1)).unwrap().as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::ExecutionError);
    assert!(!outcomes.all_succeeded());
    assert_eq!(outcomes.failures().len(), 1);
}

#[tokio::test]
async fn scatter_and_gather_eight_over_three() {
    let cluster = Cluster::start(3).await;
    let values: Vec<Value> = (0..8).map(Value::from).collect();

    let outcomes = cluster
        .handle
        .scatter(TargetSelector::All, "v", values.clone(), ScatterStyle::Basic)
        .await
        .unwrap();
    assert!(outcomes.all_succeeded());

    let parts = cluster.handle.pull(TargetSelector::All, ["v"]).await.unwrap();
    let expected = [json!([0, 1, 2]), json!([3, 4, 5]), json!([6, 7])];
    for (index, part) in expected.iter().enumerate() {
        let outcome = parts.get(EngineId::new(index as u32)).unwrap();
        assert_eq!(pulled(outcome.as_ref().unwrap()), vec![part.clone()]);
    }

    let gathered = cluster
        .handle
        .gather(TargetSelector::All, "v", ScatterStyle::Basic)
        .await
        .unwrap();
    assert_eq!(gathered, values);
}

#[tokio::test]
async fn scatter_ten_over_four_respects_selector_order() {
    let cluster = Cluster::start(4).await;
    let values: Vec<Value> = (0..10).map(Value::from).collect();

    cluster
        .handle
        .scatter(ids(&[3, 1, 2, 0]), "v", values.clone(), ScatterStyle::Basic)
        .await
        .unwrap();

    let sizes: Vec<usize> = cluster
        .handle
        .pull(TargetSelector::All, ["v"])
        .await
        .unwrap()
        .iter()
        .map(|(_, outcome)| match &pulled(outcome.as_ref().unwrap())[0] {
            Value::Array(items) => items.len(),
            other => panic!("expected a list, got {other}"),
        })
        .collect();
    assert_eq!(sizes, vec![3, 3, 2, 2]);

    let gathered = cluster
        .handle
        .gather(TargetSelector::All, "v", ScatterStyle::Basic)
        .await
        .unwrap();
    assert_eq!(gathered, values);
}

#[tokio::test]
async fn flatten_style_pushes_bare_elements() {
    let cluster = Cluster::start(3).await;
    let values = vec![json!("a"), json!("b"), json!("c")];
    cluster
        .handle
        .scatter(TargetSelector::All, "v", values.clone(), ScatterStyle::Flatten)
        .await
        .unwrap();

    let first = cluster.handle.pull(EngineId::new(0), ["v"]).await.unwrap();
    assert_eq!(
        pulled(first.get(EngineId::new(0)).unwrap().as_ref().unwrap()),
        vec![json!("a")]
    );

    let gathered = cluster
        .handle
        .gather(TargetSelector::All, "v", ScatterStyle::Flatten)
        .await
        .unwrap();
    assert_eq!(gathered, values);

    let err = cluster
        .handle
        .gather(TargetSelector::All, "v", ScatterStyle::Basic)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::NotASequence { .. }));
}

#[tokio::test]
async fn flatten_round_trips_list_elements() {
    let cluster = Cluster::start(3).await;
    let values = vec![json!([1, 2]), json!(3), json!(4)];
    cluster
        .handle
        .scatter(TargetSelector::All, "v", values.clone(), ScatterStyle::Flatten)
        .await
        .unwrap();

    let first = cluster.handle.pull(EngineId::new(0), ["v"]).await.unwrap();
    assert_eq!(
        pulled(first.get(EngineId::new(0)).unwrap().as_ref().unwrap()),
        vec![json!([1, 2])]
    );

    let gathered = cluster
        .handle
        .gather(TargetSelector::All, "v", ScatterStyle::Flatten)
        .await
        .unwrap();
    assert_eq!(gathered, values);

    let nested = vec![json!([1]), json!([2, 3]), json!([]), json!(4), json!([5])];
    cluster
        .handle
        .scatter(ids(&[0, 1]), "w", nested.clone(), ScatterStyle::Flatten)
        .await
        .unwrap();
    let gathered = cluster
        .handle
        .gather(ids(&[0, 1]), "w", ScatterStyle::Flatten)
        .await
        .unwrap();
    assert_eq!(gathered, nested);
}

#[tokio::test]
async fn flatten_gather_refuses_unmarked_names() {
    let cluster = Cluster::start(1).await;
    cluster
        .handle
        .push(EngineId::new(0), bind("v", json!([1, 2])))
        .await
        .unwrap();

    let err = cluster
        .handle
        .gather(TargetSelector::All, "v", ScatterStyle::Flatten)
        .await
        .unwrap_err();
    match err {
        ControllerError::GatherIncomplete { failures, .. } => {
            assert_eq!(failures[&EngineId::new(0)].kind, FailureKind::NameError);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let gathered = cluster
        .handle
        .gather(TargetSelector::All, "v", ScatterStyle::Basic)
        .await
        .unwrap();
    assert_eq!(gathered, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn gather_reports_partial_failure() {
    let cluster = Cluster::start(2).await;
    cluster
        .handle
        .push(EngineId::new(0), bind("v", json!([1])))
        .await
        .unwrap();

    let err = cluster
        .handle
        .gather(TargetSelector::All, "v", ScatterStyle::Basic)
        .await
        .unwrap_err();
    match err {
        ControllerError::GatherIncomplete { name, failures } => {
            assert_eq!(name, "v");
            assert_eq!(failures.keys().copied().collect::<Vec<_>>(), ids(&[1]));
            assert_eq!(failures[&EngineId::new(1)].kind, FailureKind::NameError);
        }
        other => panic!("expected GatherIncomplete, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_and_stale_selectors_are_refused() {
    let cluster = Cluster::start(0).await;
    let err = cluster.handle.keys(TargetSelector::All).await.unwrap_err();
    assert!(matches!(err, ControllerError::NoEngine));

    let mut cluster = Cluster::start(1).await;
    let err = cluster.handle.keys(Vec::<EngineId>::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::NoEngine));

    let err = cluster.handle.keys(ids(&[0, 7])).await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Registry(RegistryError::UnknownEngine(id)) if id == EngineId::new(7)
    ));

    assert_eq!(cluster.add_engine().await, EngineId::new(1));
}

#[tokio::test]
async fn reset_and_keys() {
    let cluster = Cluster::start(1).await;
    let target = EngineId::new(0);
    cluster
        .handle
        .execute(target, "b = 1\na = 2")
        .await
        .unwrap();

    let keys = cluster.handle.keys(target).await.unwrap();
    assert_eq!(
        keys.get(target).unwrap().as_ref().unwrap(),
        &EngineReply::Keys {
            names: vec!["a".into(), "b".into()]
        }
    );

    cluster.handle.reset(target).await.unwrap();
    let keys = cluster.handle.keys(target).await.unwrap();
    assert_eq!(
        keys.get(target).unwrap().as_ref().unwrap(),
        &EngineReply::Keys { names: vec![] }
    );
}

#[tokio::test]
async fn oversize_payload_fails_before_anything_is_sent() {
    let settings = ControllerSettings {
        max_message_size: 256,
        ..ControllerSettings::default()
    };
    let cluster = Cluster::with_settings(settings, 1).await;

    let err = cluster
        .handle
        .push(TargetSelector::All, bind("big", json!("x".repeat(1024))))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Serialization(_)));

    let engines = cluster.handle.engines().await.unwrap();
    assert_eq!(engines[0].busy, 0);
    let outcomes = cluster.handle.keys(TargetSelector::All).await.unwrap();
    assert!(outcomes.all_succeeded());
}

#[tokio::test]
async fn kill_disconnects_the_engine() {
    let cluster = Cluster::start(2).await;
    let outcomes = cluster.handle.kill(EngineId::new(1)).await.unwrap();
    assert_eq!(
        outcomes.get(EngineId::new(1)).unwrap().as_ref().unwrap(),
        &EngineReply::Killed
    );

    cluster.wait_for_live(1).await;
    let engines = cluster.handle.engines().await.unwrap();
    assert!(engines
        .iter()
        .all(|engine| engine.id == EngineId::new(0) || engine.state != EngineState::Registered));
}

#[tokio::test]
async fn multicall_reports_engines_before_waiting() {
    let cluster = Cluster::start(2).await;
    let call = cluster
        .handle
        .dispatch(TargetSelector::All, EngineRequest::Keys)
        .await
        .unwrap();
    assert_eq!(call.engines(), ids(&[0, 1]).as_slice());
    let outcomes = tokio::time::timeout(Duration::from_secs(5), call.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcomes.len(), 2);
}

#[tokio::test]
async fn properties_are_read_updated_and_removed() {
    let mut cluster = Cluster::start(1).await;
    let rack = cluster.add_engine_with(bind("rack", json!("a1"))).await;

    let all = cluster
        .handle
        .get_properties(TargetSelector::All, Vec::<String>::new())
        .await
        .unwrap();
    assert!(all[&EngineId::new(0)].is_empty());
    assert_eq!(all[&rack].get("rack"), Some(&json!("a1")));

    let updated = cluster
        .handle
        .set_properties(TargetSelector::All, bind("mem", json!(8)))
        .await
        .unwrap();
    assert_eq!(updated[&rack].len(), 2);
    assert_eq!(updated[&EngineId::new(0)].get("mem"), Some(&json!(8)));

    let present = cluster
        .handle
        .has_properties(TargetSelector::All, ["rack", "mem"])
        .await
        .unwrap();
    assert_eq!(present[&EngineId::new(0)], vec![false, true]);
    assert_eq!(present[&rack], vec![true, true]);

    let left = cluster.handle.del_properties(rack, ["rack"]).await.unwrap();
    assert_eq!(left[&rack].keys().collect::<Vec<_>>(), vec!["mem"]);
    let cleared = cluster
        .handle
        .clear_properties(TargetSelector::All)
        .await
        .unwrap();
    assert!(cleared.values().all(Bindings::is_empty));

    let engines = cluster.handle.engines().await.unwrap();
    assert!(engines.iter().all(|engine| engine.properties.is_empty()));

    let err = cluster
        .handle
        .get_properties(EngineId::new(5), ["rack"])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Registry(RegistryError::UnknownEngine(_))
    ));
}

#[tokio::test]
async fn execution_history_is_kept_per_engine() {
    let cluster = Cluster::start(2).await;
    cluster
        .handle
        .execute(TargetSelector::All, "print 1")
        .await
        .unwrap();
    cluster
        .handle
        .execute(EngineId::new(1), "print 2")
        .await
        .unwrap();

    let latest = cluster
        .handle
        .get_result(TargetSelector::All, None)
        .await
        .unwrap();
    match latest.get(EngineId::new(1)).unwrap().as_ref().unwrap() {
        EngineReply::ExecutionResult {
            number,
            code,
            stdout,
            ..
        } => {
            assert_eq!(*number, 1);
            assert_eq!(code, "print 2");
            assert_eq!(stdout, "2\n");
        }
        other => panic!("unexpected reply {other:?}"),
    }
    match latest.get(EngineId::new(0)).unwrap().as_ref().unwrap() {
        EngineReply::ExecutionResult { number, .. } => assert_eq!(*number, 0),
        other => panic!("unexpected reply {other:?}"),
    }

    let second = cluster
        .handle
        .get_result(TargetSelector::All, Some(1))
        .await
        .unwrap();
    assert!(second.get(EngineId::new(1)).unwrap().is_ok());
    assert_eq!(
        second.get(EngineId::new(0)).unwrap().as_ref().unwrap_err().kind,
        FailureKind::IndexError
    );
}
