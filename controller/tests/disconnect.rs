mod common;

use cluster_controller::infrastructure::config::ControllerSettings;
use cluster_controller::protocol::{CallId, EngineReply, EngineRequest};
use cluster_controller::registry::{EngineInfo, TargetSelector};
use cluster_controller::{ControllerError, EngineId, FailureKind};
use common::Cluster;
use std::time::Duration;

fn execute(code: &str) -> EngineRequest {
    EngineRequest::Execute { code: code.into() }
}

#[tokio::test]
async fn disconnect_fails_every_pending_call_and_frees_the_id() {
    let cluster = Cluster::start(0).await;
    let silent = cluster.add_silent().await;
    assert_eq!(silent.engine_id, EngineId::new(0));

    let first = cluster
        .handle
        .dispatch(silent.engine_id, execute("a = 1"))
        .await
        .unwrap();
    let second = cluster
        .handle
        .dispatch(silent.engine_id, execute("b = 2"))
        .await
        .unwrap();
    let requests = silent.wait_for_requests(2).await;
    assert!(requests[0].0 < requests[1].0);

    silent.disconnect("connection reset");

    for call in [first, second] {
        let outcomes = call.wait().await.unwrap();
        let failure = outcomes.get(EngineId::new(0)).unwrap().as_ref().unwrap_err();
        assert_eq!(failure.kind, FailureKind::EngineLost);
        assert_eq!(failure.detail, "connection reset");
    }
    assert!(silent.is_closed());

    let replacement = cluster.add_silent().await;
    assert_eq!(replacement.engine_id, EngineId::new(0));
}

#[tokio::test]
async fn replies_from_a_replaced_connection_are_ignored() {
    let cluster = Cluster::start(0).await;
    let old = cluster.add_silent().await;
    let call = cluster
        .handle
        .dispatch(old.engine_id, EngineRequest::Keys)
        .await
        .unwrap();
    let (call_id, _) = old.wait_for_requests(1).await[0].clone();
    old.disconnect("gone");
    call.wait().await.unwrap();

    let new = cluster.add_silent().await;
    assert_eq!(new.engine_id, old.engine_id);

    old.reply(call_id, Ok(EngineReply::Keys { names: vec![] }));
    old.disconnect("gone again");

    let call = cluster
        .handle
        .dispatch(new.engine_id, EngineRequest::Keys)
        .await
        .unwrap();
    let (call_id, _) = new.wait_for_requests(1).await[0].clone();
    new.reply(call_id, Ok(EngineReply::Keys { names: vec!["x".into()] }));
    let outcomes = call.wait().await.unwrap();
    assert!(outcomes.all_succeeded());
    assert!(cluster.handle.is_running());
}

#[tokio::test]
async fn timed_out_engine_stays_busy_until_the_late_reply() {
    let settings = ControllerSettings {
        default_call_timeout_ms: Some(50),
        ..ControllerSettings::default()
    };
    let cluster = Cluster::with_settings(settings, 0).await;
    let silent = cluster.add_silent().await;

    let outcomes = cluster.handle.execute(silent.engine_id, "a = 1").await.unwrap();
    let failure = outcomes.get(silent.engine_id).unwrap().as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Timeout);

    let engines = cluster.handle.engines().await.unwrap();
    assert!(engines[0].suspect);
    assert_eq!(engines[0].busy, 1);

    let (call_id, _) = silent.requests()[0].clone();
    silent.reply(
        call_id,
        Ok(EngineReply::Executed {
            stdout: String::new(),
            stderr: String::new(),
        }),
    );

    let call = cluster
        .handle
        .dispatch(silent.engine_id, EngineRequest::Keys)
        .await
        .unwrap();
    let (call_id, _) = silent.wait_for_requests(2).await[1].clone();
    silent.reply(call_id, Ok(EngineReply::Keys { names: vec![] }));
    assert!(call.wait().await.unwrap().all_succeeded());

    let engines = cluster.handle.engines().await.unwrap();
    assert!(!engines[0].suspect);
    assert_eq!(engines[0].busy, 0);
}

#[tokio::test]
async fn cancel_resolves_unanswered_members() {
    let mut cluster = Cluster::start(0).await;
    let silent = cluster.add_silent().await;
    let live = cluster.add_engine().await;

    let call = cluster
        .handle
        .dispatch(TargetSelector::All, EngineRequest::Keys)
        .await
        .unwrap();
    silent.wait_for_requests(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcomes = call.cancel().await.unwrap();
    assert_eq!(
        outcomes.get(silent.engine_id).unwrap().as_ref().unwrap_err().kind,
        FailureKind::Cancelled
    );
    assert!(outcomes.get(live).unwrap().is_ok());

    let busy = |engines: &[EngineInfo], id: EngineId| {
        engines.iter().find(|engine| engine.id == id).unwrap().busy
    };
    let engines = cluster.handle.engines().await.unwrap();
    assert_eq!(busy(&engines, silent.engine_id), 1);
    assert_eq!(busy(&engines, live), 0);

    let (call_id, _) = silent.requests()[0].clone();
    silent.reply(call_id, Ok(EngineReply::Keys { names: vec![] }));
    let engines = cluster.handle.engines().await.unwrap();
    assert_eq!(busy(&engines, silent.engine_id), 0);
    assert!(cluster.handle.is_running());
}

#[tokio::test]
async fn reply_to_an_unknown_call_stops_the_controller() {
    let cluster = Cluster::start(0).await;
    let silent = cluster.add_silent().await;

    silent.reply(CallId::new(999), Ok(EngineReply::Reset));

    let result = tokio::time::timeout(Duration::from_secs(5), cluster.controller)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ControllerError::Correlation(_))));
    assert!(silent.is_closed());
    assert!(matches!(
        cluster.handle.engines().await,
        Err(ControllerError::Stopped)
    ));
}

#[tokio::test]
async fn duplicate_reply_stops_the_controller() {
    let cluster = Cluster::start(0).await;
    let silent = cluster.add_silent().await;

    let call = cluster
        .handle
        .dispatch(silent.engine_id, EngineRequest::Reset)
        .await
        .unwrap();
    let (call_id, _) = silent.wait_for_requests(1).await[0].clone();
    silent.reply(call_id, Ok(EngineReply::Reset));
    assert!(call.wait().await.unwrap().all_succeeded());

    silent.reply(call_id, Ok(EngineReply::Reset));
    let result = tokio::time::timeout(Duration::from_secs(5), cluster.controller)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ControllerError::Correlation(_))));
}

#[tokio::test]
async fn local_engine_crash_is_detected() {
    let mut cluster = Cluster::start(2).await;
    let crashed = cluster.engines.remove(0);
    assert_eq!(crashed.engine_id(), EngineId::new(0));
    crashed.disconnect();

    cluster.wait_for_live(1).await;
    let err = cluster.handle.keys(EngineId::new(0)).await.unwrap_err();
    assert!(matches!(err, ControllerError::Registry(_)));
    assert_eq!(cluster.add_engine().await, EngineId::new(0));
}
