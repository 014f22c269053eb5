use std::sync::Arc;

use transcribe_fanout::providers::HistoryStore;
use transcribe_fanout::providers::in_memory::InMemoryHistoryStore;
use transcribe_fanout::runtime::{self, ActivityRegistry, RetryPolicy};
use transcribe_fanout::{Action, Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, run_turn};

// 1) Single-turn emission: an activity is scheduled once and the turn stays pending
#[test]
fn action_emission_single_turn() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("A", "1").into_activity().await.unwrap_or_default()
    };
    let (history, actions, _logs, out) = run_turn("inst-unit-1", Vec::new(), orchestrator);
    assert!(out.is_none());
    assert_eq!(
        actions,
        vec![Action::CallActivity {
            id: 1,
            name: "A".into(),
            input: "1".into()
        }]
    );
    assert!(matches!(&history[0], Event::ActivityScheduled { id: 1, name, .. } if name == "A"));
}

// 2) Completions are picked up by correlation id, whatever their position
#[test]
fn correlation_out_of_order_completion() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "1".into(),
        },
        Event::TimerCreated { id: 2, fire_at_ms: 0 },
        Event::TimerFired { id: 2, fire_at_ms: 0 },
        Event::ActivityCompleted {
            id: 1,
            result: "ok".into(),
        },
    ];
    let orchestrator = |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "1").into_activity().await;
        ctx.schedule_timer(1).into_timer().await;
        a
    };
    let (_history, actions, _logs, out) = run_turn("inst-unit-2", history, orchestrator);
    assert!(actions.is_empty());
    assert_eq!(out, Some(Ok("ok".to_string())));
}

// 3) Replaying with the same completion twice does not re-emit the schedule
#[tokio::test]
async fn deterministic_replay_activity_only() {
    let activity_registry = ActivityRegistry::builder()
        .register("A", |input: String| async move { Ok(format!("{input}!")) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("OneActivity", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("A", input).into_activity().await
        })
        .build();
    let rt = runtime::Runtime::start(Arc::new(activity_registry), orchestrations).await;
    let (history, out) = rt
        .clone()
        .start_orchestration("inst-unit-3", "OneActivity", "go")
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(out, Ok("go!".to_string()));

    let replay = |ctx: OrchestrationContext| async move { ctx.schedule_activity("A", "go").into_activity().await };
    let (_h, actions, _logs, replayed) = run_turn("inst-unit-3", history, replay);
    assert!(actions.is_empty());
    assert_eq!(replayed, Some(Ok("go!".to_string())));
    rt.shutdown().await;
}

// 4) HistoryStore admin APIs (in-memory)
#[tokio::test]
async fn history_store_admin_apis() {
    let store = InMemoryHistoryStore::default();
    store.create_instance("i1").await.unwrap();
    store.create_instance("i2").await.unwrap();
    store
        .append("i1", vec![Event::TimerCreated { id: 1, fire_at_ms: 10 }])
        .await
        .unwrap();
    store
        .append(
            "i2",
            vec![Event::ActivityScheduled {
                id: 1,
                name: "Go".into(),
                input: String::new(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(store.list_instances().await, vec!["i1".to_string(), "i2".to_string()]);
    let dump = store.dump_all_pretty().await;
    assert!(dump.contains("instance=i1") && dump.contains("instance=i2"));
    store.reset().await;
    assert!(store.list_instances().await.is_empty());
}

#[tokio::test]
async fn providers_create_remove_and_duplicate_checks() {
    let mem = InMemoryHistoryStore::default();
    mem.create_instance("dup").await.unwrap();
    assert!(mem.create_instance("dup").await.is_err());
    assert!(mem.append("missing", vec![]).await.is_err());
    mem.remove_instance("dup").await.unwrap();
    assert!(mem.remove_instance("dup").await.is_err());
}

#[tokio::test]
async fn terminal_event_is_written_once() {
    let mem = InMemoryHistoryStore::default();
    mem.create_instance("t").await.unwrap();
    mem.append("t", vec![Event::OrchestrationCompleted { output: "a".into() }])
        .await
        .unwrap();
    mem.append("t", vec![Event::OrchestrationFailed { error: "b".into() }])
        .await
        .unwrap();
    assert_eq!(
        mem.read("t").await,
        vec![Event::OrchestrationCompleted { output: "a".into() }]
    );
}

#[tokio::test]
async fn runtime_duplicate_orchestration_deduped_single_execution() {
    let activity_registry = ActivityRegistry::builder().build();
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("TestOrch", |ctx: OrchestrationContext, _input: String| async move {
            // Give the second start a chance to arrive
            ctx.schedule_timer(20).into_timer().await;
            Ok("ok".to_string())
        })
        .build();

    let rt = runtime::Runtime::start(Arc::new(activity_registry), orchestration_registry).await;
    let inst = "dup-orch";
    let h1 = rt.clone().start_orchestration(inst, "TestOrch", "").await.unwrap();
    let h2 = rt.clone().start_orchestration(inst, "TestOrch", "").await.unwrap();

    let (hist1, out1) = h1.await.unwrap();
    let (hist2, out2) = h2.await.unwrap();
    assert_eq!(out1.as_deref(), Ok("ok"));
    assert_eq!(out2.as_deref(), Ok("ok"));
    assert_eq!(hist1, hist2);
    assert_eq!(hist1.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(
        hist1
            .iter()
            .filter(|e| matches!(e, Event::OrchestrationStarted { .. }))
            .count(),
        1
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn orchestration_descriptor_root_and_child() {
    let parent = |ctx: OrchestrationContext, _input: String| async move {
        let _ = ctx
            .schedule_sub_orchestration("ChildDsc", "x")
            .into_sub_orchestration()
            .await;
        Ok("done".to_string())
    };
    let child = |_ctx: OrchestrationContext, _input: String| async move { Ok("child".to_string()) };
    let reg = OrchestrationRegistry::builder()
        .register("ParentDsc", parent)
        .register("ChildDsc", child)
        .build();
    let rt = runtime::Runtime::start(Arc::new(ActivityRegistry::builder().build()), reg).await;
    let (_hist, out) = rt
        .clone()
        .start_orchestration("inst-desc", "ParentDsc", "seed")
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(out.as_deref(), Ok("done"));

    let d = rt.get_orchestration_descriptor("inst-desc").await.unwrap();
    assert_eq!(d.name, "ParentDsc");
    assert!(d.parent_instance.is_none());
    assert!(d.parent_id.is_none());

    let dchild = rt.get_orchestration_descriptor("inst-desc::sub::1").await.unwrap();
    assert_eq!(dchild.name, "ChildDsc");
    assert_eq!(dchild.parent_instance.as_deref(), Some("inst-desc"));
    assert_eq!(dchild.parent_id, Some(1));
    assert!(rt.get_orchestration_descriptor("no-such").await.is_none());
    rt.shutdown().await;
}

#[tokio::test]
async fn orchestration_status_apis() {
    let orchestration_registry = OrchestrationRegistry::builder()
        .register("ShortTimer", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(10).into_timer().await;
            Ok("ok".to_string())
        })
        .register("AlwaysFails", |_ctx: OrchestrationContext, _input: String| async move {
            Err("boom".to_string())
        })
        .build();
    let rt = runtime::Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestration_registry).await;

    assert_eq!(rt.get_orchestration_status("no-such").await, OrchestrationStatus::NotFound);

    let inst_running = "inst-status-running";
    let handle_running = rt
        .clone()
        .start_orchestration(inst_running, "ShortTimer", "")
        .await
        .unwrap();
    assert_eq!(rt.get_orchestration_status(inst_running).await, OrchestrationStatus::Running);
    let (_h, out) = handle_running.await.unwrap();
    assert_eq!(out.as_deref(), Ok("ok"));
    assert_eq!(
        rt.get_orchestration_status(inst_running).await,
        OrchestrationStatus::Completed { output: "ok".into() }
    );

    let inst_fail = "inst-status-fail";
    let (_h2, out2) = rt
        .clone()
        .start_orchestration(inst_fail, "AlwaysFails", "")
        .await
        .unwrap()
        .await
        .unwrap();
    assert!(out2.is_err());
    assert_eq!(
        rt.get_orchestration_status(inst_fail).await,
        OrchestrationStatus::Failed { error: "boom".into() }
    );
    rt.shutdown().await;
}

#[test]
fn retry_policy_never_drops_below_one_attempt() {
    let policy = RetryPolicy::new(0, std::time::Duration::from_millis(100));
    assert_eq!(policy.max_attempts, 1);
    assert_eq!(policy.delay_for(3), std::time::Duration::from_millis(300));
    assert_eq!(RetryPolicy::default().max_attempts, 1);
}

