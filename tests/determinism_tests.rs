use std::sync::Arc;
use std::time::Duration;

use transcribe_fanout::providers::in_memory::InMemoryHistoryStore;
use transcribe_fanout::providers::HistoryStore;
use transcribe_fanout::runtime::{self, ActivityRegistry, OrchestrationStatus};
use transcribe_fanout::{Action, DurableOutput, Event, OrchestrationContext, OrchestrationRegistry, run_turn};

fn chain_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("A", |input: String| async move {
            Ok(input.parse::<i32>().map(|x| x + 1).unwrap_or(0).to_string())
        })
        .register("B", |input: String| async move { Ok(format!("{input}b")) })
        .register("C", |input: String| async move { Ok(format!("{input}c")) })
        .build()
}

async fn chain(ctx: OrchestrationContext) -> Result<String, String> {
    let a = ctx.schedule_activity("A", "1").into_activity().await?;
    let b = ctx.schedule_activity("B", a).into_activity().await?;
    ctx.schedule_timer(5).into_timer().await;
    let c = ctx.schedule_activity("C", b).into_activity().await?;
    Ok(format!("c={c}"))
}

#[tokio::test]
async fn completed_history_replays_without_new_actions() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Chain", |ctx: OrchestrationContext, _input: String| chain(ctx))
        .build();
    let rt = runtime::Runtime::start(Arc::new(chain_activities()), orchestrations).await;
    let (history, output) = rt
        .clone()
        .start_orchestration("inst-chain", "Chain", "")
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(output, Ok("c=2bc".to_string()));
    // Started + three activity pairs + one timer pair + terminal
    assert_eq!(history.len(), 10);

    let (replayed, actions, _logs, out) = run_turn("inst-chain", history.clone(), chain);
    assert!(actions.is_empty(), "replay should not produce new actions");
    assert_eq!(out, Some(output));
    assert_eq!(replayed, history);
    rt.shutdown().await;
}

#[test]
fn first_turn_emits_actions_in_poll_order() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "1");
        let t = ctx.schedule_timer(500);
        let s = ctx.schedule_sub_orchestration("Child", "in");
        ctx.join(vec![a, t, s]).await
    };
    let (history, actions, _logs, out) = run_turn("inst-order", Vec::new(), orchestrator);
    assert!(out.is_none());
    let kinds: Vec<&'static str> = actions
        .iter()
        .map(|a| match a {
            Action::CallActivity { .. } => "CallActivity",
            Action::CreateTimer { .. } => "CreateTimer",
            Action::StartSubOrchestration { .. } => "StartSubOrchestration",
        })
        .collect();
    assert_eq!(kinds, vec!["CallActivity", "CreateTimer", "StartSubOrchestration"]);
    assert_eq!(history.len(), 3);
    assert!(matches!(
        &actions[2],
        Action::StartSubOrchestration { id: 3, instance, .. } if instance == "inst-order::sub::3"
    ));
}

#[test]
fn completions_correlate_by_id_not_arrival_order() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let first = ctx.schedule_activity("Lookup", "one");
        let second = ctx.schedule_activity("Lookup", "two");
        ctx.join(vec![first, second]).await
    };
    let (mut history, actions, _, _) = run_turn("inst-corr", Vec::new(), orchestrator);
    assert_eq!(actions.len(), 2);
    // Second branch completes first
    history.push(Event::ActivityCompleted {
        id: 2,
        result: "r2".into(),
    });
    history.push(Event::ActivityCompleted {
        id: 1,
        result: "r1".into(),
    });
    let (_, actions, _, out) = run_turn("inst-corr", history, orchestrator);
    assert!(actions.is_empty());
    assert_eq!(
        out,
        Some(vec![
            DurableOutput::Activity(Ok("r1".into())),
            DurableOutput::Activity(Ok("r2".into())),
        ])
    );
}

#[test]
fn is_replaying_flips_at_the_recorded_frontier() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let before = ctx.is_replaying();
        let _ = ctx.schedule_activity("A", "").into_activity().await;
        let after = ctx.is_replaying();
        (before, after)
    };
    let (mut history, _, _, out) = run_turn("inst-replaying", Vec::new(), orchestrator);
    assert!(out.is_none());
    history.push(Event::ActivityCompleted {
        id: 1,
        result: "ok".into(),
    });
    let (_, _, _, out) = run_turn("inst-replaying", history, orchestrator);
    assert_eq!(out, Some((true, false)));
}

#[tokio::test]
async fn changed_code_fails_the_instance_as_nondeterministic() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let inst = "inst-drift";
    store.create_instance(inst).await.unwrap();
    store
        .append(
            inst,
            vec![
                Event::OrchestrationStarted {
                    name: "Drifted".into(),
                    input: String::new(),
                    parent_instance: None,
                    parent_id: None,
                },
                Event::ActivityScheduled {
                    id: 1,
                    name: "A".into(),
                    input: "1".into(),
                },
                Event::ActivityCompleted {
                    id: 1,
                    result: "2".into(),
                },
            ],
        )
        .await
        .unwrap();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Drifted", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("B", "1").into_activity().await
        })
        .build();
    let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(chain_activities()), orchestrations).await;

    match rt.wait_for_orchestration(inst, Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Failed { error } => {
            assert!(error.starts_with("nondeterministic:"), "{error}");
            assert!(error.contains("activity 'A'"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // The diverging schedule was never persisted
    let history = store.read(inst).await;
    assert!(
        !history
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "B"))
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_orchestration_fails_at_start() {
    let rt = runtime::Runtime::start(Arc::new(chain_activities()), OrchestrationRegistry::builder().build()).await;
    let (_, out) = rt
        .clone()
        .start_orchestration("inst-missing", "Missing", "")
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(out, Err("unregistered:Missing".to_string()));
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_the_awaiting_orchestration() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsNothing", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Nope", "").into_activity().await
        })
        .build();
    let rt = runtime::Runtime::start(Arc::new(chain_activities()), orchestrations).await;
    let (_, out) = rt
        .clone()
        .start_orchestration("inst-nope", "CallsNothing", "")
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(out, Err("unregistered activity:Nope".to_string()));
    rt.shutdown().await;
}
