//! Fix batches and resource refresh against a scripted `aws` CLI.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use vgraph_core::builtins::{INGRESS_VARIANT, REFRESH_INGRESS, REVOKE_INGRESS_FIX};
use vgraph_core::func::{PipelineResult, ResourceResult};
use vgraph_core::{
    builtin_registry, builtin_variants, CommandOutput, Component, EngineConfig, EventKind,
    EventPayload, FixRequest, Func, FuncContext, FuncKind, FuncResult, GraphEngine, InputSnapshot,
    ScriptedCommandRunner, Scope,
};
use vgraph_state::{FixLedger, FixOutcome, MemoryFixLedger, MemoryRowStore, Tenancy};

const GATED_FIX: &str = "test:gatedFix";

const LIVE_GROUPS: &str = r#"{
  "SecurityGroups": [{
    "GroupId": "sg-good",
    "IpPermissions": [
      {"IpProtocol": "tcp", "FromPort": 22, "ToPort": 22, "IpRanges": [{"CidrIp": "0.0.0.0/0"}]}
    ]
  }]
}"#;

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sandbox.max_retries = 1;
    config.sandbox.backoff_base_ms = 1;
    config
}

/// `sg-good` accepts revokes; `sg-locked` refuses them.
fn aws() -> ScriptedCommandRunner {
    ScriptedCommandRunner::new(|call| {
        let locked = call.args.iter().any(|a| a == "sg-locked");
        let op = call.args.get(1).map(String::as_str).unwrap_or_default();
        Ok(match (op, locked) {
            ("describe-security-groups", _) => CommandOutput::success(LIVE_GROUPS),
            ("revoke-security-group-ingress", false) => CommandOutput::success(""),
            (_, _) => CommandOutput::failure(
                254,
                "An error occurred (UnauthorizedOperation) when calling the operation",
            ),
        })
    })
}

fn rule(group: &str) -> Value {
    json!({
        "region": "us-east-1",
        "GroupId": group,
        "IpProtocol": "tcp",
        "FromPort": 22,
        "ToPort": 22,
        "CidrIp": "0.0.0.0/0",
    })
}

async fn ingress(engine: &GraphEngine, scope: &Scope, name: &str, group: &str) -> Component {
    let (component, _) = engine
        .create_component(scope, name, INGRESS_VARIANT, rule(group))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    component
}

#[tokio::test]
async fn test_refresh_records_live_rule() {
    let runner = aws();
    let engine = GraphEngine::in_memory(Arc::new(runner.clone()), fast_config());
    let head = Scope::head(Tenancy::new_universal());
    let c = ingress(&engine, &head, "ssh", "sg-good").await;
    let mut refreshed = engine.events().subscribe(EventKind::ResourceRefreshed).unwrap();

    let result = engine
        .refresh_resource(&head, c.id, REFRESH_INGRESS)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.value["FromPort"], json!(22));

    let stored = engine.component(&head, c.id).await.unwrap();
    assert_eq!(stored.resource, result.value);
    let event = refreshed.recv().await.unwrap();
    assert!(matches!(
        event.payload,
        EventPayload::ResourceRefreshed { component_id, .. } if component_id == c.id
    ));

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].command, "aws");
    assert!(calls[0].args.contains(&"sg-good".to_string()));
}

#[tokio::test]
async fn test_batch_completes_with_mixed_outcomes() {
    let engine = GraphEngine::in_memory(Arc::new(aws()), fast_config());
    let head = Scope::head(Tenancy::new_universal());
    let good = ingress(&engine, &head, "open", "sg-good").await;
    let locked = ingress(&engine, &head, "locked", "sg-locked").await;
    for id in [good.id, locked.id] {
        engine
            .refresh_resource(&head, id, REFRESH_INGRESS)
            .await
            .unwrap();
    }
    let before = engine.component(&head, locked.id).await.unwrap().resource;
    assert!(!before.is_null());

    let mut returns = engine.events().subscribe(EventKind::FixReturn).unwrap();
    let mut batches = engine.events().subscribe(EventKind::FixBatchReturn).unwrap();

    let batch = engine
        .run_fixes(
            &head,
            vec![
                FixRequest::new(good.id, REVOKE_INGRESS_FIX),
                FixRequest::new(locked.id, REVOKE_INGRESS_FIX),
            ],
        )
        .await
        .unwrap();

    assert!(batch.completed);
    assert_eq!(batch.pending_count(), 0);
    let outcome_of = |id: &str| {
        batch
            .members
            .iter()
            .find(|m| m.component_id == id)
            .and_then(|m| m.outcome)
    };
    assert_eq!(outcome_of(&good.id.to_string()), Some(FixOutcome::Success));
    assert_eq!(outcome_of(&locked.id.to_string()), Some(FixOutcome::Failure));

    // A successful revoke removes the resource; a failed one leaves it alone.
    assert!(engine
        .component(&head, good.id)
        .await
        .unwrap()
        .resource
        .is_null());
    assert_eq!(
        engine.component(&head, locked.id).await.unwrap().resource,
        before
    );

    let fix_returns = returns.drain();
    assert_eq!(fix_returns.len(), 2);
    let failure_message = fix_returns.iter().find_map(|e| match &e.payload {
        EventPayload::FixReturn {
            outcome: FixOutcome::Failure,
            message,
            ..
        } => message.clone(),
        _ => None,
    });
    assert!(failure_message
        .unwrap_or_default()
        .contains("UnauthorizedOperation"));

    let batch_returns = batches.drain();
    assert_eq!(batch_returns.len(), 1);
    assert!(matches!(
        &batch_returns[0].payload,
        EventPayload::FixBatchReturn { batch_id, succeeded: 1, failed: 1 } if *batch_id == batch.batch_id
    ));

    let stored = engine
        .fix_ledger()
        .get_batch(&batch.batch_id)
        .await
        .unwrap();
    assert_eq!(stored, batch);
}

#[tokio::test]
async fn test_empty_batch_completes_immediately() {
    let engine = GraphEngine::in_memory(Arc::new(aws()), fast_config());
    let head = Scope::head(Tenancy::new_universal());
    let mut batches = engine.events().subscribe(EventKind::FixBatchReturn).unwrap();

    let batch = engine.run_fixes(&head, Vec::new()).await.unwrap();
    assert!(batch.completed);
    assert!(batch.members.is_empty());
    assert_eq!(batches.drain().len(), 1);
}

#[tokio::test]
async fn test_spawned_batch_runs_in_background() {
    let engine = GraphEngine::in_memory(Arc::new(aws()), fast_config());
    let head = Scope::head(Tenancy::new_universal());
    let good = ingress(&engine, &head, "open", "sg-good").await;

    let handle = engine.spawn_fixes(head.clone(), vec![FixRequest::new(good.id, REVOKE_INGRESS_FIX)]);
    let batch = handle.await.unwrap().unwrap();
    assert!(batch.completed);
    assert_eq!(batch.members[0].outcome, Some(FixOutcome::Success));
    assert_eq!(batch.members[0].attempts, 1);
}

/// A fix that reports when it starts, then waits for a permit.
struct GatedFix {
    started: mpsc::UnboundedSender<()>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Func for GatedFix {
    fn name(&self) -> &str {
        GATED_FIX
    }

    fn kind(&self) -> FuncKind {
        FuncKind::Fix
    }

    async fn run(&self, _ctx: &FuncContext, _input: &InputSnapshot) -> PipelineResult<FuncResult> {
        let _ = self.started.send(());
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        Ok(FuncResult::Fix(ResourceResult::ok(Value::Null)))
    }
}

#[tokio::test]
async fn test_batch_completes_when_change_set_canceled_mid_run() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));
    let registry = builtin_registry().with_func(Arc::new(GatedFix {
        started: started_tx,
        gate: Arc::clone(&gate),
    }));
    let mut config = fast_config();
    config.propagation.max_concurrency = 1;
    let engine = builtin_variants().into_iter().fold(
        GraphEngine::with_registry(
            Arc::new(MemoryRowStore::new()),
            Arc::new(MemoryFixLedger::new()),
            Arc::new(aws()),
            registry,
            config,
        ),
        |engine, variant| engine.with_variant(variant),
    );

    let tenancy = Tenancy::new_universal();
    let cs = engine.create_change_set(&tenancy, "revoke").await.unwrap();
    let scope = Scope::new(tenancy.clone(), cs.pk);
    let first = ingress(&engine, &scope, "first", "sg-good").await;
    let second = ingress(&engine, &scope, "second", "sg-good").await;

    let mut returns = engine.events().subscribe(EventKind::FixReturn).unwrap();
    let mut batches = engine.events().subscribe(EventKind::FixBatchReturn).unwrap();
    let handle = engine.spawn_fixes(
        scope.clone(),
        vec![
            FixRequest::new(first.id, GATED_FIX),
            FixRequest::new(second.id, GATED_FIX),
        ],
    );

    // The first member is in flight; the second waits for a slot.
    started.recv().await.unwrap();
    engine.cancel_change_set(&tenancy, cs.pk).await.unwrap();
    gate.add_permits(2);

    let batch = handle.await.unwrap().unwrap();
    assert!(batch.completed);
    assert_eq!(batch.pending_count(), 0);

    // The second member's component went away with the change set.
    let second_member = batch
        .members
        .iter()
        .find(|m| m.component_id == second.id.to_string())
        .unwrap();
    assert_eq!(second_member.outcome, Some(FixOutcome::Failure));
    assert!(second_member
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("component not found"));

    assert_eq!(returns.drain().len(), 2);
    assert_eq!(batches.drain().len(), 1);
    let stored = engine
        .fix_ledger()
        .get_batch(&batch.batch_id)
        .await
        .unwrap();
    assert!(stored.completed);
}
