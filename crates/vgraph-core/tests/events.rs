//! What late subscribers see after an engine run.

use std::sync::Arc;

use serde_json::json;
use vgraph_core::builtins::EC2_INSTANCE_VARIANT;
use vgraph_core::events::OutputStream;
use vgraph_core::{
    CommandOutput, EngineConfig, EventKind, EventPayload, GraphEngine, Scope,
    ScriptedCommandRunner,
};
use vgraph_state::Tenancy;

#[tokio::test]
async fn test_late_subscribers_get_retained_events_only() {
    let engine = GraphEngine::in_memory(
        Arc::new(ScriptedCommandRunner::always(CommandOutput::failure(
            254,
            "An error occurred (UnauthorizedOperation)",
        ))),
        EngineConfig::default(),
    );
    let head = Scope::head(Tenancy::new_universal());
    let (web, _) = engine
        .create_component(&head, "web", EC2_INSTANCE_VARIANT, json!({"region": "us-east-1"}))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();

    // State-like: the latest write is replayed.
    let mut written = engine.events().subscribe(EventKind::ChangeSetWritten).unwrap();
    match written.try_recv().map(|e| e.payload) {
        Some(EventPayload::ChangeSetWritten { component_ids }) => {
            assert_eq!(component_ids, vec![web.id])
        }
        other => panic!("expected ChangeSetWritten, got {other:?}"),
    }

    // Output stream: the dry run's stderr is replayed from history.
    let mut output = engine.events().subscribe(EventKind::CommandOutput).unwrap();
    let replayed = output.drain();
    assert!(replayed.iter().any(|e| matches!(
        &e.payload,
        EventPayload::CommandOutput { stream: OutputStream::Stderr, line, .. }
            if line.contains("UnauthorizedOperation")
    )));

    // Outcomes are fire-only.
    let mut qualifications = engine
        .events()
        .subscribe(EventKind::QualificationChecked)
        .unwrap();
    assert!(qualifications.try_recv().is_none());
}
