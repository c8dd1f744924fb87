//! Structured observability hooks for change-set and engine lifecycle events.
//!
//! This module provides:
//! - Change-set scoped tracing spans: `change_set_span` for futures
//!   (attach with `Instrument`), the `ChangeSetSpan` RAII guard for
//!   synchronous sections
//! - One emission function per lifecycle event
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use tracing::info;
use vgraph_state::ChangeSetPk;

use crate::func::FuncKind;

/// Span tagged with a change-set pk, for instrumenting a future.
///
/// ```ignore
/// async { /* ... */ }.instrument(change_set_span(pk)).await
/// ```
pub fn change_set_span(change_set_pk: ChangeSetPk) -> tracing::Span {
    tracing::info_span!("vgraph.change_set", change_set_pk = %change_set_pk)
}

/// RAII guard that enters a change-set span. The guard is `!Send`; never
/// hold it across an `.await`.
///
/// ```ignore
/// let _span = ChangeSetSpan::enter(pk);
/// // every tracing call here carries change_set_pk
/// ```
pub struct ChangeSetSpan {
    _span: tracing::span::EnteredSpan,
}

impl ChangeSetSpan {
    pub fn enter(change_set_pk: ChangeSetPk) -> Self {
        Self {
            _span: change_set_span(change_set_pk).entered(),
        }
    }
}

/// Emit event: change set created.
pub fn emit_change_set_created(change_set_pk: ChangeSetPk, name: &str) {
    info!(event = "change_set.created", change_set_pk = %change_set_pk, name = %name);
}

/// Emit event: change set applied, with the number of rows re-stamped to HEAD.
pub fn emit_change_set_applied(change_set_pk: ChangeSetPk, rows: usize) {
    info!(event = "change_set.applied", change_set_pk = %change_set_pk, rows = rows);
}

/// Emit event: change set canceled, with the number of rows soft-deleted.
pub fn emit_change_set_canceled(change_set_pk: ChangeSetPk, rows: usize) {
    info!(event = "change_set.canceled", change_set_pk = %change_set_pk, rows = rows);
}

/// Emit event: one propagation run settled.
pub fn emit_propagation_settled(
    change_set_pk: ChangeSetPk,
    resolved: usize,
    unresolved: usize,
    failed: usize,
    duration_ms: u64,
) {
    info!(
        event = "propagation.settled",
        change_set_pk = %change_set_pk,
        resolved = resolved,
        unresolved = unresolved,
        failed = failed,
        duration_ms = duration_ms,
    );
}

/// Emit event: one function invocation finished (after retries).
pub fn emit_func_executed(func: &str, kind: FuncKind, duration_ms: u64, success: bool) {
    info!(
        event = "func.executed",
        func = %func,
        kind = %kind,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: a fix batch has no pending members left.
pub fn emit_fix_batch_completed(batch_id: &str, succeeded: usize, failed: usize) {
    info!(
        event = "fix_batch.completed",
        batch_id = %batch_id,
        succeeded = succeeded,
        failed = failed,
    );
}

/// Emit event: a published outcome could not be announced (warning level).
pub fn emit_dispatch_error(kind: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "event.dispatch_error", kind = %kind, error = %error);
}
