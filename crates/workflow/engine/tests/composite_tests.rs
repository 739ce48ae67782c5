//! Integration tests for the composite activities

mod common;

use common::*;
use flowstate_engine::{StructuralChange, TraceEvent, WorkflowOutcome, WorkflowRuntime};
use flowstate_types::*;
use serde_json::json;

// ── Sequence / Parallel ──────────────────────────────────────────────

#[test]
fn test_sequence_runs_children_in_order() {
    let def = ActivityDefinition::sequence("root")
        .with_child(counter("first", "n"))
        .with_child(counter("skipped", "n").disabled())
        .with_child(counter("second", "n"));
    let runtime = start(&def);

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(runtime.trace().execution_order(), names(&["root", "first", "second"]));
    assert_eq!(runtime.variable("n"), Some("2"));
    assert_eq!(runtime.status_of("skipped"), Some(ExecutionStatus::Initialized));
}

#[test]
fn test_parallel_waits_for_all_branches() {
    let def = ActivityDefinition::parallel("root")
        .with_child(ActivityDefinition::wait_for_event("left", "l"))
        .with_child(ActivityDefinition::wait_for_event("right", "r"));
    let mut runtime = start(&def);

    runtime.raise_event("r", json!(1)).unwrap();
    assert!(runtime.outcome().is_none());
    assert_eq!(runtime.status_of("right"), Some(ExecutionStatus::Closed));

    runtime.raise_event("l", json!(2)).unwrap();
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(
        runtime.trace().status_changes("root"),
        vec![ExecutionStatus::Executing, ExecutionStatus::Closed]
    );
}

#[test]
fn test_parallel_cancel_reaches_only_executing_branches() {
    let def = ActivityDefinition::parallel("root")
        .with_child(counter("done", "n"))
        .with_child(ActivityDefinition::wait_for_event("off", "q_off").disabled())
        .with_child(ActivityDefinition::wait_for_event("a", "qa"))
        .with_child(ActivityDefinition::wait_for_event("b", "qb"))
        .with_child(ActivityDefinition::wait_for_event("c", "qc"));
    let mut runtime = start(&def);
    runtime.raise_event("qc", json!(1)).unwrap();
    runtime.cancel().unwrap();

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Canceled));
    for branch in ["a", "b"] {
        assert_eq!(
            runtime.trace().status_changes(branch),
            vec![ExecutionStatus::Executing, ExecutionStatus::Canceling, ExecutionStatus::Closed],
            "{branch}"
        );
    }
    for branch in ["done", "off", "c"] {
        assert!(
            !runtime.trace().status_changes(branch).contains(&ExecutionStatus::Canceling),
            "{branch}"
        );
    }
    assert!(runtime.trace().status_changes("off").is_empty());

    let root_closed = status_position(&runtime, "root", ExecutionStatus::Closed).unwrap();
    for branch in ["a", "b"] {
        assert!(status_position(&runtime, branch, ExecutionStatus::Closed).unwrap() < root_closed);
    }
}

#[test]
fn test_empty_composites_close_immediately() {
    let def = ActivityDefinition::sequence("root")
        .with_child(ActivityDefinition::parallel("p"))
        .with_child(ActivityDefinition::listen("l"))
        .with_child(ActivityDefinition::conditioned_group("g"));
    let runtime = start(&def);
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
}

// ── Listen ───────────────────────────────────────────────────────────

fn approval_listen() -> ActivityDefinition {
    ActivityDefinition::sequence("root").with_child(
        ActivityDefinition::listen("choice")
            .with_child(ActivityDefinition::on_event(
                "OnApprove",
                "approve",
                [ActivityDefinition::code("approved").with_update(VariableUpdate::set("decision", "approve"))],
            ))
            .with_child(ActivityDefinition::on_event(
                "OnReject",
                "reject",
                [ActivityDefinition::code("rejected").with_update(VariableUpdate::set("decision", "reject"))],
            )),
    )
}

#[test]
fn test_listen_first_event_wins() {
    let mut runtime = start(&approval_listen());
    assert_eq!(runtime.queue("approve").unwrap().listeners().len(), 1);
    assert_eq!(runtime.queue("reject").unwrap().listeners().len(), 1);

    runtime.raise_event("reject", json!({ "reason": "budget" })).unwrap();

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(runtime.variable("decision"), Some("reject"));
    assert_eq!(runtime.status_of("OnApprove"), Some(ExecutionStatus::Initialized));
    assert!(runtime.queue("approve").unwrap().listeners().is_empty());
    assert!(runtime.queue("reject").unwrap().listeners().is_empty());
}

#[test]
fn test_listen_unsubscribes_before_running_winner() {
    let mut runtime = start(&approval_listen());
    runtime.raise_event("approve", json!(true)).unwrap();

    let trace = runtime.trace();
    let unsubscribed = trace
        .position(|e| matches!(e, TraceEvent::ListenerUnregistered { queue, .. } if queue.as_str() == "reject"))
        .unwrap();
    let winner_started = status_position(&runtime, "OnApprove", ExecutionStatus::Executing).unwrap();
    assert!(unsubscribed < winner_started);
}

#[test]
fn test_listen_ignores_second_event() {
    let mut runtime = start(&approval_listen());
    runtime.enqueue_item("approve", json!(1)).unwrap();
    runtime.enqueue_item("reject", json!(2)).unwrap();
    runtime.run().unwrap();

    assert_eq!(runtime.variable("decision"), Some("approve"));
    assert_eq!(executions(&runtime, "OnReject"), 0);
    assert_eq!(runtime.queue("reject").unwrap().count(), 1);
    let triggers = runtime
        .trace()
        .records()
        .iter()
        .filter(|r| matches!(r.event, TraceEvent::ListenTriggered { .. }))
        .count();
    assert_eq!(triggers, 1);
}

#[test]
fn test_listen_canceled_before_trigger() {
    let mut runtime = start(&approval_listen());
    runtime.cancel().unwrap();

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Canceled));
    assert!(runtime.queue("approve").unwrap().listeners().is_empty());
    assert!(runtime.queue("reject").unwrap().listeners().is_empty());
}

// ── Conditioned Activity Group ───────────────────────────────────────

#[test]
fn test_cag_children_run_once_by_default() {
    let def = ActivityDefinition::conditioned_group("group")
        .with_child(counter("a", "runs"))
        .with_child(counter("b", "runs"));
    let runtime = start(&def);

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(runtime.variable("runs"), Some("2"));
    assert_eq!(executions(&runtime, "a"), 1);
    assert_eq!(executions(&runtime, "b"), 1);
    // Every run happened in a context that has since been completed
    assert!(runtime.get_dynamic_activities("a").is_empty());
}

#[test]
fn test_cag_repeats_while_when_holds() {
    let def = ActivityDefinition::conditioned_group("loop")
        .with_until(ActivityCondition::expression("count >= 3"))
        .with_child(counter("inc", "count").with_when(ActivityCondition::expression("count < 3")));
    let runtime = start_with(&def, &[("count", "0")]);

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(runtime.variable("count"), Some("3"));
    assert_eq!(executions(&runtime, "inc"), 3);
}

#[test]
fn test_cag_until_true_at_start_skips_children() {
    let def = ActivityDefinition::conditioned_group("group")
        .with_until(ActivityCondition::always())
        .with_child(counter("a", "runs"));
    let runtime = start(&def);

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(executions(&runtime, "a"), 0);
}

#[test]
fn test_cag_goes_quiet_and_faults() {
    let def = ActivityDefinition::conditioned_group("group")
        .with_until(ActivityCondition::expression("done == yes"))
        .with_child(counter("a", "runs"));
    let runtime = start(&def);

    match runtime.outcome() {
        Some(WorkflowOutcome::Faulted(message)) => assert!(message.contains("went quiet")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(runtime.variable("runs"), Some("1"));
}

#[test]
fn test_cag_until_cancels_running_children() {
    let def = ActivityDefinition::conditioned_group("group")
        .with_until(ActivityCondition::expression("stop == yes"))
        .with_child(ActivityDefinition::wait_for_event("slow", "never"))
        .with_child(ActivityDefinition::code("stopper").with_update(VariableUpdate::set("stop", "yes")));
    let runtime = start(&def);

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    let slow = runtime.trace().status_changes("slow");
    assert!(slow.contains(&ExecutionStatus::Canceling));
    assert!(runtime.queue("never").unwrap().listeners().is_empty());
}

// ── Replicator ───────────────────────────────────────────────────────

fn initialized_data(runtime: &WorkflowRuntime) -> Vec<serde_json::Value> {
    runtime
        .trace()
        .records()
        .iter()
        .filter_map(|r| match &r.event {
            TraceEvent::ReplicatorChildInitialized { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

fn completed_data(runtime: &WorkflowRuntime) -> Vec<serde_json::Value> {
    runtime
        .trace()
        .records()
        .iter()
        .filter_map(|r| match &r.event {
            TraceEvent::ReplicatorChildCompleted { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_replicator_sequence_runs_items_in_order() {
    let def = ActivityDefinition::replicator("rep", ExecutionType::Sequence)
        .with_initial_child_data([json!("a"), json!("b"), json!("c")])
        .with_child(counter("work", "runs"));
    let runtime = start(&def);

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(runtime.variable("runs"), Some("3"));
    assert_eq!(initialized_data(&runtime), vec![json!("a"), json!("b"), json!("c")]);

    // Each run completes before the next one starts
    let kinds: Vec<bool> = runtime
        .trace()
        .records()
        .iter()
        .filter_map(|r| match r.event {
            TraceEvent::ReplicatorChildInitialized { .. } => Some(true),
            TraceEvent::ReplicatorChildCompleted { .. } => Some(false),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![true, false, true, false, true, false]);
}

#[test]
fn test_replicator_parallel_starts_every_item() {
    let def = ActivityDefinition::replicator("rep", ExecutionType::Parallel)
        .with_initial_child_data([json!(1), json!(2), json!(3)])
        .with_child(ActivityDefinition::wait_for_event("item", "tick"));
    let mut runtime = start(&def);

    assert_eq!(initialized_data(&runtime).len(), 3);
    assert_eq!(runtime.get_dynamic_activities("item").len(), 3);
    assert_eq!(runtime.queue("tick").unwrap().listeners().len(), 3);

    for _ in 0..3 {
        runtime.raise_event("tick", json!(null)).unwrap();
    }
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(completed_data(&runtime), vec![json!(1), json!(2), json!(3)]);
}

#[test]
fn test_replicator_without_items_closes() {
    let def = ActivityDefinition::replicator("rep", ExecutionType::Sequence).with_child(counter("work", "runs"));
    let runtime = start(&def);
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(runtime.variable("runs"), None);
}

#[test]
fn test_replicator_remove_running_item_is_pruned_after_close() {
    let def = ActivityDefinition::replicator("rep", ExecutionType::Parallel)
        .with_initial_child_data([json!("x"), json!("y")])
        .with_child(ActivityDefinition::wait_for_event("item", "tick"));
    let mut runtime = start(&def);

    let removed = runtime.replicator_remove_at("rep", 0).unwrap();
    assert_eq!(removed, json!("x"));
    assert_eq!(runtime.replicator_child_data("rep").unwrap(), vec![json!("y")]);
    // Marked, still running
    assert_eq!(runtime.get_dynamic_activities("item").len(), 2);

    runtime.raise_event("tick", json!(null)).unwrap();
    assert_eq!(completed_data(&runtime), vec![json!("x")]);
    assert_eq!(runtime.replicator_child_data("rep").unwrap(), vec![json!("y")]);
    assert!(runtime.outcome().is_none());

    runtime.raise_event("tick", json!(null)).unwrap();
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
}

#[test]
fn test_replicator_host_list_operations() {
    let def = ActivityDefinition::replicator("rep", ExecutionType::Sequence)
        .with_until(ActivityCondition::expression("stop == yes"))
        .with_child(counter("work", "runs"));
    let mut runtime = start(&def);
    assert_eq!(runtime.status_of("rep"), Some(ExecutionStatus::Executing));

    runtime.replicator_add("rep", json!(1)).unwrap();
    assert_eq!(runtime.variable("runs"), Some("1"));
    runtime.replicator_insert("rep", 0, json!(0)).unwrap();
    assert_eq!(runtime.variable("runs"), Some("2"));
    assert_eq!(runtime.replicator_child_data("rep").unwrap(), vec![json!(0), json!(1)]);

    assert!(matches!(
        runtime.replicator_insert("rep", 5, json!(9)),
        Err(WorkflowError::IndexOutOfRange { index: 5, len: 2 })
    ));
    assert!(matches!(
        runtime.replicator_remove_at("rep", 2),
        Err(WorkflowError::IndexOutOfRange { index: 2, .. })
    ));

    runtime.replicator_clear("rep").unwrap();
    assert!(runtime.replicator_child_data("rep").unwrap().is_empty());

    runtime.cancel().unwrap();
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Canceled));
    assert!(matches!(
        runtime.replicator_add("rep", json!(2)),
        Err(WorkflowError::InvalidOperation(_))
    ));
}

// ── Event Handling Scope ─────────────────────────────────────────────

fn scope() -> ActivityDefinition {
    ActivityDefinition::event_handling_scope("scope")
        .with_child(ActivityDefinition::wait_for_event("body", "done"))
        .with_child(ActivityDefinition::event_handlers("handlers").with_child(ActivityDefinition::on_event(
            "OnPing",
            "ping",
            [counter("count_ping", "pings")],
        )))
}

#[test]
fn test_event_handlers_run_per_occurrence() {
    let mut runtime = start(&scope());

    runtime.raise_event("ping", json!(1)).unwrap();
    runtime.raise_event("ping", json!(2)).unwrap();
    assert_eq!(runtime.variable("pings"), Some("2"));
    assert!(runtime.outcome().is_none());

    runtime.raise_event("done", json!(null)).unwrap();
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert!(runtime.queue("ping").unwrap().listeners().is_empty());
}

#[test]
fn test_event_handlers_serialize_overlapping_occurrences() {
    let mut runtime = start(&scope());

    runtime.enqueue_item("ping", json!(1)).unwrap();
    runtime.enqueue_item("ping", json!(2)).unwrap();
    runtime.enqueue_item("ping", json!(3)).unwrap();
    runtime.run().unwrap();

    assert_eq!(runtime.variable("pings"), Some("3"));
    assert_eq!(runtime.queue("ping").unwrap().count(), 0);
    assert!(runtime.get_dynamic_activities("OnPing").is_empty());
}

#[test]
fn test_scope_with_only_body_closes_with_body() {
    let def = ActivityDefinition::event_handling_scope("scope").with_child(counter("body", "ran"));
    let runtime = start(&def);
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(runtime.variable("ran"), Some("1"));
}

#[test]
fn test_scope_cancel_stops_handlers() {
    let mut runtime = start(&scope());
    runtime.cancel().unwrap();

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Canceled));
    assert!(runtime.queue("ping").unwrap().listeners().is_empty());
    assert!(runtime.queue("done").unwrap().listeners().is_empty());
}

// ── Dynamic update ───────────────────────────────────────────────────

#[test]
fn test_remove_active_sequence_child_moves_on() {
    let def = ActivityDefinition::sequence("root")
        .with_child(counter("before", "n"))
        .with_child(ActivityDefinition::wait_for_event("blocked", "never"))
        .with_child(counter("after", "n"));
    let mut runtime = start(&def);
    assert_eq!(runtime.status_of("blocked"), Some(ExecutionStatus::Executing));

    runtime.apply_changes(vec![StructuralChange::remove("blocked")]).unwrap();

    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
    assert_eq!(runtime.variable("n"), Some("2"));
    assert!(runtime.find_activity("blocked").is_none());
    assert!(runtime.queue("never").unwrap().listeners().is_empty());
    assert!(runtime
        .trace()
        .position(|e| matches!(e, TraceEvent::ActivityAbandoned { activity, .. } if activity.as_str() == "blocked"))
        .is_some());
}

#[test]
fn test_add_branch_to_running_parallel() {
    let def = ActivityDefinition::parallel("root").with_child(ActivityDefinition::wait_for_event("first", "a"));
    let mut runtime = start(&def);

    runtime
        .apply_changes(vec![StructuralChange::add(
            "root",
            1,
            ActivityDefinition::wait_for_event("second", "b"),
        )])
        .unwrap();
    assert_eq!(runtime.status_of("second"), Some(ExecutionStatus::Executing));

    runtime.raise_event("a", json!(null)).unwrap();
    assert!(runtime.outcome().is_none());
    runtime.raise_event("b", json!(null)).unwrap();
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
}

#[test]
fn test_add_branch_to_listen() {
    let mut runtime = start(&approval_listen());
    runtime
        .apply_changes(vec![StructuralChange::add(
            "choice",
            2,
            ActivityDefinition::on_event(
                "OnEscalate",
                "escalate",
                [ActivityDefinition::code("escalated").with_update(VariableUpdate::set("decision", "escalate"))],
            ),
        )])
        .unwrap();

    runtime.raise_event("escalate", json!(null)).unwrap();
    assert_eq!(runtime.variable("decision"), Some("escalate"));
    assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
}

#[test]
fn test_fault_in_parallel_cancels_siblings() {
    let def = ActivityDefinition::parallel("root")
        .with_child(ActivityDefinition::wait_for_event("waiting", "w"))
        .with_child(ActivityDefinition::code("boom").with_fault("exploded"));
    let runtime = start(&def);

    match runtime.outcome() {
        Some(WorkflowOutcome::Faulted(message)) => assert!(message.contains("exploded")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(runtime.trace().status_changes("waiting").contains(&ExecutionStatus::Canceling));
    assert!(runtime.queue("w").unwrap().listeners().is_empty());
}
