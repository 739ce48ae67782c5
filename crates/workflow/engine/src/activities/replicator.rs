//! Replicator: runs one template child per instance-data item
//!
//! Items come from the definition's initial data and from host list
//! operations while the replicator executes. In sequence mode items run one
//! at a time in list order; in parallel mode every pending item runs at
//! once. Each run gets its own execution context and run id. An item removed
//! while its run is in flight is only marked, and pruned when the run
//! closes.

use super::{node_state_accessor, ActivityBehavior};
use crate::context::{ActivityExecutionContext, Callback};
use crate::trace::TraceEvent;
use flowstate_types::*;

/// Lifecycle of one item's run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChildRunStatus {
    #[default]
    Created,
    PendingExecute,
    Running,
    Completed,
}

/// One instance-data item and the run bound to it
#[derive(Clone, Debug, PartialEq)]
pub struct ChildExecutionStateInfo {
    pub instance_data: serde_json::Value,
    /// Empty while no run is in flight
    pub run_id: RunId,
    pub clone: Option<ActivityId>,
    pub marked_for_removal: bool,
    pub status: ChildRunStatus,
}

impl ChildExecutionStateInfo {
    pub fn new(instance_data: serde_json::Value) -> Self {
        Self {
            instance_data,
            run_id: RunId::empty(),
            clone: None,
            marked_for_removal: false,
            status: ChildRunStatus::Created,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.run_id.is_empty()
    }

    fn is_runnable(&self) -> bool {
        !self.marked_for_removal
            && matches!(self.status, ChildRunStatus::Created | ChildRunStatus::PendingExecute)
    }
}

/// Runtime state of a replicator
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicatorStateInfo {
    pub children: Vec<ChildExecutionStateInfo>,
    /// The until condition has been observed true; no new runs start
    pub completion_condition_true_already: bool,
}

impl ReplicatorStateInfo {
    /// Items not marked for removal
    pub fn logical_len(&self) -> usize {
        self.children.iter().filter(|c| !c.marked_for_removal).count()
    }

    /// Absolute position of the `index`-th live item
    fn absolute_index(&self, index: usize) -> Option<usize> {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.marked_for_removal)
            .nth(index)
            .map(|(i, _)| i)
    }

    pub fn child_data(&self) -> Vec<serde_json::Value> {
        self.children
            .iter()
            .filter(|c| !c.marked_for_removal)
            .map(|c| c.instance_data.clone())
            .collect()
    }

    pub fn any_active(&self) -> bool {
        self.children.iter().any(ChildExecutionStateInfo::is_active)
    }

    fn next_runnable(&self) -> Option<usize> {
        self.children.iter().position(ChildExecutionStateInfo::is_runnable)
    }
}

node_state_accessor!(replicator_state, Replicator, ReplicatorStateInfo);

struct ReplicatorSettings {
    execution_type: ExecutionType,
    until: Option<ActivityCondition>,
    initial_child_data: Vec<serde_json::Value>,
}

fn read_settings(ctx: &dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<ReplicatorSettings> {
    match &ctx.tree().node(activity)?.kind {
        ActivityKind::Replicator {
            execution_type,
            until,
            initial_child_data,
        } => Ok(ReplicatorSettings {
            execution_type: *execution_type,
            until: until.clone(),
            initial_child_data: initial_child_data.clone(),
        }),
        _ => Err(WorkflowError::InvalidOperation(format!(
            "'{}' is not a replicator",
            ctx.name_of(activity)?
        ))),
    }
}

fn template_of(ctx: &dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<ActivityId> {
    ctx.enabled_children(activity).into_iter().next().ok_or_else(|| {
        WorkflowError::InvalidOperation(format!("replicator {} has no template child", activity))
    })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReplicatorActivity;

impl ReplicatorActivity {
    /// Start a run of the template for the item at absolute `index`
    fn execute_template(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        index: usize,
    ) -> WorkflowResult<()> {
        let template = template_of(ctx, activity)?;
        let clone = ctx.create_execution_context(template)?;
        let run_id = RunId::generate();

        let state = replicator_state(ctx, activity)?;
        let len = state.children.len();
        let item = state
            .children
            .get_mut(index)
            .ok_or(WorkflowError::IndexOutOfRange { index, len })?;
        item.run_id = run_id;
        item.clone = Some(clone);
        item.status = ChildRunStatus::Running;
        let data = item.instance_data.clone();

        let replicator = ctx.name_of(activity)?;
        tracing::debug!(replicator = %replicator, data = %data, "Replicator child initialized");
        ctx.trace_mut().record(TraceEvent::ReplicatorChildInitialized {
            replicator,
            run_id,
            data,
        });

        ctx.register_for_closed(clone, activity);
        ctx.execute_activity(clone)
    }

    /// Start every runnable item
    fn start_all(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
        while let Some(index) = replicator_state(ctx, activity)?.next_runnable() {
            Self::execute_template(ctx, activity, index)?;
        }
        Ok(())
    }

    /// Cancel in-flight runs. Returns true while any run is still open.
    fn try_cancel_children(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<bool> {
        let contexts = ctx.execution_contexts(activity);
        for clone in &contexts {
            if ctx.status(*clone)? == ExecutionStatus::Executing {
                ctx.cancel_activity(*clone)?;
            }
        }
        Ok(!contexts.is_empty())
    }

    /// Observe the until condition; once true it stays true
    fn until_reached(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        until: Option<&ActivityCondition>,
    ) -> WorkflowResult<bool> {
        if replicator_state(ctx, activity)?.completion_condition_true_already {
            return Ok(true);
        }
        let reached = until.map(|c| ctx.evaluate(c)).unwrap_or(false);
        if reached {
            replicator_state(ctx, activity)?.completion_condition_true_already = true;
        }
        Ok(reached)
    }
}

impl ActivityBehavior for ReplicatorActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let settings = read_settings(ctx, activity)?;
        let state = replicator_state(ctx, activity)?;
        *state = ReplicatorStateInfo::default();
        state.children = settings
            .initial_child_data
            .into_iter()
            .map(ChildExecutionStateInfo::new)
            .collect();
        let has_items = !state.children.is_empty();

        let complete_now = match &settings.until {
            Some(until) => ctx.evaluate(until),
            None => !has_items,
        };

        if complete_now {
            replicator_state(ctx, activity)?.completion_condition_true_already = true;
            if !Self::try_cancel_children(ctx, activity)? {
                return Ok(ExecutionStatus::Closed);
            }
            return ctx.status(activity);
        }

        match settings.execution_type {
            ExecutionType::Parallel => Self::start_all(ctx, activity)?,
            ExecutionType::Sequence => {
                if let Some(index) = replicator_state(ctx, activity)?.next_runnable() {
                    Self::execute_template(ctx, activity, index)?;
                }
            }
        }
        Ok(ExecutionStatus::Executing)
    }

    fn cancel(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        if Self::try_cancel_children(ctx, activity)? {
            ctx.status(activity)
        } else {
            Ok(ExecutionStatus::Closed)
        }
    }

    fn on_child_closed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        child: ActivityId,
    ) -> WorkflowResult<()> {
        let state = replicator_state(ctx, activity)?;
        let finished = state
            .children
            .iter()
            .position(|c| c.clone == Some(child));
        if let Some(index) = finished {
            let item = &mut state.children[index];
            let run_id = item.run_id;
            let data = item.instance_data.clone();
            let marked = item.marked_for_removal;
            item.status = ChildRunStatus::Completed;
            item.run_id = RunId::empty();
            item.clone = None;
            if marked {
                state.children.remove(index);
            }

            let replicator = ctx.name_of(activity)?;
            ctx.trace_mut().record(TraceEvent::ReplicatorChildCompleted {
                replicator,
                run_id,
                data,
            });
        }
        ctx.complete_execution_context(child)?;

        let status = ctx.status(activity)?;
        if status.is_winding_down() {
            if ctx.execution_contexts(activity).is_empty() {
                ctx.close_activity(activity)?;
            }
            return Ok(());
        }
        if status != ExecutionStatus::Executing {
            return Ok(());
        }

        let settings = read_settings(ctx, activity)?;
        if Self::until_reached(ctx, activity, settings.until.as_ref())? {
            if !Self::try_cancel_children(ctx, activity)? {
                ctx.close_activity(activity)?;
            }
            return Ok(());
        }

        let state = replicator_state(ctx, activity)?;
        let any_active = state.any_active();
        match settings.execution_type {
            ExecutionType::Sequence => {
                if let Some(index) = state.next_runnable() {
                    if !any_active {
                        Self::execute_template(ctx, activity, index)?;
                    }
                    return Ok(());
                }
            }
            ExecutionType::Parallel => {
                if state.next_runnable().is_some() {
                    return Self::start_all(ctx, activity);
                }
            }
        }
        if !any_active && settings.until.is_none() {
            ctx.close_activity(activity)?;
        }
        Ok(())
    }
}

// ── Host list operations ─────────────────────────────────────────────

fn require_executing(ctx: &dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
    if ctx.status(activity)? != ExecutionStatus::Executing {
        return Err(WorkflowError::InvalidOperation(format!(
            "replicator '{}' is not executing",
            ctx.name_of(activity)?
        )));
    }
    Ok(())
}

/// Make the item at absolute `index` runnable and schedule the update callback
fn schedule_item(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId, index: usize) -> WorkflowResult<()> {
    let execution_type = read_settings(ctx, activity)?.execution_type;
    let state = replicator_state(ctx, activity)?;
    if state.completion_condition_true_already {
        return Ok(());
    }
    match execution_type {
        ExecutionType::Parallel => {
            if let Some(item) = state.children.get_mut(index) {
                item.status = ChildRunStatus::PendingExecute;
            }
            ctx.invoke(activity, Callback::ReplicatorUpdate);
        }
        ExecutionType::Sequence => {
            if !state.any_active() {
                ctx.invoke(activity, Callback::ReplicatorUpdate);
            }
        }
    }
    Ok(())
}

/// Append an item
pub(crate) fn add_child_data(
    ctx: &mut dyn ActivityExecutionContext,
    activity: ActivityId,
    data: serde_json::Value,
) -> WorkflowResult<()> {
    require_executing(ctx, activity)?;
    let state = replicator_state(ctx, activity)?;
    state.children.push(ChildExecutionStateInfo::new(data));
    let index = state.children.len() - 1;
    schedule_item(ctx, activity, index)
}

/// Insert an item at a logical position
pub(crate) fn insert_child_data(
    ctx: &mut dyn ActivityExecutionContext,
    activity: ActivityId,
    index: usize,
    data: serde_json::Value,
) -> WorkflowResult<()> {
    require_executing(ctx, activity)?;
    let state = replicator_state(ctx, activity)?;
    let len = state.logical_len();
    if index > len {
        return Err(WorkflowError::IndexOutOfRange { index, len });
    }
    let absolute = state.absolute_index(index).unwrap_or(state.children.len());
    state
        .children
        .insert(absolute, ChildExecutionStateInfo::new(data));
    schedule_item(ctx, activity, absolute)
}

/// Remove the item at a logical position. A running item is only marked.
pub(crate) fn remove_child_data_at(
    ctx: &mut dyn ActivityExecutionContext,
    activity: ActivityId,
    index: usize,
) -> WorkflowResult<serde_json::Value> {
    require_executing(ctx, activity)?;
    let state = replicator_state(ctx, activity)?;
    let len = state.logical_len();
    let absolute = state
        .absolute_index(index)
        .ok_or(WorkflowError::IndexOutOfRange { index, len })?;
    let item = &mut state.children[absolute];
    if item.is_active() {
        item.marked_for_removal = true;
        Ok(item.instance_data.clone())
    } else {
        Ok(state.children.remove(absolute).instance_data)
    }
}

/// Remove every item, marking the running ones
pub(crate) fn clear_child_data(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
    require_executing(ctx, activity)?;
    let state = replicator_state(ctx, activity)?;
    state.children.retain(ChildExecutionStateInfo::is_active);
    for item in state.children.iter_mut() {
        item.marked_for_removal = true;
    }
    Ok(())
}

/// Live instance data, in list order
pub(crate) fn child_data(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<Vec<serde_json::Value>> {
    Ok(replicator_state(ctx, activity)?.child_data())
}

/// Start the runs a list change made possible
pub(crate) fn handle_child_update(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
    if replicator_state(ctx, activity)?.completion_condition_true_already {
        return Ok(());
    }
    match read_settings(ctx, activity)?.execution_type {
        ExecutionType::Parallel => ReplicatorActivity::start_all(ctx, activity),
        ExecutionType::Sequence => {
            let state = replicator_state(ctx, activity)?;
            if state.any_active() {
                return Ok(());
            }
            match state.next_runnable() {
                Some(index) => ReplicatorActivity::execute_template(ctx, activity, index),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(items: &[(i64, bool, bool)]) -> ReplicatorStateInfo {
        ReplicatorStateInfo {
            children: items
                .iter()
                .map(|(v, active, marked)| {
                    let mut item = ChildExecutionStateInfo::new(json!(v));
                    if *active {
                        item.run_id = RunId::generate();
                        item.status = ChildRunStatus::Running;
                    }
                    item.marked_for_removal = *marked;
                    item
                })
                .collect(),
            completion_condition_true_already: false,
        }
    }

    #[test]
    fn test_logical_index_skips_marked() {
        let state = info(&[(1, true, true), (2, false, false), (3, false, false)]);
        assert_eq!(state.logical_len(), 2);
        assert_eq!(state.absolute_index(0), Some(1));
        assert_eq!(state.absolute_index(1), Some(2));
        assert_eq!(state.absolute_index(2), None);
        assert_eq!(state.child_data(), vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_next_runnable_skips_running_and_marked() {
        let state = info(&[(1, true, false), (2, false, true), (3, false, false)]);
        assert!(state.any_active());
        assert_eq!(state.next_runnable(), Some(2));
    }
}
