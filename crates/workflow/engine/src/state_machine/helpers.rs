//! Navigation over the state hierarchy
//!
//! The static tree under the root holds one template per state. Running
//! states are clones living in execution contexts, owned by the running
//! clone of their parent state (the root itself is never cloned). Static
//! lookups answer structural questions; dynamic lookups find the live
//! clone an action has to run against.

use crate::context::ActivityExecutionContext;
use crate::tree::ActivityTree;
use flowstate_types::*;

/// Walk parents up to the state machine root
pub fn root_state_of(tree: &ActivityTree, activity: ActivityId) -> WorkflowResult<ActivityId> {
    let mut current = Some(activity);
    while let Some(id) = current {
        let node = tree.node(id)?;
        if matches!(node.kind, ActivityKind::StateMachine { .. }) {
            return Ok(id);
        }
        current = node.parent;
    }
    Err(WorkflowError::NotInStateMachine(tree.name(activity)?.clone()))
}

pub(crate) fn is_state(tree: &ActivityTree, activity: ActivityId) -> bool {
    tree.get(activity).map(|n| n.is_state()).unwrap_or(false)
}

pub(crate) fn is_root_state(tree: &ActivityTree, activity: ActivityId) -> bool {
    tree.get(activity)
        .map(|n| matches!(n.kind, ActivityKind::StateMachine { .. }))
        .unwrap_or(false)
}

/// A state with no enabled state children
pub(crate) fn is_leaf_state(tree: &ActivityTree, activity: ActivityId) -> bool {
    is_state(tree, activity)
        && !tree
            .enabled_children(activity)
            .into_iter()
            .any(|c| is_state(tree, c))
}

/// Enabled state children, in order
pub(crate) fn child_states(tree: &ActivityTree, activity: ActivityId) -> Vec<ActivityId> {
    tree.enabled_children(activity)
        .into_iter()
        .filter(|c| is_state(tree, *c))
        .collect()
}

/// Enabled EventDriven children, in order
pub(crate) fn event_driven_children(tree: &ActivityTree, activity: ActivityId) -> Vec<ActivityId> {
    tree.enabled_children(activity)
        .into_iter()
        .filter(|c| matches!(tree.get(*c).map(|n| &n.kind), Some(ActivityKind::EventDriven)))
        .collect()
}

/// First enabled child of the given kind label
pub(crate) fn child_of_kind(tree: &ActivityTree, activity: ActivityId, kind: &ActivityKind) -> Option<ActivityId> {
    tree.enabled_children(activity).into_iter().find(|c| {
        tree.get(*c)
            .map(|n| std::mem::discriminant(&n.kind) == std::mem::discriminant(kind))
            .unwrap_or(false)
    })
}

pub(crate) fn initialization_of(tree: &ActivityTree, state: ActivityId) -> Option<ActivityId> {
    child_of_kind(tree, state, &ActivityKind::StateInitialization)
}

pub(crate) fn finalization_of(tree: &ActivityTree, state: ActivityId) -> Option<ActivityId> {
    child_of_kind(tree, state, &ActivityKind::StateFinalization)
}

/// The state template named `name` in the static hierarchy under `root`
pub(crate) fn find_static_state(
    tree: &ActivityTree,
    root: ActivityId,
    name: &QualifiedName,
) -> WorkflowResult<ActivityId> {
    tree.find_by_name(root, name.as_str())
        .filter(|id| is_state(tree, *id))
        .ok_or_else(|| WorkflowError::StateNotFound(name.clone()))
}

/// True if `state` is `name` or contains a state called `name`
pub(crate) fn contains_state(tree: &ActivityTree, state: ActivityId, name: &QualifiedName) -> bool {
    let Some(node) = tree.get(state) else {
        return false;
    };
    if &node.name == name {
        return true;
    }
    child_states(tree, state)
        .into_iter()
        .any(|c| contains_state(tree, c, name))
}

/// Parent of a state if that parent is itself a state
pub(crate) fn parent_state(tree: &ActivityTree, state: ActivityId) -> Option<ActivityId> {
    tree.parent(state).filter(|p| is_state(tree, *p))
}

/// Names of the states from the root down to `name`, both included
pub(crate) fn static_path(
    tree: &ActivityTree,
    root: ActivityId,
    name: &QualifiedName,
) -> WorkflowResult<Vec<QualifiedName>> {
    let target = find_static_state(tree, root, name)?;
    let mut path = Vec::new();
    let mut current = Some(target);
    while let Some(id) = current {
        path.push(tree.name(id)?.clone());
        if id == root {
            break;
        }
        current = parent_state(tree, id);
    }
    path.reverse();
    Ok(path)
}

/// The running clone of the state called `name`, if it is live
pub(crate) fn find_dynamic_state(
    ctx: &dyn ActivityExecutionContext,
    root: ActivityId,
    name: &QualifiedName,
) -> WorkflowResult<Option<ActivityId>> {
    let path = static_path(ctx.tree(), root, name)?;
    let mut current = root;
    for step in path.iter().skip(1) {
        match ctx.get_execution_context(current, step) {
            Some(clone) => current = clone,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Configured completed state of the machine
pub(crate) fn completed_state_name(tree: &ActivityTree, root: ActivityId) -> WorkflowResult<Option<QualifiedName>> {
    match &tree.node(root)?.kind {
        ActivityKind::StateMachine { completed_state, .. } => Ok(completed_state.clone()),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (ActivityTree, ActivityId) {
        let def = ActivityDefinition::state_machine("Machine", "Idle")
            .with_child(ActivityDefinition::state("Idle"))
            .with_child(
                ActivityDefinition::state("Working")
                    .with_child(ActivityDefinition::state("Busy"))
                    .with_child(ActivityDefinition::state("Stalled")),
            );
        ActivityTree::from_definition(&def)
    }

    #[test]
    fn test_leaf_and_root_detection() {
        let (tree, root) = machine();
        let working = tree.find_by_name(root, "Working").unwrap();
        let busy = tree.find_by_name(root, "Busy").unwrap();
        assert!(is_root_state(&tree, root));
        assert!(!is_leaf_state(&tree, working));
        assert!(is_leaf_state(&tree, busy));
        assert_eq!(root_state_of(&tree, busy).unwrap(), root);
        assert_eq!(parent_state(&tree, busy), Some(working));
    }

    #[test]
    fn test_contains_state_includes_self() {
        let (tree, root) = machine();
        let working = tree.find_by_name(root, "Working").unwrap();
        assert!(contains_state(&tree, working, &"Working".into()));
        assert!(contains_state(&tree, working, &"Stalled".into()));
        assert!(!contains_state(&tree, working, &"Idle".into()));
    }

    #[test]
    fn test_static_path() {
        let (tree, root) = machine();
        let path = static_path(&tree, root, &"Stalled".into()).unwrap();
        let names: Vec<&str> = path.iter().map(QualifiedName::as_str).collect();
        assert_eq!(names, vec!["Machine", "Working", "Stalled"]);
        assert!(matches!(
            static_path(&tree, root, &"Missing".into()),
            Err(WorkflowError::StateNotFound(_))
        ));
    }

    #[test]
    fn test_root_state_outside_machine() {
        let (tree, root) = ActivityTree::from_definition(&ActivityDefinition::sequence("plain"));
        assert!(matches!(
            root_state_of(&tree, root),
            Err(WorkflowError::NotInStateMachine(_))
        ));
    }
}
