//! Activity arena
//!
//! Every node of a running instance lives in one arena addressed by
//! [`ActivityId`]. Handles are never reused: a removed node leaves a
//! tombstone, so stale handles held by listeners or scheduled work items
//! simply stop resolving.

use crate::activities::{CagState, EventHandlersState, EventState, ListenState, ReplicatorStateInfo, SequenceState};
use crate::state_machine::StateMachineExecutionState;
use flowstate_types::*;

/// Per-kind runtime state held directly on the node
#[derive(Clone, Debug, Default)]
pub enum NodeState {
    #[default]
    Idle,
    Sequence(SequenceState),
    Listen(ListenState),
    ConditionedGroup(CagState),
    EventHandlers(EventHandlersState),
    Replicator(ReplicatorStateInfo),
    Event(EventState),
    StateMachine(Box<StateMachineExecutionState>),
}

/// One live activity
#[derive(Clone, Debug)]
pub struct ActivityNode {
    pub id: ActivityId,
    pub name: QualifiedName,
    pub kind: ActivityKind,
    pub enabled: bool,
    pub when: Option<ActivityCondition>,
    /// Non-owning back pointer
    pub parent: Option<ActivityId>,
    /// Ordered children. Clones created for execution contexts are not listed here.
    pub children: Vec<ActivityId>,
    pub status: ExecutionStatus,
    pub result: ExecutionResult,
    pub fault: Option<String>,
    pub state: NodeState,
}

impl ActivityNode {
    fn blank(
        id: ActivityId,
        name: QualifiedName,
        kind: ActivityKind,
        enabled: bool,
        when: Option<ActivityCondition>,
        parent: Option<ActivityId>,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            enabled,
            when,
            parent,
            children: Vec::new(),
            status: ExecutionStatus::Initialized,
            result: ExecutionResult::None,
            fault: None,
            state: NodeState::Idle,
        }
    }

    pub fn is_state(&self) -> bool {
        self.kind.is_state()
    }
}

/// Arena of activity nodes
#[derive(Clone, Debug, Default)]
pub struct ActivityTree {
    nodes: Vec<Option<ActivityNode>>,
}

impl ActivityTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate a definition, returning the arena and the root handle
    pub fn from_definition(definition: &ActivityDefinition) -> (Self, ActivityId) {
        let mut tree = Self::new();
        let root = tree.insert_definition(definition, None);
        (tree, root)
    }

    /// Instantiate a definition subtree under `parent` without linking it
    /// into the parent's child list
    pub fn insert_definition(
        &mut self,
        definition: &ActivityDefinition,
        parent: Option<ActivityId>,
    ) -> ActivityId {
        let id = self.allocate(
            definition.name.clone(),
            definition.kind.clone(),
            definition.enabled,
            definition.when.clone(),
            parent,
        );
        for child in &definition.children {
            let child_id = self.insert_definition(child, Some(id));
            if let Some(node) = self.get_mut(id) {
                node.children.push(child_id);
            }
        }
        id
    }

    fn allocate(
        &mut self,
        name: QualifiedName,
        kind: ActivityKind,
        enabled: bool,
        when: Option<ActivityCondition>,
        parent: Option<ActivityId>,
    ) -> ActivityId {
        let id = ActivityId(self.nodes.len());
        self.nodes
            .push(Some(ActivityNode::blank(id, name, kind, enabled, when, parent)));
        id
    }

    // ── Lookup ───────────────────────────────────────────────────────

    pub fn get(&self, id: ActivityId) -> Option<&ActivityNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ActivityId) -> Option<&mut ActivityNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn node(&self, id: ActivityId) -> WorkflowResult<&ActivityNode> {
        self.get(id)
            .ok_or_else(|| WorkflowError::ActivityNotFound(id.to_string()))
    }

    pub fn node_mut(&mut self, id: ActivityId) -> WorkflowResult<&mut ActivityNode> {
        self.get_mut(id)
            .ok_or_else(|| WorkflowError::ActivityNotFound(id.to_string()))
    }

    pub fn contains(&self, id: ActivityId) -> bool {
        self.get(id).is_some()
    }

    pub fn status(&self, id: ActivityId) -> WorkflowResult<ExecutionStatus> {
        Ok(self.node(id)?.status)
    }

    pub fn name(&self, id: ActivityId) -> WorkflowResult<&QualifiedName> {
        Ok(&self.node(id)?.name)
    }

    pub fn parent(&self, id: ActivityId) -> Option<ActivityId> {
        self.get(id).and_then(|n| n.parent)
    }

    pub fn enabled_children(&self, id: ActivityId) -> Vec<ActivityId> {
        self.get(id)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|c| self.get(*c).map(|c| c.enabled).unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Enabled direct child with this name
    pub fn child_by_name(&self, parent: ActivityId, name: &QualifiedName) -> Option<ActivityId> {
        self.enabled_children(parent)
            .into_iter()
            .find(|c| self.get(*c).map(|n| &n.name == name).unwrap_or(false))
    }

    /// Depth-first search of the subtree rooted at `from`
    pub fn find_by_name(&self, from: ActivityId, name: &str) -> Option<ActivityId> {
        let node = self.get(from)?;
        if node.name.as_str() == name {
            return Some(from);
        }
        node.children
            .iter()
            .find_map(|c| self.find_by_name(*c, name))
    }

    /// Pre-order handles of the subtree rooted at `id`, itself included
    pub fn subtree(&self, id: ActivityId) -> Vec<ActivityId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.get(current) {
                out.push(current);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityNode> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    // ── Structural changes ───────────────────────────────────────────

    /// Deep-clone a subtree into fresh nodes with reset runtime state.
    ///
    /// The clone keeps the template's parent but is not listed among the
    /// parent's children.
    pub fn clone_subtree(&mut self, template: ActivityId) -> WorkflowResult<ActivityId> {
        let parent = self.node(template)?.parent;
        self.clone_node(template, parent)
    }

    fn clone_node(&mut self, source: ActivityId, parent: Option<ActivityId>) -> WorkflowResult<ActivityId> {
        let (name, kind, enabled, when, children) = {
            let node = self.node(source)?;
            (
                node.name.clone(),
                node.kind.clone(),
                node.enabled,
                node.when.clone(),
                node.children.clone(),
            )
        };
        let id = self.allocate(name, kind, enabled, when, parent);
        for child in children {
            let cloned = self.clone_node(child, Some(id))?;
            self.node_mut(id)?.children.push(cloned);
        }
        Ok(id)
    }

    /// Instantiate a definition and link it at `index` among the parent's children
    pub fn insert_child(
        &mut self,
        parent: ActivityId,
        index: usize,
        definition: &ActivityDefinition,
    ) -> WorkflowResult<ActivityId> {
        let len = self.node(parent)?.children.len();
        if index > len {
            return Err(WorkflowError::IndexOutOfRange { index, len });
        }
        let id = self.insert_definition(definition, Some(parent));
        self.node_mut(parent)?.children.insert(index, id);
        Ok(id)
    }

    /// Unlink a node from its parent's child list
    pub fn detach(&mut self, id: ActivityId) {
        if let Some(parent) = self.parent(id) {
            if let Some(node) = self.get_mut(parent) {
                node.children.retain(|c| *c != id);
            }
        }
    }

    /// Tombstone a single slot
    pub fn remove(&mut self, id: ActivityId) -> Option<ActivityNode> {
        self.nodes.get_mut(id.0).and_then(Option::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree() -> (ActivityTree, ActivityId) {
        let def = ActivityDefinition::sequence("root")
            .with_child(ActivityDefinition::code("a"))
            .with_child(
                ActivityDefinition::parallel("p")
                    .with_child(ActivityDefinition::code("b"))
                    .with_child(ActivityDefinition::code("c").disabled()),
            );
        ActivityTree::from_definition(&def)
    }

    #[test]
    fn test_from_definition() {
        let (tree, root) = make_tree();
        assert_eq!(tree.live_count(), 5);
        assert_eq!(tree.name(root).unwrap().as_str(), "root");
        let p = tree.find_by_name(root, "p").unwrap();
        assert_eq!(tree.parent(p), Some(root));
        assert_eq!(tree.enabled_children(p).len(), 1);
        assert_eq!(tree.subtree(root).len(), 5);
    }

    #[test]
    fn test_clone_subtree_is_detached() {
        let (mut tree, root) = make_tree();
        let p = tree.find_by_name(root, "p").unwrap();
        tree.node_mut(p).unwrap().status = ExecutionStatus::Closed;

        let clone = tree.clone_subtree(p).unwrap();
        assert_ne!(clone, p);
        assert_eq!(tree.parent(clone), Some(root));
        assert_eq!(tree.status(clone).unwrap(), ExecutionStatus::Initialized);
        assert!(!tree.node(root).unwrap().children.contains(&clone));
        assert_eq!(tree.subtree(clone).len(), 3);
    }

    #[test]
    fn test_removed_handles_stop_resolving() {
        let (mut tree, root) = make_tree();
        let a = tree.find_by_name(root, "a").unwrap();
        tree.detach(a);
        tree.remove(a);
        assert!(!tree.contains(a));
        assert!(matches!(tree.node(a), Err(WorkflowError::ActivityNotFound(_))));
        assert_eq!(tree.node(root).unwrap().children.len(), 1);

        let b = tree.insert_child(root, 0, &ActivityDefinition::code("b2")).unwrap();
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_insert_child_bounds() {
        let (mut tree, root) = make_tree();
        let err = tree
            .insert_child(root, 5, &ActivityDefinition::code("x"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::IndexOutOfRange { index: 5, len: 2 }));
    }
}
