//! Workflow queues and the queuing service
//!
//! Queues are named FIFOs of JSON payloads. Each queue carries an enabled
//! flag and a set of listener activities that the runtime notifies once per
//! item that becomes available.

use flowstate_types::{ActivityId, QueueName, WorkflowError, WorkflowResult};
use std::collections::{BTreeMap, VecDeque};

/// A named FIFO of event payloads
#[derive(Clone, Debug)]
pub struct WorkflowQueue {
    name: QueueName,
    items: VecDeque<serde_json::Value>,
    enabled: bool,
    listeners: Vec<ActivityId>,
}

impl WorkflowQueue {
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            items: VecDeque::new(),
            enabled: true,
            listeners: Vec::new(),
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Append an item. Disabled queues reject new items.
    pub fn enqueue(&mut self, item: serde_json::Value) -> WorkflowResult<()> {
        if !self.enabled {
            return Err(WorkflowError::QueueNotEnabled(self.name.clone()));
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<serde_json::Value> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&serde_json::Value> {
        self.items.front()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn listeners(&self) -> &[ActivityId] {
        &self.listeners
    }

    /// Returns false if the listener was already registered
    pub fn add_listener(&mut self, listener: ActivityId) -> bool {
        if self.listeners.contains(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    /// Returns false if the listener was not registered
    pub fn remove_listener(&mut self, listener: ActivityId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| *l != listener);
        self.listeners.len() != before
    }
}

/// Owns every queue of one workflow instance
#[derive(Clone, Debug, Default)]
pub struct WorkflowQueuingService {
    queues: BTreeMap<QueueName, WorkflowQueue>,
}

impl WorkflowQueuingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_queue(&mut self, name: QueueName) -> WorkflowResult<&mut WorkflowQueue> {
        if self.queues.contains_key(&name) {
            return Err(WorkflowError::QueueAlreadyExists(name));
        }
        tracing::debug!(queue = %name, "Queue created");
        Ok(self
            .queues
            .entry(name.clone())
            .or_insert_with(|| WorkflowQueue::new(name)))
    }

    /// Create the queue unless it exists. Returns true if it was created.
    pub fn ensure_queue(&mut self, name: &QueueName) -> bool {
        if self.exists(name) {
            return false;
        }
        self.create_queue(name.clone()).is_ok()
    }

    pub fn delete_queue(&mut self, name: &QueueName) -> WorkflowResult<WorkflowQueue> {
        self.queues
            .remove(name)
            .ok_or_else(|| WorkflowError::QueueNotFound(name.clone()))
    }

    pub fn exists(&self, name: &QueueName) -> bool {
        self.queues.contains_key(name)
    }

    pub fn get_queue(&self, name: &QueueName) -> WorkflowResult<&WorkflowQueue> {
        self.queues
            .get(name)
            .ok_or_else(|| WorkflowError::QueueNotFound(name.clone()))
    }

    pub fn get_queue_mut(&mut self, name: &QueueName) -> WorkflowResult<&mut WorkflowQueue> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| WorkflowError::QueueNotFound(name.clone()))
    }

    pub fn queue_names(&self) -> Vec<QueueName> {
        self.queues.keys().cloned().collect()
    }

    /// Drop a listener from every queue
    pub fn remove_listener_everywhere(&mut self, listener: ActivityId) -> Vec<QueueName> {
        self.queues
            .values_mut()
            .filter_map(|q| q.remove_listener(listener).then(|| q.name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifo_order() {
        let mut queue = WorkflowQueue::new(QueueName::from("orders"));
        queue.enqueue(json!(1)).unwrap();
        queue.enqueue(json!(2)).unwrap();
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.peek(), Some(&json!(1)));
        assert_eq!(queue.dequeue(), Some(json!(1)));
        assert_eq!(queue.dequeue(), Some(json!(2)));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_disabled_queue_rejects() {
        let mut queue = WorkflowQueue::new(QueueName::from("orders"));
        queue.set_enabled(false);
        assert!(matches!(
            queue.enqueue(json!("x")),
            Err(WorkflowError::QueueNotEnabled(_))
        ));
    }

    #[test]
    fn test_listener_registration_is_idempotent() {
        let mut queue = WorkflowQueue::new(QueueName::from("orders"));
        assert!(queue.add_listener(ActivityId(3)));
        assert!(!queue.add_listener(ActivityId(3)));
        assert_eq!(queue.listeners(), &[ActivityId(3)]);
        assert!(queue.remove_listener(ActivityId(3)));
        assert!(!queue.remove_listener(ActivityId(3)));
    }

    #[test]
    fn test_service_create_and_delete() {
        let mut service = WorkflowQueuingService::new();
        let name = QueueName::from("approvals");
        service.create_queue(name.clone()).unwrap();
        assert!(service.exists(&name));
        assert!(matches!(
            service.create_queue(name.clone()),
            Err(WorkflowError::QueueAlreadyExists(_))
        ));
        assert!(!service.ensure_queue(&name));
        service.delete_queue(&name).unwrap();
        assert!(matches!(
            service.get_queue(&name),
            Err(WorkflowError::QueueNotFound(_))
        ));
    }

    #[test]
    fn test_ensure_queue_creates_once() {
        let mut service = WorkflowQueuingService::new();
        let name = QueueName::from("orders");
        assert!(service.ensure_queue(&name));
        assert!(service.get_queue(&name).unwrap().is_enabled());
        service.get_queue_mut(&name).unwrap().enqueue(serde_json::json!(1)).unwrap();

        assert!(!service.ensure_queue(&name));
        assert_eq!(service.get_queue(&name).unwrap().count(), 1);
    }

    #[test]
    fn test_remove_listener_everywhere() {
        let mut service = WorkflowQueuingService::new();
        for name in ["a", "b", "c"] {
            service.ensure_queue(&QueueName::from(name));
        }
        service
            .get_queue_mut(&QueueName::from("a"))
            .unwrap()
            .add_listener(ActivityId(7));
        service
            .get_queue_mut(&QueueName::from("c"))
            .unwrap()
            .add_listener(ActivityId(7));

        let removed = service.remove_listener_everywhere(ActivityId(7));
        assert_eq!(removed, vec![QueueName::from("a"), QueueName::from("c")]);
    }
}
