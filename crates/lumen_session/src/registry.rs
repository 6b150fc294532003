//! # Object Registry
//!
//! Per-session table mapping a shared identifier to the locally-attached
//! instances sharing it - at most one master plus any number of slaves,
//! in registration order.
//!
//! The dispatch context is the only writer. Readers on other threads take
//! the table mutex and work on snapshots, so command invocation never
//! iterates the live vector while it can be mutated.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use lumen_core::Identifier;

use crate::object::SharedObject;

/// Thread-safe identifier -> attached-instances table.
pub struct ObjectRegistry {
    objects: Mutex<HashMap<Identifier, Vec<Arc<dyn SharedObject>>>>,
}

impl ObjectRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { objects: Mutex::new(HashMap::new()) }
    }

    /// Appends an instance under `id`, creating the entry on first
    /// attach.
    pub fn insert(&self, id: Identifier, object: Arc<dyn SharedObject>) {
        self.objects.lock().entry(id).or_default().push(object);
    }

    /// Removes one instance under `id`, erasing the entry entirely when
    /// the last instance detaches.
    ///
    /// # Returns
    ///
    /// True if the instance was found and removed.
    pub fn remove(&self, id: Identifier, object: &Arc<dyn SharedObject>) -> bool {
        let mut objects = self.objects.lock();
        let Some(instances) = objects.get_mut(&id) else {
            return false;
        };

        let before = instances.len();
        instances.retain(|candidate| !Arc::ptr_eq(candidate, object));
        let removed = instances.len() < before;

        if instances.is_empty() {
            objects.remove(&id);
        }
        removed
    }

    /// Snapshot of the instances attached under `id`, in registration
    /// order.
    #[must_use]
    pub fn instances(&self, id: Identifier) -> Vec<Arc<dyn SharedObject>> {
        self.objects.lock().get(&id).cloned().unwrap_or_default()
    }

    /// Looks up the instance with the given instance identifier.
    #[must_use]
    pub fn instance(&self, id: Identifier, instance_id: Identifier) -> Option<Arc<dyn SharedObject>> {
        self.objects
            .lock()
            .get(&id)?
            .iter()
            .find(|object| object.instance_id() == instance_id)
            .map(Arc::clone)
    }

    /// Looks up the master instance attached under `id`, if any.
    #[must_use]
    pub fn master_instance(&self, id: Identifier) -> Option<Arc<dyn SharedObject>> {
        self.objects
            .lock()
            .get(&id)?
            .iter()
            .find(|object| object.is_master())
            .map(Arc::clone)
    }

    /// Returns true if any instance is attached under `id`.
    #[must_use]
    pub fn contains(&self, id: Identifier) -> bool {
        self.objects.lock().contains_key(&id)
    }

    /// Identifiers with attached instances, for the teardown warning.
    #[must_use]
    pub fn attached_ids(&self) -> Vec<Identifier> {
        self.objects.lock().keys().copied().collect()
    }

    /// Returns true if no objects are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ChangeType, CommandOutcome, ObjectBinding};
    use crate::protocol::ObjectCommand;

    struct Stub {
        binding: ObjectBinding,
    }

    impl Stub {
        fn attached(id: Identifier, instance_id: Identifier) -> Arc<dyn SharedObject> {
            let stub = Self { binding: ObjectBinding::new() };
            stub.binding.attach(id, instance_id);
            Arc::new(stub)
        }
    }

    impl SharedObject for Stub {
        fn binding(&self) -> &ObjectBinding {
            &self.binding
        }
        fn change_type(&self) -> ChangeType {
            ChangeType::Instance
        }
        fn instance_data(&self) -> Vec<u8> {
            Vec::new()
        }
        fn apply_instance_data(&self, _data: &[u8]) {}
        fn invoke(&self, _command: &ObjectCommand) -> CommandOutcome {
            CommandOutcome::Handled
        }
    }

    #[test]
    fn test_insert_and_lookup_in_order() {
        let registry = ObjectRegistry::new();
        let first = Stub::attached(5, 1);
        let second = Stub::attached(5, 2);

        registry.insert(5, Arc::clone(&first));
        registry.insert(5, Arc::clone(&second));

        let instances = registry.instances(5);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].instance_id(), 1);
        assert_eq!(instances[1].instance_id(), 2);
    }

    #[test]
    fn test_last_detach_erases_entry() {
        let registry = ObjectRegistry::new();
        let object = Stub::attached(9, 1);

        registry.insert(9, Arc::clone(&object));
        assert!(registry.contains(9));

        assert!(registry.remove(9, &object));
        // The key must be absent, not an empty vector
        assert!(!registry.contains(9));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_keeps_other_instances() {
        let registry = ObjectRegistry::new();
        let first = Stub::attached(3, 1);
        let second = Stub::attached(3, 2);
        registry.insert(3, Arc::clone(&first));
        registry.insert(3, Arc::clone(&second));

        assert!(registry.remove(3, &first));
        assert!(registry.contains(3));
        assert_eq!(registry.instances(3).len(), 1);
    }

    #[test]
    fn test_instance_lookup_by_instance_id() {
        let registry = ObjectRegistry::new();
        let object = Stub::attached(3, 17);
        registry.insert(3, Arc::clone(&object));

        assert!(registry.instance(3, 17).is_some());
        assert!(registry.instance(3, 18).is_none());
        assert!(registry.instance(4, 17).is_none());
    }

    #[test]
    fn test_master_instance_lookup() {
        let registry = ObjectRegistry::new();
        let slave = Stub::attached(3, 1);
        let master = Stub::attached(3, 2);
        master.binding().setup_master();

        registry.insert(3, Arc::clone(&slave));
        registry.insert(3, Arc::clone(&master));

        let found = registry.master_instance(3).expect("master is attached");
        assert_eq!(found.instance_id(), 2);
    }
}
