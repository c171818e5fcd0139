//! Session registry: handle → instance slot.
//!
//! Handles are allocated from a monotonic counter starting at 1 and are
//! never reused, even when a load fails after allocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::instance::{InstanceError, PluginInstance};

/// Shared slot holding one instance. Per-handle serialization is the
/// caller's job; the mutex only guards against overlap with the event pump.
pub type InstanceSlot = Arc<Mutex<PluginInstance>>;

#[derive(Default)]
pub struct Registry {
    next: AtomicU64,
    instances: RwLock<HashMap<u64, InstanceSlot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next handle.
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a loaded instance under its handle.
    pub fn insert(&self, instance: PluginInstance) -> InstanceSlot {
        let handle = instance.handle();
        let slot = Arc::new(Mutex::new(instance));
        self.instances.write().insert(handle, Arc::clone(&slot));
        slot
    }

    pub fn get(&self, handle: u64) -> Result<InstanceSlot, InstanceError> {
        self.instances
            .read()
            .get(&handle)
            .cloned()
            .ok_or(InstanceError::UnknownHandle(handle))
    }

    pub fn remove(&self, handle: u64) -> Result<InstanceSlot, InstanceError> {
        self.instances
            .write()
            .remove(&handle)
            .ok_or(InstanceError::UnknownHandle(handle))
    }

    /// Unload `handle` and retire it.
    pub fn unload(&self, handle: u64) -> Result<(), InstanceError> {
        let slot = self.get(handle)?;
        slot.lock().unload();
        self.remove(handle)?;
        Ok(())
    }

    /// Live handles in ascending order.
    pub fn handles(&self) -> Vec<u64> {
        let mut handles: Vec<u64> = self.instances.read().keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Every live slot, for the event pump.
    pub fn snapshot(&self) -> Vec<InstanceSlot> {
        self.instances.read().values().cloned().collect()
    }

    /// Unload every instance. Used on shutdown.
    pub fn unload_all(&self) {
        let slots: Vec<(u64, InstanceSlot)> = self.instances.write().drain().collect();
        if !slots.is_empty() {
            tracing::info!("Unloading {} instance(s)", slots.len());
        }
        for (_, slot) in slots {
            slot.lock().unload();
        }
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::BuiltinFactory;
    use crate::instance::InstanceState;
    use cuehost_core::AudioConfig;
    use cuehost_engine::builtin;

    fn load(registry: &Registry) -> u64 {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = registry.allocate();
        let instance = PluginInstance::load(
            handle,
            Arc::new(builtin::gain::GainProcessor::describe()),
            AudioConfig::default(),
            &BuiltinFactory,
            tx,
        )
        .unwrap();
        registry.insert(instance);
        handle
    }

    #[test]
    fn test_handles_are_never_reused() {
        let registry = Registry::new();
        let first = load(&registry);
        let second = load(&registry);
        assert_eq!((first, second), (1, 2));

        registry.unload(first).unwrap();
        let third = load(&registry);
        assert_eq!(third, 3);
        assert_eq!(registry.handles(), vec![2, 3]);
    }

    #[test]
    fn test_unknown_handle() {
        let registry = Registry::new();
        assert_eq!(registry.get(7).err(), Some(InstanceError::UnknownHandle(7)));

        let handle = load(&registry);
        registry.unload(handle).unwrap();
        assert_eq!(
            registry.get(handle).err(),
            Some(InstanceError::UnknownHandle(handle))
        );
        assert_eq!(
            registry.unload(handle).err(),
            Some(InstanceError::UnknownHandle(handle))
        );
    }

    #[test]
    fn test_unload_all() {
        let registry = Registry::new();
        let handle = load(&registry);
        let slot = registry.get(handle).unwrap();
        load(&registry);

        registry.unload_all();
        assert!(registry.is_empty());
        assert_eq!(slot.lock().state(), InstanceState::Unloaded);
    }
}
