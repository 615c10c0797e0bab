//! Cycle-scoped key/value state
//!
//! A [`CycleState`] is created by whoever drives a scheduling cycle and handed
//! to every phase of that cycle. Nothing in it is visible to other cycles.

use std::any::Any;
use std::collections::HashMap;

use crate::{SchedError, SchedResult};

/// Value that can be stored in a [`CycleState`]
pub trait StateData: Any + Send + Sync {
    /// Deep copy of the value
    fn clone_data(&self) -> Box<dyn StateData>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Clone + Send + Sync> StateData for T {
    fn clone_data(&self) -> Box<dyn StateData> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-cycle scratch storage keyed by plugin name
#[derive(Default)]
pub struct CycleState {
    data: HashMap<String, Box<dyn StateData>>,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value under the key
    pub fn write<T: StateData>(&mut self, key: &str, value: T) {
        self.data.insert(key.to_string(), Box::new(value));
    }

    /// Borrow a value
    pub fn read<T: Any>(&self, key: &str) -> SchedResult<&T> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| SchedError::Internal(format!("cycle state has no entry {}", key)))?;
        (**value)
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| SchedError::Internal(format!("cycle state entry {} has wrong type", key)))
    }

    /// Mutably borrow a value
    pub fn read_mut<T: Any>(&mut self, key: &str) -> SchedResult<&mut T> {
        let value = self
            .data
            .get_mut(key)
            .ok_or_else(|| SchedError::Internal(format!("cycle state has no entry {}", key)))?;
        (**value)
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| SchedError::Internal(format!("cycle state entry {} has wrong type", key)))
    }

    /// Remove a value
    pub fn delete(&mut self, key: &str) {
        self.data.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

impl Clone for CycleState {
    fn clone(&self) -> Self {
        let data = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), (**v).clone_data()))
            .collect();
        Self { data }
    }
}

impl std::fmt::Debug for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.data.keys().collect();
        keys.sort();
        f.debug_struct("CycleState").field("keys", &keys).finish()
    }
}
