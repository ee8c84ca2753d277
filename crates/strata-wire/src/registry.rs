//! Object registry
//!
//! Maps numeric object ids to live objects. One registry per process is the
//! sole owner of long-lived object references; everything else refers to
//! objects by id.

use std::collections::HashMap;

use crate::error::RegistryError;
use crate::interface::Interface;

/// A live protocol object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Object {
    pub id: u32,
    pub interface: &'static Interface,
}

impl Object {
    pub fn new(id: u32, interface: &'static Interface) -> Self {
        Self { id, interface }
    }
}

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: HashMap<u32, Object>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object. Fails if the id is already taken.
    pub fn insert(&mut self, object: Object) -> Result<(), RegistryError> {
        if self.objects.contains_key(&object.id) {
            return Err(RegistryError::DuplicateId(object.id));
        }
        self.objects.insert(object.id, object);
        Ok(())
    }

    pub fn lookup(&self, id: u32) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    /// Unregister an object. The id must be present.
    pub fn remove(&mut self, id: u32) -> Result<Object, RegistryError> {
        self.objects.remove(&id).ok_or(RegistryError::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.objects.keys().copied()
    }
}
