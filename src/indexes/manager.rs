//! The process-local index registry.
//!
//! Index definitions are not persisted: on every process start the manager
//! is re-populated from the schema. Membership here is a prerequisite of
//! state transitions, which keeps the persisted state table free of entries
//! for indexes no code knows about.

use std::{
    collections::BTreeMap,
    sync::Mutex,
};

use crate::{
    db::Db,
    schema::IndexDescriptor,
    Error, Result,
};

use super::state::{IndexState, IndexStateRegistry};

/// Mutex-guarded mapping from index name to descriptor, routing state
/// operations to the persistent registry.
#[derive(Debug)]
pub struct IndexManager {
    db: Db,
    registry: IndexStateRegistry,
    indexes: Mutex<BTreeMap<String, IndexDescriptor>>,
}

impl IndexManager {
    /// Creates an empty manager.
    pub fn new(db: Db, registry: IndexStateRegistry) -> Self {
        Self {
            db,
            registry,
            indexes: Mutex::new(BTreeMap::new()),
        }
    }

    /// The persistent state registry this manager routes through.
    pub fn registry(&self) -> &IndexStateRegistry {
        &self.registry
    }

    /// Registers a descriptor; fails on a name collision.
    pub fn register(&self, descriptor: IndexDescriptor) -> Result<()> {
        let mut indexes = self.lock();
        if indexes.contains_key(descriptor.name()) {
            return Err(Error::DuplicateIndex(descriptor.name().to_owned()));
        }
        indexes.insert(descriptor.name().to_owned(), descriptor);
        Ok(())
    }

    /// Registers several descriptors; fails (without registering any) if any
    /// name collides with the registry or within the batch.
    pub fn register_many(&self, descriptors: Vec<IndexDescriptor>) -> Result<()> {
        let mut indexes = self.lock();
        let mut incoming = std::collections::BTreeSet::new();
        for descriptor in &descriptors {
            if indexes.contains_key(descriptor.name()) || !incoming.insert(descriptor.name()) {
                return Err(Error::DuplicateIndex(descriptor.name().to_owned()));
            }
        }
        for descriptor in descriptors {
            indexes.insert(descriptor.name().to_owned(), descriptor);
        }
        Ok(())
    }

    /// Removes a descriptor, returning it if present.
    pub fn unregister(&self, name: &str) -> Option<IndexDescriptor> {
        self.lock().remove(name)
    }

    /// Looks up a descriptor by name.
    pub fn lookup(&self, name: &str) -> Option<IndexDescriptor> {
        self.lock().get(name).cloned()
    }

    /// All registered descriptors.
    pub fn all(&self) -> Vec<IndexDescriptor> {
        self.lock().values().cloned().collect()
    }

    /// Descriptors applying to `type_name`, including universal indexes.
    pub fn for_type(&self, type_name: &str) -> Vec<IndexDescriptor> {
        self.lock()
            .values()
            .filter(|descriptor| descriptor.applies_to(type_name))
            .cloned()
            .collect()
    }

    /// Transitions the named index `disabled -> write-only`.
    ///
    /// Unknown names are rejected before touching persistent state, so no
    /// orphan state bytes can appear.
    pub async fn enable(&self, name: &str) -> Result<()> {
        self.require_known(name)?;
        self.db
            .with_transaction(|txn| async move { self.registry.enable(&txn, name).await })
            .await
    }

    /// Transitions the named index `write-only -> readable`.
    pub async fn make_readable(&self, name: &str) -> Result<()> {
        self.require_known(name)?;
        self.db
            .with_transaction(|txn| async move { self.registry.make_readable(&txn, name).await })
            .await
    }

    /// Writes the named index's state to `disabled`.
    pub async fn disable(&self, name: &str) -> Result<()> {
        self.require_known(name)?;
        self.db
            .with_transaction(|txn| async move { self.registry.disable(&txn, name).await })
            .await
    }

    /// Reads the named index's state. Unknown names read as `Disabled`,
    /// matching the registry's default.
    pub async fn state(&self, name: &str) -> Result<IndexState> {
        self.db
            .with_transaction(|txn| async move { self.registry.state(&txn, name).await })
            .await
    }

    /// Reads several states in one transaction.
    pub async fn states(&self, names: &[&str]) -> Result<BTreeMap<String, IndexState>> {
        self.db
            .with_transaction(|txn| async move { self.registry.states(&txn, names).await })
            .await
    }

    fn require_known(&self, name: &str) -> Result<()> {
        if self.lock().contains_key(name) {
            Ok(())
        } else {
            Err(Error::index_not_found(name))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, IndexDescriptor>> {
        self.indexes.lock().expect("index manager poisoned")
    }
}
