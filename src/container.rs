//! The container: top-level lifecycle of a record store.
//!
//! A [`Container`] owns the database handle, the directory layer, the
//! store-handle cache and the main [`Context`]; it orchestrates schema
//! version reads and writes and drives migrations. Containers are always
//! handled as `Arc<Container>`: contexts hold a strong reference back to
//! their container, while the container caches stores, not contexts, so no
//! reference cycle forms.

use serde::{Deserialize, Serialize};

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex, OnceLock},
};

use crate::{
    context::Context,
    db::{Database, Db, TransactionHandle},
    directory::DirectoryLayer,
    indexes::{Index, IndexManager, IndexState, IndexStateRegistry},
    keyspace::{self, KeySpace, MetadataSpace, METADATA_SEGMENT, SHARED_METADATA_PREFIX},
    migration::Migrations,
    schema::{IndexKind, Schema, Version},
    store::Store,
    tuple::{Tuple, TupleElement},
    Error, Result, Subspace,
};

/// Where a container keeps its metadata.
///
/// The choice is locked at construction; the two flavors must never be mixed
/// on one namespace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataLayout {
    /// Metadata under `root/_metadata`: each tenant root carries its own.
    Tenant,
    /// Metadata under the fixed single-byte `0xFE` prefix, shared by every
    /// namespace on the cluster.
    Shared,
}

/// Options for a [`Container`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct ContainerOptions {
    /// Directory path of the namespace root.
    ///
    /// Defaults to `["records"]`.
    pub root_path: Vec<String>,
    /// Metadata placement. Defaults to [`MetadataLayout::Tenant`].
    pub metadata_layout: MetadataLayout,
    /// Enable deferred autosave on the main context.
    ///
    /// Defaults to `false`.
    pub autosave: bool,
    /// Retry policy for every transaction the container runs.
    pub retry: crate::db::RetryOptions,
    /// Records per transaction for online index builds and batched data
    /// operations.
    ///
    /// Defaults to `100`.
    pub build_batch_size: usize,
}

impl ContainerOptions {
    /// Creates an options object.
    pub fn new(
        root_path: Vec<String>,
        metadata_layout: MetadataLayout,
        autosave: bool,
        retry: crate::db::RetryOptions,
        build_batch_size: usize,
    ) -> Self {
        Self {
            root_path,
            metadata_layout,
            autosave,
            retry,
            build_batch_size,
        }
    }
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self::new(
            vec!["records".to_owned()],
            MetadataLayout::Tenant,
            false,
            crate::db::RetryOptions::default(),
            100,
        )
    }
}

/// The top-level owner of a record store.
#[derive(Debug)]
pub struct Container {
    db: Db,
    directory: Arc<dyn DirectoryLayer>,
    subspace: Subspace,
    keyspace: KeySpace,
    metadata: MetadataSpace,
    schema: Schema,
    migrations: Option<Migrations>,
    manager: IndexManager,
    stores: Mutex<HashMap<Vec<u8>, Arc<Store>>>,
    main_context: OnceLock<Arc<Context>>,
    options: ContainerOptions,
}

impl Container {
    /// Opens (or creates) the namespace root through the directory layer and
    /// assembles the container around it.
    pub async fn new(
        database: Arc<dyn Database>,
        directory: Arc<dyn DirectoryLayer>,
        schema: Schema,
        migrations: Option<Migrations>,
        options: ContainerOptions,
    ) -> Result<Arc<Self>> {
        let db = Db::with_retry(database, options.retry);
        let path: Vec<&str> = options.root_path.iter().map(String::as_str).collect();
        let root = {
            let directory = &directory;
            let path = &path;
            db.with_transaction(|txn| async move { directory.create_or_open(&txn, path).await })
                .await?
        };
        Self::assemble(db, directory, schema, migrations, root, options)
    }

    /// Assembles a container around an explicit, pre-allocated namespace
    /// root, bypassing directory resolution.
    pub fn with_subspace(
        database: Arc<dyn Database>,
        directory: Arc<dyn DirectoryLayer>,
        schema: Schema,
        migrations: Option<Migrations>,
        root_subspace: Subspace,
        options: ContainerOptions,
    ) -> Result<Arc<Self>> {
        let db = Db::with_retry(database, options.retry);
        Self::assemble(db, directory, schema, migrations, root_subspace, options)
    }

    fn assemble(
        db: Db,
        directory: Arc<dyn DirectoryLayer>,
        schema: Schema,
        migrations: Option<Migrations>,
        root: Subspace,
        options: ContainerOptions,
    ) -> Result<Arc<Self>> {
        let metadata = match options.metadata_layout {
            MetadataLayout::Tenant => MetadataSpace::new(
                root.subspace(&Tuple::from_element(METADATA_SEGMENT)),
            ),
            MetadataLayout::Shared => {
                MetadataSpace::new(Subspace::from_bytes(vec![SHARED_METADATA_PREFIX]))
            }
        };
        let registry = IndexStateRegistry::new(metadata.clone());
        let manager = IndexManager::new(db.clone(), registry);
        // Index definitions are not persisted; the manager is re-populated
        // from the schema on every start.
        manager.register_many(schema.index_descriptors().cloned().collect())?;
        Ok(Arc::new(Self {
            keyspace: KeySpace::new(root.clone()),
            db,
            directory,
            subspace: root,
            metadata,
            schema,
            migrations,
            manager,
            stores: Mutex::new(HashMap::new()),
            main_context: OnceLock::new(),
            options,
        }))
    }

    /// The database handle (with this container's retry policy).
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The namespace root.
    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    /// The key layout rooted at this container's namespace.
    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    /// The metadata namespace.
    pub fn metadata(&self) -> &MetadataSpace {
        &self.metadata
    }

    /// The registered schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The migration chain, if one was supplied.
    pub fn migrations(&self) -> Option<&Migrations> {
        self.migrations.as_ref()
    }

    /// The index manager.
    pub fn index_manager(&self) -> &IndexManager {
        &self.manager
    }

    /// The construction options.
    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// The container's main context, constructed lazily on first access.
    pub fn main_context(self: &Arc<Self>) -> Arc<Context> {
        self.main_context
            .get_or_init(|| Context::new(Arc::clone(self), self.options.autosave))
            .clone()
    }

    /// Creates an additional context, e.g. for background work.
    pub fn new_context(self: &Arc<Self>, autosave: bool) -> Arc<Context> {
        Context::new(Arc::clone(self), autosave)
    }

    /// Returns the cached store for `subspace`, constructing it on first
    /// use.
    pub fn store(&self, subspace: &Subspace) -> Arc<Store> {
        let mut stores = self.stores.lock().expect("store cache poisoned");
        stores
            .entry(subspace.prefix().to_vec())
            .or_insert_with(|| Arc::new(Store::new(self.db.clone(), subspace.clone())))
            .clone()
    }

    /// Runs `body` inside a transaction with automatic retry on retriable
    /// errors.
    pub async fn with_transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: Fn(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.db.with_transaction(body).await
    }

    /// Opens the directory at `path`, creating it if absent.
    pub async fn get_or_open(&self, path: &[&str]) -> Result<Subspace> {
        let directory = &self.directory;
        self.db
            .with_transaction(|txn| async move { directory.create_or_open(&txn, path).await })
            .await
    }

    /// Creates the directory at `path`, optionally with an explicit prefix.
    pub async fn create(&self, path: &[&str], prefix: Option<Vec<u8>>) -> Result<Subspace> {
        let directory = &self.directory;
        let prefix = &prefix;
        self.db
            .with_transaction(|txn| async move {
                directory.create(&txn, path, prefix.clone()).await
            })
            .await
    }

    /// Opens the directory at `path`; fails if absent.
    pub async fn open(&self, path: &[&str]) -> Result<Subspace> {
        let directory = &self.directory;
        self.db
            .with_transaction(|txn| async move { directory.open(&txn, path).await })
            .await
    }

    /// Moves a directory to a new path, keeping its prefix.
    pub async fn move_directory(&self, old_path: &[&str], new_path: &[&str]) -> Result<Subspace> {
        let directory = &self.directory;
        self.db
            .with_transaction(|txn| async move {
                directory.move_to(&txn, old_path, new_path).await
            })
            .await
    }

    /// Removes the directory at `path` with all contents.
    pub async fn remove_directory(&self, path: &[&str]) -> Result<bool> {
        let directory = &self.directory;
        self.db
            .with_transaction(|txn| async move { directory.remove(&txn, path).await })
            .await
    }

    /// `true` if the directory at `path` exists.
    pub async fn directory_exists(&self, path: &[&str]) -> Result<bool> {
        let directory = &self.directory;
        self.db
            .with_transaction(|txn| async move { directory.exists(&txn, path).await })
            .await
    }

    /// Reads the stored schema version, `None` on a fresh namespace.
    pub async fn current_schema_version(&self) -> Result<Option<Version>> {
        let key = self.metadata.version_key();
        let key = &key;
        let raw = self
            .db
            .with_transaction(|txn| async move { txn.get(key, false).await })
            .await?;
        raw.map(|bytes| keyspace::decode_version(&bytes)).transpose()
    }

    /// Writes the schema version in its own transaction.
    pub async fn set_current_schema_version(&self, version: Version) -> Result<()> {
        self.db
            .with_transaction(|txn| async move {
                self.write_schema_version(&txn, version);
                Ok(())
            })
            .await
    }

    /// Buffers the schema version write into `txn`.
    pub(crate) fn write_schema_version(&self, txn: &TransactionHandle, version: Version) {
        txn.set(&self.metadata.version_key(), &keyspace::encode_version(version));
    }

    /// Migrates the namespace to `target`.
    ///
    /// See the [`migration`](crate::migration) module for path resolution
    /// and stage semantics. Running the same migration twice is a no-op.
    pub async fn migrate(self: &Arc<Self>, target: Version) -> Result<()> {
        crate::migration::migrate(self, target).await
    }

    /// Migrates to the newest known schema version if the namespace is not
    /// there yet. Without a migration chain the container's own schema is
    /// the target; an explicitly empty chain makes this a no-op.
    pub async fn migrate_if_needed(self: &Arc<Self>) -> Result<()> {
        let target = match &self.migrations {
            Some(migrations) => match migrations.schemas().last() {
                Some(schema) => schema.version(),
                None => return Ok(()),
            },
            None => self.schema.version(),
        };
        if self.current_schema_version().await? == Some(target) {
            return Ok(());
        }
        self.migrate(target).await
    }

    /// Looks up primary keys through a `readable` scalar or unique index.
    ///
    /// `prefix` supplies values for the leading indexed columns; every
    /// matching record's id is returned in index order. Querying an index
    /// that is not `readable` is an error: promotion is the single point at
    /// which queries may start using an index.
    pub async fn query_index(&self, name: &str, prefix: &Tuple) -> Result<Vec<Tuple>> {
        let descriptor = self
            .manager
            .lookup(name)
            .ok_or_else(|| Error::index_not_found(name))?;
        let state = self.manager.state(name).await?;
        if state != IndexState::Readable {
            return Err(Error::InvalidArgument(format!(
                "index `{name}` is {state:?}, not readable"
            )));
        }
        let index = Index::new(descriptor.clone(), &self.keyspace);
        let columns = index.expression().column_count();
        let scope = if prefix.is_empty() {
            index.subspace().clone()
        } else {
            index.subspace().subspace(prefix)
        };
        let scope = &scope;
        let entries = self
            .db
            .with_transaction(|txn| async move {
                // Begin at the bare prefix: a unique entry's key is exactly
                // the packed value tuple, with no id suffix behind it.
                let (_, end) = scope.range();
                let mut cursor = scope.prefix().to_vec();
                let mut entries = Vec::new();
                loop {
                    let result = txn
                        .get_range(&cursor, &end, crate::db::RangeOptions::default())
                        .await?;
                    if let Some(last) = result.entries.last() {
                        cursor = crate::subspace::key_after(&last.key);
                    }
                    let done = !result.more || result.entries.is_empty();
                    entries.extend(result.entries);
                    if done {
                        return Ok(entries);
                    }
                }
            })
            .await?;

        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            match descriptor.kind() {
                IndexKind::Scalar => {
                    let tuple = index.subspace().unpack(&entry.key)?;
                    let id_elements: Vec<TupleElement> =
                        tuple.elements().get(columns..).unwrap_or(&[]).to_vec();
                    if id_elements.is_empty() {
                        return Err(Error::Internal(format!(
                            "index `{name}` entry carries no record id"
                        )));
                    }
                    ids.push(Tuple::from_elements(id_elements));
                }
                IndexKind::Unique => ids.push(Tuple::unpack(&entry.value)?),
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "index `{name}` of kind {other:?} does not support key queries"
                    )))
                }
            }
        }
        Ok(ids)
    }

    /// Applies one record mutation — the record write plus every maintained
    /// index — inside `txn`. `new = None` deletes. `states` must hold the
    /// pre-read states of every index applying to the record's type.
    pub(crate) async fn apply_mutation(
        &self,
        txn: &TransactionHandle,
        store: &Store,
        type_name: &str,
        id: &Tuple,
        new: Option<&[u8]>,
        states: &BTreeMap<String, IndexState>,
    ) -> Result<()> {
        let entity = self
            .schema
            .entity(type_name)
            .ok_or_else(|| Error::entity_not_found(type_name))?;
        let old = store.load(type_name, id, txn, false).await?;
        match new {
            Some(bytes) => store.save(type_name, id, bytes, txn),
            None => store.delete(type_name, id, txn),
        }
        for descriptor in self.manager.for_type(type_name) {
            let state = states
                .get(descriptor.name())
                .copied()
                .unwrap_or(IndexState::Disabled);
            if !state.writes_maintained() {
                continue;
            }
            let index = Index::new(descriptor.clone(), store.keyspace());
            let maintainer = descriptor.kind().maintainer(&index, entity);
            maintainer.update(old.as_deref(), new, id, txn).await?;
        }
        Ok(())
    }
}
