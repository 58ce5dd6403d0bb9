//! Change-tracking contexts.
//!
//! A [`Context`] buffers inserts and deletes in memory and commits the whole
//! batch in one transaction on [`save`](Context::save). Reads through the
//! context overlay the staged changes over the persisted state, so callers
//! observe their own pending writes.
//!
//! # Concurrent saves
//!
//! `save` atomically snapshots and clears the staging area under a short
//! lock before any I/O. A second `save` racing the first therefore observes
//! an empty staging area and returns immediately; overlapping saves are not
//! an error. On failure the snapshot is restored union-style: changes staged
//! while the save was in flight supersede the restored ones.

use tracing::error;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use crate::{
    container::Container, keys::PrimaryKey, schema::Record, tuple::Tuple, Error, Result, Subspace,
};

/// Delay between the first staged change and the deferred save, when
/// autosave is enabled. Bursts of changes within the window coalesce into
/// one save.
const AUTOSAVE_DELAY: Duration = Duration::from_millis(10);

/// Identity of one staged item: the record coordinates plus the namespace
/// it is headed for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    /// The record's type name.
    pub type_name: String,
    /// The packed primary key.
    pub id: Vec<u8>,
    /// Prefix of the namespace root the record belongs to.
    pub subspace: Vec<u8>,
}

#[derive(Debug, Default)]
struct Staging {
    inserted: BTreeMap<ItemKey, Vec<u8>>,
    deleted: BTreeSet<ItemKey>,
    saving: bool,
}

impl Staging {
    fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.deleted.is_empty()
    }
}

type ErrorSink = Box<dyn Fn(&Error) + Send + Sync>;

/// A staging area buffering inserts and deletes until the next save.
pub struct Context {
    container: Arc<Container>,
    weak: Weak<Context>,
    staging: Mutex<Staging>,
    autosave: bool,
    autosave_inflight: AtomicBool,
    error_sink: Mutex<Option<ErrorSink>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let staging = self.lock();
        f.debug_struct("Context")
            .field("inserted", &staging.inserted.len())
            .field("deleted", &staging.deleted.len())
            .field("saving", &staging.saving)
            .field("autosave", &self.autosave)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(container: Arc<Container>, autosave: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            container,
            weak: weak.clone(),
            staging: Mutex::new(Staging::default()),
            autosave,
            autosave_inflight: AtomicBool::new(false),
            error_sink: Mutex::new(None),
        })
    }

    /// The container this context writes through.
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Installs a sink receiving autosave errors (they are additionally
    /// logged, never silently dropped).
    pub fn set_autosave_error_sink(&self, sink: impl Fn(&Error) + Send + Sync + 'static) {
        *self.error_sink.lock().expect("error sink poisoned") = Some(Box::new(sink));
    }

    /// Stages a typed record for insertion into the container's root
    /// namespace.
    pub fn insert<R: Record>(&self, record: &R) -> Result<()> {
        self.insert_raw(
            R::TYPE_NAME,
            &record.primary_key(),
            record.to_bytes(),
            None,
        )
    }

    /// Stages a typed record for insertion into an explicit namespace.
    pub fn insert_in<R: Record>(&self, record: &R, subspace: &Subspace) -> Result<()> {
        self.insert_raw(
            R::TYPE_NAME,
            &record.primary_key(),
            record.to_bytes(),
            Some(subspace),
        )
    }

    /// Stages an already-encoded record for insertion.
    pub fn insert_raw(
        &self,
        type_name: &str,
        id: &Tuple,
        bytes: Vec<u8>,
        subspace: Option<&Subspace>,
    ) -> Result<()> {
        self.require_entity(type_name)?;
        let key = self.item_key(type_name, id, subspace);
        {
            let mut staging = self.lock();
            staging.deleted.remove(&key);
            staging.inserted.insert(key, bytes);
        }
        self.schedule_autosave();
        Ok(())
    }

    /// Stages a typed record for deletion from the container's root
    /// namespace.
    pub fn delete<R: Record>(&self, record: &R) -> Result<()> {
        self.delete_raw(R::TYPE_NAME, &record.primary_key(), None)
    }

    /// Stages a typed record for deletion from an explicit namespace.
    pub fn delete_in<R: Record>(&self, record: &R, subspace: &Subspace) -> Result<()> {
        self.delete_raw(R::TYPE_NAME, &record.primary_key(), Some(subspace))
    }

    /// Stages a deletion by coordinates.
    ///
    /// Deleting a key whose insert is still staged cancels the insert
    /// instead of recording a deletion.
    pub fn delete_raw(
        &self,
        type_name: &str,
        id: &Tuple,
        subspace: Option<&Subspace>,
    ) -> Result<()> {
        self.require_entity(type_name)?;
        let key = self.item_key(type_name, id, subspace);
        {
            let mut staging = self.lock();
            if staging.inserted.remove(&key).is_none() {
                staging.deleted.insert(key);
            }
        }
        self.schedule_autosave();
        Ok(())
    }

    /// `true` if any insert or delete is staged.
    pub fn has_changes(&self) -> bool {
        self.lock().has_changes()
    }

    /// `true` while a save is flushing a snapshot.
    pub fn is_saving(&self) -> bool {
        self.lock().saving
    }

    /// Discards all staged changes.
    pub fn rollback(&self) {
        let mut staging = self.lock();
        staging.inserted.clear();
        staging.deleted.clear();
    }

    /// Commits all staged changes in one transaction.
    ///
    /// Every record write and the entries of every index in state
    /// `write-only` or above commit atomically; readers observe all of them
    /// or none. On any error the staged changes are restored (union-style:
    /// changes staged during the attempt win) and the error is returned.
    pub async fn save(&self) -> Result<()> {
        let (inserted, deleted) = {
            let mut staging = self.lock();
            if !staging.has_changes() {
                return Ok(());
            }
            staging.saving = true;
            (
                mem::take(&mut staging.inserted),
                mem::take(&mut staging.deleted),
            )
        };
        let result = self.flush(&inserted, &deleted).await;
        let mut staging = self.lock();
        staging.saving = false;
        if let Err(err) = result {
            for (key, bytes) in inserted {
                if !staging.inserted.contains_key(&key) && !staging.deleted.contains(&key) {
                    staging.inserted.insert(key, bytes);
                }
            }
            for key in deleted {
                if !staging.inserted.contains_key(&key) && !staging.deleted.contains(&key) {
                    staging.deleted.insert(key);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn flush(
        &self,
        inserted: &BTreeMap<ItemKey, Vec<u8>>,
        deleted: &BTreeSet<ItemKey>,
    ) -> Result<()> {
        let container = &self.container;
        let index_names: BTreeSet<String> = inserted
            .keys()
            .chain(deleted.iter())
            .flat_map(|key| container.index_manager().for_type(&key.type_name))
            .map(|descriptor| descriptor.name().to_owned())
            .collect();
        let index_names = &index_names;
        container
            .with_transaction(|txn| async move {
                let names: Vec<&str> = index_names.iter().map(String::as_str).collect();
                let states = container
                    .index_manager()
                    .registry()
                    .states(&txn, &names)
                    .await?;
                for (key, bytes) in inserted {
                    let store = container.store(&Subspace::from_bytes(key.subspace.clone()));
                    let id = Tuple::unpack(&key.id)?;
                    container
                        .apply_mutation(
                            &txn,
                            &store,
                            &key.type_name,
                            &id,
                            Some(bytes.as_slice()),
                            &states,
                        )
                        .await?;
                }
                for key in deleted {
                    let store = container.store(&Subspace::from_bytes(key.subspace.clone()));
                    let id = Tuple::unpack(&key.id)?;
                    container
                        .apply_mutation(&txn, &store, &key.type_name, &id, None, &states)
                        .await?;
                }
                Ok(())
            })
            .await
    }

    /// Runs `block` against this context, then saves.
    pub async fn perform_and_save<F, Fut>(self: &Arc<Self>, block: F) -> Result<()>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        block(Arc::clone(self)).await?;
        self.save().await
    }

    /// Loads one record by id, reflecting staged changes: a staged delete
    /// hides the persisted record, a staged insert wins over it.
    pub async fn model<R: Record, K: PrimaryKey>(&self, id: &K) -> Result<Option<R>> {
        let id_tuple = id.to_tuple();
        let key = self.item_key(R::TYPE_NAME, &id_tuple, None);
        {
            let staging = self.lock();
            if staging.deleted.contains(&key) {
                return Ok(None);
            }
            if let Some(bytes) = staging.inserted.get(&key) {
                return decode::<R>(bytes).map(Some);
            }
        }
        let store = self.container.store(self.container.subspace());
        match store.load_one(R::TYPE_NAME, &id_tuple).await? {
            Some(bytes) => decode::<R>(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Fetches all records of `R` matching `filter`, with staged changes
    /// overlaid: staged deletes are excluded, staged inserts included, and
    /// each `(type, id)` appears once with the staged version taking
    /// precedence.
    pub async fn fetch<R: Record>(&self, filter: impl Fn(&R) -> bool) -> Result<Vec<R>> {
        let root_prefix = self.container.subspace().prefix().to_vec();
        let (staged, deleted) = {
            let staging = self.lock();
            let staged: Vec<(Vec<u8>, Vec<u8>)> = staging
                .inserted
                .iter()
                .filter(|(key, _)| key.type_name == R::TYPE_NAME && key.subspace == root_prefix)
                .map(|(key, bytes)| (key.id.clone(), bytes.clone()))
                .collect();
            let deleted: BTreeSet<Vec<u8>> = staging
                .deleted
                .iter()
                .filter(|key| key.type_name == R::TYPE_NAME && key.subspace == root_prefix)
                .map(|key| key.id.clone())
                .collect();
            (staged, deleted)
        };

        let store = self.container.store(self.container.subspace());
        let store = &store;
        let persisted = self
            .container
            .with_transaction(|txn| async move { store.scan(R::TYPE_NAME, &txn).collect().await })
            .await?;

        let mut merged: BTreeMap<Vec<u8>, R> = BTreeMap::new();
        for (id, bytes) in persisted {
            let packed = id.pack();
            if deleted.contains(&packed) {
                continue;
            }
            merged.insert(packed, decode::<R>(&bytes)?);
        }
        for (packed, bytes) in staged {
            merged.insert(packed, decode::<R>(&bytes)?);
        }
        Ok(merged.into_values().filter(|record| filter(record)).collect())
    }

    /// Counts the records [`fetch`](Self::fetch) would return.
    pub async fn fetch_count<R: Record>(&self, filter: impl Fn(&R) -> bool) -> Result<usize> {
        Ok(self.fetch(filter).await?.len())
    }

    /// Visits every *persisted* record of `R` in id order, a fresh
    /// transaction per batch; staged changes are not overlaid. Returning
    /// `false` from `f` stops the enumeration. Returns the number of
    /// records visited.
    pub async fn enumerate<R: Record>(
        &self,
        mut f: impl FnMut(R) -> bool + Send,
    ) -> Result<u64> {
        let store = self.container.store(self.container.subspace());
        let subspace = store.keyspace().record_subspace(R::TYPE_NAME);
        crate::migration::enumerate_raw(
            self.container.db(),
            &subspace,
            self.container.options().build_batch_size,
            &mut |_, bytes| Ok(f(decode::<R>(&bytes)?)),
        )
        .await
    }

    fn require_entity(&self, type_name: &str) -> Result<()> {
        if self.container.schema().entity(type_name).is_some() {
            Ok(())
        } else {
            Err(Error::entity_not_found(type_name))
        }
    }

    fn item_key(&self, type_name: &str, id: &Tuple, subspace: Option<&Subspace>) -> ItemKey {
        let subspace = subspace.unwrap_or_else(|| self.container.subspace());
        ItemKey {
            type_name: type_name.to_owned(),
            id: id.pack(),
            subspace: subspace.prefix().to_vec(),
        }
    }

    fn schedule_autosave(&self) {
        if !self.autosave {
            return;
        }
        if self
            .autosave_inflight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(ctx) = self.weak.upgrade() else {
            self.autosave_inflight.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(AUTOSAVE_DELAY).await;
            ctx.autosave_inflight.store(false, Ordering::Release);
            if let Err(err) = ctx.save().await {
                error!(error = %err, "autosave failed");
                let sink = ctx.error_sink.lock().expect("error sink poisoned");
                if let Some(sink) = sink.as_ref() {
                    sink(&err);
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Staging> {
        self.staging.lock().expect("context staging poisoned")
    }
}

fn decode<R: Record>(bytes: &[u8]) -> Result<R> {
    R::from_bytes(std::borrow::Cow::Borrowed(bytes)).map_err(Error::Serialization)
}
