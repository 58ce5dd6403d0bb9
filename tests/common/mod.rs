//! Shared test harness: an in-memory backend implementing the consumed
//! `Database` / `Transaction` / `DirectoryLayer` traits, plus record
//! fixtures used across the integration tests.
//!
//! The backend keeps a single ordered map guarded by a mutex, hands each
//! transaction a snapshot clone, replays buffered writes on commit and
//! substitutes versionstamps from a monotone commit counter. Commit
//! failures can be injected per key prefix to exercise the retry and
//! restore paths.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use std::{
    borrow::Cow,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use recorddb::{
    AtomicOp, BinaryValue, Container, ContainerOptions, Database, DirectoryLayer, Error,
    FieldAccess, IndexDescriptor, IndexKind, KeyValue, Migrations, RangeOptions, RangeResult,
    Record, Result, RetryOptions, Schema, Subspace, Transaction, TransactionHandle, Tuple,
    TupleElement, Version,
};
use recorddb::EntityDescriptor;

/// Keys below this prefix hold the test directory layer's path mappings.
const DIRECTORY_NODE_PREFIX: u8 = 0xFD;

#[derive(Debug, Clone)]
struct FailureRule {
    prefix: Vec<u8>,
    skip: u32,
    times: u32,
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    commit_version: AtomicU64,
    failures: Mutex<Vec<FailureRule>>,
}

/// The in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryDb {
    inner: Arc<MemoryInner>,
}

impl MemoryDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arms a commit failure: after `skip` successful commits that write
    /// under `prefix`, the next `times` such commits fail with a retriable
    /// conflict.
    pub fn fail_commits(&self, prefix: Vec<u8>, skip: u32, times: u32) {
        self.inner
            .failures
            .lock()
            .unwrap()
            .push(FailureRule { prefix, skip, times });
    }

    /// Drops all armed failures.
    pub fn clear_failures(&self) {
        self.inner.failures.lock().unwrap().clear();
    }

    /// Reads a committed key directly, bypassing any transaction.
    pub fn read(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.data.lock().unwrap().get(key).cloned()
    }

    /// Writes a committed key directly; used to seed legacy layouts.
    pub fn write(&self, key: Vec<u8>, value: Vec<u8>) {
        self.inner.data.lock().unwrap().insert(key, value);
    }

    /// A full copy of the committed state, for whole-database comparisons.
    pub fn dump(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.inner.data.lock().unwrap().clone()
    }

    /// All committed keys under `prefix`.
    pub fn read_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner
            .data
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Number of committed keys under `prefix`.
    pub fn count_prefix(&self, prefix: &[u8]) -> usize {
        self.read_prefix(prefix).len()
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn create_transaction(&self) -> Result<TransactionHandle> {
        let snapshot = self.inner.data.lock().unwrap().clone();
        Ok(Arc::new(MemoryTxn {
            inner: Arc::clone(&self.inner),
            state: Mutex::new(TxnState {
                view: snapshot,
                ops: Vec::new(),
            }),
            cancelled: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug, Clone)]
enum WriteOp {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
    Atomic(AtomicOp, Vec<u8>, Vec<u8>),
}

#[derive(Debug)]
struct TxnState {
    view: BTreeMap<Vec<u8>, Vec<u8>>,
    ops: Vec<WriteOp>,
}

#[derive(Debug)]
pub struct MemoryTxn {
    inner: Arc<MemoryInner>,
    state: Mutex<TxnState>,
    cancelled: AtomicBool,
}

impl MemoryTxn {
    fn check_open(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transaction for MemoryTxn {
    async fn get(&self, key: &[u8], _snapshot: bool) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.state.lock().unwrap().view.get(key).cloned())
    }

    async fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        options: RangeOptions,
    ) -> Result<RangeResult> {
        self.check_open()?;
        let state = self.state.lock().unwrap();
        let mut matching: Vec<KeyValue> = state
            .view
            .range(begin.to_vec()..end.to_vec())
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        if options.reverse {
            matching.reverse();
        }
        let total = matching.len();
        if options.limit > 0 && total > options.limit {
            matching.truncate(options.limit);
            Ok(RangeResult {
                entries: matching,
                more: true,
            })
        } else {
            Ok(RangeResult {
                entries: matching,
                more: false,
            })
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.view.insert(key.to_vec(), value.to_vec());
        state.ops.push(WriteOp::Set(key.to_vec(), value.to_vec()));
    }

    fn clear(&self, key: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.view.remove(key);
        state.ops.push(WriteOp::Clear(key.to_vec()));
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<Vec<u8>> = state
            .view
            .range(begin.to_vec()..end.to_vec())
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            state.view.remove(&key);
        }
        state
            .ops
            .push(WriteOp::ClearRange(begin.to_vec(), end.to_vec()));
    }

    fn atomic_op(&self, op: AtomicOp, key: &[u8], param: &[u8]) {
        // Atomic results are not readable within the transaction, matching
        // the deferred evaluation of the real backend.
        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(WriteOp::Atomic(op, key.to_vec(), param.to_vec()));
    }

    async fn commit(&self) -> Result<()> {
        self.check_open()?;
        let state = self.state.lock().unwrap();

        {
            let mut failures = self.inner.failures.lock().unwrap();
            for rule in failures.iter_mut() {
                let touches = state.ops.iter().any(|op| match op {
                    WriteOp::Set(key, _) | WriteOp::Clear(key) | WriteOp::Atomic(_, key, _) => {
                        key.starts_with(&rule.prefix)
                    }
                    WriteOp::ClearRange(begin, _) => begin.starts_with(&rule.prefix),
                });
                if !touches {
                    continue;
                }
                if rule.skip > 0 {
                    rule.skip -= 1;
                    continue;
                }
                if rule.times > 0 {
                    rule.times -= 1;
                    return Err(Error::Backend {
                        code: 1020,
                        message: "injected conflict".into(),
                    });
                }
            }
        }

        let version = self.inner.commit_version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stamp = [0_u8; 10];
        stamp[..8].copy_from_slice(&version.to_be_bytes());

        let mut data = self.inner.data.lock().unwrap();
        for op in &state.ops {
            match op {
                WriteOp::Set(key, value) => {
                    data.insert(key.clone(), value.clone());
                }
                WriteOp::Clear(key) => {
                    data.remove(key);
                }
                WriteOp::ClearRange(begin, end) => {
                    let doomed: Vec<Vec<u8>> = data
                        .range(begin.clone()..end.clone())
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in doomed {
                        data.remove(&key);
                    }
                }
                WriteOp::Atomic(AtomicOp::Add, key, param) => {
                    let current = data
                        .get(key)
                        .map(|raw| i64::from_le_bytes(raw[..8].try_into().unwrap()))
                        .unwrap_or(0);
                    let delta = i64::from_le_bytes(param[..8].try_into().unwrap());
                    data.insert(key.clone(), (current + delta).to_le_bytes().to_vec());
                }
                WriteOp::Atomic(AtomicOp::Min, key, param) => {
                    let incoming = u64::from_le_bytes(param[..8].try_into().unwrap());
                    let winner = match data.get(key) {
                        Some(raw) => {
                            incoming.min(u64::from_le_bytes(raw[..8].try_into().unwrap()))
                        }
                        None => incoming,
                    };
                    data.insert(key.clone(), winner.to_le_bytes().to_vec());
                }
                WriteOp::Atomic(AtomicOp::Max, key, param) => {
                    let incoming = u64::from_le_bytes(param[..8].try_into().unwrap());
                    let winner = match data.get(key) {
                        Some(raw) => {
                            incoming.max(u64::from_le_bytes(raw[..8].try_into().unwrap()))
                        }
                        None => incoming,
                    };
                    data.insert(key.clone(), winner.to_le_bytes().to_vec());
                }
                WriteOp::Atomic(AtomicOp::SetVersionstampedKey, key, param) => {
                    let split = key.len() - 4;
                    let offset =
                        u32::from_le_bytes(key[split..].try_into().unwrap()) as usize;
                    let mut real_key = key[..split].to_vec();
                    real_key[offset..offset + 10].copy_from_slice(&stamp);
                    data.insert(real_key, param.clone());
                }
                WriteOp::Atomic(AtomicOp::SetVersionstampedValue, key, param) => {
                    let split = param.len() - 4;
                    let offset =
                        u32::from_le_bytes(param[split..].try_into().unwrap()) as usize;
                    let mut value = param[..split].to_vec();
                    value[offset..offset + 10].copy_from_slice(&stamp);
                    data.insert(key.clone(), value);
                }
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// A directory layer allocating short prefixes and persisting the path
/// mapping inside the store itself, so re-opened containers resolve the
/// same subspaces.
#[derive(Debug, Default)]
pub struct TestDirectory;

impl TestDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    fn node_key(path: &[&str]) -> Vec<u8> {
        let mut key = vec![DIRECTORY_NODE_PREFIX];
        let tuple: Tuple = path
            .iter()
            .map(|segment| TupleElement::String((*segment).to_owned()))
            .collect();
        key.extend_from_slice(&tuple.pack());
        key
    }

    fn counter_key() -> Vec<u8> {
        vec![DIRECTORY_NODE_PREFIX, 0x00]
    }

    async fn allocate(&self, txn: &TransactionHandle) -> Result<Vec<u8>> {
        let next = match txn.get(&Self::counter_key(), false).await? {
            Some(raw) => u16::from_be_bytes(raw[..2].try_into().unwrap()) + 1,
            None => 1,
        };
        txn.set(&Self::counter_key(), &next.to_be_bytes());
        Ok(vec![0x15, next.to_be_bytes()[0], next.to_be_bytes()[1]])
    }
}

#[async_trait]
impl DirectoryLayer for TestDirectory {
    async fn create_or_open(&self, txn: &TransactionHandle, path: &[&str]) -> Result<Subspace> {
        match txn.get(&Self::node_key(path), false).await? {
            Some(prefix) => Ok(Subspace::from_bytes(prefix)),
            None => self.create(txn, path, None).await,
        }
    }

    async fn create(
        &self,
        txn: &TransactionHandle,
        path: &[&str],
        prefix: Option<Vec<u8>>,
    ) -> Result<Subspace> {
        let node = Self::node_key(path);
        if txn.get(&node, false).await?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "directory {path:?} already exists"
            )));
        }
        let prefix = match prefix {
            Some(prefix) => prefix,
            None => self.allocate(txn).await?,
        };
        txn.set(&node, &prefix);
        Ok(Subspace::from_bytes(prefix))
    }

    async fn open(&self, txn: &TransactionHandle, path: &[&str]) -> Result<Subspace> {
        txn.get(&Self::node_key(path), false)
            .await?
            .map(Subspace::from_bytes)
            .ok_or_else(|| Error::InvalidArgument(format!("directory {path:?} does not exist")))
    }

    async fn move_to(
        &self,
        txn: &TransactionHandle,
        old_path: &[&str],
        new_path: &[&str],
    ) -> Result<Subspace> {
        let subspace = self.open(txn, old_path).await?;
        let new_node = Self::node_key(new_path);
        if txn.get(&new_node, false).await?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "directory {new_path:?} already exists"
            )));
        }
        txn.clear(&Self::node_key(old_path));
        txn.set(&new_node, subspace.prefix());
        Ok(subspace)
    }

    async fn remove(&self, txn: &TransactionHandle, path: &[&str]) -> Result<bool> {
        match txn.get(&Self::node_key(path), false).await? {
            Some(prefix) => {
                let subspace = Subspace::from_bytes(prefix);
                let (begin, end) = subspace.range();
                txn.clear_range(&begin, &end);
                txn.clear(&Self::node_key(path));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, txn: &TransactionHandle, path: &[&str]) -> Result<bool> {
        Ok(txn.get(&Self::node_key(path), false).await?.is_some())
    }
}

// ---------------------------------------------------------------------------
// Record fixtures.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub score: i64,
}

impl User {
    pub fn new(id: &str, email: &str) -> Self {
        Self {
            id: id.to_owned(),
            email: email.to_owned(),
            score: 0,
        }
    }
}

impl BinaryValue for User {
    fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialize User")
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(&bytes)?)
    }
}

impl FieldAccess for User {
    fn field(&self, path: &str) -> Option<TupleElement> {
        match path {
            "id" => Some(TupleElement::String(self.id.clone())),
            "email" => Some(TupleElement::String(self.email.clone())),
            "score" => Some(TupleElement::Int(self.score)),
            _ => None,
        }
    }
}

impl Record for User {
    const TYPE_NAME: &'static str = "User";

    fn primary_key(&self) -> Tuple {
        Tuple::from_element(self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub total: i64,
}

impl BinaryValue for Order {
    fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialize Order")
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(&bytes)?)
    }
}

impl FieldAccess for Order {
    fn field(&self, path: &str) -> Option<TupleElement> {
        match path {
            "id" => Some(TupleElement::String(self.id.clone())),
            "total" => Some(TupleElement::Int(self.total)),
            _ => None,
        }
    }
}

impl Record for Order {
    const TYPE_NAME: &'static str = "Order";

    fn primary_key(&self) -> Tuple {
        Tuple::from_element(self.id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Schema fixtures.

pub fn email_index() -> IndexDescriptor {
    IndexDescriptor::new("idx_email", "User", vec!["email"], IndexKind::Scalar)
}

pub fn unique_email_index() -> IndexDescriptor {
    IndexDescriptor::new("idx_email", "User", vec!["email"], IndexKind::Unique)
}

/// Version 1: `User` with no indexes.
pub fn schema_v1() -> Schema {
    Schema::new(
        Version::new(1, 0, 0),
        vec![user_entity(Vec::new()), order_entity(Vec::new())],
    )
    .unwrap()
}

/// Version 2: adds the scalar email index.
pub fn schema_v2() -> Schema {
    Schema::new(
        Version::new(2, 0, 0),
        vec![user_entity(vec![email_index()]), order_entity(Vec::new())],
    )
    .unwrap()
}

/// Version 3: drops the email index again.
pub fn schema_v3() -> Schema {
    Schema::new(
        Version::new(3, 0, 0),
        vec![user_entity(Vec::new()), order_entity(Vec::new())],
    )
    .unwrap()
}

pub fn user_entity(indexes: Vec<IndexDescriptor>) -> EntityDescriptor {
    EntityDescriptor::new::<User>(&["id", "email", "score"], indexes)
}

pub fn order_entity(indexes: Vec<IndexDescriptor>) -> EntityDescriptor {
    EntityDescriptor::new::<Order>(&["id", "total"], indexes)
}

/// Fast-retry options so conflict-exhaustion tests finish quickly.
pub fn test_options() -> ContainerOptions {
    let mut options = ContainerOptions::default();
    options.retry = RetryOptions {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    };
    options
}

/// Opens a container over `db` with the given schema and migrations.
pub async fn container(
    db: &Arc<MemoryDb>,
    schema: Schema,
    migrations: Option<Migrations>,
) -> Arc<Container> {
    container_with_options(db, schema, migrations, test_options()).await
}

/// Opens a container with explicit options.
pub async fn container_with_options(
    db: &Arc<MemoryDb>,
    schema: Schema,
    migrations: Option<Migrations>,
    options: ContainerOptions,
) -> Arc<Container> {
    let database: Arc<dyn Database> = db.clone();
    let directory: Arc<dyn DirectoryLayer> = TestDirectory::new();
    Container::new(database, directory, schema, migrations, options)
        .await
        .expect("open container")
}
