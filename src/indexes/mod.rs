//! Runtime indexes and the maintenance protocol.
//!
//! An [`Index`] binds a descriptor to its on-disk subspace and key
//! expression. Index kinds bridge to an [`IndexMaintainer`], the object that
//! knows the kind's entry layout: `update` handles point mutations inside a
//! save, `scan` handles bulk population during an online build. Pluggable
//! kinds supply their own maintainer through [`MaintainerFactory`] and may
//! take over whole builds through [`BuildStrategy`].

pub use self::{
    aggregate::AggregateMaintainer,
    manager::IndexManager,
    scalar::{ScalarMaintainer, UniqueMaintainer},
    state::{IndexState, IndexStateRegistry},
    version::VersionMaintainer,
};

mod aggregate;
mod manager;
mod scalar;
mod state;
mod version;

use async_trait::async_trait;

use std::{fmt, sync::Arc};

use crate::{
    db::{Db, TransactionHandle},
    key_expr::KeyExpression,
    keyspace::KeySpace,
    schema::{EntityDescriptor, IndexDescriptor, IndexKind},
    tuple::{Tuple, TupleElement},
    Result, Subspace,
};

/// A runtime index: a descriptor bound to its subspace and key expression.
#[derive(Debug, Clone)]
pub struct Index {
    descriptor: IndexDescriptor,
    expression: KeyExpression,
    subspace: Subspace,
}

impl Index {
    /// Binds `descriptor` under the layout of `keyspace`.
    pub fn new(descriptor: IndexDescriptor, keyspace: &KeySpace) -> Self {
        let subspace = keyspace.index_subspace(descriptor.subspace_key());
        let expression = descriptor.key_expression();
        Self {
            descriptor,
            expression,
            subspace,
        }
    }

    /// The static descriptor.
    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    /// The index name.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// The subspace holding this index's entries.
    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    /// The key expression entries are computed with.
    pub fn expression(&self) -> &KeyExpression {
        &self.expression
    }

    /// Key of the entry for `values` owned by record `id`.
    pub fn entry_key(&self, values: &[TupleElement], id: &Tuple) -> Vec<u8> {
        let mut elements = values.to_vec();
        elements.extend_from_slice(id.elements());
        self.subspace.pack_slice(&elements)
    }

    /// Key of the per-group entry for `values` (no record id suffix); used
    /// by unique and aggregation kinds.
    pub fn group_key(&self, values: &[TupleElement]) -> Vec<u8> {
        self.subspace.pack_slice(values)
    }
}

/// Maintains one index kind's entries.
///
/// Both operations run inside the caller's transaction; a failure aborts the
/// surrounding save or migration step. `old`/`new` are encoded record
/// payloads: an insert passes `old = None`, a delete passes `new = None`, an
/// update passes both.
#[async_trait]
pub trait IndexMaintainer: Send + Sync + fmt::Debug {
    /// Applies a point mutation of one record to the index.
    async fn update(
        &self,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
        id: &Tuple,
        txn: &TransactionHandle,
    ) -> Result<()>;

    /// Emits the entries for one existing record during a bulk build.
    async fn scan(&self, record: &[u8], id: &Tuple, txn: &TransactionHandle) -> Result<()> {
        self.update(None, Some(record), id, txn).await
    }

    /// A whole-build replacement for kinds that cannot build entry-by-entry
    /// (bulk graph construction and similar). `None` selects the standard
    /// batched scan.
    fn build_strategy(&self) -> Option<Arc<dyn BuildStrategy>> {
        None
    }
}

/// Bridges a pluggable [`IndexKind`] to its maintainer.
pub trait MaintainerFactory: Send + Sync + fmt::Debug {
    /// Creates the maintainer for `index` on records described by `entity`.
    fn make_maintainer(
        &self,
        index: &Index,
        entity: &EntityDescriptor,
    ) -> Arc<dyn IndexMaintainer>;
}

/// Everything a custom build strategy needs to populate an index on its own.
///
/// Strategies run outside any transaction and must respect the per-
/// transaction time and size budgets internally.
#[derive(Debug, Clone)]
pub struct BuildInputs {
    /// Database handle with the container's retry policy.
    pub db: Db,
    /// The record type being indexed.
    pub type_name: String,
    /// Subspace holding the type's records.
    pub record_subspace: Subspace,
    /// The index being built.
    pub index: Index,
    /// Entity descriptor of the record type.
    pub entity: EntityDescriptor,
    /// Suggested records per transaction.
    pub batch_size: usize,
}

/// A kind-supplied bulk build.
#[async_trait]
pub trait BuildStrategy: Send + Sync + fmt::Debug {
    /// Populates the index from existing records.
    async fn build(&self, inputs: &BuildInputs) -> Result<()>;
}

impl IndexKind {
    /// Creates the maintainer implementing this kind for `index`, reading
    /// record fields through `entity`.
    pub fn maintainer(
        &self,
        index: &Index,
        entity: &EntityDescriptor,
    ) -> Arc<dyn IndexMaintainer> {
        match self {
            Self::Scalar => Arc::new(ScalarMaintainer::new(index.clone(), entity.clone())),
            Self::Unique => Arc::new(UniqueMaintainer::new(index.clone(), entity.clone())),
            Self::Count => Arc::new(AggregateMaintainer::count(index.clone(), entity.clone())),
            Self::Sum => Arc::new(AggregateMaintainer::sum(index.clone(), entity.clone())),
            Self::Min => Arc::new(AggregateMaintainer::min(index.clone(), entity.clone())),
            Self::Max => Arc::new(AggregateMaintainer::max(index.clone(), entity.clone())),
            Self::Version => Arc::new(VersionMaintainer::new(index.clone(), entity.clone())),
            Self::Custom(factory) => factory.make_maintainer(index, entity),
        }
    }
}
