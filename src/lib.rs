//! A typed record persistence runtime layered over FoundationDB.
//!
//! # Container
//!
//! A [`Container`] is the top-level handle to one record namespace. It opens
//! the database (consumed through the [`Database`] trait), owns the
//! [`DirectoryLayer`] and a cache of [`Store`] handles, hosts the main
//! [`Context`] and orchestrates schema-version reads and writes. Containers
//! are shared as [`Arc`]`<Container>`; all of their state is safe to use
//! from parallel tasks.
//!
//! # Records and stores
//!
//! A record is an opaque serialized payload addressed by `(type, id)`.
//! Applications describe their types through the [`Record`] trait (codec via
//! [`BinaryValue`], field access via [`FieldAccess`], a tuple-packable
//! primary key) and register them in a [`Schema`] as [`EntityDescriptor`]s.
//! Records of a type live under `[root]/"R"/<type>/<id>`; the [`Store`]
//! provides stateless CRUD over that layout inside caller-supplied
//! transactions.
//!
//! # Contexts
//!
//! A [`Context`] buffers inserts and deletes and commits them atomically on
//! [`save`](Context::save), maintaining every index whose state is
//! `write-only` or above in the same transaction. Reads through the context
//! ([`fetch`](Context::fetch), [`model`](Context::model)) overlay the staged
//! changes over the persisted state.
//!
//! # Indexes
//!
//! Secondary indexes live under `[root]/"I"/<subspace_key>/...` and move
//! through the persisted lifecycle `disabled -> write-only -> readable`
//! ([`IndexState`]), enforced by the [`IndexStateRegistry`] and fronted by
//! the process-local [`IndexManager`]. Kind-specific entry layouts are
//! implemented by [`IndexMaintainer`]s; pluggable kinds bridge in through
//! [`MaintainerFactory`].
//!
//! # Migrations
//!
//! A [`Migrations`] chain describes the namespace's schema history.
//! [`Container::migrate`] walks the stage chain from the stored version to
//! the target: added indexes are created and populated online by the
//! [`OnlineBuilder`] (batched, resumable, within the backend's 5-second /
//! 10 MB transaction budget), removed indexes are tombstoned, disabled and
//! cleared, and the version is bumped after each stage commits.
//!
//! [`Arc`]: std::sync::Arc
//! [`Database`]: crate::db::Database
//! [`DirectoryLayer`]: crate::directory::DirectoryLayer
//! [`BinaryValue`]: crate::BinaryValue
//! [`FieldAccess`]: crate::FieldAccess
//! [`IndexMaintainer`]: crate::indexes::IndexMaintainer
//! [`MaintainerFactory`]: crate::indexes::MaintainerFactory

#![warn(
    missing_debug_implementations,
    unsafe_code,
    bare_trait_objects,
    missing_docs
)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    // Next `cast_*` lints don't give alternatives.
    clippy::cast_possible_wrap, clippy::cast_possible_truncation, clippy::cast_sign_loss,
    // Next lints produce too much noise/false positives.
    clippy::module_name_repetitions, clippy::similar_names, clippy::must_use_candidate,
    // '... may panic' lints.
    clippy::indexing_slicing,
    // Too much work to fix.
    clippy::missing_errors_doc, clippy::missing_const_for_fn, clippy::missing_panics_doc,
)]

pub use self::{
    container::{Container, ContainerOptions, MetadataLayout},
    context::{Context, ItemKey},
    db::{AtomicOp, Database, Db, KeyValue, RangeOptions, RangeResult, RetryOptions, Transaction, TransactionHandle},
    directory::DirectoryLayer,
    error::{Error, NotFoundKind},
    id::RecordId,
    key_expr::{Boundary, FieldAccess, KeyExpression, KeyValues},
    keys::PrimaryKey,
    keyspace::{KeySpace, MetadataSpace},
    migration::{MigrationContext, MigrationStage, Migrations, OnlineBuilder, StageHooks, StageKind},
    schema::{EntityDescriptor, IndexDescriptor, IndexKind, Record, Schema, Version},
    store::{RecordScan, Store},
    subspace::Subspace,
    tuple::{Tuple, TupleElement, Versionstamp},
    values::BinaryValue,
};
#[doc(no_inline)]
pub use self::indexes::{IndexManager, IndexState, IndexStateRegistry};

pub mod container;
pub mod context;
pub mod db;
pub mod directory;
mod error;
pub mod id;
pub mod indexes;
mod key_expr;
mod keys;
pub mod keyspace;
pub mod migration;
pub mod schema;
pub mod store;
mod subspace;
pub mod tuple;
mod values;

/// A specialized `Result` type for operations with the record store.
pub type Result<T> = std::result::Result<T, Error>;
