//! Schema migrations.
//!
//! A [`Migrations`] value describes the full history of a namespace: the
//! ordered list of schemas and the stages linking consecutive versions.
//! [`Container::migrate`](crate::Container::migrate) resolves the stage
//! chain from the stored version to the target and executes it stage by
//! stage; the stored version is bumped only after a stage's record and
//! index effects commit, so a crash between stages leaves the namespace at
//! the previous version, safe to resume.
//!
//! Stages are either *lightweight* (the index sets of the two schemas are
//! diffed automatically: added indexes are created and populated online,
//! removed indexes are tombstoned, disabled and cleared) or *custom* (the
//! same diff sandwiched between [`StageHooks::will_migrate`] and
//! [`StageHooks::did_migrate`], which receive a [`MigrationContext`] with
//! chunked data operations).

pub use self::{build::OnlineBuilder, context::MigrationContext};

mod build;
mod context;

use async_trait::async_trait;
use tracing::{debug, info};

use std::{collections::BTreeSet, fmt, sync::Arc};

use crate::{
    container::Container,
    db::{Db, RangeOptions},
    indexes::{Index, IndexState},
    schema::{IndexDescriptor, Schema, Version},
    subspace::key_after,
    tuple::{Tuple, TupleElement},
    Error, Result, Subspace,
};

/// Hooks run around a custom stage's automatic index diff.
#[async_trait]
pub trait StageHooks: Send + Sync + fmt::Debug {
    /// Runs before the stage's index effects.
    async fn will_migrate(&self, _ctx: &MigrationContext) -> Result<()> {
        Ok(())
    }

    /// Runs after the stage's index effects, before the version bump.
    async fn did_migrate(&self, _ctx: &MigrationContext) -> Result<()> {
        Ok(())
    }
}

/// How a stage migrates between two adjacent schemas.
#[derive(Debug, Clone)]
pub enum StageKind {
    /// Pure automatic index diff.
    Lightweight,
    /// Index diff wrapped in custom hooks.
    Custom(Arc<dyn StageHooks>),
}

/// One step in a migration chain.
#[derive(Debug, Clone)]
pub struct MigrationStage {
    /// Version this stage migrates from.
    pub from: Version,
    /// Version this stage migrates to.
    pub to: Version,
    kind: StageKind,
}

impl MigrationStage {
    /// A stage with automatic index diffing only.
    pub fn lightweight(from: Version, to: Version) -> Self {
        Self {
            from,
            to,
            kind: StageKind::Lightweight,
        }
    }

    /// A stage with custom hooks around the index diff.
    pub fn custom(from: Version, to: Version, hooks: Arc<dyn StageHooks>) -> Self {
        Self {
            from,
            to,
            kind: StageKind::Custom(hooks),
        }
    }

    /// The stage kind.
    pub fn kind(&self) -> &StageKind {
        &self.kind
    }
}

/// The migration history of a namespace: schemas in version order plus the
/// stages linking them.
#[derive(Debug, Clone)]
pub struct Migrations {
    schemas: Vec<Schema>,
    stages: Vec<MigrationStage>,
}

impl Migrations {
    /// Creates a chain from explicit schemas and stages. Validation runs
    /// when a migration executes, before any effects.
    pub fn new(schemas: Vec<Schema>, stages: Vec<MigrationStage>) -> Self {
        Self { schemas, stages }
    }

    /// Creates a chain of lightweight stages between consecutive schemas.
    pub fn lightweight(schemas: Vec<Schema>) -> Self {
        let stages = schemas
            .windows(2)
            .map(|pair| MigrationStage::lightweight(pair[0].version(), pair[1].version()))
            .collect();
        Self { schemas, stages }
    }

    /// The schemas, in version order.
    pub fn schemas(&self) -> &[Schema] {
        &self.schemas
    }

    /// The stages, in version order.
    pub fn stages(&self) -> &[MigrationStage] {
        &self.stages
    }

    /// Looks up the schema carrying `version`.
    pub fn schema(&self, version: Version) -> Option<&Schema> {
        self.schemas
            .iter()
            .find(|schema| schema.version() == version)
    }

    /// Checks the structural invariants of the chain.
    pub fn validate(&self) -> Result<()> {
        if self.schemas.is_empty() {
            return Err(Error::EmptySchemaList);
        }
        for pair in self.schemas.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(Error::DuplicateVersion(pair[0].version()));
            }
            if pair[0].version() > pair[1].version() {
                return Err(Error::VersionsNotOrdered);
            }
        }
        let expected = self.schemas.len() - 1;
        if self.stages.len() != expected {
            return Err(Error::StageCountMismatch {
                expected,
                actual: self.stages.len(),
            });
        }
        for (stage, pair) in self.stages.iter().zip(self.schemas.windows(2)) {
            if stage.from != pair[0].version() || stage.to != pair[1].version() {
                return Err(Error::StageMismatch {
                    from: stage.from,
                    to: stage.to,
                });
            }
        }
        Ok(())
    }

    /// Resolves the stage chain from `current` to `target`.
    ///
    /// Equal versions resolve to the empty chain; a lower target is a
    /// downgrade and unsupported; a missing link is a path error.
    pub fn resolve_path(&self, current: Version, target: Version) -> Result<Vec<&MigrationStage>> {
        if target == current {
            return Ok(Vec::new());
        }
        if target < current {
            return Err(Error::DowngradeNotSupported { current, target });
        }
        let mut path = Vec::new();
        let mut cursor = current;
        while cursor != target {
            // A well-formed chain cannot loop, but resolution guards
            // independently of validation.
            if path.len() > self.schemas.len() {
                return Err(Error::CyclicMigrationPath(current));
            }
            let stage = self
                .stages
                .iter()
                .find(|stage| stage.from == cursor)
                .ok_or(Error::NoMigrationPath {
                    from: current,
                    to: target,
                })?;
            cursor = stage.to;
            path.push(stage);
        }
        Ok(path)
    }
}

/// Entry point used by [`Container::migrate`](crate::Container::migrate).
pub(crate) async fn migrate(container: &Arc<Container>, target: Version) -> Result<()> {
    if let Some(migrations) = container.migrations() {
        migrations.validate()?;
    }
    let current = container.current_schema_version().await?;
    match current {
        None => provision_fresh(container, target).await,
        Some(current) if current == target => {
            debug!(version = %target, "already at target version");
            Ok(())
        }
        Some(current) if target < current => {
            Err(Error::DowngradeNotSupported { current, target })
        }
        Some(current) => {
            let migrations = container
                .migrations()
                .ok_or(Error::NoMigrationPath {
                    from: current,
                    to: target,
                })?;
            let path = migrations.resolve_path(current, target)?;
            for stage in path {
                run_stage(container, migrations, stage).await?;
            }
            Ok(())
        }
    }
}

/// First migration on a fresh namespace: no stages run; the target version
/// is written and, when the target schema is known, its indexes are
/// provisioned through the normal enable-build-promote path (the build is
/// trivial with no pre-existing records).
async fn provision_fresh(container: &Arc<Container>, target: Version) -> Result<()> {
    info!(version = %target, "provisioning fresh namespace");
    let schema = container
        .migrations()
        .and_then(|migrations| migrations.schema(target))
        .or_else(|| (container.schema().version() == target).then(|| container.schema()))
        .cloned();
    if let Some(schema) = schema {
        let descriptors: Vec<IndexDescriptor> = schema.index_descriptors().cloned().collect();
        for descriptor in descriptors {
            add_index(container, &schema, &descriptor).await?;
        }
    }
    container.set_current_schema_version(target).await
}

async fn run_stage(
    container: &Arc<Container>,
    migrations: &Migrations,
    stage: &MigrationStage,
) -> Result<()> {
    info!(from = %stage.from, to = %stage.to, "running migration stage");
    let from_schema = migrations
        .schema(stage.from)
        .ok_or_else(|| Error::Internal(format!("no schema for stage source {}", stage.from)))?;
    let to_schema = migrations
        .schema(stage.to)
        .ok_or_else(|| Error::Internal(format!("no schema for stage target {}", stage.to)))?;
    let ctx = MigrationContext::new(Arc::clone(container), to_schema.clone());

    if let StageKind::Custom(hooks) = &stage.kind {
        hooks.will_migrate(&ctx).await?;
    }

    let from_names: BTreeSet<&str> = from_schema.index_descriptors().map(|d| d.name()).collect();
    let to_names: BTreeSet<&str> = to_schema.index_descriptors().map(|d| d.name()).collect();

    for descriptor in to_schema.index_descriptors() {
        if !from_names.contains(descriptor.name()) {
            add_index(container, to_schema, descriptor).await?;
        }
    }
    for name in from_names.difference(&to_names) {
        remove_index(container, from_schema, name, stage.from).await?;
    }

    if let StageKind::Custom(hooks) = &stage.kind {
        hooks.did_migrate(&ctx).await?;
    }

    container.set_current_schema_version(stage.to).await
}

/// Creates, enables and populates one added index.
async fn add_index(
    container: &Arc<Container>,
    schema: &Schema,
    descriptor: &IndexDescriptor,
) -> Result<()> {
    let entity = schema.owning_entity(descriptor.name())?;
    let index = Index::new(descriptor.clone(), container.keyspace());
    // Re-registration across resumed migrations is a no-op.
    match container.index_manager().register(descriptor.clone()) {
        Ok(()) | Err(Error::DuplicateIndex(_)) => {}
        Err(err) => return Err(err),
    }
    match container.index_manager().state(descriptor.name()).await? {
        IndexState::Disabled => container.index_manager().enable(descriptor.name()).await?,
        IndexState::Readable => {
            debug!(index = descriptor.name(), "index already readable, skipping build");
            return Ok(());
        }
        IndexState::WriteOnly => {
            debug!(index = descriptor.name(), "resuming interrupted build");
        }
    }
    OnlineBuilder::new(
        Arc::clone(container),
        descriptor.clone(),
        entity.clone(),
        index,
        container.options().build_batch_size,
    )
    .run()
    .await
}

/// Tombstones, disables and clears one removed index, atomically.
async fn remove_index(
    container: &Arc<Container>,
    from_schema: &Schema,
    name: &str,
    last_version: Version,
) -> Result<()> {
    let descriptor = from_schema
        .index(name)
        .ok_or_else(|| Error::index_not_found(name))?;
    info!(index = name, "removing index");
    let tombstone_key = container.metadata().former_index_key(name);
    let tombstone = Tuple::from_elements(vec![
        TupleElement::Int(i64::from(last_version.major)),
        TupleElement::Int(i64::from(last_version.minor)),
        TupleElement::Int(i64::from(last_version.patch)),
        TupleElement::Int(chrono::Utc::now().timestamp()),
    ])
    .pack();
    // Clear from the bare prefix: aggregate entries with an empty grouping
    // live at the prefix itself.
    let index_subspace = container
        .keyspace()
        .index_subspace(descriptor.subspace_key());
    let (_, end) = index_subspace.range();
    let begin = index_subspace.prefix().to_vec();
    let registry = container.index_manager().registry();
    let tombstone_key = &tombstone_key;
    let tombstone = &tombstone;
    let begin = &begin;
    let end = &end;
    container
        .with_transaction(|txn| async move {
            txn.set(tombstone_key, tombstone);
            registry.disable(&txn, name).await?;
            txn.clear_range(begin, end);
            Ok(())
        })
        .await?;
    container.index_manager().unregister(name);
    Ok(())
}

/// Visits the records under `record_subspace` in id order, a fresh
/// transaction per batch, using the last-seen key as the cursor. Returns the
/// number of records visited; `f` returning `false` stops early.
pub(crate) async fn enumerate_raw(
    db: &Db,
    record_subspace: &Subspace,
    batch_size: usize,
    f: &mut (dyn FnMut(Tuple, Vec<u8>) -> Result<bool> + Send),
) -> Result<u64> {
    let (begin, end) = record_subspace.range();
    let mut cursor = begin;
    let mut visited = 0_u64;
    loop {
        let result = {
            let cursor = &cursor;
            let end = &end;
            db.with_transaction(|txn| async move {
                txn.get_range(
                    cursor,
                    end,
                    RangeOptions {
                        limit: batch_size.max(1),
                        reverse: false,
                        snapshot: true,
                    },
                )
                .await
            })
            .await?
        };
        let done = !result.more || result.entries.is_empty();
        for kv in result.entries {
            cursor = key_after(&kv.key);
            let id = record_subspace.unpack(&kv.key)?;
            visited += 1;
            if !f(id, kv.value)? {
                return Ok(visited);
            }
        }
        if done {
            return Ok(visited);
        }
    }
}
