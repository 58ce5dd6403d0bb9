//! The online index builder.
//!
//! Populates a `write-only` index from existing records in batches, each
//! batch a fresh transaction, with a persisted cursor at
//! `_metadata/progress/<index>` marking the key range still to scan. The
//! cursor makes the build resumable: a transient failure or a process death
//! preserves it, and the next invocation continues where the last committed
//! batch stopped. On completion the cursor is cleared and the index promoted
//! to `readable` in the same transaction, so the promotion happens at most
//! once even with competing builders.

use tracing::{debug, info};

use std::sync::Arc;

use crate::{
    container::Container,
    db::RangeOptions,
    indexes::{BuildInputs, Index, IndexMaintainer},
    schema::{EntityDescriptor, IndexDescriptor},
    subspace::key_after,
    Result,
};

use super::context::BatchBudget;

/// Builds one index online.
#[derive(Debug)]
pub struct OnlineBuilder {
    container: Arc<Container>,
    descriptor: IndexDescriptor,
    entity: EntityDescriptor,
    index: Index,
    batch_size: usize,
}

impl OnlineBuilder {
    /// Creates a builder for `descriptor` over the records of `entity`.
    pub fn new(
        container: Arc<Container>,
        descriptor: IndexDescriptor,
        entity: EntityDescriptor,
        index: Index,
        batch_size: usize,
    ) -> Self {
        Self {
            container,
            descriptor,
            entity,
            index,
            batch_size: batch_size.max(1),
        }
    }

    /// Runs the build to completion and promotes the index to `readable`.
    ///
    /// On a transient failure the persisted cursor survives and a later
    /// `run` resumes from it; on an unrecoverable failure the index stays
    /// `write-only` for the operator to disable or retry.
    pub async fn run(&self) -> Result<()> {
        let maintainer = self
            .descriptor
            .kind()
            .maintainer(&self.index, &self.entity);

        if let Some(strategy) = maintainer.build_strategy() {
            info!(index = self.descriptor.name(), "delegating to custom build strategy");
            strategy
                .build(&BuildInputs {
                    db: self.container.db().clone(),
                    type_name: self.entity.type_name().to_owned(),
                    record_subspace: self
                        .container
                        .keyspace()
                        .record_subspace(self.entity.type_name()),
                    index: self.index.clone(),
                    entity: self.entity.clone(),
                    batch_size: self.batch_size,
                })
                .await?;
            self.finish().await?;
            info!(index = self.descriptor.name(), "custom build complete");
            return Ok(());
        }

        let mut total = 0_u64;
        loop {
            let (scanned, done) = self.build_batch(maintainer.as_ref()).await?;
            total += scanned;
            debug!(
                index = self.descriptor.name(),
                scanned, total, "committed build batch"
            );
            if done {
                break;
            }
        }
        info!(index = self.descriptor.name(), records = total, "online build complete");
        Ok(())
    }

    /// Scans up to one batch of records in a fresh transaction. Returns the
    /// number of records scanned and whether the build finished (in which
    /// case the cursor was cleared and the index promoted in that same
    /// transaction).
    async fn build_batch(&self, maintainer: &dyn IndexMaintainer) -> Result<(u64, bool)> {
        let record_subspace = self
            .container
            .keyspace()
            .record_subspace(self.entity.type_name());
        let progress_key = self
            .container
            .metadata()
            .progress_key(self.descriptor.name());
        let registry = self.container.index_manager().registry();
        let name = self.descriptor.name();
        let batch_size = self.batch_size;

        let record_subspace = &record_subspace;
        let progress_key = &progress_key;
        self.container
            .with_transaction(|txn| async move {
                let (range_begin, range_end) = record_subspace.range();
                let begin = txn
                    .get(progress_key, false)
                    .await?
                    .unwrap_or(range_begin);
                let result = txn
                    .get_range(
                        &begin,
                        &range_end,
                        RangeOptions {
                            limit: batch_size,
                            reverse: false,
                            snapshot: false,
                        },
                    )
                    .await?;

                let mut budget = BatchBudget::start();
                let mut scanned = 0_u64;
                let mut last_key: Option<&[u8]> = None;
                for kv in &result.entries {
                    let id = record_subspace.unpack(&kv.key)?;
                    maintainer.scan(&kv.value, &id, &txn).await?;
                    budget.charge(kv.key.len() + kv.value.len());
                    scanned += 1;
                    last_key = Some(&kv.key);
                    if budget.exhausted() {
                        break;
                    }
                }

                let consumed_all = scanned as usize == result.entries.len();
                let done = consumed_all && !result.more;
                if done {
                    txn.clear(progress_key);
                    registry.make_readable(&txn, name).await?;
                } else if let Some(last) = last_key {
                    txn.set(progress_key, &key_after(last));
                }
                Ok((scanned, done))
            })
            .await
    }

    /// Clears the cursor and promotes in one transaction; used after a
    /// custom strategy finishes.
    async fn finish(&self) -> Result<()> {
        let progress_key = self
            .container
            .metadata()
            .progress_key(self.descriptor.name());
        let registry = self.container.index_manager().registry();
        let name = self.descriptor.name();
        let progress_key = &progress_key;
        self.container
            .with_transaction(|txn| async move {
                txn.clear(progress_key);
                registry.make_readable(&txn, name).await
            })
            .await
    }
}
