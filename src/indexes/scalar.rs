//! Scalar and unique-scalar index maintenance.

use async_trait::async_trait;

use crate::{
    db::TransactionHandle,
    key_expr::KeyValues,
    schema::EntityDescriptor,
    tuple::Tuple,
    Error, Result,
};

use super::{Index, IndexMaintainer};

/// Maintains presence entries `[I]/<sub>/<values...>/<id> = ()`.
#[derive(Debug)]
pub struct ScalarMaintainer {
    index: Index,
    entity: EntityDescriptor,
}

impl ScalarMaintainer {
    /// Creates the maintainer.
    pub fn new(index: Index, entity: EntityDescriptor) -> Self {
        Self { index, entity }
    }

    fn values(&self, payload: &[u8]) -> Result<KeyValues> {
        self.entity.eval(payload, self.index.expression())
    }
}

#[async_trait]
impl IndexMaintainer for ScalarMaintainer {
    async fn update(
        &self,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
        id: &Tuple,
        txn: &TransactionHandle,
    ) -> Result<()> {
        if let Some(old) = old {
            let values = self.values(old)?;
            txn.clear(&self.index.entry_key(&values, id));
        }
        if let Some(new) = new {
            let values = self.values(new)?;
            txn.set(&self.index.entry_key(&values, id), &[]);
        }
        Ok(())
    }
}

/// Maintains unique entries `[I]/<sub>/<values...> = packed id`.
///
/// An insert whose values are already claimed by a different record fails
/// with [`Error::UniqueConstraint`], aborting the surrounding save.
#[derive(Debug)]
pub struct UniqueMaintainer {
    index: Index,
    entity: EntityDescriptor,
}

impl UniqueMaintainer {
    /// Creates the maintainer.
    pub fn new(index: Index, entity: EntityDescriptor) -> Self {
        Self { index, entity }
    }

    fn values(&self, payload: &[u8]) -> Result<KeyValues> {
        self.entity.eval(payload, self.index.expression())
    }
}

#[async_trait]
impl IndexMaintainer for UniqueMaintainer {
    async fn update(
        &self,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
        id: &Tuple,
        txn: &TransactionHandle,
    ) -> Result<()> {
        if let Some(old) = old {
            let values = self.values(old)?;
            txn.clear(&self.index.group_key(&values));
        }
        if let Some(new) = new {
            let key = self.index.group_key(&self.values(new)?);
            let packed_id = id.pack();
            // The read records a conflict range, so two racing claimants
            // cannot both commit.
            if let Some(existing) = txn.get(&key, false).await? {
                if existing != packed_id {
                    return Err(Error::UniqueConstraint {
                        index: self.index.name().to_owned(),
                    });
                }
            }
            txn.set(&key, &packed_id);
        }
        Ok(())
    }
}
