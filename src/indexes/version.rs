//! Commit-version index maintenance.
//!
//! The forward entry keys each record by the 80-bit versionstamp the cluster
//! assigns at commit: `[I]/<sub>/<stamp>/<id> = ()`. Because the stamp is
//! unknown until commit, the entry is written through the
//! `SetVersionstampedKey` atomic operation. A companion entry
//! `[I]/<sub>/"_v"/<id> = <stamp>` (written with `SetVersionstampedValue` in
//! the same commit) lets later point deletes reconstruct and clear the
//! forward key without scanning.

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};

use crate::{
    db::{AtomicOp, TransactionHandle},
    schema::EntityDescriptor,
    tuple::{Tuple, TupleElement, Versionstamp},
    Error, Result,
};

use super::{Index, IndexMaintainer};

const COMPANION_SEGMENT: &str = "_v";

/// Maintains versionstamp-keyed entries.
#[derive(Debug)]
pub struct VersionMaintainer {
    index: Index,
    #[allow(dead_code)]
    entity: EntityDescriptor,
}

impl VersionMaintainer {
    /// Creates the maintainer. Entries depend only on ids and commit
    /// versions, never on payload fields.
    pub fn new(index: Index, entity: EntityDescriptor) -> Self {
        Self { index, entity }
    }

    fn companion_key(&self, id: &Tuple) -> Vec<u8> {
        let mut elements = vec![TupleElement::String(COMPANION_SEGMENT.into())];
        elements.extend_from_slice(id.elements());
        self.index.subspace().pack_slice(&elements)
    }

    fn forward_key(&self, stamp: Versionstamp, id: &Tuple) -> Vec<u8> {
        let mut elements = vec![TupleElement::Versionstamp(stamp)];
        elements.extend_from_slice(id.elements());
        self.index.subspace().pack_slice(&elements)
    }

    fn write_stamped(&self, id: &Tuple, txn: &TransactionHandle) -> Result<()> {
        let mut elements = vec![TupleElement::Versionstamp(Versionstamp::incomplete(0))];
        elements.extend_from_slice(id.elements());
        let key = Tuple::from_elements(elements)
            .pack_with_versionstamp(self.index.subspace().prefix())?;
        txn.atomic_op(AtomicOp::SetVersionstampedKey, &key, &[]);

        // Companion value: the 12-byte stamp with the tx part substituted at
        // commit (offset 0).
        let mut param = Versionstamp::incomplete(0).as_bytes().to_vec();
        let mut offset = [0; 4];
        LittleEndian::write_u32(&mut offset, 0);
        param.extend_from_slice(&offset);
        txn.atomic_op(AtomicOp::SetVersionstampedValue, &self.companion_key(id), &param);
        Ok(())
    }

    async fn clear_stamped(&self, id: &Tuple, txn: &TransactionHandle) -> Result<()> {
        let companion = self.companion_key(id);
        match txn.get(&companion, false).await? {
            Some(raw) => {
                let stamp: [u8; 12] = raw.as_slice().try_into().map_err(|_| {
                    Error::Internal(format!(
                        "index `{}`: companion entry has {} bytes, expected 12",
                        self.index.name(),
                        raw.len()
                    ))
                })?;
                txn.clear(&self.forward_key(Versionstamp::from_bytes(stamp), id));
                txn.clear(&companion);
            }
            // The record was written in this same transaction; its stamp is
            // not readable yet, and the versionstamped writes below (if any)
            // supersede it.
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl IndexMaintainer for VersionMaintainer {
    async fn update(
        &self,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
        id: &Tuple,
        txn: &TransactionHandle,
    ) -> Result<()> {
        if old.is_some() {
            self.clear_stamped(id, txn).await?;
        }
        if new.is_some() {
            // Updates re-stamp: the entry tracks the latest commit that
            // touched the record.
            self.write_stamped(id, txn)?;
        }
        Ok(())
    }
}
