//! Persisted index lifecycle states.
//!
//! Each index has a single persisted state byte controlling whether writers
//! maintain it and whether readers may use it. Legal transitions form a
//! short ladder: `disabled -> write-only -> readable`, with an unconditional
//! escape hatch back to `disabled`. Mutating operations read and write the
//! byte inside one transaction, so racing enablers serialize on the
//! backend's conflict detection.

use std::collections::BTreeMap;

use crate::{
    db::TransactionHandle,
    keyspace::MetadataSpace,
    Error, Result,
};

/// The lifecycle state of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexState {
    /// Writers skip the index; readers must not use it. The default for any
    /// unknown index name.
    Disabled,
    /// Writers maintain entries; readers must not use it yet. The state an
    /// index builds in.
    WriteOnly,
    /// Fully built: writers maintain entries and queries may use them.
    Readable,
}

impl IndexState {
    /// The persisted byte.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::WriteOnly => 1,
            Self::Readable => 2,
        }
    }

    /// Parses the persisted byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::WriteOnly),
            2 => Ok(Self::Readable),
            other => Err(Error::Internal(format!(
                "invalid persisted index state byte {other}"
            ))),
        }
    }

    /// `true` if writers must maintain entries in this state.
    pub fn writes_maintained(self) -> bool {
        self >= Self::WriteOnly
    }
}

/// Transactional storage for per-index states.
#[derive(Debug, Clone)]
pub struct IndexStateRegistry {
    metadata: MetadataSpace,
}

impl IndexStateRegistry {
    /// Creates a registry persisting under the given metadata namespace.
    pub fn new(metadata: MetadataSpace) -> Self {
        Self { metadata }
    }

    /// Reads the state of `name`; an absent byte is `Disabled`.
    pub async fn state(&self, txn: &TransactionHandle, name: &str) -> Result<IndexState> {
        match txn.get(&self.metadata.state_key(name), false).await? {
            Some(bytes) => match bytes.as_slice() {
                [byte] => IndexState::from_byte(*byte),
                other => Err(Error::Internal(format!(
                    "index state value has {} bytes, expected 1",
                    other.len()
                ))),
            },
            None => Ok(IndexState::Disabled),
        }
    }

    /// Reads several states in one transaction.
    pub async fn states(
        &self,
        txn: &TransactionHandle,
        names: &[&str],
    ) -> Result<BTreeMap<String, IndexState>> {
        let mut out = BTreeMap::new();
        for name in names {
            out.insert((*name).to_owned(), self.state(txn, name).await?);
        }
        Ok(out)
    }

    /// `disabled -> write-only`.
    pub async fn enable(&self, txn: &TransactionHandle, name: &str) -> Result<()> {
        self.transition(txn, name, IndexState::Disabled, IndexState::WriteOnly)
            .await
    }

    /// `write-only -> readable`.
    pub async fn make_readable(&self, txn: &TransactionHandle, name: &str) -> Result<()> {
        self.transition(txn, name, IndexState::WriteOnly, IndexState::Readable)
            .await
    }

    /// Unconditional write to `disabled`.
    pub async fn disable(&self, txn: &TransactionHandle, name: &str) -> Result<()> {
        self.write(txn, name, IndexState::Disabled);
        Ok(())
    }

    async fn transition(
        &self,
        txn: &TransactionHandle,
        name: &str,
        required: IndexState,
        target: IndexState,
    ) -> Result<()> {
        let current = self.state(txn, name).await?;
        if current != required {
            return Err(Error::InvalidTransition {
                index: name.to_owned(),
                from: current,
                to: target,
            });
        }
        self.write(txn, name, target);
        Ok(())
    }

    fn write(&self, txn: &TransactionHandle, name: &str, state: IndexState) {
        txn.set(&self.metadata.state_key(name), &[state.as_byte()]);
    }
}
