//! Tuple-prefix namespaces.
//!
//! A [`Subspace`] owns a byte prefix (usually allocated by the directory
//! layer) and packs tuples under it. Every key the runtime persists lives in
//! exactly one subspace; nesting subspaces composes prefixes.

use crate::{
    tuple::{pack_slice, Tuple, TupleElement},
    Error, Result,
};

/// A namespace identified by a byte prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    /// Creates a subspace from a raw prefix.
    ///
    /// Raw prefixes should come from the directory layer or from a parent
    /// subspace; handing out arbitrary prefixes forfeits the layout
    /// guarantees.
    pub fn from_bytes(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The empty-prefix subspace covering the whole keyspace.
    pub fn root() -> Self {
        Self { prefix: Vec::new() }
    }

    /// The raw prefix bytes.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Returns the child subspace obtained by appending a packed tuple to
    /// this prefix.
    pub fn subspace(&self, tuple: &Tuple) -> Self {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(&tuple.pack());
        Self { prefix }
    }

    /// Packs a tuple under this subspace's prefix.
    pub fn pack(&self, tuple: &Tuple) -> Vec<u8> {
        self.pack_slice(tuple.elements())
    }

    /// Packs a slice of elements under this subspace's prefix.
    pub fn pack_slice(&self, elements: &[TupleElement]) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(&pack_slice(elements));
        out
    }

    /// Recovers the tuple a key encodes, stripping this subspace's prefix.
    pub fn unpack(&self, key: &[u8]) -> Result<Tuple> {
        let rest = key.strip_prefix(self.prefix.as_slice()).ok_or_else(|| {
            Error::InvalidArgument("key does not belong to this subspace".into())
        })?;
        Tuple::unpack(rest)
    }

    /// `true` if `key` lies within this subspace.
    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// The `[begin, end)` key range covering every key in this subspace.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut begin = self.prefix.clone();
        begin.push(0x00);
        let mut end = self.prefix.clone();
        end.push(0xFF);
        (begin, end)
    }
}

/// Returns the key immediately after `key` in byte order: the begin selector
/// for resuming a scan past `key`.
pub(crate) fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0x00);
    next
}
