//! A definition of `BinaryValue` trait, the record codec seam.

use anyhow::Result;

use std::borrow::Cow;

/// A type serializable as a record payload.
///
/// The runtime never inspects payload bytes except through this trait and the
/// field accessors of [`Record`](crate::Record); the encoding is entirely the
/// application's choice. The encoding must be deterministic: changing it for
/// an existing type requires a schema migration.
pub trait BinaryValue: Sized {
    /// Serializes the value.
    fn to_bytes(&self) -> Vec<u8>;

    /// Deserializes a value previously produced by [`to_bytes`].
    ///
    /// [`to_bytes`]: Self::to_bytes
    fn from_bytes(bytes: Cow<'_, [u8]>) -> Result<Self>;
}

impl BinaryValue for Vec<u8> {
    fn to_bytes(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> Result<Self> {
        Ok(bytes.into_owned())
    }
}

impl BinaryValue for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> Result<Self> {
        Ok(Self::from_utf8(bytes.into_owned())?)
    }
}
