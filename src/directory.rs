//! The directory layer interface.
//!
//! FoundationDB's directory layer maps human-readable hierarchical paths to
//! short allocated byte prefixes. The runtime consumes it through the
//! [`DirectoryLayer`] trait; the [`Container`](crate::Container) owns one
//! instance for its whole lifetime and is the only way to reach it.

use async_trait::async_trait;

use std::fmt;

use crate::{db::TransactionHandle, Result, Subspace};

/// A client-side directory layer over the key-value store.
///
/// All operations run inside the supplied transaction; callers (normally the
/// `Container`) wrap them in the standard retry loop.
#[async_trait]
pub trait DirectoryLayer: Send + Sync + fmt::Debug {
    /// Opens the directory at `path`, creating it (and missing parents) if
    /// absent.
    async fn create_or_open(&self, txn: &TransactionHandle, path: &[&str]) -> Result<Subspace>;

    /// Creates the directory at `path`, optionally with a caller-chosen
    /// prefix. Fails if it already exists.
    async fn create(
        &self,
        txn: &TransactionHandle,
        path: &[&str],
        prefix: Option<Vec<u8>>,
    ) -> Result<Subspace>;

    /// Opens the directory at `path`; fails if it does not exist.
    async fn open(&self, txn: &TransactionHandle, path: &[&str]) -> Result<Subspace>;

    /// Moves the directory at `old_path` to `new_path`, keeping its prefix.
    async fn move_to(
        &self,
        txn: &TransactionHandle,
        old_path: &[&str],
        new_path: &[&str],
    ) -> Result<Subspace>;

    /// Removes the directory at `path` and all of its contents.
    async fn remove(&self, txn: &TransactionHandle, path: &[&str]) -> Result<bool>;

    /// `true` if the directory at `path` exists.
    async fn exists(&self, txn: &TransactionHandle, path: &[&str]) -> Result<bool>;
}
