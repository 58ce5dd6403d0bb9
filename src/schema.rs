//! Schema metadata: entity and index descriptors.
//!
//! A [`Schema`] is an ordered collection of [`EntityDescriptor`]s plus a
//! version triple. Entities are registered through the typed [`Record`]
//! trait; the descriptor erases the concrete type into closures so the rest
//! of the engine (index maintenance, migrations, the online builder) can
//! work on encoded payloads without knowing record types.

use std::{borrow::Cow, fmt, sync::Arc};

use crate::{
    key_expr::{FieldAccess, KeyExpression, KeyValues},
    tuple::Tuple,
    values::BinaryValue,
    Error, Result,
};

/// A schema version triple. Ordering is lexicographic over
/// `(major, minor, patch)`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Version {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

impl Version {
    /// Creates a version triple.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The kind of an index, with kind-specific parameters.
///
/// The built-in kinds cover scalar lookup, uniqueness, aggregation and
/// commit-version tracking. Pluggable kinds (vector, full-text and the like)
/// plug in through [`MaintainerFactory`](crate::indexes::MaintainerFactory):
/// the factory bridges from descriptor to the maintainer implementing the
/// kind's on-disk format.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum IndexKind {
    /// Plain scalar entries: one presence key per record.
    Scalar,
    /// Scalar entries with a uniqueness constraint; the entry value holds
    /// the owning record's packed id.
    Unique,
    /// Running count per grouping prefix.
    Count,
    /// Running sum per grouping prefix; the last key path names the summed
    /// field.
    Sum,
    /// Smallest value ever observed per grouping prefix; the last key path
    /// names the compared field.
    Min,
    /// Largest value ever observed per grouping prefix; the last key path
    /// names the compared field.
    Max,
    /// Entries keyed by the commit versionstamp.
    Version,
    /// A pluggable kind delegating to its own maintainer.
    Custom(Arc<dyn crate::indexes::MaintainerFactory>),
}

/// Static metadata for one index.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    name: String,
    type_name: Option<String>,
    key_paths: Vec<String>,
    kind: IndexKind,
    subspace_key: String,
}

impl IndexDescriptor {
    /// Creates a descriptor for an index on one record type. The subspace
    /// key defaults to the index name.
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        type_name: impl Into<String>,
        key_paths: Vec<S>,
        kind: IndexKind,
    ) -> Self {
        let name = name.into();
        Self {
            subspace_key: name.clone(),
            name,
            type_name: Some(type_name.into()),
            key_paths: key_paths.into_iter().map(Into::into).collect(),
            kind,
        }
    }

    /// Creates a universal descriptor applying to every record type.
    pub fn universal<S: Into<String>>(
        name: impl Into<String>,
        key_paths: Vec<S>,
        kind: IndexKind,
    ) -> Self {
        let name = name.into();
        Self {
            subspace_key: name.clone(),
            name,
            type_name: None,
            key_paths: key_paths.into_iter().map(Into::into).collect(),
            kind,
        }
    }

    /// Overrides the subspace key.
    #[must_use]
    pub fn with_subspace_key(mut self, subspace_key: impl Into<String>) -> Self {
        self.subspace_key = subspace_key.into();
        self
    }

    /// The index name, unique across a schema.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning record type, or `None` for a universal index.
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// The indexed field paths, dot-notation allowed.
    pub fn key_paths(&self) -> &[String] {
        &self.key_paths
    }

    /// The index kind.
    pub fn kind(&self) -> &IndexKind {
        &self.kind
    }

    /// The segment under `"I"` holding this index's entries.
    pub fn subspace_key(&self) -> &str {
        &self.subspace_key
    }

    /// `true` if this index maintains entries for records of `type_name`.
    pub fn applies_to(&self, type_name: &str) -> bool {
        self.type_name.as_deref().map_or(true, |t| t == type_name)
    }

    /// The key expression derived from the field paths.
    pub fn key_expression(&self) -> KeyExpression {
        KeyExpression::from_key_paths(&self.key_paths)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("index name must not be empty".into()));
        }
        if self.subspace_key.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "index `{}` has an empty subspace key",
                self.name
            )));
        }
        let needs_paths = matches!(
            self.kind,
            IndexKind::Scalar | IndexKind::Unique | IndexKind::Sum | IndexKind::Min | IndexKind::Max
        );
        if needs_paths && self.key_paths.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "index `{}` requires at least one key path",
                self.name
            )));
        }
        Ok(())
    }
}

/// A typed record: the seam through which applications register their types.
///
/// Combines the payload codec ([`BinaryValue`]), field access for index
/// maintenance ([`FieldAccess`]) and the primary key. The runtime reflects
/// over instances only through these three capabilities.
pub trait Record: BinaryValue + FieldAccess + Send + Sync + 'static {
    /// The stable type name records of this type are stored under.
    const TYPE_NAME: &'static str;

    /// The record's primary key as a tuple.
    fn primary_key(&self) -> Tuple;
}

type ErasedEval = Arc<dyn Fn(&[u8], &KeyExpression) -> Result<KeyValues> + Send + Sync>;

/// Per-record-type metadata supplied at schema registration.
///
/// Carries the ordered field list, the entity's index descriptors and an
/// erased accessor that decodes a payload and evaluates a [`KeyExpression`]
/// against it.
#[derive(Clone)]
pub struct EntityDescriptor {
    type_name: String,
    fields: Vec<String>,
    indexes: Vec<IndexDescriptor>,
    eval: ErasedEval,
}

impl EntityDescriptor {
    /// Describes the record type `R` with its declared fields and indexes.
    pub fn new<R: Record>(fields: &[&str], indexes: Vec<IndexDescriptor>) -> Self {
        let eval: ErasedEval = Arc::new(|payload, expr| {
            let record = R::from_bytes(Cow::Borrowed(payload)).map_err(Error::Serialization)?;
            expr.evaluate(&record)
        });
        Self {
            type_name: R::TYPE_NAME.to_owned(),
            fields: fields.iter().map(|&field| field.to_owned()).collect(),
            indexes,
            eval,
        }
    }

    /// The stable type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Declared field names, in order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The entity's index descriptors.
    pub fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    /// Looks up one of the entity's index descriptors by name.
    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|descriptor| descriptor.name() == name)
    }

    /// Decodes `payload` and evaluates `expr` against the decoded record.
    pub fn eval(&self, payload: &[u8], expr: &KeyExpression) -> Result<KeyValues> {
        (self.eval)(payload, expr)
    }
}

impl fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("type_name", &self.type_name)
            .field("fields", &self.fields)
            .field("indexes", &self.indexes)
            .finish_non_exhaustive()
    }
}

/// An ordered collection of entity descriptors under one version.
#[derive(Debug, Clone)]
pub struct Schema {
    version: Version,
    entities: Vec<EntityDescriptor>,
}

impl Schema {
    /// Creates a schema, validating that index names are unique across all
    /// entities and that every descriptor is well-formed.
    pub fn new(version: Version, entities: Vec<EntityDescriptor>) -> Result<Self> {
        let mut seen = std::collections::BTreeSet::new();
        for entity in &entities {
            for descriptor in entity.indexes() {
                descriptor.validate()?;
                if let Some(owner) = descriptor.type_name() {
                    if owner != entity.type_name() {
                        return Err(Error::InvalidArgument(format!(
                            "index `{}` claims type `{owner}` but is declared by `{}`",
                            descriptor.name(),
                            entity.type_name()
                        )));
                    }
                }
                if !seen.insert(descriptor.name().to_owned()) {
                    return Err(Error::DuplicateIndex(descriptor.name().to_owned()));
                }
            }
        }
        Ok(Self { version, entities })
    }

    /// The schema version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The entity descriptors, in registration order.
    pub fn entities(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    /// Looks up an entity by type name.
    pub fn entity(&self, type_name: &str) -> Option<&EntityDescriptor> {
        self.entities
            .iter()
            .find(|entity| entity.type_name() == type_name)
    }

    /// All index descriptors across the schema.
    pub fn index_descriptors(&self) -> impl Iterator<Item = &IndexDescriptor> {
        self.entities.iter().flat_map(EntityDescriptor::indexes)
    }

    /// Looks up an index descriptor by name.
    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.index_descriptors()
            .find(|descriptor| descriptor.name() == name)
    }

    /// The sole entity declaring the named index.
    ///
    /// Zero matches is a [`Error::NotFound`]; several matches would mean the
    /// uniqueness invariant is broken and is an internal error.
    pub fn owning_entity(&self, index_name: &str) -> Result<&EntityDescriptor> {
        let mut owners = self
            .entities
            .iter()
            .filter(|entity| entity.index(index_name).is_some());
        let first = owners
            .next()
            .ok_or_else(|| Error::index_not_found(index_name))?;
        if owners.next().is_some() {
            return Err(Error::Internal(format!(
                "index `{index_name}` is claimed by multiple entities"
            )));
        }
        Ok(first)
    }
}
