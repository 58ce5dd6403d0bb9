//! Key expressions: computing composite index keys from records.
//!
//! A [`KeyExpression`] is a small tree evaluated against a decoded record to
//! produce the ordered list of tuple elements an index entry is keyed by.
//! Dotted field paths in index descriptors become [`KeyExpression::Nest`]
//! chains.

use smallvec::SmallVec;

use crate::{tuple::TupleElement, Error, Result};

/// Field values produced by evaluating a key expression.
pub type KeyValues = SmallVec<[TupleElement; 4]>;

/// Access to the fields of a decoded record.
///
/// Implementors resolve dotted paths themselves (`"address.city"` names the
/// `city` field of the nested `address` value). Returning `None` means the
/// record does not declare the field at all, which evaluation treats as a
/// caller error.
pub trait FieldAccess {
    /// The value of the field at `path`, as a tuple element.
    fn field(&self, path: &str) -> Option<TupleElement>;
}

/// Which side of a range a [`KeyExpression::RangeBoundary`] bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Inclusive lower bound.
    Lower,
    /// Exclusive upper bound.
    Upper,
}

/// A tree producing a list of tuple elements from a record.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyExpression {
    /// The value of one field.
    Field(String),
    /// The concatenation of child expressions, in order.
    Concat(Vec<KeyExpression>),
    /// A fixed element independent of the record.
    Literal(TupleElement),
    /// No elements.
    Empty,
    /// A child expression evaluated inside a nested value.
    Nest {
        /// Field holding the nested value.
        parent: String,
        /// Expression evaluated against the nested value.
        child: Box<KeyExpression>,
    },
    /// A field value marking one side of a range scan.
    RangeBoundary {
        /// The bounded field.
        field: String,
        /// Which side it bounds.
        boundary: Boundary,
    },
}

impl KeyExpression {
    /// Number of tuple elements this expression contributes.
    pub fn column_count(&self) -> usize {
        match self {
            Self::Field(_) | Self::Literal(_) | Self::RangeBoundary { .. } => 1,
            Self::Concat(children) => children.iter().map(Self::column_count).sum(),
            Self::Empty => 0,
            Self::Nest { child, .. } => child.column_count(),
        }
    }

    /// Builds the expression for an index's field paths: one `Field` per
    /// path, dotted paths become `Nest` chains, several paths concatenate.
    pub fn from_key_paths<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut children: Vec<Self> = paths
            .iter()
            .map(|path| Self::from_dotted_path(path.as_ref()))
            .collect();
        match children.len() {
            0 => Self::Empty,
            1 => children.pop().expect("one child"),
            _ => Self::Concat(children),
        }
    }

    fn from_dotted_path(path: &str) -> Self {
        match path.split_once('.') {
            Some((parent, rest)) => Self::Nest {
                parent: parent.to_owned(),
                child: Box::new(Self::from_dotted_path(rest)),
            },
            None => Self::Field(path.to_owned()),
        }
    }

    /// Evaluates the expression against a record.
    ///
    /// The output length always equals [`column_count`](Self::column_count).
    /// A field the record does not declare fails with
    /// [`Error::InvalidArgument`].
    pub fn evaluate(&self, record: &dyn FieldAccess) -> Result<KeyValues> {
        let mut out = KeyValues::new();
        self.evaluate_into(record, "", &mut out)?;
        Ok(out)
    }

    fn evaluate_into(
        &self,
        record: &dyn FieldAccess,
        prefix: &str,
        out: &mut KeyValues,
    ) -> Result<()> {
        match self {
            Self::Field(name) | Self::RangeBoundary { field: name, .. } => {
                let path = join_path(prefix, name);
                let value = record
                    .field(&path)
                    .ok_or_else(|| Error::InvalidArgument(format!("unknown field `{path}`")))?;
                out.push(value);
                Ok(())
            }
            Self::Concat(children) => {
                for child in children {
                    child.evaluate_into(record, prefix, out)?;
                }
                Ok(())
            }
            Self::Literal(element) => {
                out.push(element.clone());
                Ok(())
            }
            Self::Empty => Ok(()),
            Self::Nest { parent, child } => {
                let path = join_path(prefix, parent);
                child.evaluate_into(record, &path, out)
            }
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}
