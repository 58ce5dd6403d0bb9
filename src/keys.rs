//! A definition of `PrimaryKey` trait and implementations for common types.

use uuid::Uuid;

use crate::{
    id::RecordId,
    tuple::{Tuple, TupleElement},
    Error, Result,
};

/// A type usable as a record id.
///
/// Primary keys must be tuple-packable and totally ordered; the encoded form
/// determines the physical order of records within a type's subspace. The
/// default generator is [`RecordId`]; 64-bit integers, strings, UUIDs and
/// small tuples of these are equally valid.
pub trait PrimaryKey: Send + Sync {
    /// Renders the key as tuple elements.
    fn to_tuple(&self) -> Tuple;

    /// Restores the key from tuple elements.
    fn from_tuple(tuple: &Tuple) -> Result<Self>
    where
        Self: Sized;
}

fn single(tuple: &Tuple) -> Result<&TupleElement> {
    match tuple.elements() {
        [element] => Ok(element),
        other => Err(Error::InvalidArgument(format!(
            "expected a single-element key tuple, got {} elements",
            other.len()
        ))),
    }
}

impl PrimaryKey for i64 {
    fn to_tuple(&self) -> Tuple {
        Tuple::from_element(*self)
    }

    fn from_tuple(tuple: &Tuple) -> Result<Self> {
        match single(tuple)? {
            TupleElement::Int(value) => Ok(*value),
            other => Err(Error::InvalidArgument(format!(
                "expected an integer key, got {other:?}"
            ))),
        }
    }
}

impl PrimaryKey for String {
    fn to_tuple(&self) -> Tuple {
        Tuple::from_element(self.as_str())
    }

    fn from_tuple(tuple: &Tuple) -> Result<Self> {
        match single(tuple)? {
            TupleElement::String(value) => Ok(value.clone()),
            other => Err(Error::InvalidArgument(format!(
                "expected a string key, got {other:?}"
            ))),
        }
    }
}

impl PrimaryKey for Uuid {
    fn to_tuple(&self) -> Tuple {
        Tuple::from_element(*self)
    }

    fn from_tuple(tuple: &Tuple) -> Result<Self> {
        match single(tuple)? {
            TupleElement::Uuid(value) => Ok(*value),
            other => Err(Error::InvalidArgument(format!(
                "expected a uuid key, got {other:?}"
            ))),
        }
    }
}

impl PrimaryKey for RecordId {
    fn to_tuple(&self) -> Tuple {
        Tuple::from_element(self.to_string())
    }

    fn from_tuple(tuple: &Tuple) -> Result<Self> {
        match single(tuple)? {
            TupleElement::String(value) => value.parse(),
            other => Err(Error::InvalidArgument(format!(
                "expected a record-id key, got {other:?}"
            ))),
        }
    }
}

impl<A: PrimaryKey, B: PrimaryKey> PrimaryKey for (A, B) {
    fn to_tuple(&self) -> Tuple {
        let mut tuple = self.0.to_tuple();
        for element in self.1.to_tuple().into_elements() {
            tuple.push(element);
        }
        tuple
    }

    fn from_tuple(tuple: &Tuple) -> Result<Self> {
        // Both halves must be single-element keys for the split to be
        // unambiguous.
        match tuple.elements() {
            [a, b] => Ok((
                A::from_tuple(&Tuple::from_elements(vec![a.clone()]))?,
                B::from_tuple(&Tuple::from_elements(vec![b.clone()]))?,
            )),
            other => Err(Error::InvalidArgument(format!(
                "expected a two-element key tuple, got {} elements",
                other.len()
            ))),
        }
    }
}
