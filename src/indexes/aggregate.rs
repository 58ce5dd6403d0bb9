//! Aggregation index maintenance: count, sum, min and max.
//!
//! Each grouping prefix owns one key. Count and sum accumulate through the
//! backend's little-endian `Add` operation, so concurrent writers never
//! conflict on the accumulator. Min and max keep the smallest respectively
//! largest value ever observed via the `Min`/`Max` operations; deleting a
//! record does not shrink the extreme.

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};

use crate::{
    db::{AtomicOp, TransactionHandle},
    key_expr::KeyValues,
    schema::EntityDescriptor,
    tuple::{Tuple, TupleElement},
    Error, Result,
};

use super::{Index, IndexMaintainer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateOp {
    Count,
    Sum,
    Min,
    Max,
}

/// Maintains one accumulator key per grouping prefix.
///
/// For `Count` every key path is a grouping field. For `Sum`, `Min` and
/// `Max` the last key path names the aggregated field, which must evaluate
/// to an integer; the preceding paths form the grouping prefix.
#[derive(Debug)]
pub struct AggregateMaintainer {
    index: Index,
    entity: EntityDescriptor,
    op: AggregateOp,
}

impl AggregateMaintainer {
    /// A record counter.
    pub fn count(index: Index, entity: EntityDescriptor) -> Self {
        Self::new(index, entity, AggregateOp::Count)
    }

    /// A running sum.
    pub fn sum(index: Index, entity: EntityDescriptor) -> Self {
        Self::new(index, entity, AggregateOp::Sum)
    }

    /// A smallest-ever tracker.
    pub fn min(index: Index, entity: EntityDescriptor) -> Self {
        Self::new(index, entity, AggregateOp::Min)
    }

    /// A largest-ever tracker.
    pub fn max(index: Index, entity: EntityDescriptor) -> Self {
        Self::new(index, entity, AggregateOp::Max)
    }

    fn new(index: Index, entity: EntityDescriptor, op: AggregateOp) -> Self {
        Self { index, entity, op }
    }

    /// Splits evaluated values into the grouping prefix and the aggregated
    /// operand.
    fn split(&self, payload: &[u8]) -> Result<(KeyValues, i64)> {
        let mut values = self.entity.eval(payload, self.index.expression())?;
        match self.op {
            AggregateOp::Count => Ok((values, 1)),
            _ => {
                let operand = match values.pop() {
                    Some(TupleElement::Int(value)) => value,
                    Some(other) => {
                        return Err(Error::InvalidArgument(format!(
                            "index `{}` aggregates a non-integer value: {other:?}",
                            self.index.name()
                        )))
                    }
                    None => {
                        return Err(Error::Internal(format!(
                            "index `{}` has no aggregated column",
                            self.index.name()
                        )))
                    }
                };
                Ok((values, operand))
            }
        }
    }

    fn add(&self, txn: &TransactionHandle, group: &KeyValues, delta: i64) {
        if delta != 0 {
            txn.atomic_op(AtomicOp::Add, &self.index.group_key(group), &le_bytes(delta));
        }
    }

    fn observe(&self, txn: &TransactionHandle, group: &KeyValues, value: i64) -> Result<()> {
        if value < 0 {
            return Err(Error::InvalidArgument(format!(
                "index `{}` tracks extremes of non-negative integers, got {value}",
                self.index.name()
            )));
        }
        let op = if self.op == AggregateOp::Min {
            AtomicOp::Min
        } else {
            AtomicOp::Max
        };
        txn.atomic_op(op, &self.index.group_key(group), &le_bytes(value));
        Ok(())
    }
}

fn le_bytes(value: i64) -> [u8; 8] {
    let mut out = [0; 8];
    LittleEndian::write_i64(&mut out, value);
    out
}

#[async_trait]
impl IndexMaintainer for AggregateMaintainer {
    async fn update(
        &self,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
        _id: &Tuple,
        txn: &TransactionHandle,
    ) -> Result<()> {
        let old = old.map(|payload| self.split(payload)).transpose()?;
        let new = new.map(|payload| self.split(payload)).transpose()?;
        match self.op {
            AggregateOp::Count | AggregateOp::Sum => match (old, new) {
                (None, Some((group, value))) => self.add(txn, &group, value),
                (Some((group, value)), None) => self.add(txn, &group, -value),
                (Some((old_group, old_value)), Some((new_group, new_value))) => {
                    if old_group == new_group {
                        self.add(txn, &old_group, new_value - old_value);
                    } else {
                        self.add(txn, &old_group, -old_value);
                        self.add(txn, &new_group, new_value);
                    }
                }
                (None, None) => {}
            },
            AggregateOp::Min | AggregateOp::Max => {
                // Extremes only ever widen; removals keep the watermark.
                if let Some((group, value)) = new {
                    self.observe(txn, &group, value)?;
                }
            }
        }
        Ok(())
    }
}
