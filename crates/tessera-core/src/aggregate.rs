//! Aggregates computed over the cells a read produces.
//!
//! Aggregates see every cell the copy engine emits, weighted by how many
//! times it is selected, without the cells needing an output buffer. Each
//! parallel copy task folds into a fresh partial which is merged into the
//! query's aggregate afterwards.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::schema::{Datatype, FieldInfo, FieldKind};

/// Result of an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AggregateValue {
    /// No non-null input.
    Null,
    UInt(u64),
    Int(i64),
    Float(f64),
    String(String),
}

/// Built-in aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    NullCount,
}

/// An aggregate operator.
pub trait Aggregator: Send + Sync + fmt::Debug {
    /// Field the aggregate reads; `None` when it only counts cells.
    fn field(&self) -> Option<&str>;

    /// Check the field and remember its datatype.
    fn bind(&mut self, info: &FieldInfo) -> Result<()>;

    /// Empty aggregate of the same kind and binding.
    fn partial(&self) -> Box<dyn Aggregator>;

    /// Fold a value selected `count` times; `None` is a null.
    fn update(&mut self, value: Option<&[u8]>, count: u64) -> Result<()>;

    /// Fold a partial produced by [`Aggregator::partial`].
    fn merge(&mut self, partial: &dyn Aggregator) -> Result<()>;

    /// Current result.
    fn value(&self) -> AggregateValue;

    fn as_any(&self) -> &dyn Any;
}

/// Constructors for the built-in aggregates.
pub struct Aggregate;

impl Aggregate {
    /// Number of cells.
    pub fn count() -> Box<dyn Aggregator> {
        Box::new(CountAggregator::default())
    }

    /// Sum of a numeric field, nulls ignored. Saturates on overflow.
    pub fn sum(field: impl Into<String>) -> Box<dyn Aggregator> {
        Box::new(SumAggregator::new(field.into()))
    }

    /// Smallest value of a field.
    pub fn min(field: impl Into<String>) -> Box<dyn Aggregator> {
        Box::new(ExtremeAggregator::new(field.into(), AggregateFunction::Min))
    }

    /// Largest value of a field.
    pub fn max(field: impl Into<String>) -> Box<dyn Aggregator> {
        Box::new(ExtremeAggregator::new(field.into(), AggregateFunction::Max))
    }

    /// Number of nulls in a nullable field.
    pub fn null_count(field: impl Into<String>) -> Box<dyn Aggregator> {
        Box::new(NullCountAggregator::new(field.into()))
    }
}

fn mismatch(name: &str) -> Error {
    Error::Internal(format!("cannot merge a different aggregate into {name}"))
}

#[derive(Debug, Clone, Default)]
struct CountAggregator {
    count: u64,
}

impl Aggregator for CountAggregator {
    fn field(&self) -> Option<&str> {
        None
    }

    fn bind(&mut self, _info: &FieldInfo) -> Result<()> {
        Ok(())
    }

    fn partial(&self) -> Box<dyn Aggregator> {
        Box::new(Self::default())
    }

    fn update(&mut self, _value: Option<&[u8]>, count: u64) -> Result<()> {
        self.count += count;
        Ok(())
    }

    fn merge(&mut self, partial: &dyn Aggregator) -> Result<()> {
        let other = partial
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| mismatch("count"))?;
        self.count += other.count;
        Ok(())
    }

    fn value(&self) -> AggregateValue {
        AggregateValue::UInt(self.count)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Running sum. Integer sums are exact in 128 bits so partials merge to
/// the same total however the cells were split.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Sum {
    Empty,
    Int(i128),
    UInt(u128),
    Float(f64),
}

impl Sum {
    /// Add two sums, `None` when the 128-bit total overflows.
    fn checked_add(self, other: Sum) -> Option<Sum> {
        Some(match (self, other) {
            (Sum::Empty, x) | (x, Sum::Empty) => x,
            (Sum::Int(a), Sum::Int(b)) => Sum::Int(a.checked_add(b)?),
            (Sum::UInt(a), Sum::UInt(b)) => Sum::UInt(a.checked_add(b)?),
            (Sum::Float(a), Sum::Float(b)) => Sum::Float(a + b),
            // Partials of one binding always agree on the variant.
            (a, _) => a,
        })
    }

    fn is_negative(self) -> bool {
        matches!(self, Sum::Int(v) if v < 0)
    }
}

#[derive(Debug, Clone)]
struct SumAggregator {
    field: String,
    datatype: Option<Datatype>,
    sum: Sum,
    /// Set once the sum left the range of its result type.
    overflow: bool,
}

impl SumAggregator {
    fn new(field: String) -> Self {
        Self {
            field,
            datatype: None,
            sum: Sum::Empty,
            overflow: false,
        }
    }

    fn add(&mut self, term: Sum) {
        match self.sum.checked_add(term) {
            Some(sum) => self.sum = sum,
            None => {
                // Keep the sign of the overflowing side for saturation.
                if term.is_negative() != self.sum.is_negative() {
                    self.sum = term;
                }
                self.overflow = true;
            }
        }
    }
}

impl Aggregator for SumAggregator {
    fn field(&self) -> Option<&str> {
        Some(&self.field)
    }

    fn bind(&mut self, info: &FieldInfo) -> Result<()> {
        if info.var || info.datatype.is_string() || info.is_special() {
            return Err(Error::Unsupported(format!(
                "sum is only defined for fixed-size numeric fields, not {}",
                self.field
            )));
        }
        self.datatype = Some(info.datatype);
        Ok(())
    }

    fn partial(&self) -> Box<dyn Aggregator> {
        Box::new(Self {
            field: self.field.clone(),
            datatype: self.datatype,
            sum: Sum::Empty,
            overflow: false,
        })
    }

    fn update(&mut self, value: Option<&[u8]>, count: u64) -> Result<()> {
        let (Some(value), Some(datatype)) = (value, self.datatype) else {
            return Ok(());
        };
        let term = if datatype.is_float() {
            Sum::Float(datatype.to_f64(value) * count as f64)
        } else {
            let v = datatype.to_i128(value).unwrap_or(0);
            let Some(v) = v.checked_mul(i128::from(count)) else {
                self.add(match (datatype.is_signed_int(), v < 0) {
                    (true, true) => Sum::Int(i128::MIN),
                    (true, false) => Sum::Int(i128::MAX),
                    (false, _) => Sum::UInt(u128::MAX),
                });
                self.overflow = true;
                return Ok(());
            };
            if datatype.is_signed_int() {
                Sum::Int(v)
            } else {
                Sum::UInt(v.unsigned_abs())
            }
        };
        self.add(term);
        Ok(())
    }

    fn merge(&mut self, partial: &dyn Aggregator) -> Result<()> {
        let other = partial
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| mismatch("sum"))?;
        self.add(other.sum);
        self.overflow |= other.overflow;
        Ok(())
    }

    fn value(&self) -> AggregateValue {
        // Out of range totals saturate at the bound of the result type.
        match self.sum {
            Sum::Empty => AggregateValue::Null,
            Sum::Int(v) if self.overflow => {
                AggregateValue::Int(if v < 0 { i64::MIN } else { i64::MAX })
            }
            Sum::Int(v) => AggregateValue::Int(v.clamp(i64::MIN.into(), i64::MAX.into()) as i64),
            Sum::UInt(_) if self.overflow => AggregateValue::UInt(u64::MAX),
            Sum::UInt(v) => AggregateValue::UInt(v.min(u64::MAX.into()) as u64),
            Sum::Float(v) => AggregateValue::Float(v),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Minimum or maximum, kept as raw little-endian bytes.
#[derive(Debug, Clone)]
struct ExtremeAggregator {
    field: String,
    function: AggregateFunction,
    datatype: Option<Datatype>,
    best: Option<Vec<u8>>,
}

impl ExtremeAggregator {
    fn new(field: String, function: AggregateFunction) -> Self {
        Self {
            field,
            function,
            datatype: None,
            best: None,
        }
    }

    fn offer(&mut self, value: &[u8]) {
        let Some(datatype) = self.datatype else {
            return;
        };
        let wanted = match self.function {
            AggregateFunction::Max => Ordering::Greater,
            _ => Ordering::Less,
        };
        let better = self
            .best
            .as_deref()
            .map_or(true, |best| datatype.compare(value, best) == wanted);
        if better {
            self.best = Some(value.to_vec());
        }
    }
}

impl Aggregator for ExtremeAggregator {
    fn field(&self) -> Option<&str> {
        Some(&self.field)
    }

    fn bind(&mut self, info: &FieldInfo) -> Result<()> {
        if info.is_special() || (info.var && !info.datatype.is_string()) {
            return Err(Error::Unsupported(format!(
                "{:?} is not defined for field {}",
                self.function, self.field
            )));
        }
        self.datatype = Some(info.datatype);
        Ok(())
    }

    fn partial(&self) -> Box<dyn Aggregator> {
        Box::new(Self {
            best: None,
            ..self.clone()
        })
    }

    fn update(&mut self, value: Option<&[u8]>, count: u64) -> Result<()> {
        if let (Some(value), true) = (value, count > 0) {
            self.offer(value);
        }
        Ok(())
    }

    fn merge(&mut self, partial: &dyn Aggregator) -> Result<()> {
        let other = partial
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| mismatch("min/max"))?;
        if let Some(best) = &other.best {
            self.offer(best);
        }
        Ok(())
    }

    fn value(&self) -> AggregateValue {
        let (Some(best), Some(datatype)) = (&self.best, self.datatype) else {
            return AggregateValue::Null;
        };
        if datatype.is_string() {
            AggregateValue::String(String::from_utf8_lossy(best).into_owned())
        } else if datatype.is_float() {
            AggregateValue::Float(datatype.to_f64(best))
        } else if datatype.is_signed_int() {
            AggregateValue::Int(datatype.to_i128(best).unwrap_or(0) as i64)
        } else {
            AggregateValue::UInt(datatype.to_i128(best).unwrap_or(0) as u64)
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
struct NullCountAggregator {
    field: String,
    nulls: u64,
}

impl NullCountAggregator {
    fn new(field: String) -> Self {
        Self { field, nulls: 0 }
    }
}

impl Aggregator for NullCountAggregator {
    fn field(&self) -> Option<&str> {
        Some(&self.field)
    }

    fn bind(&mut self, info: &FieldInfo) -> Result<()> {
        if !info.nullable || !matches!(info.kind, FieldKind::Attribute(_)) {
            return Err(Error::Unsupported(format!(
                "null count needs a nullable attribute, {} is not one",
                self.field
            )));
        }
        Ok(())
    }

    fn partial(&self) -> Box<dyn Aggregator> {
        Box::new(Self::new(self.field.clone()))
    }

    fn update(&mut self, value: Option<&[u8]>, count: u64) -> Result<()> {
        if value.is_none() {
            self.nulls += count;
        }
        Ok(())
    }

    fn merge(&mut self, partial: &dyn Aggregator) -> Result<()> {
        let other = partial
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| mismatch("null count"))?;
        self.nulls += other.nulls;
        Ok(())
    }

    fn value(&self) -> AggregateValue {
        AggregateValue::UInt(self.nulls)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
