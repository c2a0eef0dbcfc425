//! Comparison expressions over cell values.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::QueryCondition;
use crate::error::{Error, Result};
use crate::reader::ResultTile;
use crate::schema::{ArraySchema, Datatype, FieldInfo};

/// A literal compared against cell values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// A condition tree over dimensions and attributes.
///
/// Comparisons against null cells are false, so `Ne` does not match nulls
/// either; use `IsNull` to select them.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Lt { field: String, value: Value },
    Le { field: String, value: Value },
    Gt { field: String, value: Value },
    Ge { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    IsNull { field: String },
    IsNotNull { field: String },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Le {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Ge {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Condition::IsNull {
            field: field.into(),
        }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Condition::IsNotNull {
            field: field.into(),
        }
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::And(mut all) => {
                all.push(other);
                Condition::And(all)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut any) => {
                any.push(other);
                Condition::Or(any)
            }
            first => Condition::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }

    fn collect_fields(&self, fields: &mut BTreeSet<String>) {
        match self {
            Condition::Eq { field, .. }
            | Condition::Ne { field, .. }
            | Condition::Lt { field, .. }
            | Condition::Le { field, .. }
            | Condition::Gt { field, .. }
            | Condition::Ge { field, .. }
            | Condition::In { field, .. }
            | Condition::IsNull { field }
            | Condition::IsNotNull { field } => {
                fields.insert(field.clone());
            }
            Condition::And(all) | Condition::Or(all) => {
                for c in all {
                    c.collect_fields(fields);
                }
            }
            Condition::Not(inner) => inner.collect_fields(fields),
        }
    }

    /// Evaluate against cell `pos` of a tile.
    pub fn evaluate_cell(&self, schema: &ArraySchema, tile: &ResultTile, pos: u64) -> Result<bool> {
        match self {
            Condition::Eq { field, value } => {
                Self::compare_field(schema, tile, pos, field, value, Ordering::is_eq)
            }
            Condition::Ne { field, value } => {
                Self::compare_field(schema, tile, pos, field, value, Ordering::is_ne)
            }
            Condition::Lt { field, value } => {
                Self::compare_field(schema, tile, pos, field, value, Ordering::is_lt)
            }
            Condition::Le { field, value } => {
                Self::compare_field(schema, tile, pos, field, value, Ordering::is_le)
            }
            Condition::Gt { field, value } => {
                Self::compare_field(schema, tile, pos, field, value, Ordering::is_gt)
            }
            Condition::Ge { field, value } => {
                Self::compare_field(schema, tile, pos, field, value, Ordering::is_ge)
            }
            Condition::In { field, values } => {
                for value in values {
                    if Self::compare_field(schema, tile, pos, field, value, Ordering::is_eq)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::IsNull { field } => {
                let (info, _) = Self::resolve(schema, field)?;
                Ok(tile.cell_value(field, &info, pos)?.is_none())
            }
            Condition::IsNotNull { field } => {
                let (info, _) = Self::resolve(schema, field)?;
                Ok(tile.cell_value(field, &info, pos)?.is_some())
            }
            Condition::And(all) => {
                for c in all {
                    if !c.evaluate_cell(schema, tile, pos)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(any) => {
                for c in any {
                    if c.evaluate_cell(schema, tile, pos)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate_cell(schema, tile, pos)?),
        }
    }

    fn resolve(schema: &ArraySchema, field: &str) -> Result<(FieldInfo, Datatype)> {
        let info = schema
            .field(field)
            .map_err(|_| Error::Condition(format!("unknown field {field}")))?;
        if info.is_special() {
            return Err(Error::Condition(format!("cannot filter on {field}")));
        }
        if info.var && !info.datatype.is_string() {
            return Err(Error::Condition(format!(
                "cannot compare var-sized field {field}"
            )));
        }
        Ok((info, info.datatype))
    }

    /// Compare a field value with a comparator function.
    fn compare_field(
        schema: &ArraySchema,
        tile: &ResultTile,
        pos: u64,
        field: &str,
        value: &Value,
        accept: fn(Ordering) -> bool,
    ) -> Result<bool> {
        let (info, datatype) = Self::resolve(schema, field)?;
        match tile.cell_value(field, &info, pos)? {
            Some(bytes) => Ok(accept(Self::compare_values(datatype, bytes, value, field)?)),
            None => Ok(false), // Null never matches a comparison
        }
    }

    /// Order a raw cell value against a literal.
    fn compare_values(datatype: Datatype, bytes: &[u8], value: &Value, field: &str) -> Result<Ordering> {
        let mismatch = || {
            Error::Condition(format!(
                "cannot compare {datatype:?} field {field} with {value:?}"
            ))
        };
        if datatype.is_string() {
            return match value {
                Value::String(s) => Ok(bytes.cmp(s.as_bytes())),
                _ => Err(mismatch()),
            };
        }
        if let Some(cell) = datatype.to_i128(bytes) {
            return match value {
                Value::Int(v) => Ok(cell.cmp(&(*v as i128))),
                Value::UInt(v) => Ok(cell.cmp(&(*v as i128))),
                Value::Float(v) => Ok((cell as f64).total_cmp(v)),
                Value::String(_) => Err(mismatch()),
            };
        }
        let cell = datatype.to_f64(bytes);
        match value {
            Value::Int(v) => Ok(cell.total_cmp(&(*v as f64))),
            Value::UInt(v) => Ok(cell.total_cmp(&(*v as f64))),
            Value::Float(v) => Ok(cell.total_cmp(v)),
            Value::String(_) => Err(mismatch()),
        }
    }
}

impl QueryCondition for Condition {
    fn fields(&self) -> Vec<String> {
        let mut fields = BTreeSet::new();
        self.collect_fields(&mut fields);
        fields.into_iter().collect()
    }

    fn evaluate(&self, schema: &ArraySchema, tile: &ResultTile) -> Result<Vec<u8>> {
        (0..tile.cell_num())
            .map(|pos| self.evaluate_cell(schema, tile, pos).map(u8::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::CoordStorage;
    use crate::schema::{encode_values, Attribute, Dimension, Layout};
    use crate::tile::TileTuple;

    fn schema() -> ArraySchema {
        ArraySchema::new(Layout::RowMajor)
            .with_dimension(Dimension::new("x", Datatype::Int64, [0.0, 100.0]))
            .with_attribute(Attribute::new("a", Datatype::Float64).nullable())
            .with_attribute(Attribute::new("s", Datatype::StringAscii))
            .with_attribute(Attribute::var("list", Datatype::Int32))
    }

    fn tile(schema: &ArraySchema) -> ResultTile {
        let coords = CoordStorage::unzipped(
            schema,
            vec![TileTuple::fixed(encode_values(&[1i64, 5, 9]))],
        );
        let mut tile = ResultTile::new(0, 0, 3, 1, coords);
        tile.set_field(
            "a",
            TileTuple::fixed(encode_values(&[0.5f64, 2.5, 0.0])).with_validity(vec![1u8, 1, 0]),
        );
        tile.set_field(
            "s",
            TileTuple::var(encode_values(&[0u64, 3, 6]), b"catdogcow".to_vec()),
        );
        tile
    }

    #[test]
    fn test_comparisons() {
        let schema = schema();
        let tile = tile(&schema);
        assert_eq!(Condition::gt("x", 3).evaluate(&schema, &tile).unwrap(), vec![0, 1, 1]);
        assert_eq!(Condition::le("a", 1.0).evaluate(&schema, &tile).unwrap(), vec![1, 0, 0]);
        assert_eq!(Condition::eq("s", "dog").evaluate(&schema, &tile).unwrap(), vec![0, 1, 0]);
        assert_eq!(
            Condition::In {
                field: "x".into(),
                values: vec![Value::Int(1), Value::UInt(9)],
            }
            .evaluate(&schema, &tile)
            .unwrap(),
            vec![1, 0, 1]
        );
    }

    #[test]
    fn test_nulls() {
        let schema = schema();
        let tile = tile(&schema);
        assert_eq!(Condition::ne("a", 0.5).evaluate(&schema, &tile).unwrap(), vec![0, 1, 0]);
        assert_eq!(Condition::is_null("a").evaluate(&schema, &tile).unwrap(), vec![0, 0, 1]);
        assert_eq!(Condition::is_not_null("a").evaluate(&schema, &tile).unwrap(), vec![1, 1, 0]);
    }

    #[test]
    fn test_combinators() {
        let schema = schema();
        let tile = tile(&schema);
        let cond = Condition::gt("x", 1).and(Condition::lt("x", 9));
        assert_eq!(cond.evaluate(&schema, &tile).unwrap(), vec![0, 1, 0]);
        let cond = Condition::eq("x", 1).or(Condition::eq("s", "cow"));
        assert_eq!(cond.evaluate(&schema, &tile).unwrap(), vec![1, 0, 1]);
        assert_eq!(cond.negate().evaluate(&schema, &tile).unwrap(), vec![0, 1, 0]);
        assert_eq!(
            Condition::gt("x", 1).and(Condition::eq("s", "a")).fields(),
            vec!["s".to_string(), "x".to_string()]
        );
    }

    #[test]
    fn test_errors() {
        let schema = schema();
        let tile = tile(&schema);
        assert!(matches!(
            Condition::eq("x", "text").evaluate(&schema, &tile),
            Err(Error::Condition(_))
        ));
        assert!(matches!(
            Condition::eq("missing", 1).evaluate(&schema, &tile),
            Err(Error::Condition(_))
        ));
        assert!(matches!(
            Condition::eq("list", 1).evaluate(&schema, &tile),
            Err(Error::Condition(_))
        ));
    }
}
