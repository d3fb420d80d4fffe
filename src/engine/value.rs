use serde::Serialize;

/// A single result cell.
///
/// DuckDB has many integer widths; everything integral that fits collapses to
/// `Int`, which keeps downstream typing to the three shapes the column
/// metadata knows about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the cell. Text is parsed, null stays `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Render the cell for table/csv display.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    /// Convert to JSON; non-finite floats become strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(n) => serde_json::json!(n),
            Value::Float(n) => {
                if n.is_finite() {
                    serde_json::json!(n)
                } else {
                    serde_json::Value::String(n.to_string())
                }
            }
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<duckdb::types::Value> for Value {
    fn from(value: duckdb::types::Value) -> Self {
        use duckdb::types::Value as Db;
        match value {
            Db::Null => Value::Null,
            Db::Boolean(b) => Value::Int(i64::from(b)),
            Db::TinyInt(n) => Value::Int(i64::from(n)),
            Db::SmallInt(n) => Value::Int(i64::from(n)),
            Db::Int(n) => Value::Int(i64::from(n)),
            Db::BigInt(n) => Value::Int(n),
            Db::HugeInt(n) => match i64::try_from(n) {
                Ok(n64) => Value::Int(n64),
                Err(_) => Value::Float(n as f64),
            },
            Db::UTinyInt(n) => Value::Int(i64::from(n)),
            Db::USmallInt(n) => Value::Int(i64::from(n)),
            Db::UInt(n) => Value::Int(i64::from(n)),
            Db::UBigInt(n) => match i64::try_from(n) {
                Ok(n64) => Value::Int(n64),
                Err(_) => Value::Float(n as f64),
            },
            Db::Float(n) => Value::Float(f64::from(n)),
            Db::Double(n) => Value::Float(n),
            Db::Text(s) => Value::Text(s),
            other => Value::Text(format!("{other:?}")),
        }
    }
}
