//! Typed cell values, field descriptors and positional parameters.
//!
//! Rows leave the gateway as a closed set of scalar kinds. The mapping from
//! Postgres type names to kinds lives in [`ValueKind::from_pg_type`]; anything
//! not listed there decodes as [`CellValue::Unknown`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgRow, PgTypeInfo};
use sqlx::{Arguments, Column, Encode, Postgres, Row, Type, TypeInfo};

// ── Kinds ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    Integer,
    Float,
    Numeric,
    Boolean,
    Timestamp,
    Date,
    Json,
    Binary,
    Unknown,
}

impl ValueKind {
    /// Map a backend type name (as reported by `TypeInfo::name`) to a kind.
    pub fn from_pg_type(type_name: &str) -> Self {
        match type_name.to_ascii_uppercase().as_str() {
            "INT2" | "INT4" | "INT8" | "OID" | "SMALLINT" | "INTEGER" | "BIGINT" => ValueKind::Integer,
            "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" => ValueKind::Float,
            "NUMERIC" | "DECIMAL" => ValueKind::Numeric,
            "BOOL" | "BOOLEAN" => ValueKind::Boolean,
            "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "UUID" | "CITEXT" => ValueKind::Text,
            "TIMESTAMP" | "TIMESTAMPTZ" => ValueKind::Timestamp,
            "DATE" => ValueKind::Date,
            "JSON" | "JSONB" => ValueKind::Json,
            "BYTEA" => ValueKind::Binary,
            _ => ValueKind::Unknown,
        }
    }
}

// ── Cells ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// RFC 3339 in UTC (naive timestamps are assumed to be UTC).
    Timestamp(DateTime<Utc>),
    Json(Value),
    Binary(Vec<u8>),
    /// A value whose backend type has no mapping; carries the type name.
    Unknown(String),
}

impl CellValue {
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Integer(i) => json!(i),
            CellValue::Float(f) => json!(f),
            CellValue::Boolean(b) => Value::Bool(*b),
            CellValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            CellValue::Json(v) => v.clone(),
            CellValue::Binary(bytes) => json!({ "$binary": BASE64.encode(bytes) }),
            CellValue::Unknown(type_name) => json!({ "$unsupported": type_name }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub type_name: String,
    pub kind: ValueKind,
}

pub fn describe_columns<C: Column<Database = sqlx::Postgres>>(columns: &[C]) -> Vec<FieldDescriptor> {
    columns
        .iter()
        .map(|c| {
            let type_name = c.type_info().name().to_string();
            FieldDescriptor {
                name: c.name().to_string(),
                kind: ValueKind::from_pg_type(&type_name),
                type_name,
            }
        })
        .collect()
}

/// Decode every column of a row into typed cells.
pub fn decode_row(row: &PgRow) -> Vec<CellValue> {
    (0..row.columns().len()).map(|idx| decode_cell(row, idx)).collect()
}

fn decode_cell(row: &PgRow, idx: usize) -> CellValue {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    let decoded = match ValueKind::from_pg_type(&type_name) {
        ValueKind::Integer => match type_name.as_str() {
            "INT2" => row.try_get::<Option<i16>, _>(idx).map(|v| v.map(|n| CellValue::Integer(n.into()))),
            "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(|n| CellValue::Integer(n.into()))),
            "OID" => row
                .try_get::<Option<sqlx::postgres::types::Oid>, _>(idx)
                .map(|v| v.map(|n| CellValue::Integer(n.0.into()))),
            _ => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(CellValue::Integer)),
        },
        ValueKind::Float => match type_name.as_str() {
            "FLOAT4" => row.try_get::<Option<f32>, _>(idx).map(|v| v.map(|n| CellValue::Float(n.into()))),
            _ => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(CellValue::Float)),
        },
        ValueKind::Numeric => row
            .try_get::<Option<rust_decimal::Decimal>, _>(idx)
            .map(|v| v.map(|d| CellValue::Text(d.to_string()))),
        ValueKind::Boolean => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(CellValue::Boolean)),
        ValueKind::Text if type_name == "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| v.map(|u| CellValue::Text(u.to_string()))),
        ValueKind::Text => row.try_get::<Option<String>, _>(idx).map(|v| v.map(CellValue::Text)),
        ValueKind::Timestamp if type_name == "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| v.map(CellValue::Timestamp)),
        ValueKind::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| v.map(|ts| CellValue::Timestamp(ts.and_utc()))),
        ValueKind::Date => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .map(|v| v.map(|d| CellValue::Text(d.to_string()))),
        ValueKind::Json => row.try_get::<Option<Value>, _>(idx).map(|v| v.map(CellValue::Json)),
        ValueKind::Binary => row.try_get::<Option<Vec<u8>>, _>(idx).map(|v| v.map(CellValue::Binary)),
        ValueKind::Unknown => Ok(Some(unknown_cell(row, idx, &type_name))),
    };

    match decoded {
        Ok(Some(cell)) => cell,
        Ok(None) => CellValue::Null,
        Err(e) => {
            tracing::debug!(column = idx, type_name = %type_name, "cell decode failed: {}", e);
            CellValue::Unknown(type_name)
        }
    }
}

/// Unmapped types: try a lossless text decode (works for enums and domains
/// over text), otherwise report the type name.
fn unknown_cell(row: &PgRow, idx: usize, type_name: &str) -> CellValue {
    match row.try_get_unchecked::<Option<String>, _>(idx) {
        Ok(None) => CellValue::Null,
        Ok(Some(s)) if !s.contains('\0') => CellValue::Text(s),
        _ => CellValue::Unknown(type_name.to_string()),
    }
}

// ── Parameters ──────────────────────────────────────────────────────────────

/// A positional bind parameter, decoded from a JSON tool argument.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
}

/// Observed type of a JSON parameter, as reported by the validator.
pub fn json_param_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(map) if map.len() == 1 && map.contains_key("$date") => "date",
        Value::Object(map) if map.len() == 1 && map.contains_key("$binary") => "binary",
        Value::Object(_) => "object",
    }
}

impl SqlParam {
    pub fn from_json(index: usize, value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(SqlParam::Null),
            Value::Bool(b) => Ok(SqlParam::Boolean(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlParam::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(SqlParam::Float(f))
                } else {
                    Err(format!("parameter {} is not a representable number", index))
                }
            }
            Value::String(s) => Ok(SqlParam::Text(s.clone())),
            Value::Object(map) => {
                if let Some(raw) = map.get("$date").and_then(|v| v.as_str()) {
                    DateTime::parse_from_rfc3339(raw)
                        .map(|dt| SqlParam::Timestamp(dt.with_timezone(&Utc)))
                        .map_err(|e| format!("parameter {} has an invalid $date: {}", index, e))
                } else if let Some(raw) = map.get("$binary").and_then(|v| v.as_str()) {
                    BASE64
                        .decode(raw)
                        .map(SqlParam::Binary)
                        .map_err(|e| format!("parameter {} has invalid $binary base64: {}", index, e))
                } else {
                    Err(format!("parameter {} has unsupported type object", index))
                }
            }
            Value::Array(_) => Err(format!("parameter {} has unsupported type array", index)),
        }
    }

    pub fn from_json_list(values: &[Value]) -> Result<Vec<Self>, String> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| SqlParam::from_json(i, v))
            .collect()
    }
}

/// A parameter converted to the Rust type matching the backend's resolved
/// type for its slot. Values go over the wire in binary format, so the
/// encoding has to agree with what the server parsed the statement with.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BoundParam {
    Null,
    Text(String),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Bool(bool),
    TimestampTz(DateTime<Utc>),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(uuid::Uuid),
    Json(Value),
    Bytes(Vec<u8>),
}

/// NULL carrying the type the backend inferred for its slot.
struct TypedNull(PgTypeInfo);

impl Type<Postgres> for TypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl<'q> Encode<'q, Postgres> for TypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(self.0.clone())
    }
}

fn bad_param(index: usize, raw: impl std::fmt::Display, target: &str) -> String {
    format!("parameter {}: '{}' is not a valid {}", index, raw, target.to_ascii_lowercase())
}

fn parse_text<T: FromStr>(index: usize, raw: &str, target: &str) -> Result<T, String> {
    raw.trim().parse::<T>().map_err(|_| bad_param(index, raw, target))
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().and_then(|d| d.and_hms_opt(0, 0, 0)))
}

fn is_text_like(target: &str) -> bool {
    matches!(target, "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" | "UNKNOWN")
}

/// Convert one parameter to the backend type named `target` (as reported by
/// `TypeInfo::name`). An empty target means the type is unknown and the
/// parameter keeps its natural type.
pub(crate) fn coerce_param(index: usize, param: &SqlParam, target: &str) -> Result<BoundParam, String> {
    let target = target.to_ascii_uppercase();
    let t = target.as_str();
    let bound = match param {
        SqlParam::Null => BoundParam::Null,
        SqlParam::Text(s) => match t {
            "UUID" => BoundParam::Uuid(uuid::Uuid::parse_str(s.trim()).map_err(|_| bad_param(index, s, t))?),
            "JSON" | "JSONB" => BoundParam::Json(serde_json::from_str(s).map_err(|_| bad_param(index, s, t))?),
            "TIMESTAMPTZ" => BoundParam::TimestampTz(parse_timestamp(s).ok_or_else(|| bad_param(index, s, t))?.and_utc()),
            "TIMESTAMP" => BoundParam::Timestamp(parse_timestamp(s).ok_or_else(|| bad_param(index, s, t))?),
            "DATE" => BoundParam::Date(
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .ok()
                    .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
                    .ok_or_else(|| bad_param(index, s, t))?,
            ),
            "TIME" => BoundParam::Time(
                NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M"))
                    .map_err(|_| bad_param(index, s, t))?,
            ),
            "INT2" => BoundParam::Int2(parse_text(index, s, t)?),
            "INT4" => BoundParam::Int4(parse_text(index, s, t)?),
            "INT8" => BoundParam::Int8(parse_text(index, s, t)?),
            "FLOAT4" => BoundParam::Float4(parse_text(index, s, t)?),
            "FLOAT8" => BoundParam::Float8(parse_text(index, s, t)?),
            "NUMERIC" => BoundParam::Numeric(parse_text(index, s, t)?),
            "BOOL" => BoundParam::Bool(match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" => true,
                "f" | "false" | "n" | "no" | "off" | "0" => false,
                _ => return Err(bad_param(index, s, t)),
            }),
            "BYTEA" => match s.strip_prefix("\\x") {
                Some(hex_digits) => BoundParam::Bytes(hex::decode(hex_digits).map_err(|_| bad_param(index, s, t))?),
                None => BoundParam::Bytes(s.as_bytes().to_vec()),
            },
            _ => BoundParam::Text(s.clone()),
        },
        SqlParam::Integer(i) => match t {
            "INT2" => BoundParam::Int2(i16::try_from(*i).map_err(|_| bad_param(index, i, t))?),
            "INT4" => BoundParam::Int4(i32::try_from(*i).map_err(|_| bad_param(index, i, t))?),
            "FLOAT4" => BoundParam::Float4(*i as f32),
            "FLOAT8" => BoundParam::Float8(*i as f64),
            "NUMERIC" => BoundParam::Numeric(Decimal::from(*i)),
            "BOOL" if *i == 0 || *i == 1 => BoundParam::Bool(*i == 1),
            "JSON" | "JSONB" => BoundParam::Json(json!(i)),
            t if is_text_like(t) => BoundParam::Text(i.to_string()),
            _ => BoundParam::Int8(*i),
        },
        SqlParam::Float(f) => match t {
            "FLOAT4" => BoundParam::Float4(*f as f32),
            "NUMERIC" => BoundParam::Numeric(Decimal::try_from(*f).map_err(|_| bad_param(index, f, t))?),
            "INT2" | "INT4" | "INT8" => {
                if f.fract() != 0.0 {
                    return Err(bad_param(index, f, t));
                }
                return coerce_param(index, &SqlParam::Integer(*f as i64), t);
            }
            "JSON" | "JSONB" => BoundParam::Json(json!(f)),
            t if is_text_like(t) => BoundParam::Text(f.to_string()),
            _ => BoundParam::Float8(*f),
        },
        SqlParam::Boolean(b) => match t {
            "JSON" | "JSONB" => BoundParam::Json(Value::Bool(*b)),
            t if is_text_like(t) => BoundParam::Text(b.to_string()),
            _ => BoundParam::Bool(*b),
        },
        SqlParam::Timestamp(ts) => match t {
            "TIMESTAMP" => BoundParam::Timestamp(ts.naive_utc()),
            "DATE" => BoundParam::Date(ts.date_naive()),
            t if is_text_like(t) => BoundParam::Text(ts.to_rfc3339()),
            _ => BoundParam::TimestampTz(*ts),
        },
        SqlParam::Binary(bytes) => BoundParam::Bytes(bytes.clone()),
    };
    Ok(bound)
}

/// Build sqlx arguments from positional parameters, converting each one to
/// the type the backend resolved for it (`declared`, from the parsed
/// statement). NULLs carry the resolved type as well.
pub fn bind_params(params: &[SqlParam], declared: &[PgTypeInfo]) -> Result<PgArguments, BoxDynError> {
    if !declared.is_empty() && declared.len() != params.len() {
        return Err(format!(
            "statement expects {} parameters but {} were supplied",
            declared.len(),
            params.len()
        )
        .into());
    }

    let mut args = PgArguments::default();
    for (index, param) in params.iter().enumerate() {
        let target = declared.get(index);
        let type_name = target.map(|t| t.name()).unwrap_or("");
        match coerce_param(index, param, type_name)? {
            BoundParam::Null => {
                let ty = target.cloned().unwrap_or_else(|| PgTypeInfo::with_oid(Oid(0)));
                args.add(TypedNull(ty))?
            }
            BoundParam::Text(v) => args.add(v)?,
            BoundParam::Int2(v) => args.add(v)?,
            BoundParam::Int4(v) => args.add(v)?,
            BoundParam::Int8(v) => args.add(v)?,
            BoundParam::Float4(v) => args.add(v)?,
            BoundParam::Float8(v) => args.add(v)?,
            BoundParam::Numeric(v) => args.add(v)?,
            BoundParam::Bool(v) => args.add(v)?,
            BoundParam::TimestampTz(v) => args.add(v)?,
            BoundParam::Timestamp(v) => args.add(v)?,
            BoundParam::Date(v) => args.add(v)?,
            BoundParam::Time(v) => args.add(v)?,
            BoundParam::Uuid(v) => args.add(v)?,
            BoundParam::Json(v) => args.add(sqlx::types::Json(v))?,
            BoundParam::Bytes(v) => args.add(v)?,
        }
    }
    Ok(args)
}
