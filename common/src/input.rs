//! Lectura de filas de entrada (lo que una tarea escribe en el warehouse).
//!
//! JSON lines: un objeto por línea, claves = nombres de campo.
//! CSV: primera línea = encabezados; celdas vacías son NULL; los campos
//! RECORD / REPEATED van como JSON dentro de la celda.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value as Json;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::error::{io_err, ConnectorError, Result};
use crate::schema::{FieldMode, FieldSchema, FieldType, TableSchema};
use crate::value::{Row, Value};

/* =========================
   JSON -> Value
   ========================= */

fn bad(field: &FieldSchema, raw: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::encoding(format!(
        "field `{}`: cannot read `{raw}` as {:?}",
        field.name, field.field_type
    ))
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Texto de una celda escalar -> Value.
fn scalar_from_str(s: &str, field: &FieldSchema) -> Result<Value> {
    let v = match field.field_type {
        FieldType::Integer => Value::Int64(s.parse().map_err(|_| bad(field, s))?),
        FieldType::Float => Value::Float64(s.parse().map_err(|_| bad(field, s))?),
        FieldType::Boolean => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(bad(field, s)),
        },
        FieldType::String => Value::String(s.to_string()),
        FieldType::Bytes => Value::Bytes(s.as_bytes().to_vec()),
        FieldType::Date => Value::Date(
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| bad(field, s))?,
        ),
        FieldType::Datetime => Value::Timestamp(parse_datetime(s).ok_or_else(|| bad(field, s))?),
        FieldType::Timestamp => match DateTime::parse_from_rfc3339(s) {
            Ok(tz) => Value::TimestampTz(tz),
            // sin offset: timestamp civil
            Err(_) => Value::Timestamp(parse_datetime(s).ok_or_else(|| bad(field, s))?),
        },
        FieldType::Numeric => Value::Decimal(s.parse()?),
        FieldType::Record => {
            let json: Json = serde_json::from_str(s).map_err(|_| bad(field, s))?;
            return json_to_value(&json, field);
        }
    };
    Ok(v)
}

/// JSON -> Value, siguiendo el schema del campo.
pub fn json_to_value(json: &Json, field: &FieldSchema) -> Result<Value> {
    if json.is_null() {
        return Ok(Value::Null);
    }

    if field.mode == FieldMode::Repeated {
        if field.is_map() {
            if let Json::Object(obj) = json {
                let (key_field, value_field) = (&field.fields[0], &field.fields[1]);
                return obj
                    .iter()
                    .map(|(k, v)| {
                        Ok((
                            scalar_from_str(k, key_field)?,
                            json_to_value(v, value_field)?,
                        ))
                    })
                    .collect::<Result<_>>()
                    .map(Value::Map);
            }
        }
        let Json::Array(items) = json else {
            return Err(bad(field, json));
        };
        let element = field.element();
        return items
            .iter()
            .map(|v| json_to_value(v, &element))
            .collect::<Result<_>>()
            .map(Value::Array);
    }

    match (field.field_type, json) {
        (FieldType::Integer, Json::Number(n)) => n.as_i64().map(Value::Int64).ok_or_else(|| bad(field, n)),
        (FieldType::Float, Json::Number(n)) => n.as_f64().map(Value::Float64).ok_or_else(|| bad(field, n)),
        (FieldType::Boolean, Json::Bool(b)) => Ok(Value::Bool(*b)),
        (FieldType::Numeric, Json::Number(n)) => Ok(Value::Decimal(n.to_string().parse()?)),
        (FieldType::Bytes, Json::Array(bytes)) => bytes
            .iter()
            .map(|b| {
                b.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| bad(field, b))
            })
            .collect::<Result<_>>()
            .map(Value::Bytes),
        (FieldType::Record, Json::Object(obj)) => field
            .fields
            .iter()
            .map(|f| json_to_value(obj.get(&f.name).unwrap_or(&Json::Null), f))
            .collect::<Result<_>>()
            .map(Value::Struct),
        (FieldType::Record, other) => Err(bad(field, other)),
        (_, Json::String(s)) => scalar_from_str(s, field),
        (_, other) => Err(bad(field, other)),
    }
}

fn object_to_row(obj: &serde_json::Map<String, Json>, schema: &TableSchema) -> Result<Row> {
    schema
        .fields
        .iter()
        .map(|f| json_to_value(obj.get(&f.name).unwrap_or(&Json::Null), f))
        .collect()
}

/* =========================
   Archivos
   ========================= */

pub fn read_jsonl_rows(path: &Path, schema: &TableSchema) -> Result<Vec<Row>> {
    let file = File::open(path).map_err(io_err(path))?;
    let mut out = Vec::new();

    for (n, line_res) in BufReader::new(file).lines().enumerate() {
        let line = line_res.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let json: Json = serde_json::from_str(&line)?;
        let Json::Object(obj) = json else {
            return Err(ConnectorError::encoding(format!(
                "{}:{}: expected a JSON object",
                path.display(),
                n + 1
            )));
        };
        out.push(object_to_row(&obj, schema)?);
    }

    Ok(out)
}

pub fn read_csv_rows(path: &Path, schema: &TableSchema) -> Result<Vec<Row>> {
    let file = File::open(path).map_err(io_err(path))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let csv_err = |e: csv::Error| {
        ConnectorError::encoding(format!("{}: {e}", path.display()))
    };

    // Limpia BOM por si viene de Excel/Windows
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        if record.iter().all(|c| c.is_empty()) {
            continue;
        }
        let row = schema
            .fields
            .iter()
            .map(|f| {
                let cell = headers
                    .iter()
                    .position(|h| h == &f.name)
                    .and_then(|idx| record.get(idx))
                    .unwrap_or("");
                if cell.is_empty() {
                    Ok(Value::Null)
                } else if f.mode == FieldMode::Repeated {
                    let json: Json = serde_json::from_str(cell).map_err(|_| bad(f, cell))?;
                    json_to_value(&json, f)
                } else {
                    scalar_from_str(cell, f)
                }
            })
            .collect::<Result<Row>>()?;
        out.push(row);
    }

    Ok(out)
}

/// Elige el lector por extensión (`.csv` o JSON lines).
pub fn read_rows(path: &Path, schema: &TableSchema) -> Result<Vec<Row>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => read_csv_rows(path, schema),
        _ => read_jsonl_rows(path, schema),
    }
}
