//! Conversión campo a campo entre valores del motor y valores del warehouse,
//! guiada por el schema snapshot del descriptor.

use chrono::DateTime;

use crate::config::WriteStrategy;
use crate::error::{ConnectorError, Result};
use crate::schema::{FieldMode, FieldSchema, FieldType, TableSchema};
use crate::temporal;
use crate::value::{Decimal, Row, Value, WarehouseRow, WarehouseValue, NUMERIC_PRECISION, NUMERIC_SCALE};

fn mismatch(field: &FieldSchema, got: impl std::fmt::Debug) -> ConnectorError {
    ConnectorError::encoding(format!(
        "field `{}`: cannot write {:?} into a {:?} column",
        field.name, got, field.field_type
    ))
}

fn check_arity(expected: usize, got: usize, what: &str) -> Result<()> {
    if expected != got {
        return Err(ConnectorError::encoding(format!(
            "{what} has {got} values but the schema has {expected} fields"
        )));
    }
    Ok(())
}

/* =========================
   Motor -> warehouse
   ========================= */

pub fn to_warehouse_row(
    row: &Row,
    schema: &TableSchema,
    strategy: WriteStrategy,
) -> Result<WarehouseRow> {
    check_arity(schema.len(), row.len(), "row")?;
    row.iter()
        .zip(&schema.fields)
        .map(|(v, f)| to_warehouse_value(v, f, strategy))
        .collect()
}

pub fn to_warehouse_value(
    value: &Value,
    field: &FieldSchema,
    strategy: WriteStrategy,
) -> Result<WarehouseValue> {
    if field.mode == FieldMode::Repeated {
        return to_repeated(value, field, strategy);
    }
    if matches!(value, Value::Null) {
        if field.mode == FieldMode::Required {
            return Err(ConnectorError::encoding(format!(
                "field `{}` is REQUIRED but got NULL",
                field.name
            )));
        }
        return Ok(WarehouseValue::Null);
    }

    let wv = match (field.field_type, value) {
        (FieldType::Integer, Value::Int64(i)) => WarehouseValue::Int64(*i),
        (FieldType::Float, Value::Float64(x)) => WarehouseValue::Float64(*x),
        (FieldType::Float, Value::Int64(i)) => WarehouseValue::Float64(*i as f64),
        (FieldType::Boolean, Value::Bool(b)) => WarehouseValue::Bool(*b),
        (FieldType::String, Value::String(s)) => WarehouseValue::String(s.clone()),
        (FieldType::Bytes, Value::Bytes(b)) => WarehouseValue::Bytes(b.clone()),
        (FieldType::Date, Value::Date(d)) => WarehouseValue::Date(temporal::date_to_epoch_days(d)?),
        (FieldType::Datetime | FieldType::Timestamp, Value::Timestamp(t)) => {
            temporal::encode_civil(t, strategy)?
        }
        (FieldType::Timestamp, Value::TimestampTz(t)) => temporal::encode_zoned(t, strategy)?,
        (FieldType::Numeric, Value::Decimal(d)) => WarehouseValue::Numeric(rescale(d, field)?),
        (FieldType::Numeric, Value::Int64(i)) => {
            WarehouseValue::Numeric(rescale(&Decimal::new(i128::from(*i), 0), field)?)
        }
        (FieldType::Record, Value::Struct(values)) => {
            check_arity(field.fields.len(), values.len(), &format!("record `{}`", field.name))?;
            WarehouseValue::Record(
                values
                    .iter()
                    .zip(&field.fields)
                    .map(|(v, f)| to_warehouse_value(v, f, strategy))
                    .collect::<Result<_>>()?,
            )
        }
        (_, other) => return Err(mismatch(field, other)),
    };
    Ok(wv)
}

fn rescale(d: &Decimal, field: &FieldSchema) -> Result<i128> {
    d.rescale(
        field.precision.unwrap_or(NUMERIC_PRECISION),
        field.scale.unwrap_or(NUMERIC_SCALE),
    )
}

fn to_repeated(value: &Value, field: &FieldSchema, strategy: WriteStrategy) -> Result<WarehouseValue> {
    let element = field.element();
    let items = match value {
        // un REPEATED nulo se escribe como lista vacía
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .map(|v| to_warehouse_value(v, &element, strategy))
            .collect::<Result<_>>()?,
        Value::Map(entries) if field.is_map() => {
            let (key_field, value_field) = (&field.fields[0], &field.fields[1]);
            entries
                .iter()
                .map(|(k, v)| {
                    Ok(WarehouseValue::Record(vec![
                        to_warehouse_value(k, key_field, strategy)?,
                        to_warehouse_value(v, value_field, strategy)?,
                    ]))
                })
                .collect::<Result<_>>()?
        }
        other => return Err(mismatch(field, other)),
    };
    Ok(WarehouseValue::Repeated(items))
}

/* =========================
   Warehouse -> motor
   ========================= */

/// Camino de lectura. El valor del warehouse ya indica su codificación
/// (epoch micros o empaquetado), así que alcanza con el schema.
pub fn from_warehouse_row(row: &WarehouseRow, schema: &TableSchema) -> Result<Row> {
    check_arity(schema.len(), row.len(), "row")?;
    row.iter()
        .zip(&schema.fields)
        .map(|(v, f)| from_warehouse_value(v, f))
        .collect()
}

pub fn from_warehouse_value(value: &WarehouseValue, field: &FieldSchema) -> Result<Value> {
    if field.mode == FieldMode::Repeated {
        let WarehouseValue::Repeated(items) = value else {
            return Err(mismatch(field, value));
        };
        if field.is_map() {
            let (key_field, value_field) = (&field.fields[0], &field.fields[1]);
            let entries = items
                .iter()
                .map(|item| match item {
                    WarehouseValue::Record(kv) if kv.len() == 2 => Ok((
                        from_warehouse_value(&kv[0], key_field)?,
                        from_warehouse_value(&kv[1], value_field)?,
                    )),
                    other => Err(mismatch(field, other)),
                })
                .collect::<Result<_>>()?;
            return Ok(Value::Map(entries));
        }
        let element = field.element();
        return Ok(Value::Array(
            items
                .iter()
                .map(|v| from_warehouse_value(v, &element))
                .collect::<Result<_>>()?,
        ));
    }

    let v = match (field.field_type, value) {
        (_, WarehouseValue::Null) => Value::Null,
        (FieldType::Integer, WarehouseValue::Int64(i)) => Value::Int64(*i),
        (FieldType::Float, WarehouseValue::Float64(x)) => Value::Float64(*x),
        (FieldType::Boolean, WarehouseValue::Bool(b)) => Value::Bool(*b),
        (FieldType::String, WarehouseValue::String(s)) => Value::String(s.clone()),
        (FieldType::Bytes, WarehouseValue::Bytes(b)) => Value::Bytes(b.clone()),
        (FieldType::Date, WarehouseValue::Date(days)) => Value::Date(temporal::epoch_days_to_date(*days)?),
        (FieldType::Datetime, v @ (WarehouseValue::TimestampMicros(_) | WarehouseValue::PackedDatetime(_))) => {
            Value::Timestamp(temporal::decode_to_civil(v)?)
        }
        (FieldType::Timestamp, v @ (WarehouseValue::TimestampMicros(_) | WarehouseValue::PackedDatetime(_))) => {
            let utc = temporal::decode_to_utc(v)?;
            Value::TimestampTz(DateTime::from(utc))
        }
        (FieldType::Numeric, WarehouseValue::Numeric(u)) => {
            Value::Decimal(Decimal::new(*u, field.scale.unwrap_or(NUMERIC_SCALE)))
        }
        (FieldType::Record, WarehouseValue::Record(values)) => {
            check_arity(field.fields.len(), values.len(), &format!("record `{}`", field.name))?;
            Value::Struct(
                values
                    .iter()
                    .zip(&field.fields)
                    .map(|(v, f)| from_warehouse_value(v, f))
                    .collect::<Result<_>>()?,
            )
        }
        (_, other) => return Err(mismatch(field, other)),
    };
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate, TimeZone};

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldSchema::new("id", FieldType::Integer).required(),
            FieldSchema::new("monto", FieldType::Numeric).with_precision(38, 9),
            FieldSchema::new("creado", FieldType::Timestamp),
            FieldSchema::new("dia", FieldType::Date),
            FieldSchema::map("attrs", FieldType::String, FieldSchema::new("value", FieldType::Integer)),
            FieldSchema::new("tags", FieldType::String).repeated(),
            FieldSchema::record("dir", vec![FieldSchema::new("calle", FieldType::String)]),
        ])
    }

    fn row() -> Row {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        vec![
            Value::Int64(7),
            Value::Decimal("-99999999999999999999999999999.999999999".parse().unwrap()),
            Value::TimestampTz(
                tz.from_local_datetime(
                    &NaiveDate::from_ymd_opt(2024, 2, 29)
                        .unwrap()
                        .and_hms_micro_opt(23, 0, 0, 5)
                        .unwrap(),
                )
                .unwrap(),
            ),
            Value::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
            Value::Map(vec![(Value::String("a".into()), Value::Int64(1))]),
            Value::Array(vec![Value::String("x".into()), Value::Null]),
            Value::Struct(vec![Value::String("Mitre".into())]),
        ]
    }

    #[test]
    fn fila_completa_ida_y_vuelta_en_ambas_estrategias() {
        let original = row();
        for strategy in [WriteStrategy::Direct, WriteStrategy::Staged] {
            let wrow = to_warehouse_row(&original, &schema(), strategy).unwrap();
            let back = from_warehouse_row(&wrow, &schema()).unwrap();
            // el timestamp con zona vuelve normalizado a UTC: mismo instante
            let (Value::TimestampTz(a), Value::TimestampTz(b)) = (&original[2], &back[2]) else {
                panic!("esperaba timestamps con zona");
            };
            assert_eq!(a, b);
            assert_eq!(back[0], original[0]);
            assert_eq!(back[1], original[1]);
            assert_eq!(back[3..], original[3..]);
        }
    }

    #[test]
    fn timestamp_usa_la_codificacion_de_la_estrategia() {
        let wrow = to_warehouse_row(&row(), &schema(), WriteStrategy::Direct).unwrap();
        assert!(matches!(wrow[2], WarehouseValue::TimestampMicros(_)));
        let wrow = to_warehouse_row(&row(), &schema(), WriteStrategy::Staged).unwrap();
        assert!(matches!(wrow[2], WarehouseValue::PackedDatetime(_)));
    }

    #[test]
    fn null_en_campo_required_es_error() {
        let mut r = row();
        r[0] = Value::Null;
        let err = to_warehouse_row(&r, &schema(), WriteStrategy::Direct).unwrap_err();
        assert!(matches!(err, ConnectorError::Encoding { .. }));
    }

    #[test]
    fn aridad_distinta_es_error() {
        let mut r = row();
        r.pop();
        assert!(to_warehouse_row(&r, &schema(), WriteStrategy::Direct).is_err());
    }

    #[test]
    fn decimal_que_no_entra_es_precision_overflow() {
        let mut r = row();
        r[1] = Value::Decimal("0.0000000001".parse().unwrap());
        assert!(matches!(
            to_warehouse_row(&r, &schema(), WriteStrategy::Staged),
            Err(ConnectorError::PrecisionOverflow { .. })
        ));
    }

    #[test]
    fn tipos_incompatibles_fallan() {
        let f = FieldSchema::new("n", FieldType::Integer);
        assert!(to_warehouse_value(&Value::String("1".into()), &f, WriteStrategy::Direct).is_err());
        // ensanchamiento permitido
        let f = FieldSchema::new("x", FieldType::Float);
        assert_eq!(
            to_warehouse_value(&Value::Int64(2), &f, WriteStrategy::Direct).unwrap(),
            WarehouseValue::Float64(2.0)
        );
    }

    #[test]
    fn repeated_nulo_es_lista_vacia() {
        let f = FieldSchema::new("tags", FieldType::String).repeated();
        assert_eq!(
            to_warehouse_value(&Value::Null, &f, WriteStrategy::Direct).unwrap(),
            WarehouseValue::Repeated(vec![])
        );
    }

    #[test]
    fn record_repetido_con_key_y_value_vuelve_como_array() {
        let f = FieldSchema::record(
            "pares",
            vec![
                FieldSchema::new("key", FieldType::String),
                FieldSchema::new("value", FieldType::Integer),
            ],
        )
        .repeated();
        let original = Value::Array(vec![Value::Struct(vec![
            Value::String("a".into()),
            Value::Int64(1),
        ])]);
        let encoded = to_warehouse_value(&original, &f, WriteStrategy::Staged).unwrap();
        assert_eq!(from_warehouse_value(&encoded, &f).unwrap(), original);
    }
}
