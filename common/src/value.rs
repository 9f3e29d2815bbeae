use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::{ConnectorError, Result};

/// Precisión/escala fija del tipo NUMERIC del warehouse.
pub const NUMERIC_PRECISION: u32 = 38;
pub const NUMERIC_SCALE: u32 = 9;

/// Fila tal como la produce el motor de ejecución (posicional, según el schema).
pub type Row = Vec<Value>;

/// Fila ya convertida a valores del warehouse.
pub type WarehouseRow = Vec<WarehouseValue>;

/* =========================
   Valores del motor
   ========================= */

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    /// Timestamp "de pared", sin zona (tiempo civil).
    Timestamp(NaiveDateTime),
    /// Timestamp con zona.
    TimestampTz(DateTime<FixedOffset>),
    Decimal(Decimal),
    /// Campos en el mismo orden que el schema del record.
    Struct(Vec<Value>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

/* =========================
   Valores del warehouse
   ========================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Días desde 1970-01-01.
    Date(i32),
    /// Microsegundos desde epoch (camino directo).
    TimestampMicros(i64),
    /// Fecha/hora civil empaquetada en 64 bits (camino staged).
    PackedDatetime(i64),
    /// Valor sin escala a la escala del campo. Va como string en JSON:
    /// un i128 no entra en un número JSON sin perder precisión.
    Numeric(#[serde(with = "i128_as_string")] i128),
    Record(Vec<WarehouseValue>),
    Repeated(Vec<WarehouseValue>),
}

mod i128_as_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &i128, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i128, D::Error> {
        let s = String::deserialize(d)?;
        s.parse::<i128>().map_err(de::Error::custom)
    }
}

/* =========================
   Decimal de punto fijo
   ========================= */

/// Decimal exacto: `unscaled * 10^-scale`. Con i128 alcanzan los 38 dígitos
/// de NUMERIC.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    unscaled: i128,
    scale: u32,
}

fn pow10(n: u32) -> Option<i128> {
    10i128.checked_pow(n)
}

fn digit_count(v: i128) -> u32 {
    if v == 0 {
        1
    } else {
        v.unsigned_abs().ilog10() + 1
    }
}

impl Decimal {
    pub fn new(unscaled: i128, scale: u32) -> Self {
        Self { unscaled, scale }
    }

    pub fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Quita ceros a la derecha de la parte fraccionaria.
    pub fn normalize(self) -> Self {
        let mut d = self;
        while d.scale > 0 && d.unscaled % 10 == 0 {
            d.unscaled /= 10;
            d.scale -= 1;
        }
        d
    }

    /// Reescala a `(precision, scale)` y devuelve el valor sin escala.
    /// Falla si se perderían dígitos fraccionarios distintos de cero o si el
    /// resultado tiene más de `precision` dígitos.
    pub fn rescale(&self, precision: u32, scale: u32) -> Result<i128> {
        let overflow = || ConnectorError::PrecisionOverflow {
            value: self.to_string(),
            precision,
            scale,
        };

        let d = self.normalize();
        let v = if d.scale <= scale {
            let factor = pow10(scale - d.scale).ok_or_else(overflow)?;
            d.unscaled.checked_mul(factor).ok_or_else(overflow)?
        } else {
            // tras normalize el último dígito no es cero: hay pérdida
            return Err(overflow());
        };

        if digit_count(v) > precision {
            return Err(overflow());
        }
        Ok(v)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        let a = self.normalize();
        let b = other.normalize();
        a.unscaled == b.unscaled && a.scale == b.scale
    }
}

impl Eq for Decimal {}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let digits = self.unscaled.unsigned_abs().to_string();
        if self.scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let width = self.scale as usize + 1;
        let padded = format!("{digits:0>width$}");
        let (int_part, frac_part) = padded.split_at(padded.len() - self.scale as usize);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

impl FromStr for Decimal {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ConnectorError::encoding(format!("invalid decimal literal `{s}`"));

        let t = s.trim();
        let (negative, body) = match t.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, t.strip_prefix('+').unwrap_or(t)),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, fr)) => (i, fr),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let mut unscaled: i128 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            let digit = i128::from(c as u8 - b'0');
            unscaled = unscaled
                .checked_mul(10)
                .and_then(|v| v.checked_add(digit))
                .ok_or_else(invalid)?;
        }
        if negative {
            unscaled = -unscaled;
        }
        Ok(Decimal::new(unscaled, frac_part.len() as u32))
    }
}
