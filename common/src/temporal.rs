//! Codec temporal: conversión entre timestamps del motor (civiles o con zona),
//! microsegundos desde epoch y el formato "civil empaquetado" de 64 bits del
//! warehouse.
//!
//! Layout empaquetado de fecha/hora (de bit bajo a alto):
//!
//! ```text
//!  micros:20 | second:6 | minute:6 | hour:5 | day:5 | month:4 | year:14
//! ```
//!
//! La precisión es de microsegundos; lo que sobra por debajo se trunca.

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};

use crate::config::WriteStrategy;
use crate::error::{ConnectorError, Result};
use crate::value::WarehouseValue;

const MICRO_LENGTH: u32 = 20;

const SECOND_SHIFT: u32 = 0;
const MINUTE_SHIFT: u32 = 6;
const HOUR_SHIFT: u32 = 12;
const DAY_SHIFT: u32 = 17;
const MONTH_SHIFT: u32 = 22;
const YEAR_SHIFT: u32 = 26;

const MICRO_MASK: i64 = 0xF_FFFF;
const SECOND_MASK: i64 = 0x3F;
const MINUTE_MASK: i64 = 0xFC0;
const HOUR_MASK: i64 = 0x1_F000;
const DAY_MASK: i64 = 0x3E_0000;
const MONTH_MASK: i64 = 0x3C0_0000;
const YEAR_MASK: i64 = 0xFF_FC00_0000;

/// Bits válidos de la parte "segundos" de un datetime empaquetado.
const DATETIME_SECONDS_BITS: u32 = 40;
/// Bits válidos de la parte "segundos" de una hora empaquetada.
const TIME_SECONDS_BITS: u32 = 17;

pub const MIN_YEAR: i32 = 1;
pub const MAX_YEAR: i32 = 9999;

fn unix_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn check_range(dt: &NaiveDateTime) -> Result<()> {
    if dt.year() < MIN_YEAR || dt.year() > MAX_YEAR {
        return Err(ConnectorError::encoding(format!(
            "year {} out of range [{MIN_YEAR}, {MAX_YEAR}] in {dt}",
            dt.year()
        )));
    }
    if dt.nanosecond() >= 1_000_000_000 {
        return Err(ConnectorError::encoding(format!(
            "leap second not supported: {dt}"
        )));
    }
    Ok(())
}

/// Descarta lo que haya por debajo del microsegundo (truncando, no redondeando).
pub fn truncate_to_micros(dt: NaiveDateTime) -> NaiveDateTime {
    let nanos = dt.nanosecond();
    dt.with_nanosecond(nanos - nanos % 1_000).unwrap_or(dt)
}

/* =========================
   Microsegundos desde epoch
   ========================= */

/// Timestamp civil -> micros, sin aplicar ningún offset (se toma como UTC).
pub fn civil_to_epoch_micros(dt: &NaiveDateTime) -> Result<i64> {
    check_range(dt)?;
    Ok(dt.and_utc().timestamp() * 1_000_000 + i64::from(dt.nanosecond() / 1_000))
}

/// Timestamp con zona -> micros, normalizado a UTC.
pub fn zoned_to_epoch_micros<Tz: TimeZone>(dt: &DateTime<Tz>) -> Result<i64> {
    civil_to_epoch_micros(&dt.naive_utc())
}

pub fn epoch_micros_to_civil(micros: i64) -> Result<NaiveDateTime> {
    Ok(epoch_micros_to_utc(micros)?.naive_utc())
}

pub fn epoch_micros_to_utc(micros: i64) -> Result<DateTime<Utc>> {
    let dt = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
        ConnectorError::encoding(format!("epoch micros {micros} out of range"))
    })?;
    check_range(&dt.naive_utc())?;
    Ok(dt)
}

/// Decodifica un valor devuelto por el warehouse con su zona asociada.
pub fn epoch_micros_to_zoned(micros: i64, offset: FixedOffset) -> Result<DateTime<FixedOffset>> {
    Ok(epoch_micros_to_utc(micros)?.with_timezone(&offset))
}

/* =========================
   Formato civil empaquetado
   ========================= */

fn pack_time_seconds(t: &impl Timelike) -> i64 {
    (i64::from(t.hour()) << HOUR_SHIFT)
        | (i64::from(t.minute()) << MINUTE_SHIFT)
        | (i64::from(t.second()) << SECOND_SHIFT)
}

fn pack_datetime_seconds(dt: &NaiveDateTime) -> i64 {
    (i64::from(dt.year()) << YEAR_SHIFT)
        | (i64::from(dt.month()) << MONTH_SHIFT)
        | (i64::from(dt.day()) << DAY_SHIFT)
        | pack_time_seconds(dt)
}

fn unpack_time(seconds_part: i64, micros: i64, code: i64) -> Result<NaiveTime> {
    let hour = ((seconds_part & HOUR_MASK) >> HOUR_SHIFT) as u32;
    let minute = ((seconds_part & MINUTE_MASK) >> MINUTE_SHIFT) as u32;
    let second = ((seconds_part & SECOND_MASK) >> SECOND_SHIFT) as u32;
    NaiveTime::from_hms_micro_opt(hour, minute, second, micros as u32).ok_or_else(|| {
        ConnectorError::encoding(format!("invalid packed time-of-day in code {code:#x}"))
    })
}

pub fn encode_packed_datetime_micros(dt: &NaiveDateTime) -> Result<i64> {
    check_range(dt)?;
    Ok((pack_datetime_seconds(dt) << MICRO_LENGTH) | i64::from(dt.nanosecond() / 1_000))
}

pub fn decode_packed_datetime_micros(code: i64) -> Result<NaiveDateTime> {
    let seconds_part = code >> MICRO_LENGTH;
    if code < 0 || seconds_part >> DATETIME_SECONDS_BITS != 0 {
        return Err(ConnectorError::encoding(format!(
            "invalid packed datetime code {code:#x}"
        )));
    }
    let micros = code & MICRO_MASK;
    let year = ((seconds_part & YEAR_MASK) >> YEAR_SHIFT) as i32;
    let month = ((seconds_part & MONTH_MASK) >> MONTH_SHIFT) as u32;
    let day = ((seconds_part & DAY_MASK) >> DAY_SHIFT) as u32;

    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
        ConnectorError::encoding(format!("invalid packed date in code {code:#x}"))
    })?;
    let time = unpack_time(seconds_part, micros, code)?;
    let dt = date.and_time(time);
    check_range(&dt)?;
    Ok(dt)
}

pub fn encode_packed_time_micros(t: &NaiveTime) -> Result<i64> {
    if t.nanosecond() >= 1_000_000_000 {
        return Err(ConnectorError::encoding(format!(
            "leap second not supported: {t}"
        )));
    }
    Ok((pack_time_seconds(t) << MICRO_LENGTH) | i64::from(t.nanosecond() / 1_000))
}

pub fn decode_packed_time_micros(code: i64) -> Result<NaiveTime> {
    let seconds_part = code >> MICRO_LENGTH;
    if code < 0 || seconds_part >> TIME_SECONDS_BITS != 0 {
        return Err(ConnectorError::encoding(format!(
            "invalid packed time code {code:#x}"
        )));
    }
    unpack_time(seconds_part, code & MICRO_MASK, code)
}

/* =========================
   Fechas
   ========================= */

pub fn date_to_epoch_days(d: &NaiveDate) -> Result<i32> {
    if d.year() < MIN_YEAR || d.year() > MAX_YEAR {
        return Err(ConnectorError::encoding(format!("date {d} out of range")));
    }
    Ok((*d - unix_epoch_date()).num_days() as i32)
}

pub fn epoch_days_to_date(days: i32) -> Result<NaiveDate> {
    unix_epoch_date()
        .checked_add_signed(chrono::Duration::days(i64::from(days)))
        .filter(|d| d.year() >= MIN_YEAR && d.year() <= MAX_YEAR)
        .ok_or_else(|| ConnectorError::encoding(format!("epoch day {days} out of range")))
}

/* =========================
   Según estrategia de escritura
   ========================= */

/// Codifica un timestamp civil según el camino de escritura.
pub fn encode_civil(dt: &NaiveDateTime, strategy: WriteStrategy) -> Result<WarehouseValue> {
    match strategy {
        WriteStrategy::Direct => civil_to_epoch_micros(dt).map(WarehouseValue::TimestampMicros),
        WriteStrategy::Staged => {
            encode_packed_datetime_micros(dt).map(WarehouseValue::PackedDatetime)
        }
    }
}

/// Codifica un timestamp con zona: primero se normaliza a UTC.
pub fn encode_zoned<Tz: TimeZone>(dt: &DateTime<Tz>, strategy: WriteStrategy) -> Result<WarehouseValue> {
    encode_civil(&dt.naive_utc(), strategy)
}

/// Inversa de `encode_civil`/`encode_zoned`: devuelve el valor civil (en UTC
/// si el origen tenía zona).
pub fn decode_to_civil(value: &WarehouseValue) -> Result<NaiveDateTime> {
    match value {
        WarehouseValue::TimestampMicros(m) => epoch_micros_to_civil(*m),
        WarehouseValue::PackedDatetime(p) => decode_packed_datetime_micros(*p),
        other => Err(ConnectorError::encoding(format!(
            "expected a temporal warehouse value, got {other:?}"
        ))),
    }
}

pub fn decode_to_utc(value: &WarehouseValue) -> Result<DateTime<Utc>> {
    decode_to_civil(value).map(|dt| dt.and_utc())
}
