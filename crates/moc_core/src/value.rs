use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::{DataType, Id, MocError, MocResult};

/// ISO-4217 currency code. Only fixed-point values may carry one.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn parse(code: &str) -> MocResult<Self> {
        let code = code.trim();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
            Ok(Self(code.to_string()))
        } else {
            Err(MocError::format(format!("invalid currency code '{code}'")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decoded attribute value. One variant per storable kind; fixed-point
/// variants hold the scaled integer (round(decimal * divider)).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Int(i64),
    FixedPoint(i64),
    FloatingPoint(f64),
    String(String),
    Text(String),
    Datetime(NaiveDateTime),
    Date(NaiveDate),
    Codebook(Id),
    Geo {
        lat: f64,
        lon: f64,
    },
    RangeInt {
        from: Option<i64>,
        to: Option<i64>,
    },
    RangeFixedPoint {
        from: Option<i64>,
        to: Option<i64>,
    },
    RangeFloatingPoint {
        from: Option<f64>,
        to: Option<f64>,
    },
    RangeDatetime {
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    },
    RangeDate {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Int(_) => DataType::Int,
            Value::FixedPoint(_) => DataType::FixedPoint,
            Value::FloatingPoint(_) => DataType::FloatingPoint,
            Value::String(_) => DataType::String,
            Value::Text(_) => DataType::Text,
            Value::Datetime(_) => DataType::Datetime,
            Value::Date(_) => DataType::Date,
            Value::Codebook(_) => DataType::Codebook,
            Value::Geo { .. } => DataType::Geo,
            Value::RangeInt { .. } => DataType::RangeInt,
            Value::RangeFixedPoint { .. } => DataType::RangeFixedPoint,
            Value::RangeFloatingPoint { .. } => DataType::RangeFloatingPoint,
            Value::RangeDatetime { .. } => DataType::RangeDatetime,
            Value::RangeDate { .. } => DataType::RangeDate,
        }
    }

    /// Flatten into the nullable-column image stored on an attribute-value row.
    pub fn to_slots(&self) -> ValueSlots {
        let mut slots = ValueSlots::default();
        match self {
            Value::Boolean(v) => slots.value_boolean = Some(*v),
            Value::Int(v) | Value::FixedPoint(v) => slots.value_int = Some(*v),
            Value::FloatingPoint(v) => slots.value_float = Some(*v),
            Value::String(v) => slots.value_string = Some(v.clone()),
            Value::Text(v) => slots.value_text = Some(v.clone()),
            Value::Datetime(v) => slots.value_datetime = Some(datetime_to_micros(*v)),
            Value::Date(v) => slots.value_date = Some(*v),
            Value::Codebook(v) => slots.codebook_value_id = Some(*v),
            Value::Geo { lat, lon } => {
                slots.value_float = Some(*lat);
                slots.value_float_to = Some(*lon);
            }
            Value::RangeInt { from, to } | Value::RangeFixedPoint { from, to } => {
                slots.value_int = *from;
                slots.value_int_to = *to;
            }
            Value::RangeFloatingPoint { from, to } => {
                slots.value_float = *from;
                slots.value_float_to = *to;
            }
            Value::RangeDatetime { from, to } => {
                slots.value_datetime = from.map(datetime_to_micros);
                slots.value_datetime_to = to.map(datetime_to_micros);
            }
            Value::RangeDate { from, to } => {
                slots.value_date = *from;
                slots.value_date_to = *to;
            }
        }
        slots
    }

    /// Rebuild a value from stored slots; `kind` selects which slots matter.
    pub fn from_slots(kind: DataType, slots: &ValueSlots) -> MocResult<Self> {
        let missing = |slot: &str| {
            MocError::integrity(format!("stored {kind:?} value is missing its {slot} slot"))
        };
        Ok(match kind {
            DataType::Boolean => Value::Boolean(slots.value_boolean.ok_or_else(|| missing("boolean"))?),
            DataType::Int => Value::Int(slots.value_int.ok_or_else(|| missing("int"))?),
            DataType::FixedPoint => Value::FixedPoint(slots.value_int.ok_or_else(|| missing("int"))?),
            DataType::FloatingPoint => {
                Value::FloatingPoint(slots.value_float.ok_or_else(|| missing("float"))?)
            }
            DataType::String => {
                Value::String(slots.value_string.clone().ok_or_else(|| missing("string"))?)
            }
            DataType::Text => Value::Text(slots.value_text.clone().ok_or_else(|| missing("text"))?),
            DataType::Datetime => Value::Datetime(micros_to_datetime(
                slots.value_datetime.ok_or_else(|| missing("datetime"))?,
            )?),
            DataType::Date => Value::Date(slots.value_date.ok_or_else(|| missing("date"))?),
            DataType::Codebook => {
                Value::Codebook(slots.codebook_value_id.ok_or_else(|| missing("codebook"))?)
            }
            DataType::Geo => Value::Geo {
                lat: slots.value_float.ok_or_else(|| missing("lat"))?,
                lon: slots.value_float_to.ok_or_else(|| missing("lon"))?,
            },
            DataType::RangeInt => Value::RangeInt {
                from: slots.value_int,
                to: slots.value_int_to,
            },
            DataType::RangeFixedPoint => Value::RangeFixedPoint {
                from: slots.value_int,
                to: slots.value_int_to,
            },
            DataType::RangeFloatingPoint => Value::RangeFloatingPoint {
                from: slots.value_float,
                to: slots.value_float_to,
            },
            DataType::RangeDatetime => Value::RangeDatetime {
                from: slots.value_datetime.map(micros_to_datetime).transpose()?,
                to: slots.value_datetime_to.map(micros_to_datetime).transpose()?,
            },
            DataType::RangeDate => Value::RangeDate {
                from: slots.value_date,
                to: slots.value_date_to,
            },
            DataType::Complex => {
                return Err(MocError::schema("complex attributes do not store values"))
            }
        })
    }

    /// Canonical content string used by the dedup invariant: at most one
    /// attribute-value row per (subject, attribute, content_key).
    pub fn content_key(&self) -> String {
        self.to_slots().content_key()
    }
}

/// Flat nullable-column image of a `Value`. The only slot-selection logic
/// in the codebase lives in `Value::to_slots`/`Value::from_slots`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSlots {
    pub value_boolean: Option<bool>,
    pub value_int: Option<i64>,
    pub value_int_to: Option<i64>,
    pub value_float: Option<f64>,
    pub value_float_to: Option<f64>,
    pub value_string: Option<String>,
    pub value_text: Option<String>,
    pub value_datetime: Option<i64>,
    pub value_datetime_to: Option<i64>,
    pub value_date: Option<NaiveDate>,
    pub value_date_to: Option<NaiveDate>,
    pub codebook_value_id: Option<Id>,
}

impl ValueSlots {
    /// Every slot participates, populated or not, so that two rows compare
    /// equal exactly when all their slots match. The `=` prefix keeps a
    /// populated empty string distinct from a null slot.
    pub fn content_key(&self) -> String {
        fn part(slot: Option<String>) -> String {
            match slot {
                Some(text) => format!("={text}"),
                None => String::new(),
            }
        }
        [
            part(self.value_boolean.map(|v| v.to_string())),
            part(self.value_int.map(|v| v.to_string())),
            part(self.value_int_to.map(|v| v.to_string())),
            part(self.value_float.map(|v| v.to_string())),
            part(self.value_float_to.map(|v| v.to_string())),
            part(self.value_string.as_deref().map(normalize_text)),
            part(self.value_text.as_deref().map(normalize_text)),
            part(self.value_datetime.map(|v| v.to_string())),
            part(self.value_datetime_to.map(|v| v.to_string())),
            part(self.value_date.map(|v| v.to_string())),
            part(self.value_date_to.map(|v| v.to_string())),
            part(self.codebook_value_id.map(|v| v.to_string())),
        ]
        .join("|")
    }
}

pub fn normalize_text(value: &str) -> String {
    value.nfc().collect()
}

pub fn datetime_to_micros(value: NaiveDateTime) -> i64 {
    value.and_utc().timestamp_micros()
}

pub fn micros_to_datetime(micros: i64) -> MocResult<NaiveDateTime> {
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| MocError::integrity(format!("stored datetime {micros} is out of range")))
}
