use serde::{Deserialize, Serialize};

/// Kind identifier for attribute values. Simple kinds occupy a single
/// storage slot; geo and the range kinds occupy two; `Complex` has no
/// slot of its own and only groups sub-attributes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean = 1,
    Int = 2,
    FixedPoint = 3,
    FloatingPoint = 4,
    String = 5,
    Text = 6,
    Datetime = 7,
    Date = 8,
    Codebook = 9,
    Geo = 10,
    RangeInt = 11,
    RangeFixedPoint = 12,
    RangeFloatingPoint = 13,
    RangeDatetime = 14,
    RangeDate = 15,
    Complex = 16,
}

impl DataType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(DataType::Boolean),
            2 => Some(DataType::Int),
            3 => Some(DataType::FixedPoint),
            4 => Some(DataType::FloatingPoint),
            5 => Some(DataType::String),
            6 => Some(DataType::Text),
            7 => Some(DataType::Datetime),
            8 => Some(DataType::Date),
            9 => Some(DataType::Codebook),
            10 => Some(DataType::Geo),
            11 => Some(DataType::RangeInt),
            12 => Some(DataType::RangeFixedPoint),
            13 => Some(DataType::RangeFloatingPoint),
            14 => Some(DataType::RangeDatetime),
            15 => Some(DataType::RangeDate),
            16 => Some(DataType::Complex),
            _ => None,
        }
    }

    pub fn is_simple(self) -> bool {
        self.slots().len() == 1
    }

    pub fn is_range(self) -> bool {
        matches!(
            self,
            DataType::RangeInt
                | DataType::RangeFixedPoint
                | DataType::RangeFloatingPoint
                | DataType::RangeDatetime
                | DataType::RangeDate
        )
    }

    pub fn is_composite(self) -> bool {
        matches!(self, DataType::Complex)
    }

    pub fn is_fixed_point(self) -> bool {
        matches!(self, DataType::FixedPoint | DataType::RangeFixedPoint)
    }

    /// Physical storage slots this kind occupies, in column order.
    pub fn slots(self) -> &'static [SlotKind] {
        match self {
            DataType::Boolean => &[SlotKind::Bool],
            DataType::Int | DataType::FixedPoint => &[SlotKind::Int],
            DataType::FloatingPoint => &[SlotKind::Float],
            DataType::String => &[SlotKind::Str],
            DataType::Text => &[SlotKind::LongStr],
            DataType::Datetime => &[SlotKind::Time],
            DataType::Date => &[SlotKind::Date],
            DataType::Codebook => &[SlotKind::CodebookRef],
            DataType::Geo => &[SlotKind::Float, SlotKind::Float],
            DataType::RangeInt | DataType::RangeFixedPoint => &[SlotKind::Int, SlotKind::Int],
            DataType::RangeFloatingPoint => &[SlotKind::Float, SlotKind::Float],
            DataType::RangeDatetime => &[SlotKind::Time, SlotKind::Time],
            DataType::RangeDate => &[SlotKind::Date, SlotKind::Date],
            DataType::Complex => &[],
        }
    }
}

/// Physical column family a slot maps onto.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SlotKind {
    Bool,
    Int,
    Float,
    Str,
    LongStr,
    Time,
    Date,
    CodebookRef,
}

/// Fixed-point storage divider: stored integer = round(decimal * divider).
pub fn divider(decimal_places: u32) -> i64 {
    10i64.pow(decimal_places)
}

pub const DEFAULT_RANGE_SEPARATOR: &str = " -> ";
pub const DEFAULT_GEO_SEPARATOR: &str = ", ";
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// ISO-8601 first, then the common offset-free layouts.
pub const DEFAULT_DATETIME_INPUT_FORMATS: &[&str] = &[
    "%+",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Value-codec settings, passed explicitly so the codec stays pure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormatConfig {
    pub range_separator: String,
    pub geo_separator: String,
    pub date_format: String,
    pub datetime_input_formats: Vec<String>,
    /// Canonical display offset in minutes east of UTC; `None` keeps
    /// datetimes naive.
    pub datetime_offset_minutes: Option<i32>,
    /// Used when an attribute type does not pin its own precision.
    pub default_decimal_places: u32,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            range_separator: DEFAULT_RANGE_SEPARATOR.to_string(),
            geo_separator: DEFAULT_GEO_SEPARATOR.to_string(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            datetime_input_formats: DEFAULT_DATETIME_INPUT_FORMATS
                .iter()
                .map(|format| format.to_string())
                .collect(),
            datetime_offset_minutes: Some(0),
            default_decimal_places: 2,
        }
    }
}
