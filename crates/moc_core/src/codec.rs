use chrono::{DateTime, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::{
    divider, AttributeTypeSpec, DataType, FormatConfig, Id, MocError, MocResult, Value,
};

/// Decode the external textual representation of a value into its typed
/// form, driven by the attribute type's kind and configuration.
pub fn decode(raw: &str, spec: &AttributeTypeSpec, config: &FormatConfig) -> MocResult<Value> {
    match spec.data_type {
        DataType::Boolean => decode_boolean(raw).map(Value::Boolean),
        DataType::Int => decode_int(raw).map(Value::Int),
        DataType::FixedPoint => {
            decode_fixed_point(raw, decimal_places(spec, config)).map(Value::FixedPoint)
        }
        DataType::FloatingPoint => decode_float(raw).map(Value::FloatingPoint),
        DataType::String => Ok(Value::String(raw.to_string())),
        DataType::Text => Ok(Value::Text(raw.to_string())),
        DataType::Datetime => decode_datetime(raw, config).map(Value::Datetime),
        DataType::Date => decode_date(raw, config).map(Value::Date),
        DataType::Codebook => Id::parse(raw.trim()).map(Value::Codebook),
        DataType::Geo => {
            let (lat_part, lon_part) = split_parts(raw, &config.geo_separator)?;
            let lat = lat_part
                .ok_or_else(|| MocError::format("geo value is missing its latitude"))?;
            let lon = lon_part
                .ok_or_else(|| MocError::format("geo value is missing its longitude"))?;
            Ok(Value::Geo {
                lat: decode_float(&lat)?,
                lon: decode_float(&lon)?,
            })
        }
        DataType::RangeInt => {
            let (from, to) = decode_range(raw, config, decode_int)?;
            check_order(&from, &to)?;
            Ok(Value::RangeInt { from, to })
        }
        DataType::RangeFixedPoint => {
            let places = decimal_places(spec, config);
            let (from, to) = decode_range(raw, config, |part| decode_fixed_point(part, places))?;
            check_order(&from, &to)?;
            Ok(Value::RangeFixedPoint { from, to })
        }
        DataType::RangeFloatingPoint => {
            let (from, to) = decode_range(raw, config, decode_float)?;
            check_order(&from, &to)?;
            Ok(Value::RangeFloatingPoint { from, to })
        }
        DataType::RangeDatetime => {
            let (from, to) = decode_range(raw, config, |part| decode_datetime(part, config))?;
            check_order(&from, &to)?;
            Ok(Value::RangeDatetime { from, to })
        }
        DataType::RangeDate => {
            let (from, to) = decode_range(raw, config, |part| decode_date(part, config))?;
            check_order(&from, &to)?;
            Ok(Value::RangeDate { from, to })
        }
        DataType::Complex => Err(MocError::schema(format!(
            "attribute type '{}' is complex and takes no direct value",
            spec.name
        ))),
    }
}

/// Inverse of `decode`: the external form shown in API responses. Unset
/// range bounds render as empty strings.
pub fn encode(value: &Value, spec: &AttributeTypeSpec, config: &FormatConfig) -> String {
    encode_with(value, spec, config, "")
}

/// Change-log rendition: identical to `encode` except unset range bounds
/// render as the literal `null` token.
pub fn encode_log(value: &Value, spec: &AttributeTypeSpec, config: &FormatConfig) -> String {
    encode_with(value, spec, config, "null")
}

fn encode_with(
    value: &Value,
    spec: &AttributeTypeSpec,
    config: &FormatConfig,
    empty_bound: &str,
) -> String {
    let places = decimal_places(spec, config);
    let bound = |text: Option<String>| text.unwrap_or_else(|| empty_bound.to_string());
    match value {
        Value::Boolean(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::FixedPoint(v) => encode_fixed_point(*v, places),
        Value::FloatingPoint(v) => v.to_string(),
        Value::String(v) | Value::Text(v) => v.clone(),
        Value::Datetime(v) => encode_datetime(*v, config),
        Value::Date(v) => v.format(&config.date_format).to_string(),
        Value::Codebook(v) => v.to_string(),
        Value::Geo { lat, lon } => format!("{lat}{}{lon}", config.geo_separator),
        Value::RangeInt { from, to } => format!(
            "{}{}{}",
            bound(from.map(|v| v.to_string())),
            config.range_separator,
            bound(to.map(|v| v.to_string())),
        ),
        Value::RangeFixedPoint { from, to } => format!(
            "{}{}{}",
            bound(from.map(|v| encode_fixed_point(v, places))),
            config.range_separator,
            bound(to.map(|v| encode_fixed_point(v, places))),
        ),
        Value::RangeFloatingPoint { from, to } => format!(
            "{}{}{}",
            bound(from.map(|v| v.to_string())),
            config.range_separator,
            bound(to.map(|v| v.to_string())),
        ),
        Value::RangeDatetime { from, to } => format!(
            "{}{}{}",
            bound(from.map(|v| encode_datetime(v, config))),
            config.range_separator,
            bound(to.map(|v| encode_datetime(v, config))),
        ),
        Value::RangeDate { from, to } => format!(
            "{}{}{}",
            bound(from.map(|v| v.format(&config.date_format).to_string())),
            config.range_separator,
            bound(to.map(|v| v.format(&config.date_format).to_string())),
        ),
    }
}

fn decimal_places(spec: &AttributeTypeSpec, config: &FormatConfig) -> u32 {
    spec.decimal_places.unwrap_or(config.default_decimal_places)
}

fn decode_boolean(raw: &str) -> MocResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(MocError::format(format!("invalid boolean '{other}'"))),
    }
}

fn decode_int(raw: &str) -> MocResult<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| MocError::format(format!("invalid number '{}'", raw.trim())))
}

fn decode_float(raw: &str) -> MocResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| MocError::format(format!("invalid number '{}'", raw.trim())))
}

fn decode_fixed_point(raw: &str, places: u32) -> MocResult<i64> {
    let text = raw.trim();
    let parsed = Decimal::from_str_exact(text)
        .map_err(|_| MocError::format(format!("invalid number '{text}'")))?;
    let scaled = (parsed * Decimal::from(divider(places))).round();
    scaled
        .to_i64()
        .ok_or_else(|| MocError::format(format!("number '{text}' is out of range")))
}

fn encode_fixed_point(stored: i64, places: u32) -> String {
    Decimal::new(stored, places).to_string()
}

fn decode_date(raw: &str, config: &FormatConfig) -> MocResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), &config.date_format)
        .map_err(|_| MocError::format(format!("invalid date '{}'", raw.trim())))
}

fn format_carries_offset(format: &str) -> bool {
    format.contains("%z") || format.contains("%:z") || format.contains("%#z") || format == "%+"
}

fn decode_datetime(raw: &str, config: &FormatConfig) -> MocResult<NaiveDateTime> {
    let text = raw.trim();
    for format in &config.datetime_input_formats {
        if format_carries_offset(format) {
            if let Ok(parsed) = DateTime::parse_from_str(text, format) {
                return Ok(match display_offset(config) {
                    Some(offset) => parsed.with_timezone(&offset).naive_local(),
                    None => parsed.naive_local(),
                });
            }
        } else if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return localize(naive, config);
        }
    }
    Err(MocError::format(format!("invalid datetime '{text}'")))
}

/// Interpret an offset-free datetime in the configured display offset.
/// Ambiguous or nonexistent local instants are decode failures.
fn localize(naive: NaiveDateTime, config: &FormatConfig) -> MocResult<NaiveDateTime> {
    let Some(offset) = display_offset(config) else {
        return Ok(naive);
    };
    match offset.from_local_datetime(&naive) {
        LocalResult::Single(local) => Ok(local.naive_local()),
        LocalResult::Ambiguous(_, _) | LocalResult::None => Err(MocError::format(format!(
            "ambiguous local time '{naive}'"
        ))),
    }
}

fn encode_datetime(value: NaiveDateTime, config: &FormatConfig) -> String {
    match display_offset(config) {
        Some(offset) => match offset.from_local_datetime(&value) {
            LocalResult::Single(local) => local.format("%+").to_string(),
            _ => value.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
        },
        None => value.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
    }
}

fn display_offset(config: &FormatConfig) -> Option<FixedOffset> {
    config
        .datetime_offset_minutes
        .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
}

/// Split complex textual input into its two parts. Exactly one separator
/// occurrence is required; blank parts come back as `None`.
fn split_parts(raw: &str, separator: &str) -> MocResult<(Option<String>, Option<String>)> {
    let (left, right) = raw.split_once(separator).ok_or_else(|| {
        MocError::format(format!("expected two parts separated by '{separator}'"))
    })?;
    let part = |text: &str| {
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    Ok((part(left), part(right)))
}

fn decode_range<T>(
    raw: &str,
    config: &FormatConfig,
    mut decode_bound: impl FnMut(&str) -> MocResult<T>,
) -> MocResult<(Option<T>, Option<T>)> {
    let (from, to) = split_parts(raw, &config.range_separator)?;
    let from = from.map(|part| decode_bound(&part)).transpose()?;
    let to = to.map(|part| decode_bound(&part)).transpose()?;
    Ok((from, to))
}

fn check_order<T: PartialOrd>(from: &Option<T>, to: &Option<T>) -> MocResult<()> {
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(range_order_error());
        }
    }
    Ok(())
}

fn range_order_error() -> MocError {
    MocError::format("range lower bound exceeds its upper bound")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{decode, encode, encode_log};
    use crate::{AttributeTypeSpec, DataType, FormatConfig, MocError, Value};

    fn spec(kind: DataType) -> AttributeTypeSpec {
        let mut spec = AttributeTypeSpec::new("test", kind);
        if kind.is_fixed_point() {
            spec.decimal_places = Some(2);
        }
        spec
    }

    fn config() -> FormatConfig {
        FormatConfig::default()
    }

    #[test]
    fn fixed_point_scales_by_divider() {
        let decoded = decode("19.99", &spec(DataType::FixedPoint), &config()).expect("decode");
        assert_eq!(decoded, Value::FixedPoint(1999));
        assert_eq!(encode(&decoded, &spec(DataType::FixedPoint), &config()), "19.99");
    }

    #[test]
    fn fixed_point_rejects_non_numeric_input() {
        let err = decode("a lot", &spec(DataType::FixedPoint), &config()).unwrap_err();
        assert!(matches!(err, MocError::Format { .. }));
    }

    #[test]
    fn boolean_is_case_insensitive() {
        for raw in ["true", "True", "TRUE"] {
            assert_eq!(
                decode(raw, &spec(DataType::Boolean), &config()).expect("decode"),
                Value::Boolean(true)
            );
        }
        assert!(decode("yes", &spec(DataType::Boolean), &config()).is_err());
    }

    #[test]
    fn datetime_tries_formats_in_order() {
        let config = config();
        let iso = decode(
            "2020-01-02T03:04:05+00:00",
            &spec(DataType::Datetime),
            &config,
        )
        .expect("iso");
        let plain = decode("2020-01-02 03:04:05", &spec(DataType::Datetime), &config)
            .expect("plain");
        assert_eq!(iso, plain);
        assert!(decode("02.01.2020", &spec(DataType::Datetime), &config).is_err());
    }

    #[test]
    fn datetime_normalizes_to_display_offset() {
        let mut config = config();
        config.datetime_offset_minutes = Some(60);
        let decoded = decode(
            "2020-01-02T03:04:05+00:00",
            &spec(DataType::Datetime),
            &config,
        )
        .expect("decode");
        // 03:04:05 UTC is 04:04:05 at +01:00.
        let expected = NaiveDate::from_ymd_opt(2020, 1, 2)
            .and_then(|d| d.and_hms_opt(4, 4, 5))
            .expect("datetime");
        assert_eq!(decoded, Value::Datetime(expected));
    }

    #[test]
    fn range_parses_open_bounds() {
        let decoded = decode("1 -> ", &spec(DataType::RangeInt), &config()).expect("decode");
        assert_eq!(
            decoded,
            Value::RangeInt {
                from: Some(1),
                to: None
            }
        );
        let both = decode(" -> 10", &spec(DataType::RangeInt), &config()).expect("decode");
        assert_eq!(
            both,
            Value::RangeInt {
                from: None,
                to: Some(10)
            }
        );
    }

    #[test]
    fn range_rejects_reversed_bounds() {
        let err = decode("10 -> 1", &spec(DataType::RangeInt), &config()).unwrap_err();
        assert!(matches!(err, MocError::Format { .. }));
        assert!(decode("2.5 -> 1.5", &spec(DataType::RangeFloatingPoint), &config()).is_err());
        assert!(decode("2021-01-01 -> 2020-01-01", &spec(DataType::RangeDate), &config()).is_err());
    }

    #[test]
    fn geo_requires_both_coordinates() {
        let decoded = decode("50.087, 14.42", &spec(DataType::Geo), &config()).expect("decode");
        assert_eq!(
            decoded,
            Value::Geo {
                lat: 50.087,
                lon: 14.42
            }
        );
        assert!(decode("50.087, ", &spec(DataType::Geo), &config()).is_err());
        assert!(decode("50.087", &spec(DataType::Geo), &config()).is_err());
    }

    #[test]
    fn log_rendition_spells_out_null_bounds() {
        let value = Value::RangeFixedPoint {
            from: Some(1999),
            to: None,
        };
        let spec = spec(DataType::RangeFixedPoint);
        assert_eq!(encode(&value, &spec, &config()), "19.99 -> ");
        assert_eq!(encode_log(&value, &spec, &config()), "19.99 -> null");
    }

    #[test]
    fn roundtrip_for_every_kind() {
        let config = config();
        let samples = [
            (DataType::Boolean, "true"),
            (DataType::Int, "-42"),
            (DataType::FixedPoint, "19.99"),
            (DataType::FloatingPoint, "2.5"),
            (DataType::String, "Sirius a.s."),
            (DataType::Text, "long form text"),
            (DataType::Date, "2020-03-14"),
            (DataType::RangeInt, "1 -> 9"),
            (DataType::RangeFixedPoint, "0.01 -> 19.99"),
            (DataType::RangeFloatingPoint, "0.5 -> 1.5"),
            (DataType::RangeDate, "2020-01-01 -> 2020-12-31"),
            (DataType::Geo, "50.087, 14.42"),
        ];
        for (kind, raw) in samples {
            let spec = spec(kind);
            let decoded = decode(raw, &spec, &config).expect("decode");
            let encoded = encode(&decoded, &spec, &config);
            let redecoded = decode(&encoded, &spec, &config).expect("redecode");
            assert_eq!(redecoded, decoded, "kind {kind:?} failed to roundtrip");
        }
    }

    #[test]
    fn datetime_roundtrips_with_fixed_offset() {
        let mut config = config();
        config.datetime_offset_minutes = Some(120);
        let spec = spec(DataType::Datetime);
        let decoded = decode("2020-06-01T10:30:00+02:00", &spec, &config).expect("decode");
        let encoded = encode(&decoded, &spec, &config);
        let redecoded = decode(&encoded, &spec, &config).expect("redecode");
        assert_eq!(redecoded, decoded);
    }
}
