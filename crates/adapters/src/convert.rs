use domain::{DataType, GatewayError, Result, TagDefinition, Value};

/// Turn a raw wire reading into the normalized store value.
///
/// Scaled values and floating point types become `Float` (rounded to four
/// decimals so register noise does not churn the store); unscaled integer
/// types stay `Int`.
pub(crate) fn engineering_value(tag: &TagDefinition, raw: f64) -> Value {
    let eng = tag.to_engineering(raw);
    if tag.data_type.is_float() || tag.has_scaling() {
        Value::Float((eng * 10000.0).round() / 10000.0)
    } else {
        Value::Int(eng.round() as i64)
    }
}

/// Inverse direction for writes: engineering value back to the raw number
/// the wire encoding expects.
pub(crate) fn raw_from_value(tag: &TagDefinition, value: &Value) -> Result<f64> {
    let eng = value.as_f64().ok_or_else(|| {
        GatewayError::Rejected(format!(
            "tag {} expects a numeric value, got {}",
            tag.name,
            value.type_name()
        ))
    })?;
    Ok(tag.to_raw(eng))
}

/// Assemble a numeric value from consecutive 16-bit words, lowest word first
/// (the convention shared by the FINS and MELSEC device families).
pub(crate) fn decode_words_low_first(words: &[u16], data_type: DataType) -> Option<f64> {
    let pair = |w: &[u16]| -> u32 { ((w[1] as u32) << 16) | w[0] as u32 };
    match data_type {
        DataType::UInt16 => Some(*words.first()? as f64),
        DataType::Int16 => Some(*words.first()? as i16 as f64),
        DataType::UInt32 => Some(pair(words.get(..2)?) as f64),
        DataType::Int32 => Some(pair(words.get(..2)?) as i32 as f64),
        DataType::Float32 => Some(f32::from_bits(pair(words.get(..2)?)) as f64),
        DataType::Float64 => {
            let w = words.get(..4)?;
            let bits = ((pair(&w[2..4]) as u64) << 32) | pair(&w[..2]) as u64;
            Some(f64::from_bits(bits))
        }
        DataType::Bool => None,
    }
}

/// Inverse of [`decode_words_low_first`], used when writing.
pub(crate) fn encode_words_low_first(raw: f64, data_type: DataType) -> Result<Vec<u16>> {
    let split = |v: u32| -> Vec<u16> { vec![v as u16, (v >> 16) as u16] };
    match data_type {
        DataType::UInt16 => Ok(vec![raw.round() as u16]),
        DataType::Int16 => Ok(vec![raw.round() as i16 as u16]),
        DataType::UInt32 => Ok(split(raw.round() as u32)),
        DataType::Int32 => Ok(split(raw.round() as i32 as u32)),
        DataType::Float32 => Ok(split((raw as f32).to_bits())),
        DataType::Float64 => {
            let bits = raw.to_bits();
            let mut words = split(bits as u32);
            words.extend(split((bits >> 32) as u32));
            Ok(words)
        }
        DataType::Bool => Err(GatewayError::InvalidConfig(
            "bool values are written bit-wise, not as words".to_string(),
        )),
    }
}

/// Number of 16-bit words a numeric type occupies on the wire.
pub(crate) fn word_count(data_type: DataType) -> u16 {
    match data_type {
        DataType::Bool | DataType::Int16 | DataType::UInt16 => 1,
        DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
        DataType::Float64 => 4,
    }
}
