//! Conversions between wire encodings and the values the host sees.

/// Convert a multi-level switch byte to a percent. 0..=99 map straight
/// across, 0xFF means fully on. 100..=254 are not valid levels.
pub fn dim_to_percent(level: u8) -> Option<u8> {
    match level {
        0xff => Some(100),
        0..=99 => Some(level),
        _ => None,
    }
}

/// Convert a percent to a multi-level switch byte. 100% becomes the "full
/// on" marker 0xFF.
pub fn percent_to_dim(percent: u8) -> Option<u8> {
    match percent {
        100 => Some(0xff),
        0..=99 => Some(percent),
        _ => None,
    }
}

/// Temperature scales a sensor report can carry and the host can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempScale {
    Celsius,
    Fahrenheit,
}

impl TempScale {
    /// The scale bits in a sensor report metadata byte: 0 = C, 1 = F.
    pub fn from_report_bits(bits: u8) -> Self {
        if bits & 0x01 != 0 {
            TempScale::Fahrenheit
        } else {
            TempScale::Celsius
        }
    }

    pub fn report_bits(&self) -> u8 {
        match self {
            TempScale::Celsius => 0,
            TempScale::Fahrenheit => 1,
        }
    }
}

/// Convert a temperature between scales. Conversion happens once, at the
/// impl boundary; nothing stores both forms.
pub fn convert_temp(value: f64, from: TempScale, to: TempScale) -> f64 {
    match (from, to) {
        (TempScale::Celsius, TempScale::Fahrenheit) => value * 9.0 / 5.0 + 32.0,
        (TempScale::Fahrenheit, TempScale::Celsius) => (value - 32.0) * 5.0 / 9.0,
        _ => value,
    }
}

/// A decoded multi-level sensor value: the metadata byte packs
/// precision (3 bits), scale (2 bits) and size (3 bits), followed by a
/// big-endian signed value of `size` bytes scaled by 10^precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorValue {
    pub value: f64,
    pub scale_bits: u8,
}

impl SensorValue {
    /// Decode from the metadata byte onward. Returns the value and how many
    /// bytes were consumed.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let meta = *bytes.first()?;
        let precision = (meta >> 5) & 0x07;
        let scale_bits = (meta >> 3) & 0x03;
        let size = (meta & 0x07) as usize;
        if !matches!(size, 1 | 2 | 4) || bytes.len() < 1 + size {
            return None;
        }

        let raw: i64 = match size {
            1 => bytes[1] as i8 as i64,
            2 => i16::from_be_bytes([bytes[1], bytes[2]]) as i64,
            4 => i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as i64,
            _ => unreachable!(),
        };

        let value = raw as f64 / 10f64.powi(precision as i32);
        Some((Self { value, scale_bits }, 1 + size))
    }

    /// Encode with the given precision and a 2-byte value, the form used
    /// for thermostat set points.
    pub fn encode_2byte(value: f64, precision: u8, scale_bits: u8) -> [u8; 3] {
        let raw = (value * 10f64.powi(precision as i32)).round() as i16;
        let meta = (precision << 5) | ((scale_bits & 0x03) << 3) | 0x02;
        let be = raw.to_be_bytes();
        [meta, be[0], be[1]]
    }
}
