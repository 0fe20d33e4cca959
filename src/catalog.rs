//! Live-data parameter catalog and decoder.
//!
//! Descriptors are fixed at build time per data source. Decoding is total:
//! a payload too short for a descriptor degrades that one value to NaN and
//! never fails the containing record.

/// One decodable live-data parameter inside a data-source payload.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: &'static str,
    pub unit: &'static str,
    /// Byte offset inside the data-source response payload.
    pub position: usize,
    /// Width of the raw little-endian integer, in bytes.
    pub size: usize,
    /// Affine conversion: `raw * scale + offset`.
    pub scale: f64,
    pub offset: f64,
    /// Decimal places, clamped to [0, 6] at decode time.
    pub precision: i32,
}

/// An addressable sensor group: one ReadDataByLocalIdentifier request
/// returns one payload decoded against every parameter, in order.
pub struct DataSource {
    pub id: u8,
    pub parameters: &'static [Parameter],
}

macro_rules! param {
    ($name:expr, $unit:expr, $pos:expr, $size:expr, $scale:expr, $offset:expr, $prec:expr) => {
        Parameter {
            name: $name,
            unit: $unit,
            position: $pos,
            size: $size,
            scale: $scale,
            offset: $offset,
            precision: $prec,
        }
    };
}

pub static DATA_SOURCES: &[DataSource] = &[DataSource {
    id: 0x01,
    parameters: &[
        param!("Oxygen Sensor-Bank1/Sensor1", "mV", 38, 2, 4.883, 0.0, 1),
        param!("Air Flow Rate from Mass Air Flow Sensor", "kg/h", 15, 2, 0.03125, 0.0, 2),
        param!("Engine Coolant Temperature Sensor", "C", 4, 1, 0.75, 0.0, 2),
        param!("Oil Temperature Sensor", "C", 6, 1, 1.0, -40.0, 2),
        param!("Intake Air Temperature Sensor", "C", 9, 1, 0.75, -48.0, 2),
        param!("Throttle Position", "'", 11, 1, 0.468627, 0.0, 2),
        param!("Battery voltage", "V", 1, 1, 0.10159, 0.0, 2),
        param!("Vehicle Speed", "km/h", 30, 1, 1.0, 0.0, 1),
        param!("Engine Speed", "RPM", 31, 2, 1.0, 0.0, 1),
        param!("Oxygen Sensor-Bank1/Sensor2", "mV", 40, 2, 4.883, 0.0, 2),
        param!("Ignition Timing Advance for 1 Cylinder", "'", 58, 1, -0.325, -72.0, 2),
        param!("Cylinder Injection Time-Bank1", "ms", 76, 2, 0.004, 0.0, 2),
        param!("Long Term Fuel Trim-Idle Load", "ms", 89, 2, 0.004, 0.0, 2),
        param!("Long Term Fuel Trim-Part Load", "%", 91, 2, 0.001529, 0.0, 2),
        param!("Camshaft Actual Position", "'", 142, 1, 0.375, -60.0, 2),
        param!("Camshaft position target", "'", 143, 1, 0.375, -60.0, 2),
        param!("Ignition dwell time", "ms", 106, 2, 0.004, 0.0, 2),
        param!("EVAP Purge valve", "%", 101, 2, 0.003052, 0.0, 2),
        param!("Idle speed control actuator", "%", 99, 2, 0.001529, 0.0, 2),
        param!("CVVT Valve Duty", "%", 156, 2, 0.001526, 0.0, 2),
        param!("Oxygen Sensor Heater Duty-Bank1/Sensor1", "%", 93, 1, 0.390625, 0.0, 2),
        param!("Oxygen Sensor Heater Duty-Bank1/Sensor2", "%", 94, 1, 0.390625, 0.0, 2),
        param!("CVVT Status", "", 145, 1, 1.0, 0.0, 1),
        param!("CVVT Actuation Status", "", 146, 1, 1.0, 0.0, 1),
        param!("CVVT Duty Control Status", "", 160, 1, 1.0, 0.0, 1),
    ],
}];

/// Total number of values in one telemetry record.
pub fn field_count() -> usize {
    DATA_SOURCES.iter().map(|s| s.parameters.len()).sum()
}

/// Machine-safe column key derived from a parameter label: lower-cased,
/// non-alphanumeric runs collapsed to single underscores, trimmed.
pub fn make_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut pending_sep = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !key.is_empty() {
                key.push('_');
            }
            pending_sep = false;
            key.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    key
}

fn read_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i)))
}

fn round_to(value: f64, precision: i32) -> f64 {
    let factor = 10f64.powi(precision.clamp(0, 6));
    (value * factor).round() / factor
}

/// Decode one parameter out of a raw data-source payload. A slice shorter
/// than the descriptor's width decodes to NaN.
pub fn decode(payload: &[u8], parameter: &Parameter) -> f64 {
    let end = parameter.position + parameter.size;
    let Some(slice) = payload.get(parameter.position..end) else {
        return f64::NAN;
    };

    let raw = read_le(slice) as f64;
    round_to(raw * parameter.scale + parameter.offset, parameter.precision)
}
