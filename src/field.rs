/*! Field type codes and runtime field values.

Every message field carries one of the type codes below. The codes and
their widths match the firmware's packing rules; everything is big
endian on the wire.

The `F32` code is not IEEE-754. The firmware's `Double32_Auto` format
packs sign, a biased `frexp` exponent and a 23 bit fraction-above-half
mantissa into 32 bits. For normal numbers the bit pattern happens to
coincide with IEEE single precision, but the encoding is defined by
the firmware routine and is reimplemented here bit for bit.
*/
use serde::Serialize;

/// Wire type of a single message field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// One byte boolean (`?`).
    Bool,
    /// Unsigned byte (`B`).
    U8,
    /// Signed byte (`b`).
    I8,
    /// Big endian unsigned 16 bit (`H`).
    U16,
    /// Big endian signed 16 bit (`h`).
    I16,
    /// Big endian unsigned 32 bit (`I` / `L`).
    U32,
    /// Big endian signed 32 bit (`i`).
    I32,
    /// 32 bit `Double32_Auto` float (`f`).
    F32,
    /// Half precision stand-in (`e`): rounded to the nearest integer
    /// and sent as a signed 16 bit value.
    F16,
    /// Single raw byte, no scaling ever applied (`c`).
    Byte,
    /// Variable length byte string (`s`). At most one per direction.
    Bytes,
}

impl FieldKind {
    /// Wire width in bytes. `None` for the variable length code.
    #[must_use]
    pub fn width(self) -> Option<usize> {
        match self {
            FieldKind::Bool | FieldKind::U8 | FieldKind::I8 | FieldKind::Byte => Some(1),
            FieldKind::U16 | FieldKind::I16 | FieldKind::F16 => Some(2),
            FieldKind::U32 | FieldKind::I32 | FieldKind::F32 => Some(4),
            FieldKind::Bytes => None,
        }
    }

    /// True for the integer codes a scalar may be applied to.
    #[must_use]
    pub fn scalable(self) -> bool {
        matches!(
            self,
            FieldKind::U8
                | FieldKind::I8
                | FieldKind::U16
                | FieldKind::I16
                | FieldKind::U32
                | FieldKind::I32
        )
    }
}

/// Runtime value of a message field.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean field.
    Bool(bool),
    /// Any integer field.
    Int(i64),
    /// Float field, or an integer field carrying a scalar.
    Float(f64),
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// ASCII text string.
    Text(String),
}

impl Value {
    /// Numeric view of the value, if it has one.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(u8::from(*v).into()),
            _ => None,
        }
    }

    /// Integer view of the value, if it has one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some((*v).into()),
            _ => None,
        }
    }

    /// Byte string view of the value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            Value::Text(v) => Some(v.as_bytes()),
            _ => None,
        }
    }

    /// Text view of the value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

// Split a float into fraction and exponent such that
// x == fr * 2^e with 0.5 <= |fr| < 1, like C's frexpf.
fn frexp(x: f32) -> (f32, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let raw_exp = ((bits >> 23) & 0xff) as i32;
    if raw_exp == 0 {
        // Subnormal: normalise first.
        let (fr, e) = frexp(x * 2f32.powi(64));
        return (fr, e - 64);
    }
    let fr = f32::from_bits((bits & 0x807f_ffff) | (126 << 23));
    (fr, raw_exp - 126)
}

/// Serialise a float in the firmware's `Double32_Auto` layout.
#[must_use]
pub fn encode_f32_auto(x: f32) -> u32 {
    // Tiny magnitudes, subnormals included, collapse to zero.
    if x.abs() < 1.5e-38 {
        return 0;
    }
    let (fr, e) = frexp(x);
    let fr_abs = fr.abs();
    let (mantissa, exp) = if fr_abs >= 0.5 {
        let m = ((fr_abs - 0.5) * 2.0 * 8388608.0).round_ties_even() as u32;
        (m, e + 126)
    } else {
        (0, 0)
    };
    let sign = u32::from(fr < 0.0);
    (sign << 31) | (((exp as u32) & 0xff) << 23) | (mantissa & 0x7f_ffff)
}

/// Deserialise a float from the firmware's `Double32_Auto` layout.
#[must_use]
pub fn decode_f32_auto(raw: u32) -> f32 {
    let exp = ((raw >> 23) & 0xff) as i32;
    let mantissa = raw & 0x7f_ffff;
    if exp == 0 && mantissa == 0 {
        return 0.0;
    }
    let fr = mantissa as f32 / (2.0 * 8388608.0) + 0.5;
    let fr = if raw & 0x8000_0000 != 0 { -fr } else { fr };
    fr * 2f32.powi(exp - 126)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_auto_known_bits() {
        // For normal values the layout lines up with IEEE single
        // precision, which gives us easy reference bit patterns.
        assert_eq!(encode_f32_auto(1.0), 0x3f80_0000);
        assert_eq!(encode_f32_auto(-123.456), 0xc2f6_e979);
        assert_eq!(encode_f32_auto(0.0), 0);
        assert_eq!(encode_f32_auto(1.0e-38), 0);
        assert_eq!(decode_f32_auto(0x3f80_0000), 1.0);
        assert_eq!(decode_f32_auto(0), 0.0);
    }

    #[test]
    fn f32_auto_roundtrip() {
        for x in [
            0.0f32, 1.0, -1.0, 0.5, -0.5, 3.3, 50.5, -1234.5678, 1.0e20, -1.0e-20, 65535.0,
        ] {
            let back = decode_f32_auto(encode_f32_auto(x));
            let err = (back - x).abs();
            assert!(
                err <= x.abs() * 1e-6,
                "{x} came back as {back} (err {err})"
            );
        }
    }

    #[test]
    fn f32_auto_zero_window() {
        // Below the firmware's smallest representable magnitude
        // everything is sent as zero bytes.
        assert_eq!(encode_f32_auto(1.4e-38), 0);
        assert_ne!(encode_f32_auto(1.6e-38), 0);
    }

    #[test]
    fn frexp_matches_libm() {
        for (x, fr, e) in [
            (1.0f32, 0.5, 1),
            (0.5, 0.5, 0),
            (-8.0, -0.5, 4),
            (3.0, 0.75, 2),
        ] {
            assert_eq!(frexp(x), (fr, e), "frexp({x})");
        }
    }

    #[test]
    fn widths() {
        assert_eq!(FieldKind::I32.width(), Some(4));
        assert_eq!(FieldKind::F16.width(), Some(2));
        assert_eq!(FieldKind::Byte.width(), Some(1));
        assert_eq!(FieldKind::Bytes.width(), None);
    }
}
