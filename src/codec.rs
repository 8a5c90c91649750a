/*! Packing and unpacking of messages.

A [`Message`] pairs a [`Spec`] with one value per schema field. Packing
walks the field list in order and emits the id byte followed by each
field big endian; unpacking reverses that, resolving the length of a
variable length field from whatever the fixed fields leave over.

Fixed point fields are handled here: a field with scalar `s` is packed
as `round(value * s)` in its integer code, and unpacked as the integer
divided by `s`.

A message bound for another VESC on the CAN bus gets the two byte
forwarding prefix in front of its id; replies come back without it.
*/
use std::sync::Arc;

use crate::field::{FieldKind, Value, decode_f32_auto, encode_f32_auto};
use crate::schema::{Field, Registry, Schema, Spec};
use crate::{Error, Result};

/// Message id of the CAN forwarding wrapper.
pub const FORWARD_CAN: u8 = 33;

/// Which of a message's two field lists is in play.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Send,
    /// Device to host.
    Recv,
}

/// A message instance: schema plus current field values.
///
/// Lives for a single request/response turn.
#[derive(Clone, Debug)]
pub struct Message {
    spec: Arc<Spec>,
    direction: Direction,
    can_id: Option<u8>,
    values: Vec<Value>,
}

impl Message {
    /// Build an outgoing message from send-direction field values, in
    /// schema order.
    pub fn compose(spec: Arc<Spec>, values: Vec<Value>) -> Result<Self> {
        Self::with_direction(spec, Direction::Send, values)
    }

    /// Build a receive-direction message. This is what a device would
    /// send back; useful for tests and simulators.
    pub fn compose_reply(spec: Arc<Spec>, values: Vec<Value>) -> Result<Self> {
        Self::with_direction(spec, Direction::Recv, values)
    }

    fn with_direction(spec: Arc<Spec>, direction: Direction, values: Vec<Value>) -> Result<Self> {
        let schema = schema_for(&spec, direction).ok_or(Error::MissingSchema(spec.id()))?;
        if schema.fields().len() != values.len() {
            return Err(Error::Arity {
                expected: schema.fields().len(),
                got: values.len(),
            });
        }
        Ok(Self {
            spec,
            direction,
            can_id: None,
            values,
        })
    }

    /// Address the message to a VESC behind the CAN bus.
    #[must_use]
    pub fn with_can_id(mut self, can_id: Option<u8>) -> Self {
        self.can_id = can_id;
        self
    }

    /// Message id.
    #[must_use]
    pub fn id(&self) -> u8 {
        self.spec.id()
    }

    /// Message name from the spec.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.spec.name()
    }

    /// CAN node id the message is addressed to, if any.
    #[must_use]
    pub fn can_id(&self) -> Option<u8> {
        self.can_id
    }

    /// The direction whose schema the values follow.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// All field values in schema order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Look up a field value by name.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        let schema = schema_for(&self.spec, self.direction)?;
        let idx = schema.fields().iter().position(|f| f.name == name)?;
        self.values.get(idx)
    }

    /// Numeric field by name.
    #[must_use]
    pub fn float(&self, name: &str) -> Option<f64> {
        self.value(name)?.as_f64()
    }

    /// Integer field by name.
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        self.value(name)?.as_i64()
    }

    /// Byte string field by name.
    #[must_use]
    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.value(name)?.as_bytes()
    }

    /// Text field by name.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.value(name)?.as_text()
    }

    /// The variable length field of the schema in play, if any.
    #[must_use]
    pub fn string_field(&self) -> Option<&Field> {
        let schema = schema_for(&self.spec, self.direction)?;
        schema.fields().get(schema.string_index()?)
    }

    /// Pack the message into a frame payload.
    pub fn pack(&self) -> Result<Vec<u8>> {
        let schema =
            schema_for(&self.spec, self.direction).ok_or(Error::MissingSchema(self.spec.id()))?;
        let mut out = Vec::with_capacity(3 + schema.fixed_size() + 16);
        if let Some(can_id) = self.can_id {
            out.push(FORWARD_CAN);
            out.push(can_id);
        }
        out.push(self.spec.id());
        for (field, value) in schema.fields().iter().zip(&self.values) {
            pack_field(&mut out, field, value)?;
        }
        Ok(out)
    }

    /// Unpack a payload into a message using the registry.
    ///
    /// `direction` selects which field list to decode with; if the
    /// spec lacks that direction the other one is used.
    pub fn unpack(registry: &Registry, payload: &[u8], direction: Direction) -> Result<Self> {
        let (&id, body) = payload.split_first().ok_or(Error::MalformedPayload {
            id: 0,
            reason: "empty payload",
        })?;
        let spec = registry
            .get(id)
            .cloned()
            .ok_or(Error::UnknownMessageId(id))?;
        let (schema, direction) = match direction {
            Direction::Recv => schema_for(&spec, Direction::Recv)
                .map(|s| (s, Direction::Recv))
                .or_else(|| schema_for(&spec, Direction::Send).map(|s| (s, Direction::Send))),
            Direction::Send => schema_for(&spec, Direction::Send)
                .map(|s| (s, Direction::Send))
                .or_else(|| schema_for(&spec, Direction::Recv).map(|s| (s, Direction::Recv))),
        }
        .ok_or(Error::MissingSchema(id))?;

        let var_len = if schema.string_index().is_some() {
            body.len()
                .checked_sub(schema.fixed_size())
                .ok_or(Error::MalformedPayload {
                    id,
                    reason: "payload shorter than its fixed fields",
                })?
        } else {
            0
        };

        let mut values = Vec::with_capacity(schema.fields().len());
        let mut cursor = 0;
        for field in schema.fields() {
            let value = match field.kind.width() {
                None => {
                    let raw = &body[cursor..cursor + var_len];
                    cursor += var_len;
                    if field.scalar == -1 {
                        Value::Bytes(raw.to_vec())
                    } else {
                        let text = std::str::from_utf8(raw)
                            .ok()
                            .filter(|s| s.is_ascii())
                            .ok_or(Error::MalformedPayload {
                                id,
                                reason: "string field is not ASCII",
                            })?;
                        Value::Text(text.to_string())
                    }
                }
                Some(width) => {
                    if body.len() < cursor + width {
                        return Err(Error::MalformedPayload {
                            id,
                            reason: "payload truncated",
                        });
                    }
                    let raw = &body[cursor..cursor + width];
                    cursor += width;
                    unpack_fixed(field, raw)
                }
            };
            values.push(value);
        }
        // Trailing bytes beyond the last field are tolerated; newer
        // firmware appends fields older schemas do not know about.
        Ok(Self {
            spec,
            direction,
            can_id: None,
            values,
        })
    }
}

/// Build the payload that requests a getter: just the id, with the
/// CAN forwarding prefix when addressed over the bus.
#[must_use]
pub fn request_payload(spec: &Spec, can_id: Option<u8>) -> Vec<u8> {
    match can_id {
        Some(node) => vec![FORWARD_CAN, node, spec.id()],
        None => vec![spec.id()],
    }
}

fn schema_for(spec: &Spec, direction: Direction) -> Option<&Schema> {
    match direction {
        Direction::Send => spec.send(),
        Direction::Recv => spec.recv(),
    }
}

fn pack_field(out: &mut Vec<u8>, field: &Field, value: &Value) -> Result<()> {
    let type_err = || Error::ArgumentType(field.name);
    match field.kind {
        FieldKind::Bytes => {
            if field.scalar == -1 {
                out.extend_from_slice(value.as_bytes().ok_or_else(type_err)?);
            } else {
                let text = value.as_text().ok_or_else(type_err)?;
                if !text.is_ascii() {
                    return Err(type_err());
                }
                out.extend_from_slice(text.as_bytes());
            }
        }
        // A scalar of 1 is an identity scale; keep those fields integer.
        _ if field.scalar > 1 => {
            let scaled = (value.as_f64().ok_or_else(type_err)? * f64::from(field.scalar)).round();
            write_int(out, field.kind, scaled as i64);
        }
        FieldKind::F32 => {
            let x = value.as_f64().ok_or_else(type_err)?;
            out.extend(encode_f32_auto(x as f32).to_be_bytes());
        }
        FieldKind::F16 => {
            let rounded = value.as_f64().ok_or_else(type_err)?.round();
            out.extend((rounded as i16).to_be_bytes());
        }
        FieldKind::Bool => out.push(u8::from(value.as_i64().ok_or_else(type_err)? != 0)),
        _ => write_int(out, field.kind, value.as_i64().ok_or_else(type_err)?),
    }
    Ok(())
}

fn write_int(out: &mut Vec<u8>, kind: FieldKind, v: i64) {
    match kind {
        FieldKind::Bool | FieldKind::U8 | FieldKind::Byte => out.push(v as u8),
        FieldKind::I8 => out.push(v as i8 as u8),
        FieldKind::U16 => out.extend((v as u16).to_be_bytes()),
        FieldKind::I16 | FieldKind::F16 => out.extend((v as i16).to_be_bytes()),
        FieldKind::U32 => out.extend((v as u32).to_be_bytes()),
        FieldKind::I32 | FieldKind::F32 => out.extend((v as i32).to_be_bytes()),
        FieldKind::Bytes => unreachable!("variable length fields are packed separately"),
    }
}

fn unpack_fixed(field: &Field, raw: &[u8]) -> Value {
    let int_val: i64 = match field.kind {
        FieldKind::Bool | FieldKind::U8 | FieldKind::Byte => raw[0].into(),
        FieldKind::I8 => (raw[0] as i8).into(),
        FieldKind::U16 => u16::from_be_bytes([raw[0], raw[1]]).into(),
        FieldKind::I16 | FieldKind::F16 => i16::from_be_bytes([raw[0], raw[1]]).into(),
        FieldKind::U32 => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).into(),
        FieldKind::I32 => i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).into(),
        FieldKind::F32 => {
            let bits = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            return Value::Float(decode_f32_auto(bits).into());
        }
        FieldKind::Bytes => unreachable!("variable length fields are unpacked separately"),
    };
    if field.scalar > 1 {
        Value::Float(int_val as f64 / f64::from(field.scalar))
    } else {
        match field.kind {
            FieldKind::Bool => Value::Bool(int_val != 0),
            FieldKind::F16 => Value::Float(int_val as f64),
            _ => Value::Int(int_val),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: u8, name: &'static str, send: &[Field], recv: &[Field]) -> Arc<Spec> {
        Arc::new(Spec::new(id, name, Some(send), Some(recv)).unwrap())
    }

    fn registry_with(specs: Vec<Spec>) -> Registry {
        let mut reg = Registry::new();
        for s in specs {
            reg.register(s).unwrap();
        }
        reg
    }

    #[test]
    fn scaled_int_roundtrip() -> Result<()> {
        let fields = [Field::scaled("x", FieldKind::I32, 1000)];
        let spec = spec(7, "scaled", &fields, &fields);
        let msg = Message::compose(spec.clone(), vec![1.2345.into()])?;
        let payload = msg.pack()?;
        assert_eq!(payload, [7, 0x00, 0x00, 0x04, 0xd3]); // round(1234.5) = 1235
        let reg = registry_with(vec![Spec::new(7, "scaled", Some(&fields), Some(&fields))?]);
        let back = Message::unpack(&reg, &payload, Direction::Recv)?;
        assert_eq!(back.float("x"), Some(1.235));
        Ok(())
    }

    #[test]
    fn scalar_rounding_error_bounded() -> Result<()> {
        use rand::Rng;
        let mut rng = rand::rng();
        for scalar in [10, 100, 1000, 10000, 1_000_000] {
            let fields = [Field::scaled("x", FieldKind::I32, scalar)];
            let reg = registry_with(vec![Spec::new(9, "s", Some(&fields), Some(&fields))?]);
            for _ in 0..50 {
                let x: f64 = rng.random_range(-1000.0..1000.0);
                let spec = reg.get(9).unwrap().clone();
                let payload = Message::compose(spec, vec![x.into()])?.pack()?;
                let back = Message::unpack(&reg, &payload, Direction::Recv)?
                    .float("x")
                    .unwrap();
                assert!(
                    (back - x).abs() <= 0.5 / f64::from(scalar) + 1e-12,
                    "scalar {scalar}: {x} came back as {back}"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn can_forwarding_prefix() -> Result<()> {
        let fields = [Field::plain("rpm", FieldKind::I32)];
        let spec = spec(8, "set_rpm", &fields, &fields);
        let msg = Message::compose(spec, vec![1000.into()])?.with_can_id(Some(72));
        assert_eq!(msg.pack()?, [0x21, 0x48, 0x08, 0x00, 0x00, 0x03, 0xe8]);
        Ok(())
    }

    #[test]
    fn request_payload_forms() -> Result<()> {
        let s = Spec::getter(4, "get_values", &[Field::plain("x", FieldKind::I32)])?;
        assert_eq!(request_payload(&s, None), [4]);
        assert_eq!(request_payload(&s, Some(72)), [33, 72, 4]);
        Ok(())
    }

    #[test]
    fn variable_field_in_the_middle() -> Result<()> {
        // offset, blob, then a trailing fixed byte: the blob length is
        // whatever the fixed fields leave over.
        let fields = [
            Field::plain("offset", FieldKind::U32),
            Field::raw_bytes("data"),
            Field::plain("flag", FieldKind::Byte),
        ];
        let reg = registry_with(vec![Spec::new(3, "w", Some(&fields), Some(&fields))?]);
        let spec = reg.get(3).unwrap().clone();
        let msg = Message::compose(
            spec,
            vec![384u32.into(), vec![0xde, 0xad, 0xbe].into(), 1u8.into()],
        )?;
        let payload = msg.pack()?;
        let back = Message::unpack(&reg, &payload, Direction::Recv)?;
        assert_eq!(back.int("offset"), Some(384));
        assert_eq!(back.bytes("data"), Some(&[0xde, 0xad, 0xbe][..]));
        assert_eq!(back.int("flag"), Some(1));
        Ok(())
    }

    #[test]
    fn ascii_text_field() -> Result<()> {
        let fields = [Field::text("cmd")];
        let reg = registry_with(vec![Spec::new(19, "t", Some(&fields), Some(&fields))?]);
        let spec = reg.get(19).unwrap().clone();
        let payload = Message::compose(spec.clone(), vec!["faults".into()])?.pack()?;
        assert_eq!(&payload[1..], b"faults");
        let back = Message::unpack(&reg, &payload, Direction::Recv)?;
        assert_eq!(back.text("cmd"), Some("faults"));
        // Non-ASCII refuses to pack.
        let bad = Message::compose(spec, vec!["fälts".into()])?;
        assert!(matches!(bad.pack(), Err(Error::ArgumentType(_))));
        Ok(())
    }

    #[test]
    fn trailing_bytes_tolerated() -> Result<()> {
        let fields = [Field::plain("a", FieldKind::I16)];
        let reg = registry_with(vec![Spec::new(1, "t", None, Some(&fields))?]);
        let back = Message::unpack(&reg, &[1, 0x00, 0x2a, 0xff, 0xff], Direction::Recv)?;
        assert_eq!(back.int("a"), Some(42));
        Ok(())
    }

    #[test]
    fn truncated_payload_rejected() -> Result<()> {
        let fields = [Field::plain("a", FieldKind::I32)];
        let reg = registry_with(vec![Spec::new(1, "t", None, Some(&fields))?]);
        assert!(matches!(
            Message::unpack(&reg, &[1, 0x00], Direction::Recv),
            Err(Error::MalformedPayload { id: 1, .. })
        ));
        // A string schema whose fixed part does not fit is also bad.
        let fields = [Field::plain("a", FieldKind::I32), Field::text("s")];
        let reg = registry_with(vec![Spec::new(2, "t", None, Some(&fields))?]);
        assert!(matches!(
            Message::unpack(&reg, &[2, 0x00], Direction::Recv),
            Err(Error::MalformedPayload { id: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn unknown_id() {
        let reg = Registry::new();
        assert!(matches!(
            Message::unpack(&reg, &[99, 1, 2], Direction::Recv),
            Err(Error::UnknownMessageId(99))
        ));
    }

    #[test]
    fn arity_checked() -> Result<()> {
        let fields = [Field::plain("a", FieldKind::I16)];
        let spec = spec(5, "t", &fields, &fields);
        assert!(matches!(
            Message::compose(spec, vec![]),
            Err(Error::Arity {
                expected: 1,
                got: 0
            })
        ));
        Ok(())
    }

    #[test]
    fn direction_fallback_on_unpack() -> Result<()> {
        // A send-only message can still be decoded, e.g. when looking
        // at our own traffic or a simulated device's inbox.
        let fields = [Field::plain("rpm", FieldKind::I32)];
        let reg = registry_with(vec![Spec::setter(8, "set_rpm", &fields)?]);
        let msg = Message::unpack(&reg, &[8, 0, 0, 0x03, 0xe8], Direction::Recv)?;
        assert_eq!(msg.int("rpm"), Some(1000));
        Ok(())
    }

    #[test]
    fn all_fixed_kinds_roundtrip() -> Result<()> {
        let fields = [
            Field::plain("b", FieldKind::Bool),
            Field::plain("u8", FieldKind::U8),
            Field::plain("i8", FieldKind::I8),
            Field::plain("u16", FieldKind::U16),
            Field::plain("i16", FieldKind::I16),
            Field::plain("u32", FieldKind::U32),
            Field::plain("i32", FieldKind::I32),
            Field::plain("f", FieldKind::F32),
            Field::plain("e", FieldKind::F16),
            Field::plain("c", FieldKind::Byte),
        ];
        let reg = registry_with(vec![Spec::new(40, "zoo", Some(&fields), Some(&fields))?]);
        let spec = reg.get(40).unwrap().clone();
        let msg = Message::compose(
            spec,
            vec![
                true.into(),
                200u8.into(),
                (-100i32).into(),
                60000u32.into(),
                (-30000i32).into(),
                4_000_000_000u32.into(),
                (-2_000_000_000i32).into(),
                Value::Float(-123.456),
                Value::Float(99.6),
                0x7fu8.into(),
            ],
        )?;
        let payload = msg.pack()?;
        assert_eq!(payload.len(), 1 + 1 + 1 + 1 + 2 + 2 + 4 + 4 + 4 + 2 + 1);
        let back = Message::unpack(&reg, &payload, Direction::Recv)?;
        assert_eq!(back.value("b"), Some(&Value::Bool(true)));
        assert_eq!(back.int("u8"), Some(200));
        assert_eq!(back.int("i8"), Some(-100));
        assert_eq!(back.int("u16"), Some(60000));
        assert_eq!(back.int("i16"), Some(-30000));
        assert_eq!(back.int("u32"), Some(4_000_000_000));
        assert_eq!(back.int("i32"), Some(-2_000_000_000));
        let f = back.float("f").unwrap();
        assert!((f - -123.456).abs() < 1e-4);
        assert_eq!(back.float("e"), Some(100.0));
        assert_eq!(back.int("c"), Some(0x7f));
        Ok(())
    }
}
