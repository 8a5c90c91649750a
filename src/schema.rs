/*! Message schemas and the id registry.

A [`Spec`] describes one message id: an ordered field list for the
send direction, the receive direction, or both. The two directions are
independent; a getter typically sends nothing and receives a struct,
and a few messages send one shape and receive another.

Schemas are built once, registered in a [`Registry`] keyed by message
id, and never mutated afterwards. Anything the codec needs repeatedly,
like the fixed byte size and the position of the variable length
field, is computed at registration time.
*/
use std::collections::HashMap;
use std::sync::Arc;

use crate::field::FieldKind;
use crate::{Error, Result};

/// Upper bound used when sizing reads for variable length replies.
///
/// Terminal output and config blobs have no declared length; this cap
/// bounds the buffer reserved for them.
pub const STRING_MAX_LEN: usize = 5000;

/// One named field in a schema.
#[derive(Clone, Copy, Debug)]
pub struct Field {
    /// Field name, used for lookup on decoded messages.
    pub name: &'static str,
    /// Wire type.
    pub kind: FieldKind,
    /// Fixed point scale factor. `0` means none. `-1` on a
    /// [`FieldKind::Bytes`] field marks it as raw bytes rather than
    /// ASCII text.
    pub scalar: i32,
}

impl Field {
    /// An unscaled field.
    #[must_use]
    pub const fn plain(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            scalar: 0,
        }
    }

    /// An integer field holding a fixed point value times `scalar`.
    #[must_use]
    pub const fn scaled(name: &'static str, kind: FieldKind, scalar: i32) -> Self {
        Self { name, kind, scalar }
    }

    /// A variable length field carrying raw bytes, not text.
    #[must_use]
    pub const fn raw_bytes(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Bytes,
            scalar: -1,
        }
    }

    /// A variable length ASCII text field.
    #[must_use]
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Bytes,
            scalar: 0,
        }
    }
}

/// Ordered field list for one direction of a message.
#[derive(Clone, Debug)]
pub struct Schema {
    fields: Vec<Field>,
    string_index: Option<usize>,
    fixed_size: usize,
}

impl Schema {
    /// Validate and index a field list.
    ///
    /// At most one variable length field is allowed.
    pub fn new(fields: &[Field]) -> Result<Self> {
        let mut string_index = None;
        let mut fixed_size = 0;
        for (idx, field) in fields.iter().enumerate() {
            match field.kind.width() {
                Some(w) => fixed_size += w,
                None => {
                    if string_index.is_some() {
                        return Err(Error::InvalidSchema(
                            "at most one variable length field per direction",
                        ));
                    }
                    string_index = Some(idx);
                }
            }
        }
        Ok(Self {
            fields: fields.to_vec(),
            string_index,
            fixed_size,
        })
    }

    /// The ordered fields.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Index of the variable length field, if there is one.
    #[must_use]
    pub fn string_index(&self) -> Option<usize> {
        self.string_index
    }

    /// Combined width of all fixed size fields.
    #[must_use]
    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }
}

/// Wire description of one message id.
#[derive(Debug)]
pub struct Spec {
    id: u8,
    name: &'static str,
    send: Option<Schema>,
    recv: Option<Schema>,
}

impl Spec {
    /// Build a spec from optional send and receive field lists.
    ///
    /// At least one direction must be present.
    pub fn new(
        id: u8,
        name: &'static str,
        send: Option<&[Field]>,
        recv: Option<&[Field]>,
    ) -> Result<Self> {
        if send.is_none() && recv.is_none() {
            return Err(Error::InvalidSchema("no field list in either direction"));
        }
        Ok(Self {
            id,
            name,
            send: send.map(Schema::new).transpose()?,
            recv: recv.map(Schema::new).transpose()?,
        })
    }

    /// A command that is only ever sent.
    pub fn setter(id: u8, name: &'static str, fields: &[Field]) -> Result<Self> {
        Self::new(id, name, Some(fields), None)
    }

    /// A request with an empty send side and a typed reply.
    pub fn getter(id: u8, name: &'static str, recv: &[Field]) -> Result<Self> {
        Self::new(id, name, Some(&[]), Some(recv))
    }

    /// Message id.
    #[must_use]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Human readable message name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Schema for the send direction.
    #[must_use]
    pub fn send(&self) -> Option<&Schema> {
        self.send.as_ref()
    }

    /// Schema for the receive direction.
    #[must_use]
    pub fn recv(&self) -> Option<&Schema> {
        self.recv.as_ref()
    }

    /// How many payload bytes a reply to this message can carry: the
    /// id byte, the fixed fields, and room for a variable length
    /// field if the receive schema has one.
    #[must_use]
    pub fn expected_recv_len(&self) -> usize {
        match &self.recv {
            None => 0,
            Some(schema) => {
                let var = if schema.string_index().is_some() {
                    STRING_MAX_LEN
                } else {
                    0
                };
                1 + schema.fixed_size() + var
            }
        }
    }
}

/// All known message specs, keyed by id.
///
/// A registry is assembled before any traffic flows and is immutable
/// from then on; controllers share it behind an [`Arc`]. Registering
/// the same id twice is an error.
#[derive(Debug, Default)]
pub struct Registry {
    by_id: HashMap<u8, Arc<Spec>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a spec, failing on id collision.
    pub fn register(&mut self, spec: Spec) -> Result<()> {
        if self.by_id.contains_key(&spec.id()) {
            return Err(Error::DuplicateMessageId(spec.id()));
        }
        self.by_id.insert(spec.id(), Arc::new(spec));
        Ok(())
    }

    /// Look up the spec for a message id.
    #[must_use]
    pub fn get(&self, id: u8) -> Option<&Arc<Spec>> {
        self.by_id.get(&id)
    }

    /// Number of registered message ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
