#![warn(missing_docs)]
/*! This crate speaks the VESC binary wire protocol, for controlling and
querying one or more VESC brushless motor controllers over a byte
oriented transport.

The transport is typically a serial UART at 115200 baud, but anything
that can move bytes works: the library only needs the [`Transport`]
trait, and ships a TCP adapter for serial-over-network bridges.

# Architecture overview

Bytes move through three layers on their way to the wire:

```text
  [ Controller: set_rpm(), get_measurements(), ... ]
                     ↓
  [ Message codec: typed fields ↔ packed payload  ]
                     ↓
  [ Packet framer: length + CRC16 + terminator    ]
                     ↓
               [ Transport ]
```

Incoming bytes run the same path in reverse, with the framer
resynchronising past any corruption on the line.

Several controllers can share one serial line: a [`MultiController`]
owns the transport behind a mutex and hands out one [`Controller`] per
CAN node id. Messages for a controller with a CAN id are wrapped in a
forwarding prefix and relayed over the CAN bus by the directly
connected VESC.

# Examples

Encoding a command without any hardware:

```
use rustvesc::codec::Message;
use rustvesc::messages::{self, CommandId};
use rustvesc::frame::frame;

let registry = messages::standard_registry();
let spec = registry.get(CommandId::SetDuty as u8).unwrap();
let msg = Message::compose(spec.clone(), vec![0.5.into()])?;
let packet = frame(&msg.pack()?)?;
assert_eq!(packet, [0x02, 0x05, 0x05, 0x00, 0x00, 0xC3, 0x50, 0x3A, 0xA5, 0x03]);
# Ok::<(), rustvesc::Error>(())
```

Driving a motor over a TCP-to-serial bridge:

```no_run
use rustvesc::controller::Controller;
use rustvesc::transport::TcpTransport;

let transport = TcpTransport::connect("192.168.1.7:65102")?;
let mut vesc = Controller::connect(transport)?;
vesc.set_rpm(3000)?;
let m = vesc.get_measurements()?;
println!("input voltage: {} V", m.v_in);
vesc.close();
# Ok::<(), anyhow::Error>(())
```
*/

pub mod codec;
pub mod controller;
pub mod crc;
pub mod field;
pub mod firmware;
pub mod frame;
pub mod messages;
pub mod schema;
pub mod session;
pub mod transport;

pub use controller::{Controller, ControllerParams, MultiController};
pub use field::Value;
pub use messages::{FaultCode, FwVersion, Measurements, RotorPositionMode};
pub use schema::Registry;
pub use session::Session;
pub use transport::Transport;

/// Baud rate the VESC serial port runs at.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Suggested read timeout when opening the serial port itself.
pub const DEFAULT_SERIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(50);

/// RustVESC error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame payload was empty or too large to frame.
    #[error("payload length {0} outside 1..=65535")]
    PayloadLength(usize),

    /// A payload named a message id that is not in the registry.
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    /// A payload did not match the schema for its message id.
    #[error("malformed payload for message id {id}: {reason}")]
    MalformedPayload {
        /// Message id from the payload header.
        id: u8,
        /// What did not line up.
        reason: &'static str,
    },

    /// Two schemas were registered under the same message id.
    #[error("duplicate message id {0}")]
    DuplicateMessageId(u8),

    /// A schema failed validation at registration time.
    #[error("invalid schema: {0}")]
    InvalidSchema(&'static str),

    /// A message was packed in a direction its schema does not define.
    #[error("message id {0} has no field list for that direction")]
    MissingSchema(u8),

    /// A message was composed with the wrong number of field values.
    #[error("expected {expected} field values, got {got}")]
    Arity {
        /// Field count in the schema.
        expected: usize,
        /// Values supplied by the caller.
        got: usize,
    },

    /// A field value did not fit the field's type code.
    #[error("value does not fit field {0:?}")]
    ArgumentType(&'static str),

    /// The transport failed.
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    /// No complete response arrived within the response timeout.
    #[error("timed out waiting for response")]
    Timeout,

    /// Multiple response frames arrived for a message with no string field.
    #[error("unexpected multi-frame response")]
    UnexpectedMultiFrame,

    /// The device rejected the flash erase request.
    #[error("firmware erase rejected by device")]
    FirmwareEraseFailed,

    /// The device rejected a firmware data chunk.
    #[error("firmware write rejected by device")]
    FirmwareWriteFailed,
}

/// RustVESC result type.
pub type Result<T> = std::result::Result<T, Error>;
