/*! Packet framer.

Wraps a payload of 1..=65535 bytes in the VESC wire envelope:

```text
[ START ][ LEN ][ PAYLOAD ][ CRC16-BE ][ 0x03 ]
```

`START` is `0x02` with a one byte length for payloads under 256 bytes,
`0x03` with a two byte big endian length otherwise. The terminator is
always `0x03`; it shares its value with the long form start byte, so
frames are parsed by position and never by scanning for the terminator.

[`unframe`] recovers frames from a dirty byte stream. Corruption is
never reported upward: a candidate frame that fails its checks costs
one byte of input, and parsing locks onto the next plausible start, so
a good frame behind garbage still decodes.
*/
use log::{debug, trace};

use crate::crc::crc16;
use crate::{Error, Result};

/// Largest payload that fits the two byte length header.
pub const MAX_PAYLOAD: usize = 65535;

const START_SHORT: u8 = 0x02;
const START_LONG: u8 = 0x03;
const TERMINATOR: u8 = 0x03;

/// Worst case envelope overhead: start, two length bytes, CRC, terminator.
pub const MAX_OVERHEAD: usize = 6;

/// Wrap a payload in the wire envelope.
///
/// Fails with [`Error::PayloadLength`] for an empty payload or one
/// larger than [`MAX_PAYLOAD`].
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadLength(payload.len()));
    }
    let mut out = Vec::with_capacity(payload.len() + MAX_OVERHEAD);
    if payload.len() < 256 {
        out.push(START_SHORT);
        out.push(payload.len() as u8);
    } else {
        out.push(START_LONG);
        out.extend((payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out.extend(crc16(payload).to_be_bytes());
    out.push(TERMINATOR);
    Ok(out)
}

/// Parse the next frame out of a receive buffer.
///
/// Returns the recovered payload, if any, and how many leading bytes
/// of `buf` the caller should discard:
///
/// * `(Some(payload), n)`: a valid frame was parsed. `n` covers the
///   whole frame plus any garbage that preceded it.
/// * `(None, 0)`: the buffer is empty or starts with a plausible but
///   incomplete frame. Accumulate more bytes and call again.
/// * `(None, k)` with `k > 0`: the first `k` bytes cannot begin a
///   frame. Drop them; the remainder may still become one.
#[must_use]
pub fn unframe(buf: &[u8]) -> (Option<Vec<u8>>, usize) {
    let mut skipped = 0;
    loop {
        let rest = &buf[skipped..];
        if rest.is_empty() {
            return (None, skipped);
        }
        // Hunt for a start byte.
        match rest.iter().position(|&b| b == START_SHORT || b == START_LONG) {
            Some(0) => {}
            Some(n) => {
                skipped += n;
                continue;
            }
            None => return (None, buf.len()),
        }
        let header_len = if rest[0] == START_SHORT { 1 } else { 2 };
        if rest.len() < 1 + header_len {
            return (None, skipped);
        }
        let payload_len = if header_len == 1 {
            rest[1] as usize
        } else {
            u16::from_be_bytes([rest[1], rest[2]]) as usize
        };
        let total = 1 + header_len + payload_len + 3;
        if rest.len() < total {
            return (None, skipped);
        }
        let payload = &rest[1 + header_len..1 + header_len + payload_len];
        let want_crc = u16::from_be_bytes([rest[total - 3], rest[total - 2]]);
        if payload_len > 0 && rest[total - 1] == TERMINATOR && crc16(payload) == want_crc {
            trace!("unframed {payload_len} byte payload, {skipped} bytes of garbage skipped");
            return (Some(payload.to_vec()), skipped + total);
        }
        // Corrupt candidate. Give up one byte and try to lock onto a
        // frame hidden in what we thought was payload.
        debug!("frame candidate at offset {skipped} failed CRC or terminator check");
        skipped += 1;
    }
}
