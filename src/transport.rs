/*! Byte transport abstraction.

The session layer only needs two things from a transport: push bytes
out, and hand over whatever input has arrived so far without blocking.
Serial port handling itself lives outside this crate; wrap whichever
serial crate you use in this trait, with the port opened at
[`crate::DEFAULT_BAUD`] and a short read timeout.

[`TcpTransport`] adapts a TCP stream, which covers serial-over-network
bridges like `socat` or an ESP-Link in front of the VESC.
*/
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

/// A byte pipe to the device.
///
/// Implementations must be [`Send`]: the heartbeat task writes frames
/// from a background thread.
pub trait Transport: Send {
    /// Write all bytes.
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Read whatever input is pending, up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when nothing is buffered; never blocks waiting
    /// for data.
    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// [`Transport`] over a nonblocking TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to a TCP-to-serial bridge.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::new(stream)
    }

    /// Wrap an already connected stream.
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        // The stream is in nonblocking mode for the read side; a full
        // send buffer shows up as WouldBlock here and needs a retry.
        let mut pos = 0;
        while pos < bytes.len() {
            match self.stream.write(&bytes[pos..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "connection closed",
                    ));
                }
                Ok(n) => pos += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}
