/*! Request/response turns over a shared transport.

All traffic on one serial line funnels through a [`Session`]. A mutex
around the transport serialises complete turns: a request's write and
the read of its response happen under one lock acquisition, so turns
from different controllers, and heartbeat writes, never interleave on
the wire.

Reads use a drain-until-idle strategy, the same one the stock VESC
host tools use: poll the transport, and once bytes have started
arriving, stop when the stream has been quiet for an idle window. The
window is short for fixed size binary replies and longer for string
replies, whose length is unknown and which the firmware sends as
several frames. A hard timeout bounds the whole read. Idle detection
rather than a fixed byte count also keeps replies working when newer
firmware appends fields the schema does not predict.

A response that arrives as several frames is reassembled here: string
fields are joined (with a newline per frame for text, plain
concatenation for raw bytes); anything else arriving multiply is an
error.
*/
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::codec::{Direction, Message};
use crate::frame::{MAX_OVERHEAD, unframe};
use crate::schema::Registry;
use crate::transport::Transport;
use crate::{Error, Result};

/// Transport shared between controllers and heartbeat tasks.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Knobs for the drain-until-idle read loop.
#[derive(Clone, Copy, Debug)]
pub struct ReadTimings {
    /// Sleep between polls of the transport.
    pub poll: Duration,
    /// Idle window that ends a fixed size binary response.
    pub idle_binary: Duration,
    /// Idle window that ends a string response.
    pub idle_string: Duration,
    /// Hard cap on one read.
    pub overall: Duration,
}

impl Default for ReadTimings {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(10),
            idle_binary: Duration::from_millis(10),
            idle_string: Duration::from_millis(100),
            overall: Duration::from_millis(1000),
        }
    }
}

/// A decoded response.
#[derive(Debug)]
pub enum Reply {
    /// A single binary message.
    Message(Message),
    /// Text reassembled from one or more string frames.
    Text(String),
    /// Raw bytes reassembled from one or more frames.
    Blob(Vec<u8>),
}

impl Reply {
    /// The message, if this is a binary reply.
    #[must_use]
    pub fn into_message(self) -> Option<Message> {
        match self {
            Reply::Message(m) => Some(m),
            _ => None,
        }
    }

    /// The text, if this is a string reply.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Reply::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The bytes, if this is a blob reply.
    #[must_use]
    pub fn into_blob(self) -> Option<Vec<u8>> {
        match self {
            Reply::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// One end of a shared transport, with the registry needed to decode
/// what comes back.
#[derive(Clone)]
pub struct Session {
    transport: SharedTransport,
    registry: Arc<Registry>,
    timings: ReadTimings,
    garbage_bytes: Arc<AtomicU64>,
    frames_decoded: Arc<AtomicU64>,
}

impl Session {
    /// Wrap a transport in a fresh shared lock.
    pub fn new<T: Transport + 'static>(transport: T, registry: Arc<Registry>) -> Self {
        Self::from_shared(Arc::new(Mutex::new(Box::new(transport))), registry)
    }

    /// Attach to an existing shared transport.
    #[must_use]
    pub fn from_shared(transport: SharedTransport, registry: Arc<Registry>) -> Self {
        Self {
            transport,
            registry,
            timings: ReadTimings::default(),
            garbage_bytes: Arc::new(AtomicU64::new(0)),
            frames_decoded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the read timings.
    #[must_use]
    pub fn with_timings(mut self, timings: ReadTimings) -> Self {
        self.timings = timings;
        self
    }

    /// The shared transport handle.
    #[must_use]
    pub fn transport(&self) -> SharedTransport {
        self.transport.clone()
    }

    /// The registry used for decoding.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bytes discarded by frame resynchronisation so far.
    #[must_use]
    pub fn garbage_bytes(&self) -> u64 {
        self.garbage_bytes.load(Ordering::Relaxed)
    }

    /// Frames successfully decoded so far.
    #[must_use]
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    /// Write a pre-framed packet, without expecting a response.
    pub fn write(&self, packet: &[u8]) -> Result<()> {
        let mut t = self.lock();
        t.write_all(packet)?;
        Ok(())
    }

    /// Send a pre-framed request and decode its response.
    ///
    /// `expected_len` is the payload size the receive schema
    /// predicts, used to size the read buffer. `expect_string`
    /// selects the longer idle window for responses of unknown
    /// length.
    pub fn request(&self, packet: &[u8], expected_len: usize, expect_string: bool) -> Result<Reply> {
        let buf = {
            let mut t = self.lock();
            t.write_all(packet)?;
            self.drain(&mut **t, expect_string, expected_len + MAX_OVERHEAD)?
        };
        trace!("request of {} bytes drew {} bytes back", packet.len(), buf.len());
        self.decode(&buf)
    }

    /// Pick up an unsolicited frame, e.g. a debug print.
    ///
    /// Returns immediately with `None` when nothing is buffered.
    pub fn probe(&self) -> Result<Option<Reply>> {
        let buf = {
            let mut t = self.lock();
            let mut chunk = [0u8; 4096];
            let n = t.read_available(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            let mut buf = chunk[..n].to_vec();
            buf.extend(self.drain(&mut **t, false, 0)?);
            buf
        };
        match self.decode(&buf) {
            Ok(reply) => Ok(Some(reply)),
            // Noise without a complete frame in it is not an event.
            Err(Error::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn Transport>> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(
        &self,
        transport: &mut dyn Transport,
        expect_string: bool,
        size_hint: usize,
    ) -> Result<Vec<u8>> {
        let idle = if expect_string {
            self.timings.idle_string
        } else {
            self.timings.idle_binary
        };
        let start = Instant::now();
        let mut buf = Vec::with_capacity(size_hint);
        let mut chunk = [0u8; 4096];
        let mut last_growth: Option<Instant> = None;
        loop {
            let n = transport.read_available(&mut chunk)?;
            if n > 0 {
                buf.extend_from_slice(&chunk[..n]);
                last_growth = Some(Instant::now());
                // Keep pulling while bytes are flowing.
                continue;
            }
            if let Some(ts) = last_growth
                && ts.elapsed() >= idle
            {
                break;
            }
            if start.elapsed() >= self.timings.overall {
                break;
            }
            std::thread::sleep(self.timings.poll);
        }
        Ok(buf)
    }

    fn decode(&self, buf: &[u8]) -> Result<Reply> {
        let mut messages: VecDeque<Message> = VecDeque::new();
        let mut rest = buf;
        while !rest.is_empty() {
            let (payload, consumed) = unframe(rest);
            match payload {
                Some(p) => {
                    self.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    messages.push_back(Message::unpack(&self.registry, &p, Direction::Recv)?);
                }
                None if consumed == 0 => {
                    // Incomplete trailing frame; it never finished
                    // arriving.
                    if !rest.is_empty() {
                        debug!("{} trailing bytes did not form a frame", rest.len());
                    }
                    break;
                }
                None => {
                    self.garbage_bytes.fetch_add(consumed as u64, Ordering::Relaxed);
                    debug!("dropped {consumed} bytes of line noise");
                }
            }
            rest = &rest[consumed..];
        }
        let Some(first) = messages.front() else {
            return Err(Error::Timeout);
        };

        // A response carrying a string field may span frames; collect
        // the field across all of them. PRINT frames from a terminal
        // command land here too.
        let join = first.string_field().map(|f| (f.name, f.scalar));
        match join {
            Some((name, -1)) => {
                let mut blob = Vec::new();
                for m in &messages {
                    blob.extend_from_slice(m.bytes(name).ok_or(Error::MalformedPayload {
                        id: m.id(),
                        reason: "frame missing the joined bytes field",
                    })?);
                }
                Ok(Reply::Blob(blob))
            }
            Some((name, _)) => {
                let mut text = String::new();
                for m in &messages {
                    text.push_str(m.text(name).ok_or(Error::MalformedPayload {
                        id: m.id(),
                        reason: "frame missing the joined text field",
                    })?);
                    text.push('\n');
                }
                Ok(Reply::Text(text))
            }
            None if messages.len() == 1 => Ok(Reply::Message(
                messages.pop_front().expect("length checked above"),
            )),
            None => Err(Error::UnexpectedMultiFrame),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test helpers shared with the controller tests.
    use super::*;

    /// Transport whose replies are scripted in advance. Each write
    /// releases the next scripted reply into the read buffer.
    #[derive(Clone, Default)]
    pub(crate) struct Scripted {
        inner: Arc<Mutex<ScriptedInner>>,
    }

    #[derive(Default)]
    struct ScriptedInner {
        written: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
        readable: VecDeque<u8>,
    }

    impl Scripted {
        pub(crate) fn push_reply(&self, bytes: Vec<u8>) {
            self.inner.lock().unwrap().replies.push_back(bytes);
        }
        pub(crate) fn push_unsolicited(&self, bytes: Vec<u8>) {
            self.inner.lock().unwrap().readable.extend(bytes);
        }
        pub(crate) fn written(&self) -> Vec<Vec<u8>> {
            self.inner.lock().unwrap().written.clone()
        }
    }

    impl Transport for Scripted {
        fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.written.push(bytes.to_vec());
            if let Some(reply) = inner.replies.pop_front() {
                inner.readable.extend(reply);
            }
            Ok(())
        }
        fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            let n = buf.len().min(inner.readable.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inner.readable.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    /// Timings tightened so the test suite does not sit in idle
    /// windows.
    pub(crate) fn fast_timings() -> ReadTimings {
        ReadTimings {
            poll: Duration::from_millis(1),
            idle_binary: Duration::from_millis(5),
            idle_string: Duration::from_millis(10),
            overall: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Scripted, fast_timings};
    use super::*;
    use crate::codec::request_payload;
    use crate::frame::frame;
    use crate::messages::{CommandId, FwVersion, standard_registry};

    fn session(transport: Scripted) -> Session {
        Session::new(transport, Arc::new(standard_registry())).with_timings(fast_timings())
    }

    #[test]
    fn binary_request() -> Result<()> {
        let t = Scripted::default();
        t.push_reply(frame(&[0, 3, 2, 1])?);
        let s = session(t.clone());
        let reg = s.registry().clone();
        let spec = reg.get(CommandId::FwVersion as u8).unwrap();
        let req = frame(&request_payload(spec, None))?;
        let reply = s.request(&req, spec.expected_recv_len(), false)?;
        let msg = reply.into_message().unwrap();
        assert_eq!(FwVersion::try_from(&msg)?.to_string(), "3.2.1");
        assert_eq!(t.written(), vec![req]);
        assert_eq!(s.frames_decoded(), 1);
        Ok(())
    }

    #[test]
    fn text_frames_joined() -> Result<()> {
        // Terminal output arrives as two PRINT frames.
        let t = Scripted::default();
        let mut reply = frame(&[CommandId::Print as u8, b'a', b'b'])?;
        reply.extend(frame(&[CommandId::Print as u8, b'c', b'd'])?);
        t.push_reply(reply);
        let s = session(t);
        let reg = s.registry().clone();
        let spec = reg.get(CommandId::TerminalCmd as u8).unwrap().clone();
        let req = frame(&Message::compose(spec.clone(), vec!["foo".into()])?.pack()?)?;
        let out = s.request(&req, spec.expected_recv_len(), true)?;
        assert_eq!(out.into_text().as_deref(), Some("ab\ncd\n"));
        Ok(())
    }

    #[test]
    fn blob_frames_concatenated() -> Result<()> {
        let t = Scripted::default();
        let mut reply = frame(&[CommandId::GetMcConf as u8, 0x01, 0x02])?;
        reply.extend(frame(&[CommandId::GetMcConf as u8, 0x03])?);
        t.push_reply(reply);
        let s = session(t);
        let reg = s.registry().clone();
        let spec = reg.get(CommandId::GetMcConf as u8).unwrap();
        let req = frame(&request_payload(spec, None))?;
        let out = s.request(&req, spec.expected_recv_len(), true)?;
        assert_eq!(out.into_blob(), Some(vec![1, 2, 3]));
        Ok(())
    }

    #[test]
    fn multi_frame_binary_is_an_error() -> Result<()> {
        let t = Scripted::default();
        let mut reply = frame(&[0, 3, 2, 1])?;
        reply.extend(frame(&[0, 3, 2, 1])?);
        t.push_reply(reply);
        let s = session(t);
        let reg = s.registry().clone();
        let spec = reg.get(CommandId::FwVersion as u8).unwrap();
        let req = frame(&request_payload(spec, None))?;
        let out = s.request(&req, spec.expected_recv_len(), false);
        assert!(matches!(out, Err(Error::UnexpectedMultiFrame)));
        Ok(())
    }

    #[test]
    fn no_reply_times_out() -> Result<()> {
        let t = Scripted::default();
        let s = session(t);
        let reg = s.registry().clone();
        let spec = reg.get(CommandId::FwVersion as u8).unwrap();
        let req = frame(&request_payload(spec, None))?;
        assert!(matches!(
            s.request(&req, spec.expected_recv_len(), false),
            Err(Error::Timeout)
        ));
        Ok(())
    }

    #[test]
    fn resyncs_past_garbage_and_counts_it() -> Result<()> {
        let t = Scripted::default();
        let mut reply = vec![0xff, 0xff];
        reply.extend(frame(&[0, 3, 2, 1])?);
        t.push_reply(reply);
        let s = session(t);
        let reg = s.registry().clone();
        let spec = reg.get(CommandId::FwVersion as u8).unwrap();
        let req = frame(&request_payload(spec, None))?;
        let out = s.request(&req, spec.expected_recv_len(), true)?;
        assert!(out.into_message().is_some());
        // The two noise bytes were part of the successful frame's
        // consumed count, so they are not double counted; the counter
        // only tracks bytes dropped without a frame.
        assert_eq!(s.frames_decoded(), 1);
        Ok(())
    }

    #[test]
    fn probe_is_nonblocking() -> Result<()> {
        let t = Scripted::default();
        let s = session(t.clone());
        let started = Instant::now();
        assert!(s.probe()?.is_none());
        assert!(started.elapsed() < Duration::from_millis(50));

        t.push_unsolicited(frame(&[CommandId::Print as u8, b'h', b'i'])?);
        let out = s.probe()?.unwrap();
        assert_eq!(out.into_text().as_deref(), Some("hi\n"));
        Ok(())
    }
}
