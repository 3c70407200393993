//! RFC 6455 frame codec with callback dispatch.
//!
//! The worker owns exactly one WebSocket at a time, so the kill switch is
//! process-wide state: [`kill`] flags the socket for teardown with a
//! reason, the owning loop observes [`kill_requested`] and drops the
//! connection. The flag lives from the `kill` call until [`reset_kill`],
//! which the loop invokes before adopting a new socket.
//!
//! Sending tolerates non-blocking sockets: bytes that would block are kept
//! in a per-socket leftover buffer and drained by later sends or an
//! explicit [`WebSocket::flush`]. Receiving is push-based: the owner reads
//! the socket and feeds bytes to [`WebSocket::receive`].

use crate::buffer::Buffer;
use log::{debug, warn};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

static KILL: AtomicBool = AtomicBool::new(false);
static KILL_REASON: Mutex<Option<String>> = Mutex::new(None);

/// Flags the worker's WebSocket for teardown.
pub fn kill(reason: impl Into<String>) {
    if let Ok(mut slot) = KILL_REASON.lock() {
        *slot = Some(reason.into());
    }
    KILL.store(true, Ordering::Release);
}

pub fn kill_requested() -> bool {
    KILL.load(Ordering::Acquire)
}

pub fn kill_reason() -> Option<String> {
    KILL_REASON.lock().ok().and_then(|slot| slot.clone())
}

/// Clears the kill state before a new socket is adopted.
pub fn reset_kill() {
    KILL.store(false, Ordering::Release);
    if let Ok(mut slot) = KILL_REASON.lock() {
        *slot = None;
    }
}

/// Frame opcode (low four bits of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }
}

/// One complete (defragmented) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Message {
    /// Payload as text, when it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        simdutf8::basic::from_utf8(&self.payload).ok()
    }
}

/// Connection state: OPEN until a close frame travels either way, CLOSED
/// once the close handshake finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Open,
    CloseSent,
    CloseReceived,
    Closed,
}

/// Encodes a single frame.
///
/// Length encoding is picked from the payload size (<126, <65536, larger);
/// extended lengths go out in network order. With a mask the payload is
/// XOR-ed in place into the output.
pub fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);

    frame.push(((fin as u8) << 7) | opcode as u8);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if payload.len() < 126 {
        frame.push(mask_bit | payload.len() as u8);
    } else if payload.len() < 65536 {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            frame.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(i, byte)| *byte ^ key[i % 4]),
            );
        }
        None => frame.extend_from_slice(payload),
    }

    frame
}

/// A decoded frame plus how many input bytes it consumed.
#[derive(Debug, PartialEq, Eq)]
struct RawFrame {
    fin: bool,
    opcode: Opcode,
    payload: Vec<u8>,
    consumed: usize,
}

/// Peels one frame off `data`. `Ok(None)` means more bytes are needed.
fn decode_frame(data: &[u8]) -> io::Result<Option<RawFrame>> {
    if data.len() < 2 {
        return Ok(None);
    }

    let fin = data[0] & 0x80 != 0;
    let opcode = Opcode::from_bits(data[0] & 0x0F)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "reserved opcode"))?;

    let masked = data[1] & 0x80 != 0;
    let short_length = (data[1] & 0x7F) as usize;

    let mut offset = 2;
    let length = match short_length {
        126 => {
            if data.len() < offset + 2 {
                return Ok(None);
            }
            let length = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            offset += 2;
            length
        }
        127 => {
            if data.len() < offset + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[offset..offset + 8]);
            offset += 8;
            u64::from_be_bytes(bytes) as usize
        }
        length => length,
    };

    let key = if masked {
        if data.len() < offset + 4 {
            return Ok(None);
        }
        let key = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if data.len() < offset + length {
        return Ok(None);
    }

    let mut payload = data[offset..offset + length].to_vec();
    if let Some(key) = key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some(RawFrame {
        fin,
        opcode,
        payload,
        consumed: offset + length,
    }))
}

type Callback = Box<dyn FnMut(&Message) -> bool + Send>;

/// One WebSocket connection over an arbitrary writable transport.
///
/// The transport may be non-blocking; decoding is fed externally via
/// [`receive`](WebSocket::receive) so the owner keeps control of reads.
pub struct WebSocket<S: Write> {
    socket: S,
    /// Client role masks outbound frames; the server role does not.
    mask_outbound: bool,
    leftover: Vec<u8>,
    to_parse: Buffer,
    fragments: Buffer,
    fragment_opcode: Option<Opcode>,
    state: State,
    on_text: Option<Callback>,
    on_binary: Option<Callback>,
    on_close: Option<Callback>,
    on_message: Option<Callback>,
}

impl<S: Write> WebSocket<S> {
    /// Server-role socket: outbound frames are not masked.
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            mask_outbound: false,
            leftover: Vec::new(),
            to_parse: Buffer::new(),
            fragments: Buffer::new(),
            fragment_opcode: None,
            state: State::Open,
            on_text: None,
            on_binary: None,
            on_close: None,
            on_message: None,
        }
    }

    /// Client-role socket: outbound frames carry a random mask.
    pub fn new_client(socket: S) -> Self {
        Self {
            mask_outbound: true,
            ..Self::new(socket)
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn socket(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Callback for complete text messages. Return `false` to stop
    /// propagation to the generic callback.
    pub fn on_text(&mut self, callback: impl FnMut(&Message) -> bool + Send + 'static) {
        self.on_text = Some(Box::new(callback));
    }

    pub fn on_binary(&mut self, callback: impl FnMut(&Message) -> bool + Send + 'static) {
        self.on_binary = Some(Box::new(callback));
    }

    pub fn on_close(&mut self, callback: impl FnMut(&Message) -> bool + Send + 'static) {
        self.on_close = Some(Box::new(callback));
    }

    /// Generic callback, run after the opcode-specific one agreed to
    /// propagate.
    pub fn on_message(&mut self, callback: impl FnMut(&Message) -> bool + Send + 'static) {
        self.on_message = Some(Box::new(callback));
    }

    pub fn send_text(&mut self, text: &str) -> io::Result<usize> {
        self.send_frame(true, Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.send_frame(true, Opcode::Binary, payload)
    }

    pub fn send_ping(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.send_frame(true, Opcode::Ping, payload)
    }

    pub fn send_pong(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.send_frame(true, Opcode::Pong, payload)
    }

    /// Sends a close frame and moves the state machine along.
    pub fn send_close(&mut self) -> io::Result<usize> {
        let written = self.send_frame(true, Opcode::Close, &[])?;
        self.state = match self.state {
            State::CloseReceived => State::Closed,
            State::Closed => State::Closed,
            _ => State::CloseSent,
        };
        Ok(written)
    }

    /// Encodes and transmits one frame, queueing whatever the socket will
    /// not take. Returns the bytes actually written now.
    pub fn send_frame(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) -> io::Result<usize> {
        let mask = self.mask_outbound.then(rand::random::<[u8; 4]>);
        let frame = encode_frame(fin, opcode, payload, mask);
        self.leftover.extend_from_slice(&frame);
        self.flush()
    }

    /// Drains the leftover buffer as far as the socket allows. Returns the
    /// bytes written; the rest stays queued for the next attempt.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while !self.leftover.is_empty() {
            match self.socket.write(&self.leftover) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"))
                }
                Ok(n) => {
                    self.leftover.drain(..n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Bytes queued by partial sends and not yet on the wire.
    pub fn pending(&self) -> usize {
        self.leftover.len()
    }

    /// Feeds received bytes into the decoder, emitting any complete
    /// messages to the callbacks. PING frames are answered with a PONG and
    /// never reach user callbacks.
    pub fn receive(&mut self, data: &[u8]) -> io::Result<()> {
        self.to_parse.append(data);

        loop {
            let frame = match decode_frame(self.to_parse.as_slice()) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(error) => {
                    warn!("dropping websocket: {error}");
                    kill(error.to_string());
                    self.state = State::Closed;
                    return Err(error);
                }
            };
            self.to_parse.consume(frame.consumed);
            self.handle_frame(frame)?;
        }
    }

    fn handle_frame(&mut self, frame: RawFrame) -> io::Result<()> {
        match frame.opcode {
            Opcode::Ping => {
                debug!("ping with {} payload bytes", frame.payload.len());
                self.send_pong(&frame.payload)?;
                return Ok(());
            }
            Opcode::Close => {
                self.state = match self.state {
                    State::CloseSent => State::Closed,
                    _ => State::CloseReceived,
                };
                if self.state == State::CloseReceived {
                    self.send_close()?;
                    self.state = State::Closed;
                }
                let message = Message {
                    opcode: Opcode::Close,
                    payload: frame.payload,
                };
                self.dispatch(&message);
                return Ok(());
            }
            Opcode::Pong => {
                let message = Message {
                    opcode: Opcode::Pong,
                    payload: frame.payload,
                };
                self.dispatch(&message);
                return Ok(());
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {}
        }

        // Data frame: accumulate fragments. The opcode of the first frame
        // applies to the whole message.
        if frame.opcode != Opcode::Continuation {
            self.fragment_opcode = Some(frame.opcode);
            self.fragments.clear();
        }
        self.fragments.append(&frame.payload);

        if frame.fin {
            let message = Message {
                opcode: self.fragment_opcode.take().unwrap_or(frame.opcode),
                payload: self.fragments.as_slice().to_vec(),
            };
            self.fragments.clear();
            self.dispatch(&message);
        }

        Ok(())
    }

    /// Specific callback first, then the generic one; each returns a
    /// propagate flag and the chain stops at the first `false`.
    fn dispatch(&mut self, message: &Message) {
        let specific = match message.opcode {
            Opcode::Text => self.on_text.as_mut(),
            Opcode::Binary => self.on_binary.as_mut(),
            Opcode::Close => self.on_close.as_mut(),
            _ => None,
        };

        if let Some(callback) = specific {
            if !callback(message) {
                return;
            }
        }
        if let Some(callback) = self.on_message.as_mut() {
            callback(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Accepts a limited number of bytes, then signals WouldBlock.
    struct ThrottledSink {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for ThrottledSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = buf.len().min(self.budget);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn length_encodings() {
        let short = encode_frame(true, Opcode::Binary, &[7u8; 125], None);
        assert_eq!(short[1], 125);
        assert_eq!(short.len(), 2 + 125);

        let medium = encode_frame(true, Opcode::Binary, &[7u8; 126], None);
        assert_eq!(medium[1], 126);
        assert_eq!(u16::from_be_bytes([medium[2], medium[3]]), 126);
        assert_eq!(medium.len(), 4 + 126);

        let large = encode_frame(true, Opcode::Binary, &[7u8; 65536], None);
        assert_eq!(large[1], 127);
        let mut be = [0u8; 8];
        be.copy_from_slice(&large[2..10]);
        assert_eq!(u64::from_be_bytes(be), 65536);
        assert_eq!(large.len(), 10 + 65536);
    }

    #[test]
    fn first_byte_layout() {
        let frame = encode_frame(true, Opcode::Text, b"x", None);
        assert_eq!(frame[0], 0x81);

        let frame = encode_frame(false, Opcode::Binary, b"x", None);
        assert_eq!(frame[0], 0x02);

        let frame = encode_frame(true, Opcode::Text, b"x", Some([1, 2, 3, 4]));
        assert_eq!(frame[1] & 0x80, 0x80, "mask bit set");
    }

    #[test]
    fn roundtrip_with_random_mask() {
        let payload: Vec<u8> = (0..1000).map(|_| rand::random::<u8>()).collect();
        let mask: [u8; 4] = rand::random();

        let frame = encode_frame(true, Opcode::Binary, &payload, Some(mask));
        let decoded = decode_frame(&frame).unwrap().expect("complete frame");

        assert!(decoded.fin);
        assert_eq!(decoded.opcode, Opcode::Binary);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.consumed, frame.len());
    }

    #[test]
    fn decode_waits_for_missing_bytes() {
        let frame = encode_frame(true, Opcode::Text, b"hello world", Some([9, 9, 9, 9]));

        for cut in [0, 1, 2, 5, frame.len() - 1] {
            assert_eq!(decode_frame(&frame[..cut]).unwrap(), None, "cut at {cut}");
        }
        assert!(decode_frame(&frame).unwrap().is_some());
    }

    #[test]
    fn reserved_opcode_is_rejected() {
        assert!(decode_frame(&[0x83, 0x00]).is_err());
    }

    #[test]
    fn ping_is_answered_not_delivered() {
        let sink = ThrottledSink {
            accepted: Vec::new(),
            budget: usize::MAX,
        };
        let mut ws = WebSocket::new(sink);

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        ws.on_message(move |_| {
            f.fetch_add(1, Ordering::Relaxed);
            true
        });

        let ping = encode_frame(true, Opcode::Ping, &[1, 2, 3, 4], Some(rand::random()));
        ws.receive(&ping).unwrap();

        // unmasked pong with the identical payload, no callback
        assert_eq!(ws.socket().accepted, vec![0x8A, 0x04, 1, 2, 3, 4]);
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn fragmented_text_keeps_first_opcode() {
        let sink = ThrottledSink {
            accepted: Vec::new(),
            budget: usize::MAX,
        };
        let mut ws = WebSocket::new(sink);

        let seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        ws.on_message(move |m| {
            s.lock().unwrap().push(m.clone());
            true
        });

        ws.receive(&encode_frame(false, Opcode::Text, b"Hel", None)).unwrap();
        assert!(seen.lock().unwrap().is_empty(), "no message before FIN");
        ws.receive(&encode_frame(true, Opcode::Continuation, b"lo", None)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].opcode, Opcode::Text);
        assert_eq!(seen[0].as_text(), Some("Hello"));
    }

    #[test]
    fn two_frames_in_one_read() {
        let sink = ThrottledSink {
            accepted: Vec::new(),
            budget: usize::MAX,
        };
        let mut ws = WebSocket::new(sink);

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        ws.on_binary(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
            true
        });

        let mut bytes = encode_frame(true, Opcode::Binary, b"a", None);
        bytes.extend(encode_frame(true, Opcode::Binary, b"b", None));
        ws.receive(&bytes).unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dispatch_order_and_propagation() {
        let sink = ThrottledSink {
            accepted: Vec::new(),
            budget: usize::MAX,
        };
        let mut ws = WebSocket::new(sink);

        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        ws.on_text(move |_| {
            l.lock().unwrap().push("text");
            false // stop here
        });
        let l = log.clone();
        ws.on_message(move |_| {
            l.lock().unwrap().push("generic");
            true
        });

        ws.receive(&encode_frame(true, Opcode::Text, b"hi", None)).unwrap();
        assert_eq!(*log.lock().unwrap(), ["text"]);

        // binary has no specific callback here, so the generic one runs
        ws.receive(&encode_frame(true, Opcode::Binary, b"\x01", None)).unwrap();
        assert_eq!(*log.lock().unwrap(), ["text", "generic"]);
    }

    #[test]
    fn close_handshake() {
        let sink = ThrottledSink {
            accepted: Vec::new(),
            budget: usize::MAX,
        };
        let mut ws = WebSocket::new(sink);

        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        ws.on_close(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
            true
        });

        assert_eq!(ws.state(), State::Open);
        ws.receive(&encode_frame(true, Opcode::Close, &[], None)).unwrap();

        assert_eq!(ws.state(), State::Closed);
        assert_eq!(closed.load(Ordering::Relaxed), 1);
        // the close frame we echoed back
        assert_eq!(ws.socket().accepted, vec![0x88, 0x00]);
    }

    #[test]
    fn close_after_we_initiated() {
        let sink = ThrottledSink {
            accepted: Vec::new(),
            budget: usize::MAX,
        };
        let mut ws = WebSocket::new(sink);

        ws.send_close().unwrap();
        assert_eq!(ws.state(), State::CloseSent);

        ws.receive(&encode_frame(true, Opcode::Close, &[], None)).unwrap();
        assert_eq!(ws.state(), State::Closed);
        // no second close frame beyond our initial one
        assert_eq!(ws.socket().accepted, vec![0x88, 0x00]);
    }

    #[test]
    fn partial_send_keeps_leftover() {
        let sink = ThrottledSink {
            accepted: Vec::new(),
            budget: 4,
        };
        let mut ws = WebSocket::new(sink);

        let written = ws.send_text("hello world").unwrap();
        assert_eq!(written, 4);
        assert_eq!(ws.pending(), 2 + 11 - 4);

        // unblock and drain
        ws.socket().budget = usize::MAX;
        let written = ws.flush().unwrap();
        assert_eq!(written, 9);
        assert_eq!(ws.pending(), 0);

        let frame = ws.socket().accepted.clone();
        let decoded = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(decoded.payload, b"hello world");
    }

    #[test]
    fn client_frames_are_masked() {
        let sink = ThrottledSink {
            accepted: Vec::new(),
            budget: usize::MAX,
        };
        let mut ws = WebSocket::new_client(sink);
        ws.send_text("abc").unwrap();

        let frame = ws.socket().accepted.clone();
        assert_eq!(frame[1] & 0x80, 0x80, "mask bit");

        let decoded = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(decoded.payload, b"abc");
    }

    #[test]
    fn kill_flag_lifecycle() {
        reset_kill();
        assert!(!kill_requested());
        assert_eq!(kill_reason(), None);

        kill("protocol violation");
        assert!(kill_requested());
        assert_eq!(kill_reason().as_deref(), Some("protocol violation"));

        reset_kill();
        assert!(!kill_requested());
    }
}
