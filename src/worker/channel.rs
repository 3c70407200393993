//! Wire framing between the worker and its daemon.
//!
//! Inbound: a `u32` little-endian length prefix followed by that many raw
//! bytes (one full HTTP request as received from the client). Outbound: a
//! fixed 16-byte [`WorkerPayload`] header followed by the serialized
//! response. Both ends are co-located, so multi-byte fields use host
//! (little-endian) order; the daemon must agree on both layouts.

use crate::buffer::Buffer;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

/// Single byte sent right after connecting, telling the daemon this worker
/// is ready for frames.
pub(crate) const ACK: u8 = 0x06;

/// Fixed outbound frame header.
///
/// Layout: byte 0 = keep-alive flag, bytes 1..8 = zero padding, bytes
/// 8..16 = little-endian total length of the response bytes (status line +
/// headers + CRLF + body) that follow. This is the frame length, not the
/// HTTP `content-length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerPayload {
    pub keep_alive: bool,
    pub content_length: u64,
}

impl WorkerPayload {
    pub(crate) const SIZE: usize = 16;

    pub(crate) fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.keep_alive as u8;
        bytes[8..].copy_from_slice(&self.content_length.to_le_bytes());
        bytes
    }
}

/// Outcome of one [`DaemonChannel::read_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameRead {
    /// A complete frame is available via [`DaemonChannel::frame`].
    Frame,
    /// The 1-second tick elapsed with the stream quiet; the caller checks
    /// its retirement rules and retries. Partially received prefix/frame
    /// bytes are kept and the next call resumes where this one stopped.
    Idle,
    /// The daemon closed the stream.
    Closed,
}

/// The worker's end of the control socket.
pub(crate) struct DaemonChannel {
    reader: OwnedReadHalf,
    writer: ResponseWriter,
    prefix: [u8; 4],
    prefix_filled: usize,
    frame_needed: Option<usize>,
    frame: Buffer,
}

impl DaemonChannel {
    /// Connects to the daemon's control socket. On Linux the name lives in
    /// the abstract namespace; elsewhere it is a filesystem path.
    pub(crate) async fn connect(socket_name: &str) -> io::Result<Self> {
        let stream = connect_std(socket_name)?;
        stream.set_nonblocking(true)?;
        Ok(Self::from_stream(UnixStream::from_std(stream)?))
    }

    pub(crate) fn from_stream(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer: ResponseWriter {
                inner: Arc::new(Mutex::new(writer)),
            },
            prefix: [0u8; 4],
            prefix_filled: 0,
            frame_needed: None,
            frame: Buffer::with_capacity(16 * 1024),
        }
    }

    pub(crate) async fn send_ack(&self) -> io::Result<()> {
        let mut writer = self.writer.inner.lock().await;
        writer.write_all(&[ACK]).await?;
        writer.flush().await
    }

    /// A cloneable handle for sending response frames; the watchdog holds
    /// one so it can answer after winning the send CAS.
    pub(crate) fn writer(&self) -> ResponseWriter {
        self.writer.clone()
    }

    /// The last complete frame read.
    pub(crate) fn frame(&self) -> &[u8] {
        self.frame.as_slice()
    }

    /// Reads towards one complete frame, waking at least every `tick` so
    /// the caller can evaluate its idle rules.
    pub(crate) async fn read_frame(&mut self, tick: Duration) -> io::Result<FrameRead> {
        loop {
            match self.frame_needed {
                None => {
                    if self.prefix_filled == self.prefix.len() {
                        let length = u32::from_le_bytes(self.prefix) as usize;
                        self.frame_needed = Some(length);
                        self.frame.clear();
                        self.frame.reserve(length);
                        continue;
                    }

                    let read = self.reader.read(&mut self.prefix[self.prefix_filled..]);
                    match timeout(tick, read).await {
                        Err(_) => return Ok(FrameRead::Idle),
                        Ok(Ok(0)) => return Ok(FrameRead::Closed),
                        Ok(Ok(n)) => self.prefix_filled += n,
                        Ok(Err(e)) => return Err(e),
                    }
                }
                Some(needed) => {
                    if self.frame.len() >= needed {
                        self.prefix_filled = 0;
                        self.frame_needed = None;
                        return Ok(FrameRead::Frame);
                    }

                    let mut chunk = [0u8; 8 * 1024];
                    let want = (needed - self.frame.len()).min(chunk.len());
                    match timeout(tick, self.reader.read(&mut chunk[..want])).await {
                        Err(_) => return Ok(FrameRead::Idle),
                        Ok(Ok(0)) => return Ok(FrameRead::Closed),
                        Ok(Ok(n)) => self.frame.append(&chunk[..n]),
                        Ok(Err(e)) => return Err(e),
                    }
                }
            }
        }
    }
}

/// Shared, mutex-guarded write half of the control socket.
///
/// Exclusivity per request is already guaranteed by the send CAS; the mutex
/// only satisfies `&mut` access from two tasks.
#[derive(Clone)]
pub(crate) struct ResponseWriter {
    inner: Arc<Mutex<OwnedWriteHalf>>,
}

impl ResponseWriter {
    /// Frames and sends one response: payload header, headers bytes, body
    /// bytes.
    pub(crate) async fn send(
        &self,
        keep_alive: bool,
        headers: &[u8],
        body: &[u8],
    ) -> io::Result<()> {
        let payload = WorkerPayload {
            keep_alive,
            content_length: (headers.len() + body.len()) as u64,
        };

        let mut writer = self.inner.lock().await;
        writer.write_all(&payload.to_bytes()).await?;
        writer.write_all(headers).await?;
        writer.write_all(body).await?;
        writer.flush().await
    }

    pub(crate) async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(target_os = "linux")]
fn connect_std(socket_name: &str) -> io::Result<std::os::unix::net::UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let address = std::os::unix::net::SocketAddr::from_abstract_name(socket_name.as_bytes())?;
    std::os::unix::net::UnixStream::connect_addr(&address)
}

#[cfg(not(target_os = "linux"))]
fn connect_std(socket_name: &str) -> io::Result<std::os::unix::net::UnixStream> {
    std::os::unix::net::UnixStream::connect(socket_name)
}
