//! Per-connection protocol engine
//!
//! A [`Conn`] sits on one connected byte stream and runs three cooperating
//! pieces: a single read task ([`Conn::read_loop`]) that parses frames and
//! feeds the handler, a write queue of concurrency 1 that serializes every
//! outbound frame, and a bounded dispatcher that fans completed messages out
//! to the handler. The host performs the HTTP upgrade itself and hands the
//! engine the stream, any bytes it over-read past the handshake, and the
//! negotiated permessage-deflate parameters.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};

use crate::buffer::{self, PooledBuffer};
use crate::deflate::{Deflater, PermessageDeflate, SlideWindow};
use crate::error::{close_code, CloseError, Error, Result};
use crate::frame::{FrameHeader, Opcode, MAX_7BIT_PAYLOAD};
use crate::handler::{Handler, Message};
use crate::mask::apply_mask;
use crate::queue::{Dispatcher, WorkerQueue};
use crate::session::SessionStorage;
use crate::utf8::validate_utf8;
use crate::Options;

/// Byte stream the engine runs over: anything readable, writable and
/// shippable across tasks (TCP, TLS, in-memory pipes, ...)
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

type BoxStream = Box<dyn ByteStream>;

/// Callback invoked with the outcome of an asynchronous write
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Buffered reader over the stream's read half, draining any bytes the host
/// over-read during the handshake before touching the stream itself.
struct FrameReader {
    prebuf: Bytes,
    reader: BufReader<ReadHalf<BoxStream>>,
}

impl FrameReader {
    async fn fill(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut offset = 0;
        if !self.prebuf.is_empty() {
            let n = self.prebuf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.prebuf[..n]);
            self.prebuf.advance(n);
            offset = n;
        }
        if offset < buf.len() {
            self.reader.read_exact(&mut buf[offset..]).await?;
        }
        Ok(())
    }
}

/// Frame-scratch and reassembly state owned by the read loop
struct ReadState {
    fh: FrameHeader,
    continuation_opcode: Option<Opcode>,
    continuation_compressed: bool,
    continuation: Option<PooledBuffer>,
}

impl ReadState {
    fn new() -> Self {
        Self {
            fh: FrameHeader::new(),
            continuation_opcode: None,
            continuation_compressed: false,
            continuation: None,
        }
    }
}

/// One WebSocket connection
pub struct Conn {
    weak: Weak<Conn>,
    is_server: bool,
    options: Arc<Options>,
    pd: PermessageDeflate,
    compress_enabled: bool,
    subprotocol: String,
    closed: AtomicBool,
    close_sent: AtomicBool,
    closed_notify: Notify,
    reader: AsyncMutex<FrameReader>,
    writer: Arc<AsyncMutex<WriteHalf<BoxStream>>>,
    /// Holds frame generation and queue submission together so that
    /// compression order equals wire order under context takeover
    write_order: Mutex<()>,
    write_queue: WorkerQueue,
    dispatcher: Dispatcher,
    deflater: Option<Arc<Deflater>>,
    cps_window: Mutex<SlideWindow>,
    dps_window: Mutex<SlideWindow>,
    session: Arc<dyn SessionStorage>,
    handler: Arc<dyn Handler>,
}

impl Conn {
    /// Wrap the server side of an upgraded stream
    pub fn server(
        stream: impl ByteStream + 'static,
        prebuffer: Bytes,
        options: Arc<Options>,
        pd: PermessageDeflate,
        subprotocol: impl Into<String>,
        session: Arc<dyn SessionStorage>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Conn> {
        Self::new(
            true,
            Box::new(stream),
            prebuffer,
            options,
            pd,
            subprotocol.into(),
            session,
            handler,
        )
    }

    /// Wrap the client side of an upgraded stream
    pub fn client(
        stream: impl ByteStream + 'static,
        prebuffer: Bytes,
        options: Arc<Options>,
        pd: PermessageDeflate,
        subprotocol: impl Into<String>,
        session: Arc<dyn SessionStorage>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Conn> {
        Self::new(
            false,
            Box::new(stream),
            prebuffer,
            options,
            pd,
            subprotocol.into(),
            session,
            handler,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        is_server: bool,
        stream: BoxStream,
        prebuffer: Bytes,
        options: Arc<Options>,
        pd: PermessageDeflate,
        subprotocol: String,
        session: Arc<dyn SessionStorage>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Conn> {
        let (read_half, write_half) = tokio::io::split(stream);
        let compress_enabled = pd.enabled;

        let deflater = if compress_enabled {
            Some(if is_server {
                options.deflater_pool().select()
            } else {
                Arc::new(Deflater::new(false, &pd, options.read_max_payload_size))
            })
        } else {
            None
        };

        // outbound window follows our own side, inbound window the peer's
        let (cps_window, dps_window) = if compress_enabled {
            let outbound = if is_server {
                (pd.server_context_takeover, pd.server_max_window_bits)
            } else {
                (pd.client_context_takeover, pd.client_max_window_bits)
            };
            let inbound = if is_server {
                (pd.client_context_takeover, pd.client_max_window_bits)
            } else {
                (pd.server_context_takeover, pd.server_max_window_bits)
            };
            let window = |(takeover, bits): (bool, u8)| {
                if takeover {
                    SlideWindow::new(bits)
                } else {
                    SlideWindow::disabled()
                }
            };
            (window(outbound), window(inbound))
        } else {
            (SlideWindow::disabled(), SlideWindow::disabled())
        };

        Arc::new_cyclic(|weak| Conn {
            weak: weak.clone(),
            is_server,
            pd,
            compress_enabled,
            subprotocol,
            closed: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            closed_notify: Notify::new(),
            reader: AsyncMutex::new(FrameReader {
                prebuf: prebuffer,
                reader: BufReader::new(read_half),
            }),
            writer: Arc::new(AsyncMutex::new(write_half)),
            write_order: Mutex::new(()),
            write_queue: WorkerQueue::new(1),
            dispatcher: Dispatcher::new(options.parallel_enabled, options.parallel_golimit),
            deflater,
            cps_window: Mutex::new(cps_window),
            dps_window: Mutex::new(dps_window),
            session,
            handler,
            options,
        })
    }

    /// Whether this is the server side of the connection
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Whether the connection has terminated
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The subprotocol selected during the handshake (possibly empty)
    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// The application's session storage for this connection
    pub fn session(&self) -> &Arc<dyn SessionStorage> {
        &self.session
    }

    /// The negotiated permessage-deflate parameters
    pub fn permessage_deflate(&self) -> &PermessageDeflate {
        &self.pd
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Send one message, waiting until the frame reaches the transport
    pub async fn write_message(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(
            opcode,
            payload,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnClosed),
        }
    }

    /// Queue one message and return immediately; `callback` (if any) receives
    /// the outcome once the frame has been written or rejected.
    ///
    /// Queued frames are bounded only by memory: a peer that stops draining
    /// its socket while many writers keep queueing will pile frames up here.
    /// Producers that need backpressure should use [`write_message`]
    /// (Conn::write_message) instead.
    pub fn write_async(&self, opcode: Opcode, payload: &[u8], callback: Option<WriteCallback>) {
        self.submit(opcode, payload, callback);
    }

    /// Send a text message from a string slice
    pub async fn write_string(&self, text: &str) -> Result<()> {
        self.write_message(Opcode::Text, text.as_bytes()).await
    }

    /// Send a ping (payload at most 125 bytes)
    pub async fn write_ping(&self, payload: &[u8]) -> Result<()> {
        self.write_message(Opcode::Ping, payload).await
    }

    /// Send a pong (payload at most 125 bytes)
    pub async fn write_pong(&self, payload: &[u8]) -> Result<()> {
        self.write_message(Opcode::Pong, payload).await
    }

    /// Initiate the close handshake. The close frame is sent at most once;
    /// the stream stays open until the peer's close reply arrives or the
    /// configured close timeout fires. The reason is truncated to the 123
    /// bytes a close payload can carry, at a character boundary.
    pub async fn write_close(&self, code: u16, reason: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnClosed);
        }
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let reason = truncate_reason(reason);
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());

        let weak = self.weak.clone();
        let timeout = self.options.close_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(conn) = weak.upgrade() {
                if !conn.is_closed() {
                    conn.emit_error(Error::Close(CloseError::new(
                        close_code::ABNORMAL_CLOSURE,
                        "close handshake timed out",
                    )))
                    .await;
                }
            }
        });

        self.write_message(Opcode::Close, &payload).await
    }

    /// Tear the connection down immediately, without a close handshake.
    /// `on_close` fires with `None` if the connection was still open.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_stream().await;
        if let Some(conn) = self.weak.upgrade() {
            self.handler.on_close(&conn, None).await;
        }
        self.closed_notify.notify_one();
        tracing::debug!(server = self.is_server, "connection closed locally");
    }

    fn submit(&self, opcode: Opcode, payload: &[u8], callback: Option<WriteCallback>) {
        if self.is_closed() {
            if let Some(cb) = callback {
                cb(Err(Error::ConnClosed));
            }
            return;
        }

        let err = {
            let _order = self.write_order.lock();
            match self.gen_frame(opcode, payload) {
                Ok(frame) => {
                    self.enqueue(frame, callback);
                    return;
                }
                Err(err) => err,
            }
        };
        self.fail_write(err, callback);
    }

    /// Encode one complete frame, compressing data payloads that cross the
    /// negotiated threshold
    fn gen_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<PooledBuffer> {
        if opcode.is_control() {
            if payload.len() > MAX_7BIT_PAYLOAD {
                return Err(Error::MessageTooLarge);
            }
            return Ok(self.build_frame(opcode, false, payload));
        }

        if payload.len() > self.options.write_max_payload_size {
            return Err(Error::MessageTooLarge);
        }

        if self.compress_enabled && opcode.is_data() && payload.len() >= self.pd.threshold {
            if let Some(deflater) = &self.deflater {
                let mut window = self.cps_window.lock();
                let mut compressed = buffer::alloc(payload.len() / 2 + 64);
                deflater.compress(payload, window.dict(), &mut compressed)?;
                window.write(payload);
                drop(window);
                return Ok(self.build_frame(opcode, true, &compressed));
            }
        }

        Ok(self.build_frame(opcode, false, payload))
    }

    /// Header plus payload in one pooled buffer; client frames are masked
    /// into the copy, so the caller's payload is never modified
    fn build_frame(&self, opcode: Opcode, rsv1: bool, payload: &[u8]) -> PooledBuffer {
        let mut fh = FrameHeader::new();
        let (header_len, key) = fh.generate(true, rsv1, !self.is_server, opcode, payload.len());

        let mut frame = buffer::alloc(header_len + payload.len());
        frame.extend_from_slice(&fh.as_bytes()[..header_len]);
        let body = frame.len();
        frame.extend_from_slice(payload);
        if let Some(key) = key {
            apply_mask(&mut frame[body..], key);
        }
        frame
    }

    fn enqueue(&self, frame: PooledBuffer, callback: Option<WriteCallback>) {
        let writer = Arc::clone(&self.writer);
        let weak = self.weak.clone();
        self.write_queue.push(async move {
            let result = match weak.upgrade() {
                Some(conn) if !conn.is_closed() => {
                    let io_result = {
                        let mut writer = writer.lock().await;
                        writer.write_all(&frame).await
                    };
                    match io_result {
                        Ok(()) => Ok(()),
                        Err(err) => {
                            conn.emit_error(Error::Close(CloseError::new(
                                close_code::ABNORMAL_CLOSURE,
                                err.to_string(),
                            )))
                            .await;
                            Err(Error::Io(err))
                        }
                    }
                }
                _ => Err(Error::ConnClosed),
            };
            if let Some(cb) = callback {
                cb(result);
            }
        });
    }

    fn fail_write(&self, err: Error, callback: Option<WriteCallback>) {
        tracing::warn!(server = self.is_server, "write failed: {err}");
        // a failed compressor leaves truncated deflate state behind; the
        // connection cannot continue
        if let Error::Compression(msg) = &err {
            let close = CloseError::new(close_code::INTERNAL_ERROR, msg.clone());
            if let Some(conn) = self.weak.upgrade() {
                tokio::spawn(async move {
                    conn.emit_error(Error::Close(close)).await;
                });
            }
        }
        if let Some(cb) = callback {
            cb(Err(err));
        }
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// Run the connection's read loop until the peer closes, a protocol
    /// violation occurs, or the transport fails. Call exactly once, usually
    /// on its own task: `tokio::spawn(conn.clone().read_loop())`.
    pub async fn read_loop(self: Arc<Self>) {
        let conn = &self;
        let mut reader = conn.reader.lock().await;
        tracing::debug!(server = conn.is_server, "read loop started");
        conn.handler.on_open(conn).await;

        let mut state = ReadState::new();
        loop {
            tokio::select! {
                result = conn.read_frame(&mut reader, &mut state) => match result {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        conn.emit_error(err).await;
                        break;
                    }
                },
                _ = conn.closed_notify.notified() => break,
            }
        }
        tracing::debug!(server = conn.is_server, "read loop finished");
    }

    /// Read and dispatch one frame. `Ok(false)` ends the loop.
    async fn read_frame(&self, reader: &mut FrameReader, st: &mut ReadState) -> Result<bool> {
        reader.fill(st.fh.fixed_mut()).await?;

        let fin = st.fh.fin();
        let rsv1 = st.fh.rsv1();
        if st.fh.rsv2() || st.fh.rsv3() {
            return Err(Error::Protocol("rsv2 and rsv3 must be zero"));
        }
        let opcode =
            Opcode::from_u8(st.fh.opcode_bits()).ok_or(Error::Protocol("reserved opcode"))?;
        if rsv1 && !self.compress_enabled {
            return Err(Error::Protocol("rsv1 set without negotiated compression"));
        }
        if rsv1 && !opcode.is_data() {
            return Err(Error::Protocol("rsv1 set on a non-data frame"));
        }
        if opcode.is_control() && !fin {
            return Err(Error::Protocol("fragmented control frame"));
        }

        let masked = st.fh.masked();
        if self.is_server && !masked {
            return Err(Error::Protocol("client frame without mask"));
        }
        if !self.is_server && masked {
            return Err(Error::Protocol("masked server frame"));
        }

        let extra = st.fh.extended_len_bytes();
        if extra > 0 {
            reader.fill(st.fh.extended_mut(extra)).await?;
        }
        let payload_len = st.fh.payload_len();
        if opcode.is_control() && payload_len > MAX_7BIT_PAYLOAD as u64 {
            return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
        }
        if payload_len > self.options.read_max_payload_size as u64 {
            return Err(Error::Close(CloseError::message_too_large()));
        }
        let payload_len = payload_len as usize;

        let key = if masked {
            reader.fill(st.fh.mask_mut(extra)).await?;
            Some(st.fh.mask_key(extra))
        } else {
            None
        };

        let mut payload = buffer::alloc(payload_len);
        payload.resize(payload_len, 0);
        reader.fill(&mut payload).await?;
        if let Some(key) = key {
            apply_mask(&mut payload, key);
        }

        match opcode {
            Opcode::Ping => {
                if let Some(conn) = self.weak.upgrade() {
                    let echo = Bytes::copy_from_slice(&payload);
                    self.handler.on_ping(&conn, echo).await;
                }
                Ok(true)
            }
            Opcode::Pong => {
                if let Some(conn) = self.weak.upgrade() {
                    let body = Bytes::copy_from_slice(&payload);
                    self.handler.on_pong(&conn, body).await;
                }
                Ok(true)
            }
            Opcode::Close => {
                self.handle_close_frame(&payload).await?;
                Ok(false)
            }
            Opcode::Text | Opcode::Binary => {
                if st.continuation_opcode.is_some() {
                    return Err(Error::Protocol(
                        "data frame while a fragmented message is in progress",
                    ));
                }
                if fin {
                    self.emit_data(opcode, rsv1, payload).await?;
                } else {
                    st.continuation_opcode = Some(opcode);
                    st.continuation_compressed = rsv1;
                    st.continuation = Some(payload);
                }
                Ok(true)
            }
            Opcode::Continuation => {
                let Some(opcode) = st.continuation_opcode else {
                    return Err(Error::Protocol(
                        "continuation frame without a fragmented message",
                    ));
                };
                {
                    let assembled = st
                        .continuation
                        .as_mut()
                        .ok_or(Error::Protocol("continuation frame without a fragmented message"))?;
                    if assembled.len() + payload.len() > self.options.read_max_payload_size {
                        return Err(Error::Close(CloseError::message_too_large()));
                    }
                    assembled.extend_from_slice(&payload);
                }
                if fin {
                    let compressed = st.continuation_compressed;
                    st.continuation_opcode = None;
                    st.continuation_compressed = false;
                    if let Some(assembled) = st.continuation.take() {
                        self.emit_data(opcode, compressed, assembled).await?;
                    }
                }
                Ok(true)
            }
        }
    }

    /// Finalize one data message: decompress, validate text, dispatch
    async fn emit_data(&self, opcode: Opcode, compressed: bool, payload: PooledBuffer) -> Result<()> {
        let data = if compressed {
            let deflater = self
                .deflater
                .as_ref()
                .ok_or(Error::Protocol("rsv1 set without negotiated compression"))?;
            let mut window = self.dps_window.lock();
            let out = deflater.decompress(&payload, window.dict())?;
            window.write(&out);
            out
        } else {
            payload
        };

        if opcode == Opcode::Text && self.options.check_utf8_enabled && !validate_utf8(&data) {
            return Err(Error::Close(CloseError::new(
                close_code::UNSUPPORTED_DATA,
                "invalid utf-8 in text message",
            )));
        }

        let Some(conn) = self.weak.upgrade() else {
            return Ok(());
        };
        let handler = Arc::clone(&self.handler);
        let message = Message::new(opcode, data);
        self.dispatcher
            .dispatch(async move {
                handler.on_message(&conn, message).await;
            })
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // close path
    // ------------------------------------------------------------------

    /// Process the peer's close frame: validate, echo unless we initiated,
    /// shut the stream down and fire `on_close` exactly once
    async fn handle_close_frame(&self, payload: &[u8]) -> Result<()> {
        let (code, reason): (u16, &[u8]) = match payload.len() {
            0 => (close_code::NO_STATUS_RECEIVED, &[]),
            1 => return Err(Error::Protocol("close frame payload of one byte")),
            _ => (u16::from_be_bytes([payload[0], payload[1]]), &payload[2..]),
        };
        if !payload.is_empty() && !CloseError::is_valid_code(code) {
            return Err(Error::Protocol("invalid close code"));
        }
        if !validate_utf8(reason) {
            return Err(Error::Protocol("close reason is not valid utf-8"));
        }

        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(code, server = self.is_server, "close frame received");

        {
            let mut writer = self.writer.lock().await;
            if !self.close_sent.swap(true, Ordering::SeqCst) {
                let echo: Vec<u8> = if payload.is_empty() {
                    Vec::new()
                } else {
                    code.to_be_bytes().to_vec()
                };
                let frame = self.build_frame(Opcode::Close, false, &echo);
                let _ = writer.write_all(&frame).await;
            }
            let _ = writer.shutdown().await;
        }

        let err = if code == close_code::NORMAL_CLOSURE || code == close_code::NO_STATUS_RECEIVED {
            None
        } else {
            let reason = String::from_utf8_lossy(reason).into_owned();
            Some(Error::Close(CloseError::new(code, reason)))
        };
        if let Some(conn) = self.weak.upgrade() {
            self.handler.on_close(&conn, err).await;
        }
        Ok(())
    }

    /// Terminate on a local or protocol error: best-effort close frame (when
    /// the transport still works), stream shutdown, `on_close` exactly once
    async fn emit_error(&self, err: Error) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let code = err.close_code();
        if code == close_code::ABNORMAL_CLOSURE {
            tracing::debug!(code, server = self.is_server, "closing connection: {err}");
        } else {
            tracing::warn!(code, server = self.is_server, "closing connection: {err}");
        }
        if code != close_code::ABNORMAL_CLOSURE {
            let text = err.to_string();
            let reason = truncate_reason(&text);
            let mut payload = Vec::with_capacity(2 + reason.len());
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());

            let frame = self.build_frame(Opcode::Close, false, &payload);
            self.close_sent.store(true, Ordering::SeqCst);
            let mut writer = self.writer.lock().await;
            let _ = writer.write_all(&frame).await;
            let _ = writer.shutdown().await;
        } else {
            self.shutdown_stream().await;
        }

        if let Some(conn) = self.weak.upgrade() {
            self.handler.on_close(&conn, Some(err)).await;
        }
        self.closed_notify.notify_one();
    }

    async fn shutdown_stream(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Cut a close reason down to what a close payload can carry, respecting
/// UTF-8 boundaries
fn truncate_reason(text: &str) -> &str {
    let mut end = text.len().min(MAX_7BIT_PAYLOAD - 2);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
