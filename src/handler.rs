//! Connection event callbacks

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::buffer::PooledBuffer;
use crate::conn::Conn;
use crate::error::Error;
use crate::frame::Opcode;

/// A complete inbound data message, reassembled and decompressed.
///
/// The payload lives in a pooled buffer that returns to the pool when the
/// message is dropped; copy the bytes out if they must outlive the callback.
pub struct Message {
    opcode: Opcode,
    data: PooledBuffer,
}

impl Message {
    pub(crate) fn new(opcode: Opcode, data: PooledBuffer) -> Self {
        Self { opcode, data }
    }

    /// The message opcode ([`Opcode::Text`] or [`Opcode::Binary`])
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The payload bytes
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload as text; `None` when it is not valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Take the underlying buffer out of the message
    pub fn into_data(self) -> PooledBuffer {
        self.data
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("opcode", &self.opcode)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Event sink for a connection.
///
/// Every callback has a default body, so implementations only override what
/// they care about. The default [`on_ping`](Handler::on_ping) answers with a
/// pong carrying the echoed payload, as RFC 6455 requires.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The read loop has started for `conn`
    async fn on_open(&self, conn: &Arc<Conn>) {
        let _ = conn;
    }

    /// The connection ended. `err` is `None` after a clean normal closure,
    /// otherwise the terminal error. Invoked exactly once per connection.
    async fn on_close(&self, conn: &Arc<Conn>, err: Option<Error>) {
        let _ = (conn, err);
    }

    /// A ping frame arrived
    async fn on_ping(&self, conn: &Arc<Conn>, payload: Bytes) {
        if let Err(err) = conn.write_pong(&payload).await {
            tracing::trace!("pong reply failed: {err}");
        }
    }

    /// A pong frame arrived
    async fn on_pong(&self, conn: &Arc<Conn>, payload: Bytes) {
        let _ = (conn, payload);
    }

    /// A complete data message arrived
    async fn on_message(&self, conn: &Arc<Conn>, message: Message) {
        let _ = (conn, message);
    }
}

/// Handler using every default callback; useful for write-only connections
pub struct DefaultHandler;

#[async_trait]
impl Handler for DefaultHandler {}
