//! # wavesock: event-driven WebSocket protocol engine
//!
//! An RFC 6455 server/client protocol engine with the permessage-deflate
//! extension (RFC 7692). The engine sits above any connected byte stream
//! (`AsyncRead + AsyncWrite`) the host hands it after the HTTP upgrade and
//! exposes a message-oriented API: the application writes logical messages
//! and receives inbound traffic through [`Handler`] callbacks.
//!
//! What the engine takes care of:
//!
//! - **Framing**: header parsing and generation, masking, extended lengths,
//!   fragmentation and control-frame rules
//! - **The connection state machine**: message reassembly, control frames
//!   interleaved with data, the close handshake
//! - **Compression**: permessage-deflate with per-direction sliding-window
//!   dictionaries, context takeover and a shared server-side deflater pool
//! - **Concurrency**: per-connection write serialization and bounded
//!   parallel dispatch of handler callbacks with read-loop backpressure
//!
//! The HTTP upgrade, TLS and listening sockets stay with the host; it hands
//! the engine the stream, any bytes it over-read past the handshake, and the
//! negotiated [`PermessageDeflate`] parameters.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wavesock::{Conn, Handler, Message, Opcode, Options, SessionMap};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     async fn on_message(&self, conn: &Arc<Conn>, message: Message) {
//!         let _ = conn.write_message(message.opcode(), message.bytes()).await;
//!     }
//! }
//!
//! // after the HTTP upgrade:
//! let options = Arc::new(Options::default());
//! let pd = options.permessage_deflate.clone();
//! let conn = Conn::server(
//!     stream,
//!     handshake_remainder,
//!     options,
//!     pd,
//!     "",
//!     Arc::new(SessionMap::new()),
//!     Arc::new(Echo),
//! );
//! tokio::spawn(conn.clone().read_loop());
//! ```

pub mod buffer;
pub mod conn;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handler;
pub mod mask;
pub mod queue;
pub mod session;
pub mod utf8;

use std::sync::OnceLock;
use std::time::Duration;

use crate::deflate::DeflaterPool;

pub use buffer::PooledBuffer;
pub use conn::{ByteStream, Conn, WriteCallback};
pub use deflate::PermessageDeflate;
pub use error::{close_code, CloseError, Error, Result};
pub use frame::{FrameHeader, Opcode, FRAME_HEADER_SIZE};
pub use handler::{DefaultHandler, Handler, Message};
pub use session::{ConcurrentMap, SessionMap, SessionStorage, SessionValue};

/// Default fan-out of the read dispatch channel
pub const DEFAULT_PARALLEL_GOLIMIT: usize = 8;

/// Default maximum inbound message size (16 MiB)
pub const DEFAULT_READ_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum outbound message size (16 MiB)
pub const DEFAULT_WRITE_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default bound on the close handshake after we initiate it
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection behavior knobs, shared across the connections of one endpoint.
///
/// Construct with [`Options::default`] and adjust fields, or use
/// [`Options::builder`].
pub struct Options {
    /// Allow handler callbacks of one connection to run in parallel.
    /// Disabled, callbacks run in receive order.
    pub parallel_enabled: bool,
    /// How many handler callbacks may run at once per connection; beyond
    /// that the read loop stalls, which is the backpressure path
    pub parallel_golimit: usize,
    /// Maximum accepted inbound message size, after decompression
    pub read_max_payload_size: usize,
    /// Maximum outbound message size
    pub write_max_payload_size: usize,
    /// Reject text messages that are not valid UTF-8
    pub check_utf8_enabled: bool,
    /// How long to wait for the peer's close reply before dropping the stream
    pub close_timeout: Duration,
    /// permessage-deflate configuration; for servers this is also the basis
    /// of the shared deflater pool
    pub permessage_deflate: PermessageDeflate,
    deflater_pool: OnceLock<DeflaterPool>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            parallel_enabled: false,
            parallel_golimit: DEFAULT_PARALLEL_GOLIMIT,
            read_max_payload_size: DEFAULT_READ_MAX_PAYLOAD_SIZE,
            write_max_payload_size: DEFAULT_WRITE_MAX_PAYLOAD_SIZE,
            check_utf8_enabled: true,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            permessage_deflate: PermessageDeflate::default(),
            deflater_pool: OnceLock::new(),
        }
    }
}

impl Options {
    /// Start building a configuration
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }

    /// The shared server-side deflater pool, built on first use
    pub(crate) fn deflater_pool(&self) -> &DeflaterPool {
        self.deflater_pool
            .get_or_init(|| DeflaterPool::new(&self.permessage_deflate, self.read_max_payload_size))
    }
}

/// Builder for [`Options`]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    /// Allow parallel handler dispatch per connection
    pub fn parallel_enabled(mut self, enabled: bool) -> Self {
        self.options.parallel_enabled = enabled;
        self
    }

    /// Read dispatch fan-out
    pub fn parallel_golimit(mut self, limit: usize) -> Self {
        self.options.parallel_golimit = limit;
        self
    }

    /// Maximum inbound message size
    pub fn read_max_payload_size(mut self, size: usize) -> Self {
        self.options.read_max_payload_size = size;
        self
    }

    /// Maximum outbound message size
    pub fn write_max_payload_size(mut self, size: usize) -> Self {
        self.options.write_max_payload_size = size;
        self
    }

    /// Reject invalid UTF-8 in text messages
    pub fn check_utf8_enabled(mut self, enabled: bool) -> Self {
        self.options.check_utf8_enabled = enabled;
        self
    }

    /// Bound on the close handshake after we initiate it
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.options.close_timeout = timeout;
        self
    }

    /// permessage-deflate configuration
    pub fn permessage_deflate(mut self, pd: PermessageDeflate) -> Self {
        self.options.permessage_deflate = pd;
        self
    }

    /// Finish building
    pub fn build(self) -> Options {
        self.options
    }
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenient imports for applications
pub mod prelude {
    pub use crate::conn::Conn;
    pub use crate::error::{CloseError, Error, Result};
    pub use crate::frame::Opcode;
    pub use crate::handler::{Handler, Message};
    pub use crate::Options;
}
