//! permessage-deflate extension (RFC 7692)
//!
//! Messages travel as raw deflate streams with the per-block flush tail
//! stripped. Both directions of a connection can keep their LZ77 context
//! across messages ("context takeover"); rather than keeping a stateful
//! stream per connection, each compress/decompress call resets a shared
//! deflate state and seeds it with a dictionary taken from a per-connection
//! [`SlideWindow`]. That is what lets a server share a small pool of deflate
//! states across every connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use parking_lot::Mutex;

use crate::buffer::{self, PooledBuffer};
use crate::error::{CloseError, Error, Result};

/// Flush tail ending every sync-flushed deflate block; stripped after
/// compression per RFC 7692 section 7.2.1.
const FLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Tail appended before decompression: the stripped flush tail plus a final
/// empty stored block so the inflate stream terminates cleanly.
const INFLATE_TAIL: [u8; 9] = [0x00, 0x00, 0xff, 0xff, 0x01, 0x00, 0x00, 0xff, 0xff];

/// Smallest negotiable LZ77 window (2^8 bytes)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Largest negotiable LZ77 window (2^15 bytes)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Negotiated permessage-deflate parameters.
///
/// A configured instance doubles as the local offer; [`negotiate`]
/// (crate::PermessageDeflate::negotiate) merges it with the peer's
/// `Sec-WebSocket-Extensions` value into the parameters both sides share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermessageDeflate {
    /// Whether the extension is active on the connection
    pub enabled: bool,
    /// Server keeps its compression context between messages
    pub server_context_takeover: bool,
    /// Client keeps its compression context between messages
    pub client_context_takeover: bool,
    /// Server-side LZ77 window bits, in `[8, 15]`
    pub server_max_window_bits: u8,
    /// Client-side LZ77 window bits, in `[8, 15]`
    pub client_max_window_bits: u8,
    /// Minimum payload length worth compressing
    pub threshold: usize,
    /// Deflate compression level (0-9)
    pub level: u32,
    /// Number of shared deflate states on the server side
    pub pool_size: usize,
}

impl Default for PermessageDeflate {
    fn default() -> Self {
        Self {
            enabled: false,
            server_context_takeover: true,
            client_context_takeover: true,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
            threshold: 512,
            level: 6,
            pool_size: 16,
        }
    }
}

fn parse_window_bits(value: Option<&str>) -> u8 {
    value
        .and_then(|v| v.trim().trim_matches('"').parse::<u8>().ok())
        .filter(|&v| v != 0)
        .unwrap_or(MAX_WINDOW_BITS)
}

impl PermessageDeflate {
    /// Merge this configuration with the peer's `Sec-WebSocket-Extensions`
    /// value. Window bits take the minimum of both sides and are clamped into
    /// `[8, 15]`; context takeover survives only if neither side vetoes it.
    pub fn negotiate(&self, extensions: &str) -> PermessageDeflate {
        let mut out = self.clone();
        if !extensions.contains("permessage-deflate") {
            out.enabled = false;
            return out;
        }

        for token in extensions.split(';') {
            let mut pair = token.trim().splitn(2, '=');
            let name = pair.next().unwrap_or("").trim();
            let value = pair.next();
            match name {
                "permessage-deflate" => {}
                "server_no_context_takeover" => out.server_context_takeover = false,
                "client_no_context_takeover" => out.client_context_takeover = false,
                "server_max_window_bits" => {
                    if value.is_some() {
                        out.server_max_window_bits =
                            out.server_max_window_bits.min(parse_window_bits(value));
                    }
                }
                "client_max_window_bits" => {
                    if value.is_some() {
                        out.client_max_window_bits =
                            out.client_max_window_bits.min(parse_window_bits(value));
                    }
                }
                _ => {}
            }
        }

        out.server_max_window_bits = out
            .server_max_window_bits
            .clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        out.client_max_window_bits = out
            .client_max_window_bits
            .clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        out
    }

    /// `Sec-WebSocket-Extensions` value a client sends when offering this
    /// configuration
    pub fn request_header(&self) -> String {
        let mut options = vec!["permessage-deflate".to_string()];
        if !self.server_context_takeover {
            options.push("server_no_context_takeover".to_string());
        }
        if !self.client_context_takeover {
            options.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits != MAX_WINDOW_BITS {
            options.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits != MAX_WINDOW_BITS {
            options.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        } else if self.client_context_takeover {
            options.push("client_max_window_bits".to_string());
        }
        options.join("; ")
    }

    /// `Sec-WebSocket-Extensions` value a server answers with after
    /// negotiation
    pub fn response_header(&self) -> String {
        let mut options = vec!["permessage-deflate".to_string()];
        if !self.server_context_takeover {
            options.push("server_no_context_takeover".to_string());
        }
        if !self.client_context_takeover {
            options.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits != MAX_WINDOW_BITS {
            options.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits != MAX_WINDOW_BITS {
            options.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }
        options.join("; ")
    }
}

/// Iteration backstop for the flate2 loops
const MAX_FLATE_ROUNDS: u32 = 100_000;

/// One reusable compress state and one reusable decompress state.
///
/// The two sides are guarded by separate locks so inbound and outbound
/// traffic never contend. Dictionaries are supplied per call, which is what
/// allows a deflater to be shared across connections.
pub struct Deflater {
    limit: usize,
    inflate: Mutex<Decompress>,
    deflate: Mutex<Compress>,
}

impl Deflater {
    /// Build a deflater. `server_side` picks which negotiated window-bits
    /// value applies to the compressor; `limit` bounds decompressed output.
    pub fn new(server_side: bool, pd: &PermessageDeflate, limit: usize) -> Self {
        let bits = if server_side {
            pd.server_max_window_bits
        } else {
            pd.client_max_window_bits
        };
        // raw zlib streams reject an 8-bit window; the dictionary capacity
        // still honors the negotiated 2^8
        let bits = bits.max(9);
        Self {
            limit,
            inflate: Mutex::new(Decompress::new_with_window_bits(false, MAX_WINDOW_BITS)),
            deflate: Mutex::new(Compress::new_with_window_bits(
                Compression::new(pd.level),
                false,
                bits,
            )),
        }
    }

    /// Compress `src` into `dst`, seeding the LZ77 window from `dict`.
    ///
    /// The trailing `00 00 FF FF` flush tail is stripped, to be restored by
    /// the receiver before inflating.
    pub fn compress(&self, src: &[u8], dict: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        let mut deflate = self.deflate.lock();
        deflate.reset();
        if !dict.is_empty() {
            deflate
                .set_dictionary(dict)
                .map_err(|e| Error::Compression(e.to_string()))?;
        }

        let mut consumed = 0usize;
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > MAX_FLATE_ROUNDS {
                return Err(Error::Compression("deflate did not converge".to_string()));
            }
            if dst.capacity() == dst.len() {
                dst.reserve(dst.capacity().max(4 * 1024));
            }

            let before_in = deflate.total_in();
            let status = deflate
                .compress_vec(&src[consumed..], dst, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += (deflate.total_in() - before_in) as usize;

            // spare output capacity after a sync flush means the flush is complete
            if matches!(status, Status::StreamEnd)
                || (consumed >= src.len() && dst.len() < dst.capacity())
            {
                break;
            }
        }

        if dst.ends_with(&FLATE_TAIL) {
            dst.truncate(dst.len() - FLATE_TAIL.len());
        }
        Ok(())
    }

    /// Decompress `src` (a tail-stripped deflate stream) into a pooled
    /// buffer, seeding the LZ77 window from `dict`. Output beyond the
    /// configured limit fails with close code 1009.
    pub fn decompress(&self, src: &[u8], dict: &[u8]) -> Result<PooledBuffer> {
        let mut inflate = self.inflate.lock();
        inflate.reset(false);
        if !dict.is_empty() {
            inflate
                .set_dictionary(dict)
                .map_err(|e| Error::Compression(e.to_string()))?;
        }

        let mut input = Vec::with_capacity(src.len() + INFLATE_TAIL.len());
        input.extend_from_slice(src);
        input.extend_from_slice(&INFLATE_TAIL);

        let mut out = buffer::alloc((src.len().max(256)).saturating_mul(2));
        let mut consumed = 0usize;
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > MAX_FLATE_ROUNDS {
                return Err(Error::Compression("inflate did not converge".to_string()));
            }
            if out.capacity() == out.len() {
                let additional = out.capacity().max(4 * 1024);
                out.reserve(additional);
            }

            let before_in = inflate.total_in();
            let status = inflate
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += (inflate.total_in() - before_in) as usize;

            if out.len() > self.limit {
                return Err(Error::Close(CloseError::message_too_large()));
            }
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed >= input.len() && out.len() < out.capacity() {
                        break;
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Server-side pool of shared deflate states, selected round robin.
///
/// The size is rounded up to a power of two so selection is a mask on an
/// atomically incremented serial.
pub struct DeflaterPool {
    serial: AtomicU64,
    pool: Vec<Arc<Deflater>>,
}

impl DeflaterPool {
    /// Build `pool_size` deflaters (rounded up to a power of two)
    pub fn new(pd: &PermessageDeflate, limit: usize) -> Self {
        let num = pd.pool_size.max(1).next_power_of_two();
        Self {
            serial: AtomicU64::new(0),
            pool: (0..num)
                .map(|_| Arc::new(Deflater::new(true, pd, limit)))
                .collect(),
        }
    }

    /// Pick the next deflater
    pub fn select(&self) -> Arc<Deflater> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&self.pool[serial as usize & (self.pool.len() - 1)])
    }

    /// Number of deflaters in the pool
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Whether the pool is empty (never true after construction)
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

/// Rolling dictionary of the most recent `2^window_bits` uncompressed bytes.
///
/// Fed with every compressed message's uncompressed payload on both the
/// producing and consuming side, so the two stay byte-identical; the contents
/// seed the next compress or decompress call when context takeover is on.
#[derive(Debug)]
pub struct SlideWindow {
    enabled: bool,
    size: usize,
    dict: Vec<u8>,
}

impl SlideWindow {
    /// A window that ignores writes and always yields an empty dictionary
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            size: 0,
            dict: Vec::new(),
        }
    }

    /// A window of capacity `2^window_bits`
    pub fn new(window_bits: u8) -> Self {
        let size = 1usize << window_bits;
        Self {
            enabled: true,
            size,
            dict: Vec::with_capacity(size),
        }
    }

    /// The current dictionary bytes
    pub fn dict(&self) -> &[u8] {
        &self.dict
    }

    /// Roll `p` into the window, keeping at most the last `size` bytes
    pub fn write(&mut self, p: &[u8]) {
        if !self.enabled {
            return;
        }

        let len = self.dict.len();
        if len + p.len() <= self.size {
            self.dict.extend_from_slice(p);
            return;
        }

        let mut p = p;
        if self.size > len {
            let fill = self.size - len;
            self.dict.extend_from_slice(&p[..fill]);
            p = &p[fill..];
        }

        let n = p.len();
        if n == 0 {
            return;
        }
        if n >= self.size {
            self.dict.copy_from_slice(&p[n - self.size..]);
            return;
        }
        self.dict.copy_within(n.., 0);
        let start = self.size - n;
        self.dict[start..].copy_from_slice(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deflater(level: u32) -> Deflater {
        let pd = PermessageDeflate {
            enabled: true,
            level,
            ..Default::default()
        };
        Deflater::new(true, &pd, 1024 * 1024)
    }

    #[test]
    fn test_compress_decompress_roundtrip() {
        let d = deflater(6);
        let original = b"The quick brown fox jumps over the lazy dog. \
                         The quick brown fox jumps over the lazy dog.";

        let mut compressed = Vec::new();
        d.compress(original, &[], &mut compressed).unwrap();
        assert!(compressed.len() < original.len());
        assert!(
            !compressed.ends_with(&FLATE_TAIL),
            "flush tail must be stripped"
        );

        let out = d.decompress(&compressed, &[]).unwrap();
        assert_eq!(&out[..], &original[..]);
    }

    #[test]
    fn test_roundtrip_with_dictionary() {
        let d = deflater(6);
        let dict = b"a shared dictionary both sides agree on";
        let payload = b"a shared dictionary both sides agree on, again";

        let mut with_dict = Vec::new();
        d.compress(payload, dict, &mut with_dict).unwrap();
        let mut without_dict = Vec::new();
        d.compress(payload, &[], &mut without_dict).unwrap();
        assert!(
            with_dict.len() < without_dict.len(),
            "dictionary should shrink the output"
        );

        let out = d.decompress(&with_dict, dict).unwrap();
        assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn test_roundtrip_all_takeover_combinations() {
        // emulate one producer and one consumer whose windows advance in step
        let d = deflater(6);
        for takeover in [false, true] {
            let mut producer = if takeover {
                SlideWindow::new(12)
            } else {
                SlideWindow::disabled()
            };
            let mut consumer = if takeover {
                SlideWindow::new(12)
            } else {
                SlideWindow::disabled()
            };

            for round in 0..4 {
                let payload: Vec<u8> = format!("round {round}: ")
                    .bytes()
                    .chain(std::iter::repeat(b"repetitive payload ".to_owned()).take(20).flatten())
                    .collect();

                let mut compressed = Vec::new();
                d.compress(&payload, producer.dict(), &mut compressed).unwrap();
                producer.write(&payload);

                let out = d.decompress(&compressed, consumer.dict()).unwrap();
                consumer.write(&out);

                assert_eq!(&out[..], &payload[..], "takeover={takeover} round={round}");
            }
        }
    }

    #[test]
    fn test_context_takeover_shrinks_second_message() {
        let d = deflater(6);
        let payload = vec![b'x'; 1024];
        let mut window = SlideWindow::new(15);

        let mut first = Vec::new();
        d.compress(&payload, window.dict(), &mut first).unwrap();
        window.write(&payload);

        let mut second = Vec::new();
        d.compress(&payload, window.dict(), &mut second).unwrap();

        assert!(
            second.len() < first.len(),
            "second frame ({}) should be shorter than first ({})",
            second.len(),
            first.len()
        );
    }

    #[test]
    fn test_decompress_limit() {
        let pd = PermessageDeflate {
            enabled: true,
            ..Default::default()
        };
        let d = Deflater::new(true, &pd, 64);

        let payload = vec![b'a'; 4096];
        let mut compressed = Vec::new();
        d.compress(&payload, &[], &mut compressed).unwrap();

        match d.decompress(&compressed, &[]) {
            Err(Error::Close(c)) => assert_eq!(c.code, crate::error::close_code::MESSAGE_TOO_BIG),
            other => panic!("expected close 1009, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let d = deflater(6);
        let mut compressed = Vec::new();
        d.compress(&[], &[], &mut compressed).unwrap();
        let out = d.decompress(&compressed, &[]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_pool_rounds_up_and_cycles() {
        let pd = PermessageDeflate {
            enabled: true,
            pool_size: 10,
            ..Default::default()
        };
        let pool = DeflaterPool::new(&pd, 1024);
        assert_eq!(pool.len(), 16);

        // selection must walk every slot before repeating
        let first = Arc::as_ptr(&pool.select());
        for _ in 0..15 {
            assert_ne!(Arc::as_ptr(&pool.select()), first);
        }
        assert_eq!(Arc::as_ptr(&pool.select()), first);
    }

    #[test]
    fn test_slide_window_keeps_last_capacity_bytes() {
        let mut w = SlideWindow::new(8); // capacity 256
        let mut fed = Vec::new();
        for chunk in 0..40u8 {
            let piece = vec![chunk; 17];
            w.write(&piece);
            fed.extend_from_slice(&piece);
        }
        assert_eq!(w.dict().len(), 256);
        assert_eq!(w.dict(), &fed[fed.len() - 256..]);
    }

    #[test]
    fn test_slide_window_oversize_write() {
        let mut w = SlideWindow::new(8);
        let big: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        w.write(&big);
        assert_eq!(w.dict(), &big[big.len() - 256..]);
    }

    #[test]
    fn test_slide_window_disabled_is_empty() {
        let mut w = SlideWindow::disabled();
        w.write(b"anything at all");
        assert!(w.dict().is_empty());
    }

    #[test]
    fn test_negotiate_takes_minimum_and_clamps() {
        let config = PermessageDeflate {
            enabled: true,
            server_max_window_bits: 12,
            ..Default::default()
        };
        let out = config.negotiate(
            "permessage-deflate; client_no_context_takeover; \
             server_max_window_bits=14; client_max_window_bits=4",
        );
        assert!(out.enabled);
        assert!(out.server_context_takeover);
        assert!(!out.client_context_takeover);
        assert_eq!(out.server_max_window_bits, 12); // min(12, 14)
        assert_eq!(out.client_max_window_bits, 8); // clamped up from 4
    }

    #[test]
    fn test_negotiate_without_offer_disables() {
        let config = PermessageDeflate {
            enabled: true,
            ..Default::default()
        };
        assert!(!config.negotiate("some-other-extension").enabled);
    }

    #[test]
    fn test_negotiate_bad_value_falls_back() {
        let config = PermessageDeflate {
            enabled: true,
            ..Default::default()
        };
        let out = config.negotiate("permessage-deflate; server_max_window_bits=oops");
        assert_eq!(out.server_max_window_bits, MAX_WINDOW_BITS);
    }

    #[test]
    fn test_header_generation() {
        let pd = PermessageDeflate {
            enabled: true,
            server_context_takeover: false,
            server_max_window_bits: 12,
            ..Default::default()
        };
        let response = pd.response_header();
        assert!(response.starts_with("permessage-deflate"));
        assert!(response.contains("server_no_context_takeover"));
        assert!(response.contains("server_max_window_bits=12"));
        assert!(!response.contains("client_no_context_takeover"));

        let request = pd.request_header();
        assert!(request.contains("client_max_window_bits"));
    }
}
