//! Incremental decoder for the minicap capture stream.
//!
//! ## Wire format
//!
//! All multi-byte fields are little-endian.
//!
//! **Banner** (sent once per connection, `length` bytes, usually 24):
//! ```text
//! version:          u8   (1)
//! length:           u8   (1)   total banner size, including these two bytes
//! pid:              u32  (4)
//! real_width:       u32  (4)
//! real_height:      u32  (4)
//! virtual_width:    u32  (4)
//! virtual_height:   u32  (4)
//! orientation:      u8   (1)   degrees / 90
//! quirks:           u8   (1)
//! (padding up to `length`)
//! ```
//!
//! **Frame** (repeated):
//! ```text
//! length:           u32  (4)
//! payload:          [u8] (length bytes)
//! ```
//!
//! Reads arrive in arbitrarily sized chunks, so the decoder walks a
//! small [`Phase`] state machine one step at a time and never looks back.

use bytes::{Bytes, BytesMut};
use tracing::{info, warn};

// ── Constants ────────────────────────────────────────────────────

/// Banner bytes the decoder knows how to interpret.
pub const BANNER_SIZE: usize = 24;

/// Bytes read before the banner's own `length` field is known.
const MIN_BANNER_SIZE: usize = 2;

/// Size of the little-endian frame length prefix.
const LENGTH_PREFIX_SIZE: u8 = 4;

/// Upper bound on up-front allocation for a single frame body.
const MAX_PREALLOC: usize = 16 * 1024 * 1024;

/// Frames above this size are still accepted, but logged.
const SUSPICIOUS_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One complete frame payload (a JPEG image for stock minicap).
pub type Frame = Bytes;

// ── Banner ───────────────────────────────────────────────────────

/// Stream metadata sent by the capture helper at connection start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Banner {
    pub version: u8,
    /// Declared banner size in bytes.
    pub length: u8,
    /// Process id of the capture helper on the device.
    pub pid: u32,
    pub real_width: u32,
    pub real_height: u32,
    pub virtual_width: u32,
    pub virtual_height: u32,
    /// Display orientation in degrees (0, 90, 180 or 270).
    pub orientation: u16,
    pub quirks: u8,
}

impl Banner {
    /// Apply the banner byte found at `position` (0-based).
    ///
    /// Bytes past the known layout are ignored.
    fn apply(&mut self, position: usize, byte: u8) {
        let shift = |base: usize| (8 * (position - base)) as u32;
        match position {
            0 => self.version = byte,
            1 => self.length = byte,
            2..=5 => self.pid |= u32::from(byte) << shift(2),
            6..=9 => self.real_width |= u32::from(byte) << shift(6),
            10..=13 => self.real_height |= u32::from(byte) << shift(10),
            14..=17 => self.virtual_width |= u32::from(byte) << shift(14),
            18..=21 => self.virtual_height |= u32::from(byte) << shift(18),
            22 => self.orientation = u16::from(byte) * 90,
            23 => self.quirks = byte,
            _ => {}
        }
    }

    /// Serialize the known 24-byte layout.
    ///
    /// `orientation` is written back as degrees / 90.
    pub fn encode(&self) -> [u8; BANNER_SIZE] {
        let mut buf = [0u8; BANNER_SIZE];
        buf[0] = self.version;
        buf[1] = self.length;
        buf[2..6].copy_from_slice(&self.pid.to_le_bytes());
        buf[6..10].copy_from_slice(&self.real_width.to_le_bytes());
        buf[10..14].copy_from_slice(&self.real_height.to_le_bytes());
        buf[14..18].copy_from_slice(&self.virtual_width.to_le_bytes());
        buf[18..22].copy_from_slice(&self.virtual_height.to_le_bytes());
        buf[22] = (self.orientation / 90) as u8;
        buf[23] = self.quirks;
        buf
    }
}

// ── Phase ────────────────────────────────────────────────────────

/// Parse position within the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Reading banner bytes; `target` is re-derived once byte 1 arrives.
    Banner { read: usize, target: usize },
    /// Accumulating the 4-byte frame length.
    Length { read: u8, value: u32 },
    /// Copying frame payload; `remaining` bytes still missing.
    Body { remaining: usize },
}

impl Phase {
    const AWAIT_LENGTH: Phase = Phase::Length { read: 0, value: 0 };
}

// ── FrameDecoder ─────────────────────────────────────────────────

/// Stateful decoder turning raw stream chunks into a [`Banner`] and
/// a sequence of complete [`Frame`]s.
///
/// One decoder serves exactly one connection. At most one frame body
/// is buffered at any time.
#[derive(Debug)]
pub struct FrameDecoder {
    phase: Phase,
    banner: Banner,
    banner_complete: bool,
    /// Payload of the frame currently being assembled.
    body: BytesMut,
    frames_decoded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::Banner {
                read: 0,
                target: MIN_BANNER_SIZE,
            },
            banner: Banner::default(),
            banner_complete: false,
            body: BytesMut::new(),
            frames_decoded: 0,
        }
    }

    /// The banner, once all of its bytes have been consumed.
    pub fn banner(&self) -> Option<&Banner> {
        self.banner_complete.then_some(&self.banner)
    }

    /// Number of frames emitted so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Bytes of an incomplete frame body currently held.
    pub fn partial_len(&self) -> usize {
        self.body.len()
    }

    /// Consume `chunk`, calling `emit` once for every frame completed by it.
    ///
    /// A chunk may finish the banner, any number of whole frames, and
    /// start another one; leftover state carries over to the next call.
    pub fn feed<F>(&mut self, chunk: &[u8], mut emit: F)
    where
        F: FnMut(Frame),
    {
        let mut cursor = 0;
        while cursor < chunk.len() {
            cursor += self.step(&chunk[cursor..], &mut emit);
        }
    }

    /// Convenience wrapper around [`feed`](Self::feed) collecting frames.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        self.feed(chunk, |frame| frames.push(frame));
        frames
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Advance by one step over non-empty `input`, returning bytes consumed.
    fn step<F>(&mut self, input: &[u8], emit: &mut F) -> usize
    where
        F: FnMut(Frame),
    {
        match self.phase {
            Phase::Banner { read, target } => {
                let byte = input[0];
                self.banner.apply(read, byte);
                let target = if read == 1 {
                    usize::from(byte).max(MIN_BANNER_SIZE)
                } else {
                    target
                };
                let read = read + 1;
                if read >= target {
                    self.finish_banner();
                    self.phase = Phase::AWAIT_LENGTH;
                } else {
                    self.phase = Phase::Banner { read, target };
                }
                1
            }
            Phase::Length { read, value } => {
                let value = value | (u32::from(input[0]) << (8 * u32::from(read)));
                let read = read + 1;
                if read < LENGTH_PREFIX_SIZE {
                    self.phase = Phase::Length { read, value };
                } else if value == 0 {
                    self.emit_frame(emit);
                } else {
                    self.begin_body(value as usize);
                }
                1
            }
            Phase::Body { remaining } => {
                let take = remaining.min(input.len());
                self.body.extend_from_slice(&input[..take]);
                if take == remaining {
                    self.emit_frame(emit);
                } else {
                    self.phase = Phase::Body {
                        remaining: remaining - take,
                    };
                }
                take
            }
        }
    }

    fn finish_banner(&mut self) {
        self.banner_complete = true;
        info!(banner = ?self.banner, "received banner");
    }

    fn begin_body(&mut self, len: usize) {
        if len > SUSPICIOUS_FRAME_SIZE {
            warn!(len, "unusually large frame announced");
        }
        self.body.reserve(len.min(MAX_PREALLOC));
        self.phase = Phase::Body { remaining: len };
    }

    fn emit_frame<F>(&mut self, emit: &mut F)
    where
        F: FnMut(Frame),
    {
        let frame = self.body.split().freeze();
        self.frames_decoded += 1;
        self.phase = Phase::AWAIT_LENGTH;
        emit(frame);
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
