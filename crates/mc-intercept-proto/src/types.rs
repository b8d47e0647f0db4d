//! Base data types shared by the wire model.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{ensure_remaining, ProtoDecode, ProtoEncode};
use crate::error::ProtoError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum VarIntError {
    #[error("buffer too short")]
    BufferTooShort,
    #[error("VarInt is too long (more than {max_bytes} bytes)")]
    TooManyBytes { max_bytes: usize },
}

// ---------------------------------------------------------------------------
// VarInt (i32, two's complement LEB128)
// ---------------------------------------------------------------------------

/// Signed variable-length integer. Negative values always take 5 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarInt(pub i32);

impl VarInt {
    pub const MAX_BYTES: usize = 5;
}

impl ProtoEncode for VarInt {
    fn proto_encode(&self, buf: &mut impl BufMut) {
        VarUInt32(self.0 as u32).proto_encode(buf);
    }
}

impl ProtoDecode for VarInt {
    fn proto_decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        Ok(VarInt(VarUInt32::proto_decode(buf)?.0 as i32))
    }
}

// ---------------------------------------------------------------------------
// VarLong (i64, two's complement LEB128)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarLong(pub i64);

impl VarLong {
    pub const MAX_BYTES: usize = 10;
}

impl ProtoEncode for VarLong {
    fn proto_encode(&self, buf: &mut impl BufMut) {
        let mut value = self.0 as u64;
        loop {
            if value & !0x7F == 0 {
                buf.put_u8(value as u8);
                return;
            }
            buf.put_u8((value & 0x7F | 0x80) as u8);
            value >>= 7;
        }
    }
}

impl ProtoDecode for VarLong {
    fn proto_decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let mut result: u64 = 0;
        for i in 0..Self::MAX_BYTES {
            if !buf.has_remaining() {
                return Err(VarIntError::BufferTooShort.into());
            }
            let byte = buf.get_u8();
            result |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(VarLong(result as i64));
            }
        }
        Err(VarIntError::TooManyBytes {
            max_bytes: Self::MAX_BYTES,
        }
        .into())
    }
}

// ---------------------------------------------------------------------------
// VarUInt32 (unsigned LEB128)
// ---------------------------------------------------------------------------

/// Unsigned variable-length integer, used for frame lengths, string lengths and packet ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarUInt32(pub u32);

impl VarUInt32 {
    pub const MAX_BYTES: usize = 5;

    /// Number of bytes this value occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self.0 {
            0..=0x7F => 1,
            0x80..=0x3FFF => 2,
            0x4000..=0x1F_FFFF => 3,
            0x20_0000..=0xFFF_FFFF => 4,
            _ => 5,
        }
    }
}

impl ProtoEncode for VarUInt32 {
    fn proto_encode(&self, buf: &mut impl BufMut) {
        let mut value = self.0;
        loop {
            if value & !0x7F == 0 {
                buf.put_u8(value as u8);
                return;
            }
            buf.put_u8((value & 0x7F | 0x80) as u8);
            value >>= 7;
        }
    }
}

impl ProtoDecode for VarUInt32 {
    fn proto_decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        let mut result: u32 = 0;
        for i in 0..Self::MAX_BYTES {
            if !buf.has_remaining() {
                return Err(VarIntError::BufferTooShort.into());
            }
            let byte = buf.get_u8();
            result |= ((byte & 0x7F) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(VarUInt32(result));
            }
        }
        Err(VarIntError::TooManyBytes {
            max_bytes: Self::MAX_BYTES,
        }
        .into())
    }
}

// ---------------------------------------------------------------------------
// Uuid (two big-endian u64)
// ---------------------------------------------------------------------------

/// 128-bit identifier, used both for player identity and UUID-typed packet fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uuid {
    pub most_significant: u64,
    pub least_significant: u64,
}

impl Uuid {
    pub const ZERO: Self = Self {
        most_significant: 0,
        least_significant: 0,
    };

    pub fn new(most: u64, least: u64) -> Self {
        Self {
            most_significant: most,
            least_significant: least,
        }
    }

    /// Random version-4 UUID.
    pub fn random() -> Self {
        let most: u64 = rand::random();
        let least: u64 = rand::random();
        Self {
            most_significant: (most & !0xF000) | 0x4000,
            least_significant: (least & !(0b11 << 62)) | (0b10 << 62),
        }
    }
}

impl ProtoEncode for Uuid {
    fn proto_encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.most_significant);
        buf.put_u64(self.least_significant);
    }
}

impl ProtoDecode for Uuid {
    fn proto_decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        ensure_remaining(buf, 16)?;
        Ok(Self {
            most_significant: buf.get_u64(),
            least_significant: buf.get_u64(),
        })
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hi = self.most_significant;
        let lo = self.least_significant;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            hi >> 32,
            (hi >> 16) & 0xFFFF,
            hi & 0xFFFF,
            lo >> 48,
            lo & 0xFFFF_FFFF_FFFF,
        )
    }
}

impl FromStr for Uuid {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(ProtoError::InvalidData(format!("malformed uuid: {s}")));
        }
        let parse = |part: &str| {
            u64::from_str_radix(part, 16)
                .map_err(|_| ProtoError::InvalidData(format!("malformed uuid: {s}")))
        };
        Ok(Self::new(parse(&hex[..16])?, parse(&hex[16..])?))
    }
}

// ---------------------------------------------------------------------------
// BlockPos (i32 x, y, z)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The 16x16x16 section containing this block.
    pub fn section_pos(&self) -> SectionPos {
        SectionPos::new(self.x >> 4, self.y >> 4, self.z >> 4)
    }

    /// Pack into the 64-bit position format: 26 bits x, 26 bits z, 12 bits y.
    pub fn pack(&self) -> i64 {
        ((self.x as i64 & 0x3FF_FFFF) << 38) | ((self.z as i64 & 0x3FF_FFFF) << 12) | (self.y as i64 & 0xFFF)
    }

    pub fn unpack(packed: i64) -> Self {
        Self {
            x: (packed >> 38) as i32,
            y: ((packed << 52) >> 52) as i32,
            z: ((packed << 26) >> 38) as i32,
        }
    }

    /// Whether this position lies inside the box spanned by `a` and `b` (inclusive, any corner order).
    pub fn within(&self, a: BlockPos, b: BlockPos) -> bool {
        let within = |v: i32, p: i32, q: i32| v >= p.min(q) && v <= p.max(q);
        within(self.x, a.x, b.x) && within(self.y, a.y, b.y) && within(self.z, a.z, b.z)
    }

    /// Block coordinates as a precise location at the block's corner.
    pub fn to_location(&self) -> Location {
        Location::new(self.x as f64, self.y as f64, self.z as f64)
    }
}

impl ProtoEncode for BlockPos {
    fn proto_encode(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.pack());
    }
}

impl ProtoDecode for BlockPos {
    fn proto_decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        ensure_remaining(buf, 8)?;
        Ok(Self::unpack(buf.get_i64()))
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// SectionPos (chunk x, section y, chunk z)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SectionPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Pack into 22 bits x, 22 bits z, 20 bits y.
    pub fn pack(&self) -> i64 {
        ((self.x as i64 & 0x3F_FFFF) << 42) | ((self.y as i64 & 0xF_FFFF) << 20) | (self.z as i64 & 0x3F_FFFF)
    }

    /// Block position relative to this section, encoded as `x << 8 | z << 4 | y`.
    pub fn relative_index(pos: BlockPos) -> i16 {
        (((pos.x & 0xF) << 8) | ((pos.z & 0xF) << 4) | (pos.y & 0xF)) as i16
    }
}

// ---------------------------------------------------------------------------
// Location (f64 x, y, z + rotation)
// ---------------------------------------------------------------------------

/// Precise world position with rotation, as carried by entity packets.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
}

impl Location {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    pub fn with_rotation(mut self, yaw: f32, pitch: f32) -> Self {
        self.yaw = yaw;
        self.pitch = pitch;
        self
    }

    pub fn block_pos(&self) -> BlockPos {
        BlockPos::new(self.x.floor() as i32, self.y.floor() as i32, self.z.floor() as i32)
    }

    pub fn distance(&self, other: &Location) -> f64 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Rotation in degrees to the 1/256-turn byte angle used on the wire.
pub fn angle_to_byte(degrees: f32) -> i8 {
    ((degrees * 256.0 / 360.0) as i32) as i8
}

// ===========================================================================
// Tests
// ===========================================================================
