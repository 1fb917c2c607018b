//! Bit-level read/write cursors for the binary game protocol.
//!
//! Bits are packed least-significant first inside each byte and multi-bit values are
//! written low bit first, so byte-aligned `u16`/`u32` fields come out little-endian.

use bytes::Bytes;
use glam::Vec2;

/// Width of a game-type (item catalog) index on the wire.
pub const DEFAULT_GAME_TYPE_BITS: u32 = 11;
/// Width of a map-type (map object catalog) index on the wire.
pub const MAP_TYPE_BITS: u32 = 12;

/// Decode failures. Always recoverable: the offending message is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("read of {requested} bits at bit {position} overruns a {available}-bit buffer")]
    Overrun {
        position: usize,
        requested: u32,
        available: usize,
    },

    #[error("string contains non-ASCII bytes")]
    InvalidString,
}

fn quantize(value: f32, min: f32, max: f32, bits: u32) -> u32 {
    let range = ((1u64 << bits) - 1) as f64;
    let value = if value.is_nan() { min } else { value.clamp(min, max) };
    let t = (value as f64 - min as f64) / (max as f64 - min as f64);
    (t * range + 0.5) as u32
}

fn dequantize(raw: u32, min: f32, max: f32, bits: u32) -> f32 {
    let range = ((1u64 << bits) - 1) as f64;
    (min as f64 + (max as f64 - min as f64) * raw as f64 / range) as f32
}

/// Write cursor over a fixed-capacity, zero-initialised buffer.
///
/// Writing past the capacity is a programming error (buffers are sized per message
/// type) and panics.
#[derive(Debug)]
pub struct BitWriter {
    buf: Vec<u8>,
    bit_pos: usize,
    game_type_bits: u32,
}

impl BitWriter {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: vec![0; bytes],
            bit_pos: 0,
            game_type_bits: DEFAULT_GAME_TYPE_BITS,
        }
    }

    pub fn with_game_type_bits(mut self, bits: u32) -> Self {
        self.game_type_bits = bits;
        self
    }

    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    /// Bytes touched so far (a trailing partial byte counts).
    pub fn byte_len(&self) -> usize {
        self.bit_pos.div_ceil(8)
    }

    pub fn write_bits(&mut self, value: u32, bits: u32) {
        assert!(bits <= 32, "cannot write {bits} bits at once");
        let end = self.bit_pos + bits as usize;
        assert!(
            end <= self.buf.len() * 8,
            "bit stream capacity exceeded: {} bits needed, {} available",
            end,
            self.buf.len() * 8
        );
        for i in 0..bits {
            if (value >> i) & 1 != 0 {
                let pos = self.bit_pos + i as usize;
                self.buf[pos >> 3] |= 1 << (pos & 7);
            }
        }
        self.bit_pos = end;
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(value as u32, 1);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value as u32, 8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(value as u32, 16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(value, 32);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_bits(value.to_bits(), 32);
    }

    /// Linear quantization of `value` (clamped to `[min, max]`) into `bits` bits.
    pub fn write_float(&mut self, value: f32, min: f32, max: f32, bits: u32) {
        self.write_bits(quantize(value, min, max, bits), bits);
    }

    pub fn write_vec(&mut self, v: Vec2, min_x: f32, min_y: f32, max_x: f32, max_y: f32, bits: u32) {
        self.write_float(v.x, min_x, max_x, bits);
        self.write_float(v.y, min_y, max_y, bits);
    }

    pub fn write_unit_vec(&mut self, v: Vec2, bits: u32) {
        self.write_vec(v, -1.0, -1.0, 1.0, 1.0, bits);
    }

    /// Pads with zero bits up to the next byte boundary. No-op when already aligned.
    pub fn align_to_next_byte(&mut self) {
        let rem = self.bit_pos % 8;
        if rem != 0 {
            self.write_bits(0, 8 - rem as u32);
        }
    }

    pub fn write_game_type(&mut self, type_id: u16) {
        self.write_bits(type_id as u32, self.game_type_bits);
    }

    pub fn write_map_type(&mut self, type_id: u16) {
        self.write_bits(type_id as u32, MAP_TYPE_BITS);
    }

    /// u8 length prefix followed by the ASCII bytes. Non-ASCII characters become `?`.
    pub fn write_string(&mut self, s: &str) {
        let bytes: Vec<u8> = s
            .chars()
            .take(u8::MAX as usize)
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        self.write_u8(bytes.len() as u8);
        for b in bytes {
            self.write_u8(b);
        }
    }

    /// Exactly `len` bytes: truncated, or padded with zero bytes.
    pub fn write_fixed_string(&mut self, s: &str, len: usize) {
        let mut written = 0;
        for c in s.chars().take(len) {
            self.write_u8(if c.is_ascii() { c as u8 } else { b'?' });
            written += 1;
        }
        for _ in written..len {
            self.write_u8(0);
        }
    }

    /// Truncates the buffer to the bytes actually used.
    pub fn finish(mut self) -> Bytes {
        let len = self.byte_len();
        self.buf.truncate(len);
        Bytes::from(self.buf)
    }
}

/// Read cursor over a received message. Every read is bounds-checked.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
    game_type_bits: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            bit_pos: 0,
            game_type_bits: DEFAULT_GAME_TYPE_BITS,
        }
    }

    pub fn with_game_type_bits(mut self, bits: u32) -> Self {
        self.game_type_bits = bits;
        self
    }

    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32, StreamError> {
        let available = self.data.len() * 8;
        if bits > 32 || self.bit_pos + bits as usize > available {
            return Err(StreamError::Overrun {
                position: self.bit_pos,
                requested: bits,
                available,
            });
        }
        let mut value = 0u32;
        for i in 0..bits {
            let pos = self.bit_pos + i as usize;
            if self.data[pos >> 3] & (1 << (pos & 7)) != 0 {
                value |= 1 << i;
            }
        }
        self.bit_pos += bits as usize;
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool, StreamError> {
        Ok(self.read_bits(1)? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8, StreamError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, StreamError> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32, StreamError> {
        self.read_bits(32)
    }

    pub fn read_f32(&mut self) -> Result<f32, StreamError> {
        Ok(f32::from_bits(self.read_bits(32)?))
    }

    pub fn read_float(&mut self, min: f32, max: f32, bits: u32) -> Result<f32, StreamError> {
        Ok(dequantize(self.read_bits(bits)?, min, max, bits))
    }

    pub fn read_vec(
        &mut self,
        min_x: f32,
        min_y: f32,
        max_x: f32,
        max_y: f32,
        bits: u32,
    ) -> Result<Vec2, StreamError> {
        let x = self.read_float(min_x, max_x, bits)?;
        let y = self.read_float(min_y, max_y, bits)?;
        Ok(Vec2::new(x, y))
    }

    pub fn read_unit_vec(&mut self, bits: u32) -> Result<Vec2, StreamError> {
        self.read_vec(-1.0, -1.0, 1.0, 1.0, bits)
    }

    pub fn align_to_next_byte(&mut self) -> Result<(), StreamError> {
        let rem = self.bit_pos % 8;
        if rem != 0 {
            self.read_bits(8 - rem as u32)?;
        }
        Ok(())
    }

    pub fn read_game_type(&mut self) -> Result<u16, StreamError> {
        Ok(self.read_bits(self.game_type_bits)? as u16)
    }

    pub fn read_map_type(&mut self) -> Result<u16, StreamError> {
        Ok(self.read_bits(MAP_TYPE_BITS)? as u16)
    }

    pub fn read_string(&mut self) -> Result<String, StreamError> {
        let len = self.read_u8()? as usize;
        let mut out = String::with_capacity(len);
        for _ in 0..len {
            let b = self.read_u8()?;
            if !b.is_ascii() {
                return Err(StreamError::InvalidString);
            }
            out.push(b as char);
        }
        Ok(out)
    }

    /// Reads `len` bytes; the string ends at the first zero byte.
    pub fn read_fixed_string(&mut self, len: usize) -> Result<String, StreamError> {
        let mut out = String::new();
        let mut terminated = false;
        for _ in 0..len {
            let b = self.read_u8()?;
            if b == 0 {
                terminated = true;
            }
            if terminated {
                continue;
            }
            if !b.is_ascii() {
                return Err(StreamError::InvalidString);
            }
            out.push(b as char);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bits_pack_low_bit_first() {
        let mut w = BitWriter::with_capacity(4);
        w.write_bits(0b101, 3);
        w.write_bits(0b11111, 5);
        w.write_u16(0x1234);
        let bytes = w.finish();
        assert_eq!(&bytes[..], &[0b1111_1101, 0x34, 0x12]);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(3).unwrap(), 0b101);
        assert_eq!(r.read_bits(5).unwrap(), 0b11111);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
    }

    #[test]
    fn half_quantizes_within_one_step() {
        let mut w = BitWriter::with_capacity(1);
        w.write_float(0.5, 0.0, 1.0, 8);
        let bytes = w.finish();
        let v = BitReader::new(&bytes).read_float(0.0, 1.0, 8).unwrap();
        assert!((v - 0.5).abs() <= 1.0 / 255.0);
    }

    #[test]
    fn out_of_range_values_clamp() {
        let mut w = BitWriter::with_capacity(4);
        w.write_float(-10.0, 0.0, 100.0, 8);
        w.write_float(250.0, 0.0, 100.0, 8);
        w.write_float(f32::NAN, 0.0, 100.0, 8);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_float(0.0, 100.0, 8).unwrap(), 0.0);
        assert_eq!(r.read_float(0.0, 100.0, 8).unwrap(), 100.0);
        assert_eq!(r.read_float(0.0, 100.0, 8).unwrap(), 0.0);
    }

    #[test]
    fn align_is_noop_when_aligned() {
        let mut w = BitWriter::with_capacity(4);
        w.write_u8(7);
        w.align_to_next_byte();
        assert_eq!(w.bit_position(), 8);
        w.write_bits(1, 3);
        w.align_to_next_byte();
        assert_eq!(w.bit_position(), 16);
        w.align_to_next_byte();
        assert_eq!(w.bit_position(), 16);
    }

    #[test]
    fn overrun_is_an_error_not_a_panic() {
        let data = [0xffu8];
        let mut r = BitReader::new(&data);
        assert!(r.read_bits(6).is_ok());
        assert!(matches!(
            r.read_bits(3),
            Err(StreamError::Overrun { position: 6, requested: 3, available: 8 })
        ));
        assert!(r.read_u16().is_err());
    }

    #[test]
    #[should_panic(expected = "capacity exceeded")]
    fn writer_capacity_is_fixed() {
        let mut w = BitWriter::with_capacity(1);
        w.write_u16(1);
    }

    #[test]
    fn strings() {
        let mut w = BitWriter::with_capacity(64);
        w.write_bits(1, 1);
        w.write_string("Pineapple");
        w.write_fixed_string("main", 24);
        let bytes = w.finish();

        let mut r = BitReader::new(&bytes);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_string().unwrap(), "Pineapple");
        let pos = r.bit_position();
        assert_eq!(r.read_fixed_string(24).unwrap(), "main");
        assert_eq!(r.bit_position() - pos, 24 * 8);
    }

    #[test]
    fn game_type_width_follows_protocol() {
        let mut w = BitWriter::with_capacity(8).with_game_type_bits(10);
        w.write_game_type(1023);
        w.write_map_type(4095);
        assert_eq!(w.bit_position(), 10 + 12);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes).with_game_type_bits(10);
        assert_eq!(r.read_game_type().unwrap(), 1023);
        assert_eq!(r.read_map_type().unwrap(), 4095);
    }

    proptest! {
        #[test]
        fn grid_values_round_trip_exactly(raw in 0u32..65536, bits in prop::sample::select(vec![8u32, 10, 11, 16])) {
            let raw = raw & ((1 << bits) - 1);
            let snapped = dequantize(raw, 0.0, 1024.0, bits);
            let mut w = BitWriter::with_capacity(4);
            w.write_float(snapped, 0.0, 1024.0, bits);
            let bytes = w.finish();
            let decoded = BitReader::new(&bytes).read_float(0.0, 1024.0, bits).unwrap();
            prop_assert_eq!(decoded, snapped);
        }

        #[test]
        fn arbitrary_values_within_one_step(v in -1.0f32..1.0, bits in 4u32..=16) {
            let mut w = BitWriter::with_capacity(4);
            w.write_float(v, -1.0, 1.0, bits);
            let bytes = w.finish();
            let decoded = BitReader::new(&bytes).read_float(-1.0, 1.0, bits).unwrap();
            let step = 2.0 / ((1u32 << bits) - 1) as f32;
            prop_assert!((decoded - v).abs() <= step);
        }
    }
}
