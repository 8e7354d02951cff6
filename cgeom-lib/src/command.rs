//! Bit-granular command stream writer and the matching reader.
//!
//! Commands are packed most-significant bit first with no alignment between
//! them; only the end of the stream is padded with zero bits to a whole byte.

use crate::common::length_mask;
use crate::error::CgError;

pub(crate) const SET_NORM: u32 = 0xC0;
pub(crate) const SET_COLOR: u32 = 0x80;
pub(crate) const VERTEX: u32 = 0x40;
pub(crate) const MESH_B_R: u32 = 0x20;
pub(crate) const SET_STATE: u32 = 0x18;
pub(crate) const SET_TABLE: u32 = 0x10;

pub(crate) const POSITION_TABLE: u32 = 0;
pub(crate) const COLOR_TABLE: u32 = 1;
pub(crate) const NORMAL_TABLE: u32 = 2;

/// Width of the tag/data field that follows a 2-bit opcode, and of a bundled
/// subcommand header.
pub(crate) const SUBCOMMAND_HEADER_LENGTH: u32 = 6;

#[derive(Debug, Default)]
pub struct CommandStream {
    bytes: Vec<u8>,
    pending: u64,
    pending_bits: u32,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `header_length + body_length` bits: the header, then the body.
    pub fn add_command(&mut self, header: u32, header_length: u32, body: u64, body_length: u32) {
        self.add_bits(u64::from(header), header_length);
        self.add_bits(body, body_length);
    }

    pub fn bit_length(&self) -> usize {
        self.bytes.len() * 8 + self.pending_bits as usize
    }

    /// Flushes the partial last byte, zero padded, and returns the buffer.
    pub fn finish(mut self) -> Vec<u8> {
        if self.pending_bits > 0 {
            let byte = (self.pending << (8 - self.pending_bits)) as u8;
            self.bytes.push(byte);
        }
        self.bytes
    }

    fn add_bits(&mut self, bits: u64, mut length: u32) {
        debug_assert!(length <= 64);
        while length > 0 {
            let take = length.min(32);
            length -= take;
            let chunk = (bits >> length) & u64::from(length_mask(take));
            self.pending = (self.pending << take) | chunk;
            self.pending_bits += take;
            while self.pending_bits >= 8 {
                self.pending_bits -= 8;
                self.bytes.push((self.pending >> self.pending_bits) as u8);
            }
            self.pending &= u64::from(length_mask(self.pending_bits));
        }
    }
}

pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() * 8 - self.position
    }

    pub(crate) fn read(&mut self, length: u32) -> Result<u64, CgError> {
        if length as usize > self.remaining() {
            return Err(CgError::Decode(format!(
                "Unexpected end of stream: need {} bits, have {}",
                length,
                self.remaining()
            )));
        }
        let mut value = 0_u64;
        let mut left = length;
        while left > 0 {
            let byte = u32::from(self.data[self.position / 8]);
            let available = 8 - (self.position % 8) as u32;
            let take = available.min(left);
            let chunk = (byte >> (available - take)) & length_mask(take);
            value = (value << take) | u64::from(chunk);
            self.position += take as usize;
            left -= take;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_pack_without_alignment() {
        let mut stream = CommandStream::new();
        stream.add_command(0b101, 3, 0b11, 2);
        stream.add_command(0b0, 1, 0b1111_0000_1, 9);
        assert_eq!(stream.bit_length(), 15);
        let bytes = stream.finish();
        // 101 11 0 11110000 1 + one pad bit
        assert_eq!(bytes, vec![0b1011_1011, 0b1100_0010]);
    }

    #[test]
    fn test_wide_body_spans_bytes() {
        let mut stream = CommandStream::new();
        stream.add_command(VERTEX | 0x3F, 8, 0xFFFF_0000_FFFF, 48);
        let bytes = stream.finish();
        assert_eq!(bytes, vec![0x7F, 0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_reader_matches_writer() {
        let mut stream = CommandStream::new();
        stream.add_command(SET_STATE | 0x5, 8, 0, 0);
        stream.add_command(0x2A, 6, 0x1_2345, 17);
        stream.add_command(0x1, 1, u64::MAX, 64);
        let bytes = stream.finish();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(8).unwrap(), u64::from(SET_STATE | 0x5));
        assert_eq!(reader.read(6).unwrap(), 0x2A);
        assert_eq!(reader.read(17).unwrap(), 0x1_2345);
        assert_eq!(reader.read(1).unwrap(), 1);
        assert_eq!(reader.read(64).unwrap(), u64::MAX);
        assert!(reader.remaining() < 8);
        assert!(reader.read(8).is_err());
    }
}
