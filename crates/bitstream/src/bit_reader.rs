//! Exp-Golomb bit reader over an RBSP.
//!
//! Only enough of H.264 slice-header syntax is read to find
//! `first_mb_in_slice`, the field that marks the first slice of a picture.

use pj_common::BitstreamError;

/// Longest Exp-Golomb prefix accepted for a 32-bit value.
const MAX_LEADING_ZEROS: u32 = 31;

/// Bytes of escaped payload needed to read one 32-bit ue(v) from the slice
/// header with room for emulation-prevention bytes.
const SLICE_HEADER_PREFIX: usize = 16;

/// MSB-first bit reader.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    /// Read a single bit.
    pub fn read_bit(&mut self) -> Result<u8, BitstreamError> {
        let byte = *self.data.get(self.byte_pos).ok_or(BitstreamError::EndOfData {
            len: self.data.len(),
        })?;
        let bit = (byte >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        Ok(bit)
    }

    /// Read `n` bits (at most 32) as an unsigned value.
    pub fn read_bits(&mut self, n: u8) -> Result<u32, BitstreamError> {
        debug_assert!(n <= 32);
        let mut val = 0u32;
        for _ in 0..n {
            val = (val << 1) | self.read_bit()? as u32;
        }
        Ok(val)
    }

    /// Read an unsigned Exp-Golomb coded value, ue(v).
    pub fn read_ue(&mut self) -> Result<u32, BitstreamError> {
        let mut leading_zeros = 0u32;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > MAX_LEADING_ZEROS {
                return Err(BitstreamError::InvalidExpGolomb {
                    leading_zeros: MAX_LEADING_ZEROS,
                });
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros as u8)? as u64;
        Ok(((1u64 << leading_zeros) - 1 + suffix) as u32)
    }

    /// Bits not yet consumed.
    pub fn bits_remaining(&self) -> usize {
        (self.data.len().saturating_sub(self.byte_pos)) * 8 - self.bit_pos as usize
    }
}

/// Remove emulation-prevention bytes: every `00 00 03` becomes `00 00`.
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    unescape_rbsp_prefix(data, usize::MAX)
}

/// Like [`unescape_rbsp`] but stops once `max_out` bytes have been produced.
fn unescape_rbsp_prefix(data: &[u8], max_out: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len().min(max_out));
    let mut zeros = 0usize;
    for &byte in data {
        if out.len() >= max_out {
            break;
        }
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// Read `first_mb_in_slice` from a slice NAL unit.
///
/// `nal` starts at the one-byte NAL header (no start code). Zero means the
/// slice begins a new picture.
pub fn first_mb_in_slice(nal: &[u8]) -> Result<u32, BitstreamError> {
    let payload = nal.get(1..).ok_or(BitstreamError::EmptyNal)?;
    let rbsp = unescape_rbsp_prefix(payload, SLICE_HEADER_PREFIX);
    BitReader::new(&rbsp).read_ue()
}
