//! NAL unit types and a zero-copy Annex-B splitter.

/// NAL unit type for H.264.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum H264NalType {
    Slice,
    SliceA,
    SliceB,
    SliceC,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    EndSeq,
    EndStream,
    FillerData,
    Other(u8),
}

impl From<u8> for H264NalType {
    fn from(val: u8) -> Self {
        match val & 0x1F {
            1 => Self::Slice,
            2 => Self::SliceA,
            3 => Self::SliceB,
            4 => Self::SliceC,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndSeq,
            11 => Self::EndStream,
            12 => Self::FillerData,
            other => Self::Other(other),
        }
    }
}

impl H264NalType {
    /// Non-IDR coded slice (including data partitions).
    pub fn is_non_idr_slice(self) -> bool {
        matches!(self, Self::Slice | Self::SliceA | Self::SliceB | Self::SliceC)
    }

    /// Any coded slice, IDR or not.
    pub fn is_slice(self) -> bool {
        self == Self::Idr || self.is_non_idr_slice()
    }

    /// Position in the canonical order the first IDR unit is rewritten to:
    /// AUD, SPS, PPS, SEI, IDR slices, everything else.
    pub fn canonical_rank(self) -> u8 {
        match self {
            Self::Aud => 0,
            Self::Sps => 1,
            Self::Pps => 2,
            Self::Sei => 3,
            Self::Idr => 4,
            _ => 5,
        }
    }
}

/// Annex-B start code (4 bytes).
pub const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Extract the NAL unit type from the first byte of NAL data.
pub fn nal_unit_type(nal_first_byte: u8) -> H264NalType {
    H264NalType::from(nal_first_byte)
}

/// A NAL unit located inside an Annex-B buffer.
///
/// The view covers the start code prefix and the payload, so consecutive
/// views tile the buffer from its first start code to its end.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NalView {
    /// Offset of the start code.
    pub offset: usize,
    /// Start code plus payload length.
    pub len: usize,
    /// Start code length, 3 or 4.
    pub prefix_len: usize,
    pub nal_type: H264NalType,
}

impl NalView {
    /// Start code and payload.
    pub fn bytes<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.offset..self.offset + self.len]
    }

    /// Payload only, beginning with the NAL header byte.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.offset + self.prefix_len..self.offset + self.len]
    }
}

/// Iterator over the NAL units of an Annex-B buffer.
///
/// Bytes before the first start code are skipped. Empty NAL units
/// (back-to-back start codes) are not yielded.
#[derive(Debug)]
pub struct NalSplitter<'a> {
    data: &'a [u8],
    next_start: Option<(usize, usize)>,
}

impl<'a> NalSplitter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next_start: find_start_code(data, 0),
        }
    }
}

impl Iterator for NalSplitter<'_> {
    type Item = NalView;

    fn next(&mut self) -> Option<NalView> {
        loop {
            let (offset, prefix_len) = self.next_start?;
            let payload_start = offset + prefix_len;
            self.next_start = find_start_code(self.data, payload_start);
            let end = self.next_start.map_or(self.data.len(), |(pos, _)| pos);

            if end > payload_start {
                return Some(NalView {
                    offset,
                    len: end - offset,
                    prefix_len,
                    nal_type: nal_unit_type(self.data[payload_start]),
                });
            }
        }
    }
}

/// Find the next start code at or after `from`.
///
/// Returns the offset of its first byte and its length. A `00 00 01` preceded
/// by a zero byte is reported as the 4-byte form.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i + 2] > 1 {
            i += 3;
        } else if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return if i > from && data[i - 1] == 0 {
                Some((i - 1, 4))
            } else {
                Some((i, 3))
            };
        } else {
            i += 1;
        }
    }
    None
}

/// Convert AVCC-formatted NAL units to Annex-B format.
///
/// AVCC: `[length_size bytes length][NAL data]...`
/// Annex-B: `[0x00 0x00 0x00 0x01][NAL data]...`
///
/// A trailing NAL whose length runs past the buffer is dropped.
pub fn avcc_to_annexb(avcc_data: &[u8], length_size: u8) -> Vec<u8> {
    let mut output = Vec::with_capacity(avcc_data.len() + 64);
    let ls = length_size as usize;
    let mut offset = 0;

    while offset + ls <= avcc_data.len() {
        let nal_len = read_nal_length(&avcc_data[offset..], ls);
        offset += ls;

        if offset + nal_len > avcc_data.len() {
            tracing::debug!(
                nal_len,
                remaining = avcc_data.len() - offset,
                "Dropping truncated AVCC NAL unit"
            );
            break;
        }

        output.extend_from_slice(&ANNEXB_START_CODE);
        output.extend_from_slice(&avcc_data[offset..offset + nal_len]);
        offset += nal_len;
    }

    output
}

/// Read a variable-length NAL unit size (1, 2, 3, or 4 bytes big-endian).
fn read_nal_length(data: &[u8], length_size: usize) -> usize {
    let mut val: usize = 0;
    for &byte in &data[..length_size] {
        val = (val << 8) | byte as usize;
    }
    val
}
