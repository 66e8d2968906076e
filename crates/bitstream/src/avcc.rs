//! Bitstream pre-filter: AVCC (length-prefixed) input to Annex-B.
//!
//! MP4/MKV carry H.264 as length-prefixed samples with the parameter sets
//! stored once in the track's AVCDecoderConfigurationRecord. The hardware
//! decoder only understands Annex-B, so samples are rewritten here before
//! access-unit reconstruction.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use tracing::debug;

use pj_common::BitstreamError;

use crate::nal::{avcc_to_annexb, ANNEXB_START_CODE};

/// AVC Decoder Configuration Record (contents of an `avcC` box).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvccConfig {
    /// AVC profile indication
    pub profile: u8,
    /// Profile compatibility
    pub profile_compat: u8,
    /// AVC level indication
    pub level: u8,
    /// NAL unit length size minus one (typically 3, meaning 4-byte lengths)
    pub length_size_minus_one: u8,
    /// Sequence Parameter Sets
    pub sps_list: Vec<Vec<u8>>,
    /// Picture Parameter Sets
    pub pps_list: Vec<Vec<u8>>,
}

impl AvccConfig {
    /// Parse an AVCDecoderConfigurationRecord.
    pub fn parse(extradata: &[u8]) -> Result<Self, BitstreamError> {
        let truncated = |_| BitstreamError::TruncatedData {
            expected: extradata.len() + 1,
            got: extradata.len(),
        };
        let mut reader = Cursor::new(extradata);

        let config_version = reader.read_u8().map_err(truncated)?;
        if config_version != 1 {
            return Err(BitstreamError::UnsupportedAvccVersion(config_version));
        }

        let profile = reader.read_u8().map_err(truncated)?;
        let profile_compat = reader.read_u8().map_err(truncated)?;
        let level = reader.read_u8().map_err(truncated)?;

        // length_size_minus_one is the lower 2 bits
        let length_size_minus_one = reader.read_u8().map_err(truncated)? & 0x03;

        // SPS count: lower 5 bits
        let sps_count = (reader.read_u8().map_err(truncated)? & 0x1F) as usize;
        let sps_list = read_parameter_sets(&mut reader, sps_count, extradata.len())?;

        let pps_count = reader.read_u8().map_err(truncated)? as usize;
        let pps_list = read_parameter_sets(&mut reader, pps_count, extradata.len())?;

        debug!(
            profile,
            level,
            length_size = length_size_minus_one + 1,
            sps = sps_list.len(),
            pps = pps_list.len(),
            "Parsed avcC record"
        );

        Ok(Self {
            profile,
            profile_compat,
            level,
            length_size_minus_one,
            sps_list,
            pps_list,
        })
    }

    /// The byte size used for NAL unit length fields in the bitstream.
    pub fn length_size(&self) -> u8 {
        self.length_size_minus_one + 1
    }

    /// All SPS then all PPS, each behind a 4-byte start code.
    pub fn to_annexb(&self) -> Vec<u8> {
        let total: usize = self
            .sps_list
            .iter()
            .chain(&self.pps_list)
            .map(|ps| ps.len() + ANNEXB_START_CODE.len())
            .sum();
        let mut out = Vec::with_capacity(total);
        for ps in self.sps_list.iter().chain(&self.pps_list) {
            out.extend_from_slice(&ANNEXB_START_CODE);
            out.extend_from_slice(ps);
        }
        out
    }
}

fn read_parameter_sets(
    reader: &mut Cursor<&[u8]>,
    count: usize,
    total_len: usize,
) -> Result<Vec<Vec<u8>>, BitstreamError> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader
            .read_u16::<BigEndian>()
            .map_err(|_| BitstreamError::TruncatedData {
                expected: reader.position() as usize + 2,
                got: total_len,
            })? as usize;
        let mut ps = vec![0u8; len];
        let expected = reader.position() as usize + len;
        reader
            .read_exact(&mut ps)
            .map_err(|_| BitstreamError::TruncatedData {
                expected,
                got: total_len,
            })?;
        sets.push(ps);
    }
    Ok(sets)
}

/// Converts container samples to Annex-B.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnnexBFilter {
    /// Input is already Annex-B.
    Passthrough,
    /// Input is length-prefixed; parameter sets came from the avcC record.
    Avcc(AvccConfig),
}

impl AnnexBFilter {
    /// Pick the filter from the track's codec extradata.
    ///
    /// Empty extradata or extradata that already starts with a start code
    /// means the stream is Annex-B.
    pub fn from_extradata(extradata: &[u8]) -> Result<Self, BitstreamError> {
        if extradata.is_empty() || starts_with_start_code(extradata) {
            return Ok(Self::Passthrough);
        }
        Ok(Self::Avcc(AvccConfig::parse(extradata)?))
    }

    /// Rewrite one sample to Annex-B.
    pub fn filter(&self, sample: &[u8]) -> Vec<u8> {
        match self {
            Self::Passthrough => sample.to_vec(),
            Self::Avcc(config) => avcc_to_annexb(sample, config.length_size()),
        }
    }

    /// Out-of-band parameter sets as Annex-B, if the container had any.
    pub fn parameter_sets(&self) -> Option<Vec<u8>> {
        match self {
            Self::Passthrough => None,
            Self::Avcc(config) if config.sps_list.is_empty() && config.pps_list.is_empty() => None,
            Self::Avcc(config) => Some(config.to_annexb()),
        }
    }
}

fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&ANNEXB_START_CODE)
}
