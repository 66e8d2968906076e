//! Output pixel format selection.

use pj_common::PixelFormat;

/// Pick the decoder output format.
///
/// The first entry of `preferred` the decoder offers wins; if none is
/// offered, the decoder's own first choice is taken. `None` only when the
/// decoder offers nothing.
pub fn negotiate_format(offered: &[PixelFormat], preferred: &[PixelFormat]) -> Option<PixelFormat> {
    preferred
        .iter()
        .find(|format| offered.contains(format))
        .or_else(|| offered.first())
        .copied()
}
