//! Minimal raw TIFF writer: one strip, 8-bit RGBA, no compression,
//! little-endian. Used by the WMS compositor's `image/tiff` output (§4.6
//! step 3) and available standalone for the GeoTIFF source tests.

use crate::error::{Result, ServerError};

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_EXTRA_SAMPLES: u16 = 338;
const TAG_SAMPLE_FORMAT: u16 = 339;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Value or offset, always stored as 4 little-endian bytes per the TIFF
    /// spec; short/byte values are left-justified within those 4 bytes.
    value: [u8; 4],
}

/// Writes `rgba` (length `width*height*4`) as an uncompressed RGBA TIFF.
pub fn write_rgba_tiff(width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>> {
    if rgba.len() != (width as usize) * (height as usize) * 4 {
        return Err(ServerError::Format("rgba buffer size mismatch".into()));
    }

    let mut entries = vec![
        short_entry(TAG_IMAGE_WIDTH, width),
        short_entry(TAG_IMAGE_LENGTH, height),
        // BitsPerSample is an array of 4 SHORTs: 8,8,8,8. Four SHORTs is 8
        // bytes, which does not fit inline, so it is written out-of-line.
        IfdEntry { tag: TAG_BITS_PER_SAMPLE, field_type: TYPE_SHORT, count: 4, value: [0; 4] },
        short_entry(TAG_COMPRESSION, 1), // no compression
        short_entry(TAG_PHOTOMETRIC, 2), // RGB
        long_entry(TAG_STRIP_OFFSETS, 0),
        short_entry(TAG_SAMPLES_PER_PIXEL, 4),
        long_entry(TAG_ROWS_PER_STRIP, height),
        long_entry(TAG_STRIP_BYTE_COUNTS, rgba.len() as u32),
        short_entry(TAG_EXTRA_SAMPLES, 1), // unassociated alpha
        IfdEntry { tag: TAG_SAMPLE_FORMAT, field_type: TYPE_SHORT, count: 4, value: [0; 4] },
    ];
    entries.sort_by_key(|e| e.tag);

    let header_len = 8usize;
    let ifd_entry_count = entries.len();
    let ifd_len = 2 + ifd_entry_count * 12 + 4;
    let bits_per_sample_offset = header_len + ifd_len;
    let sample_format_offset = bits_per_sample_offset + 8;
    let strip_offset = sample_format_offset + 8;

    let mut out = Vec::with_capacity(strip_offset + rgba.len());
    out.extend_from_slice(b"II"); // little-endian
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&(header_len as u32).to_le_bytes());

    out.extend_from_slice(&(ifd_entry_count as u16).to_le_bytes());
    for entry in &mut entries {
        match entry.tag {
            TAG_BITS_PER_SAMPLE => entry.value = (bits_per_sample_offset as u32).to_le_bytes(),
            TAG_SAMPLE_FORMAT => entry.value = (sample_format_offset as u32).to_le_bytes(),
            TAG_STRIP_OFFSETS => entry.value = (strip_offset as u32).to_le_bytes(),
            _ => {}
        }
        out.extend_from_slice(&entry.tag.to_le_bytes());
        out.extend_from_slice(&entry.field_type.to_le_bytes());
        out.extend_from_slice(&entry.count.to_le_bytes());
        out.extend_from_slice(&entry.value);
    }
    out.extend_from_slice(&0u32.to_le_bytes()); // no next IFD

    debug_assert_eq!(out.len(), bits_per_sample_offset);
    for _ in 0..4 {
        out.extend_from_slice(&8u16.to_le_bytes());
    }
    debug_assert_eq!(out.len(), sample_format_offset);
    for _ in 0..4 {
        out.extend_from_slice(&1u16.to_le_bytes()); // unsigned integer data
    }
    debug_assert_eq!(out.len(), strip_offset);
    out.extend_from_slice(rgba);

    Ok(out)
}

fn short_entry(tag: u16, v: u32) -> IfdEntry {
    let mut value = [0u8; 4];
    value[..2].copy_from_slice(&(v as u16).to_le_bytes());
    IfdEntry { tag, field_type: TYPE_SHORT, count: 1, value }
}

fn long_entry(tag: u16, v: u32) -> IfdEntry {
    IfdEntry { tag, field_type: TYPE_LONG, count: 1, value: v.to_le_bytes() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_well_formed_header() {
        let rgba = vec![0u8; 4 * 4 * 4];
        let tiff = write_rgba_tiff(4, 4, &rgba).unwrap();
        assert_eq!(&tiff[0..2], b"II");
        assert_eq!(u16::from_le_bytes([tiff[2], tiff[3]]), 42);
    }

    #[test]
    fn rejects_mismatched_buffer_size() {
        assert!(write_rgba_tiff(4, 4, &[0u8; 10]).is_err());
    }
}
