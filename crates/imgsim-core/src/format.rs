//! The database file format.
//!
//! Little-endian throughout. A current-version file is laid out as:
//!
//! ```text
//! u32                version-and-size code
//! count              number of images
//! offset             file offset of the first signature record
//! 98304 x count      bucket sizes, (channel, sign, magnitude) order
//! N x id             image id table, padded with room for 1024 more ids
//! ...                hole up to the signature offset
//! N x 520 bytes      signature records
//! ```
//!
//! The low byte of the version code is the version (9 current); the upper
//! bytes pack the byte widths of the four integer types as 5-bit fields
//! plus a sentinel that doubles as an endianness check. Version 9 is
//! always written; versions 1, 2, 3 and 8 remain readable.

use crate::bucket::NUM_BUCKETS;
use crate::errors::{DbError, Result};
use crate::signature::{ImgData, NUM_CHANNELS, NUM_COEFS, SIG_RECORD_BYTES};
use std::io::{Read, Seek, SeekFrom, Write};

/// Serialization versions.
pub(crate) const SRZ_V0_5_1: u32 = 1;
pub(crate) const SRZ_V0_6_0: u32 = 2;
pub(crate) const SRZ_V0_6_1: u32 = 3;
pub(crate) const SRZ_V0_7_0: u32 = 8;
pub(crate) const SRZ_V0_9_0: u32 = 9;

/// Ids worth of slack left between the id table and the signatures.
pub(crate) const ID_HEADROOM: u64 = 1024;

/// Byte widths of the four integer types encoded in the version code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SizeWidths {
    pub res: usize,
    pub count: usize,
    pub offset: usize,
    pub id: usize,
}

impl SizeWidths {
    pub const NATIVE: SizeWidths = SizeWidths {
        res: 4,
        count: 8,
        offset: 8,
        id: 8,
    };

    pub const fn encode(&self) -> u32 {
        (self.res as u32)
            | (self.count as u32) << 5
            | (self.offset as u32) << 10
            | (self.id as u32) << 15
            | 3 << 20
    }

    /// Decode the size fields, rejecting anything a byte-swapped or
    /// corrupt header would produce.
    pub fn decode(intsizes: u32) -> Result<Self> {
        let widths = SizeWidths {
            res: (intsizes & 31) as usize,
            count: (intsizes >> 5 & 31) as usize,
            offset: (intsizes >> 10 & 31) as usize,
            id: (intsizes >> 15 & 31) as usize,
        };
        let sentinel = intsizes >> 20;
        let plausible = |w: usize| matches!(w, 2 | 4 | 8);
        if sentinel != 3
            || !plausible(widths.res)
            || !plausible(widths.count)
            || !plausible(widths.offset)
            || !plausible(widths.id)
        {
            return Err(DbError::data(
                "database written with incompatible data sizes or byte order",
            ));
        }
        Ok(widths)
    }

    pub fn is_native(&self) -> bool {
        *self == Self::NATIVE
    }
}

/// The version code written at the head of every saved file.
pub(crate) const V_CODE: u32 = SRZ_V0_9_0 | (SizeWidths::NATIVE.encode() << 8);

/// Stream reader with the format's integer codecs.
pub(crate) struct DbReader<R> {
    inner: R,
}

impl<R: Read + Seek> DbReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    /// Read an integer stored with the given byte width.
    pub fn read_sized(&mut self, width: usize) -> Result<u64> {
        debug_assert!(width <= 8);
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn skip(&mut self, bytes: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Current(bytes as i64))?;
        Ok(())
    }

    /// Read one signature record with the file's integer widths.
    pub fn read_sig(&mut self, widths: &SizeWidths) -> Result<ImgData> {
        if widths.is_native() {
            let mut buf = [0u8; SIG_RECORD_BYTES];
            self.inner.read_exact(&mut buf)?;
            return Ok(ImgData::decode(&buf));
        }
        let id = self.read_sized(widths.id)?;
        let mut sig = [[0i32; NUM_COEFS]; NUM_CHANNELS];
        for channel in sig.iter_mut() {
            for coef in channel.iter_mut() {
                *coef = self.read_i32()?;
            }
        }
        let mut avglf = [0f64; 3];
        for avg in avglf.iter_mut() {
            *avg = self.read_f64()?;
        }
        let width = self.read_sized(widths.res)? as u32;
        let height = self.read_sized(widths.res)? as u32;
        Ok(ImgData {
            id,
            sig,
            avglf,
            width,
            height,
        })
    }
}

/// Stream writer for the current version.
pub(crate) struct DbWriter<W> {
    inner: W,
}

impl<W: Write + Seek> DbWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_sig(&mut self, sig: &ImgData) -> Result<()> {
        self.inner.write_all(&sig.encode())?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    /// Zero-fill up to an absolute offset.
    pub fn pad_to(&mut self, offset: u64) -> Result<()> {
        let at = self.position()?;
        if at > offset {
            return Err(DbError::internal("header overran the signature offset"));
        }
        let zeros = [0u8; 4096];
        let mut remaining = (offset - at) as usize;
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            self.inner.write_all(&zeros[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Everything read from the front of the file before deciding how to load.
#[derive(Debug)]
pub(crate) struct Preamble {
    pub version: u32,
    pub intsizes: u32,
}

/// Read the version code, unwrapping the version-1 metadata prefix.
pub(crate) fn read_preamble<R: Read + Seek>(r: &mut DbReader<R>) -> Result<Preamble> {
    let v_code = r.read_u32()?;
    let mut intsizes = v_code >> 8;
    let mut version = v_code & 0xff;

    if version == SRZ_V0_5_1 {
        // The oldest layout carries the real version plus three ignored
        // metadata words.
        version = r.read_u32()?;
        r.read_u32()?;
        r.read_u32()?;
        r.read_u32()?;
        intsizes = 0;
    }

    if version > SRZ_V0_9_0 {
        return Err(DbError::data(format!(
            "database version {version} is newer than this library"
        )));
    }
    if intsizes == 0 && version >= SRZ_V0_7_0 {
        return Err(DbError::data("current-version file missing its size code"));
    }
    Ok(Preamble { version, intsizes })
}

/// Header contents of a version 8/9 file, reader left at the end of the id
/// table.
pub(crate) struct CurrentHeader {
    pub widths: SizeWidths,
    pub num_images: u64,
    pub sig_offset: u64,
    pub bucket_sizes: Vec<u64>,
    pub ids: Vec<u64>,
}

pub(crate) fn read_current_header<R: Read + Seek>(
    r: &mut DbReader<R>,
    intsizes: u32,
) -> Result<CurrentHeader> {
    let widths = SizeWidths::decode(intsizes)?;
    if !widths.is_native() {
        tracing::debug!("converting data sizes while loading");
    }

    let num_images = r.read_sized(widths.count)?;
    let sig_offset = r.read_sized(widths.offset)?;

    let mut bucket_sizes = Vec::with_capacity(NUM_BUCKETS);
    for _ in 0..NUM_BUCKETS {
        bucket_sizes.push(r.read_sized(widths.count)?);
    }

    let mut ids = Vec::with_capacity(num_images as usize);
    for _ in 0..num_images {
        ids.push(r.read_sized(widths.id)?);
    }

    Ok(CurrentHeader {
        widths,
        num_images,
        sig_offset,
        bucket_sizes,
        ids,
    })
}

/// Offset of the first signature record when saving `num_images` images:
/// the fixed header, the bucket size table, the id table, and headroom for
/// future ids.
pub(crate) fn first_sig_offset(num_images: u64) -> u64 {
    4 + 8 + 8 + (NUM_BUCKETS as u64) * 8 + num_images * 8 + ID_HEADROOM * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_size_code_roundtrip() {
        let code = SizeWidths::NATIVE.encode();
        let decoded = SizeWidths::decode(code).unwrap();
        assert!(decoded.is_native());
        assert_eq!(V_CODE & 0xff, SRZ_V0_9_0);
        assert_eq!(V_CODE >> 8, code);
    }

    #[test]
    fn test_byte_swapped_code_rejected() {
        let swapped = SizeWidths::NATIVE.encode().swap_bytes();
        assert!(SizeWidths::decode(swapped).is_err());
    }

    #[test]
    fn test_preamble_current_version() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&V_CODE.to_le_bytes());
        let mut r = DbReader::new(Cursor::new(bytes));
        let pre = read_preamble(&mut r).unwrap();
        assert_eq!(pre.version, SRZ_V0_9_0);
        assert_eq!(pre.intsizes, SizeWidths::NATIVE.encode());
    }

    #[test]
    fn test_preamble_v1_wrapper() {
        // Version 1 files re-state the version and carry three ignored
        // metadata words.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SRZ_V0_5_1.to_le_bytes());
        bytes.extend_from_slice(&SRZ_V0_6_1.to_le_bytes());
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&9u32.to_le_bytes());
        let mut r = DbReader::new(Cursor::new(bytes));
        let pre = read_preamble(&mut r).unwrap();
        assert_eq!(pre.version, SRZ_V0_6_1);
        assert_eq!(pre.intsizes, 0);
    }

    #[test]
    fn test_preamble_future_version_rejected() {
        let code = (SRZ_V0_9_0 + 1) | (SizeWidths::NATIVE.encode() << 8);
        let mut r = DbReader::new(Cursor::new(code.to_le_bytes().to_vec()));
        let err = read_preamble(&mut r).unwrap_err();
        assert_eq!(err.kind(), "data_error");
    }

    #[test]
    fn test_sig_record_stream_roundtrip() {
        let mut sig = ImgData {
            id: 77,
            sig: [[0; NUM_COEFS]; NUM_CHANNELS],
            avglf: [0.5, -0.25, 0.125],
            width: 1024,
            height: 768,
        };
        for c in 0..NUM_CHANNELS {
            for k in 0..NUM_COEFS {
                sig.sig[c][k] = ((c + 1) * 200 + k) as i32 * if k % 2 == 0 { 1 } else { -1 };
            }
        }
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = DbWriter::new(&mut buf);
            w.write_sig(&sig).unwrap();
        }
        buf.set_position(0);
        let mut r = DbReader::new(buf);
        let back = r.read_sig(&SizeWidths::NATIVE).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn test_pad_to_fills_zeros() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = DbWriter::new(&mut buf);
            w.write_u32(0xaabbccdd).unwrap();
            w.pad_to(16).unwrap();
            w.write_u32(1).unwrap();
        }
        let bytes = buf.into_inner();
        assert_eq!(bytes.len(), 20);
        assert!(bytes[4..16].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_first_sig_offset_leaves_headroom() {
        let n = 100u64;
        let header_end = 4 + 8 + 8 + (NUM_BUCKETS as u64) * 8 + n * 8;
        assert_eq!(first_sig_offset(n), header_end + ID_HEADROOM * 8);
    }
}
