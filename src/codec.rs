// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw and gzip-framed I/O between segments and files,
//! plus the compressed file header.

use crate::error::Error;
use crate::key::Key;
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

/// New files are written with this magic; `0x41534D54` ("TMSA", the
/// byte-swapped form) is also accepted on read for backward compatibility
/// with files written in host byte order.
pub const MAGIC: u32 = 0x544D_5341;
const MAGIC_SWAPPED: u32 = 0x4153_4D54;
pub const HEADER_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 24;

/// The 24-byte header prefixing a compressed (`.dat.gz`) file.
///
/// Fields are little-endian on disk, a deliberate portability fix over
/// host-byte-order encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CompressedHeader {
    pub magic: u32,
    pub version: u32,
    pub segsz: u64,
    pub crc32: u32,
}

impl CompressedHeader {
    #[must_use]
    pub fn new(segsz: u64, crc32: u32) -> Self {
        Self {
            magic: MAGIC,
            version: HEADER_VERSION,
            segsz,
            crc32,
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.version);
        LittleEndian::write_u64(&mut buf[8..16], self.segsz);
        LittleEndian::write_u64(&mut buf[16..24], u64::from(self.crc32));
        buf
    }

    /// Parses a header, validating magic and version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatError`] if the magic is unrecognized or the
    /// version is not `1`.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Result<Self, Error> {
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != MAGIC && magic != MAGIC_SWAPPED {
            return Err(Error::FormatError {
                key: None,
                reason: format!("bad compressed header magic {magic:#010x}"),
            });
        }
        let version = LittleEndian::read_u32(&buf[4..8]);
        if version != HEADER_VERSION {
            return Err(Error::FormatError {
                key: None,
                reason: format!("unsupported compressed header version {version}"),
            });
        }
        let segsz = LittleEndian::read_u64(&buf[8..16]);
        let crc32 = LittleEndian::read_u64(&buf[16..24]) as u32;
        Ok(Self {
            magic,
            version,
            segsz,
            crc32,
        })
    }
}

/// Applies ownership/mode to an open file, masking mode to 0o777.
pub fn chown_chmod(file: &File, uid: u32, gid: u32, mode: u32) -> Result<(), Error> {
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid, open file descriptor owned by `file` for the
    // duration of this call.
    let rc = unsafe { libc::fchown(fd, uid, gid) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: fd is a valid, open file descriptor owned by `file`.
    let rc = unsafe { libc::fchmod(fd, (mode & 0o777) as libc::mode_t) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Writes `data` to `file` at offset 0 with a chunked `pwrite` loop,
/// returning the running CRC32 over the bytes actually written.
///
/// A `pwrite` returning `0` before all bytes are written is treated as
/// [`Error::ShortTransfer`], never retried, for symmetry with the read
/// side's EOF handling.
pub fn write_raw(file: &File, key: Key, data: &[u8]) -> Result<u32, Error> {
    let fd = file.as_raw_fd();
    let mut written = 0usize;
    let mut hasher = crc32fast::Hasher::new();

    while written < data.len() {
        let remaining = &data[written..];
        // SAFETY: fd is valid and open for writing; the buffer pointer
        // and length describe `remaining`, a live slice of `data`.
        let n = unsafe {
            libc::pwrite(
                fd,
                remaining.as_ptr().cast(),
                remaining.len(),
                written as libc::off_t,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if n == 0 {
            return Err(Error::ShortTransfer {
                key,
                expected: data.len(),
                actual: written,
            });
        }
        #[allow(clippy::cast_sign_loss)]
        let n = n as usize;
        hasher.update(&data[written..written + n]);
        written += n;
    }

    Ok(hasher.finalize())
}

/// Reads `len` bytes from `file` at offset 0 into a freshly allocated
/// buffer with a chunked `pread` loop, returning the buffer and its
/// running CRC32.
pub fn read_raw(file: &File, key: Key, len: usize) -> Result<(Vec<u8>, u32), Error> {
    let fd = file.as_raw_fd();
    let mut buf = vec![0u8; len];
    let mut read = 0usize;
    let mut hasher = crc32fast::Hasher::new();

    while read < len {
        let dest = &mut buf[read..];
        // SAFETY: fd is valid and open for reading; dest describes a live,
        // writable slice of `buf` with `dest.len()` readable bytes.
        let n = unsafe {
            libc::pread(fd, dest.as_mut_ptr().cast(), dest.len(), read as libc::off_t)
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if n == 0 {
            // True EOF before `len` bytes were read: never loop forever.
            return Err(Error::ShortTransfer {
                key,
                expected: len,
                actual: read,
            });
        }
        #[allow(clippy::cast_sign_loss)]
        let n = n as usize;
        hasher.update(&buf[read..read + n]);
        read += n;
    }

    Ok((buf, hasher.finalize()))
}

/// Size of each slice pulled through the (de)compressor at a time.
const CHUNK: usize = 1024 * 1024;

/// Gzip-compresses `data` and writes header + stream to `file`.
///
/// Returns the CRC32 over the *uncompressed* bytes, matching what the
/// header records.
pub fn write_compressed(file: &mut File, data: &[u8]) -> Result<u32, Error> {
    let placeholder = CompressedHeader::new(data.len() as u64, 0);
    file.write_all(&placeholder.to_bytes())?;

    let crc32 = crc32fast::hash(data);

    let mut encoder = flate2::write::GzEncoder::new(
        Vec::with_capacity(data.len() / 2 + 64),
        flate2::Compression::fast(),
    );

    for chunk in data.chunks(CHUNK) {
        encoder.write_all(chunk)?;
    }
    let compressed = encoder.finish()?;
    file.write_all(&compressed)?;

    let finished = CompressedHeader::new(data.len() as u64, crc32);
    // SAFETY-free: a plain pwrite at offset 0 to overwrite the placeholder.
    write_raw(file, Key::from_raw(0), &finished.to_bytes())?;

    Ok(crc32)
}

/// Reads and inflates a compressed file's body into a freshly allocated
/// buffer. Validates the header against `expected_segsz` and returns the
/// CRC32 recomputed over the inflated bytes (independent of the value
/// stored in the header).
///
/// # Errors
///
/// [`Error::FormatError`] if the header is malformed or its `segsz`
/// disagrees with `expected_segsz`.
pub fn read_compressed(file: &mut File, key: Key, expected_segsz: u64) -> Result<(Vec<u8>, u32), Error> {
    let mut header_buf = [0u8; HEADER_LEN];
    file.read_exact(&mut header_buf)?;
    let header = CompressedHeader::from_bytes(&header_buf)?;

    if header.segsz != expected_segsz {
        return Err(Error::FormatError {
            key: Some(key),
            reason: format!(
                "compressed header segsz {} does not match expected {}",
                header.segsz, expected_segsz
            ),
        });
    }

    let mut rest = Vec::new();
    file.read_to_end(&mut rest)?;

    let mut decoder = flate2::read::GzDecoder::new(rest.as_slice());
    let mut out = Vec::with_capacity(header.segsz as usize);
    decoder.read_to_end(&mut out)?;

    if out.len() as u64 != header.segsz {
        return Err(Error::FormatError {
            key: Some(key),
            reason: format!(
                "inflated length {} does not match header segsz {}",
                out.len(),
                header.segsz
            ),
        });
    }

    let crc32 = crc32fast::hash(&out);
    Ok((out, crc32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    #[test]
    fn header_round_trip() {
        let header = CompressedHeader::new(65536, 0xDEAD_BEEF);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = CompressedHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_accepts_swapped_magic() {
        let mut header = CompressedHeader::new(4096, 1);
        header.magic = MAGIC_SWAPPED;
        let bytes = header.to_bytes();
        assert!(CompressedHeader::from_bytes(&bytes).is_ok());
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut header = CompressedHeader::new(4096, 1);
        header.version = 2;
        let bytes = header.to_bytes();
        assert!(CompressedHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn raw_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let key = Key::from_raw(0xAE00_1100);

        let file = File::create(&path).unwrap();
        let crc_written = write_raw(&file, key, &data).unwrap();

        let file = File::open(&path).unwrap();
        let (read_back, crc_read) = read_raw(&file, key, data.len()).unwrap();
        assert_eq!(read_back, data);
        assert_eq!(crc_written, crc_read);
    }

    #[test]
    fn compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dat.gz");
        let data: Vec<u8> = (0..50_000).map(|i| (i % 97) as u8).collect();
        let key = Key::from_raw(0xAE00_1100);

        let mut file = File::create(&path).unwrap();
        let crc_written = write_compressed(&mut file, &data).unwrap();

        let mut file = File::open(&path).unwrap();
        let (read_back, crc_read) = read_compressed(&mut file, key, data.len() as u64).unwrap();
        assert_eq!(read_back, data);
        assert_eq!(crc_written, crc_read);
    }

    #[test]
    fn compressed_rejects_segsz_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dat.gz");
        let data = vec![7u8; 1024];
        let key = Key::from_raw(0xAE00_1100);

        let mut file = File::create(&path).unwrap();
        write_compressed(&mut file, &data).unwrap();

        let mut file = File::open(&path).unwrap();
        file.rewind().unwrap();
        assert!(read_compressed(&mut file, key, 2048).is_err());
    }
}
