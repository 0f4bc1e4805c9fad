// SPDX-License-Identifier: MIT OR Apache-2.0

//! File enumerator and the [`FileRecord`] type it produces.

use crate::codec::{CompressedHeader, HEADER_LEN};
use crate::error::Error;
use crate::key::{self, Key, SegmentKind};
use crate::segment::{BASE_NAME_OFFSET, DATA_STAGE_NAME_OFFSET, NAME_WIDTH};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// One backup file discovered in the backup directory.
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub key: Key,
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub on_disk_size: u64,
    /// Logical (uncompressed) segment size: equals `on_disk_size` for
    /// `.dat`, comes from the compressed header for `.dat.gz`.
    pub segsz: u64,
    pub compressed: bool,
    pub kind: SegmentKind,
    pub instance: u8,
    pub nsid: u16,
    pub stage: u16,
    pub namespace_name: Option<String>,
}

/// Parses `<hex-key>.dat` / `<hex-key>.dat.gz`, returning the key and
/// whether the extension denotes compression. Returns `None` for any
/// other filename (including `.`/`..`, handled by the caller skipping
/// non-UTF8/non-matching entries rather than erroring the whole walk).
fn parse_filename(name: &str) -> Option<(Key, bool)> {
    let (stem, compressed) = if let Some(stem) = name.strip_suffix(".dat.gz") {
        (stem, true)
    } else if let Some(stem) = name.strip_suffix(".dat") {
        (stem, false)
    } else {
        return None;
    };

    let key = Key::from_hex(stem)?;
    Some((key, compressed))
}

fn name_from_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reads the namespace name embedded in a `Base` or `DataStage` file,
/// mirroring [`crate::segment::load_namespace_name`] but reading from a
/// file instead of an attached segment.
pub fn load_namespace_name_from_file(
    file: &mut File,
    kind: SegmentKind,
    compressed: bool,
) -> Result<Option<String>, Error> {
    let offset = match kind {
        SegmentKind::Base => BASE_NAME_OFFSET,
        SegmentKind::DataStage => DATA_STAGE_NAME_OFFSET,
        _ => return Ok(None),
    };

    if compressed {
        // Partial gzip decompression: enough of the stream to cover
        // `offset + NAME_WIDTH` . Base's offset (1024) is
        // only ever exercised uncompressed (Base is always stored
        // uncompressed step 1), but this path stays
        // general for DataStage.
        file.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut scratch = vec![0u8; offset + NAME_WIDTH];
        decoder.read_exact(&mut scratch)?;
        Ok(Some(name_from_bytes(&scratch[offset..offset + NAME_WIDTH])))
    } else {
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut buf = [0u8; NAME_WIDTH];
        file.read_exact(&mut buf)?;
        Ok(Some(name_from_bytes(&buf)))
    }
}

/// Reads one candidate's metadata into a [`FileRecord`].
fn load_record(path: &Path) -> Result<Option<FileRecord>, Error> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned);
    let Some(name) = name else { return Ok(None) };
    let Some((key, compressed)) = parse_filename(&name) else {
        return Ok(None);
    };
    let Ok(decoded) = key::decode(key) else {
        return Ok(None);
    };

    let metadata = std::fs::metadata(path).map_err(|e| Error::io(path, e))?;
    let on_disk_size = metadata.len();

    use std::os::unix::fs::MetadataExt;
    let uid = metadata.uid();
    let gid = metadata.gid();
    let mode = metadata.mode();

    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;

    let segsz = if compressed {
        let mut header_buf = [0u8; HEADER_LEN];
        file.read_exact(&mut header_buf)
            .map_err(|e| Error::io(path, e))?;
        let header = CompressedHeader::from_bytes(&header_buf)?;
        header.segsz
    } else {
        on_disk_size
    };

    let namespace_name = match decoded.kind {
        SegmentKind::Base | SegmentKind::DataStage => {
            file.rewind().map_err(|e| Error::io(path, e))?;
            load_namespace_name_from_file(&mut file, decoded.kind, compressed)?
        }
        _ => None,
    };

    Ok(Some(FileRecord {
        key,
        path: path.to_path_buf(),
        uid,
        gid,
        mode,
        on_disk_size,
        segsz,
        compressed,
        kind: decoded.kind,
        instance: decoded.instance,
        nsid: decoded.nsid,
        stage: decoded.stage,
        namespace_name,
    }))
}

fn read_u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("checked length"))
}

/// Reads a `Base` file's version, shutdown flag and primary arena count
/// directly (Base is always stored uncompressed), used by the grouper's
/// sanity checks on the restore path.
pub fn read_base_header(path: &Path) -> Result<Option<(u32, u32, u32)>, Error> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut buf = vec![0u8; crate::segment::BASE_MIN_SIZE];
    if file.read_exact(&mut buf).is_err() {
        return Ok(None);
    }
    Ok(Some((
        read_u32_at(&buf, crate::segment::BASE_VERSION_OFFSET),
        read_u32_at(&buf, crate::segment::BASE_SHUTDOWN_OFFSET),
        read_u32_at(&buf, crate::segment::BASE_ARENA_COUNT_OFFSET),
    )))
}

/// Reads a `Meta` file's secondary arena count (Meta is always stored
/// uncompressed).
pub fn read_meta_arena_count(path: &Path) -> Result<Option<u32>, Error> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut buf = vec![0u8; crate::segment::META_ARENA_COUNT_OFFSET + 4];
    if file.read_exact(&mut buf).is_err() {
        return Ok(None);
    }
    Ok(Some(read_u32_at(&buf, crate::segment::META_ARENA_COUNT_OFFSET)))
}

/// Walks `dir`, parsing every `<hex>.dat`/`<hex>.dat.gz` entry into a
/// [`FileRecord`]. Entries that don't match the naming convention (not
/// just `.`/`..`) are silently skipped.
pub fn enumerate(dir: &Path) -> Result<Vec<FileRecord>, Error> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        if let Some(record) = load_record(&entry.path())? {
            out.push(record);
        }
    }
    out.sort_by_key(|r| r.key);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_compressed;

    #[test]
    fn parses_lower_and_upper_hex() {
        assert!(parse_filename("ae001100.dat").is_some());
        assert!(parse_filename("AE001100.dat").is_some());
        assert!(parse_filename("ae001100.dat.gz").is_some());
        assert!(parse_filename("notakey.dat").is_none());
        assert!(parse_filename("ae001100.txt").is_none());
    }

    #[test]
    fn enumerate_skips_dotfiles_and_junk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ae001000.dat"), vec![0u8; 16]).unwrap();
        std::fs::write(dir.path().join("README.md"), b"hello").unwrap();

        let records = enumerate(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, SegmentKind::Base);
    }

    #[test]
    fn compressed_file_reports_logical_size_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ae001100.dat.gz");
        let data = vec![9u8; 65536];
        let mut file = File::create(&path).unwrap();
        write_compressed(&mut file, &data).unwrap();

        let records = enumerate(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].compressed);
        assert_eq!(records[0].segsz, 65536);
        assert!(records[0].on_disk_size < 65536);
    }

    #[test]
    fn reads_base_header_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ae001000.dat");
        let mut body = vec![0u8; crate::segment::BASE_MIN_SIZE];
        body[crate::segment::BASE_VERSION_OFFSET..crate::segment::BASE_VERSION_OFFSET + 4]
            .copy_from_slice(&10u32.to_le_bytes());
        body[crate::segment::BASE_SHUTDOWN_OFFSET..crate::segment::BASE_SHUTDOWN_OFFSET + 4]
            .copy_from_slice(&1u32.to_le_bytes());
        body[crate::segment::BASE_ARENA_COUNT_OFFSET..crate::segment::BASE_ARENA_COUNT_OFFSET + 4]
            .copy_from_slice(&3u32.to_le_bytes());
        std::fs::write(&path, &body).unwrap();

        let (version, shutdown, arena_count) = read_base_header(&path).unwrap().unwrap();
        assert_eq!((version, shutdown, arena_count), (10, 1, 3));
    }

    #[test]
    fn reads_data_stage_name_from_compressed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ad002000.dat.gz");
        let mut body = vec![0u8; 4096];
        body[DATA_STAGE_NAME_OFFSET..DATA_STAGE_NAME_OFFSET + 3].copy_from_slice(b"bar");
        let mut file = File::create(&path).unwrap();
        write_compressed(&mut file, &body).unwrap();

        let records = enumerate(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].namespace_name.as_deref(), Some("bar"));
    }
}
