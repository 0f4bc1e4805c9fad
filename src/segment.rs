// SPDX-License-Identifier: MIT OR Apache-2.0

//! Segment enumerator and the [`SegmentRecord`] type it
//! produces.

use crate::error::Error;
use crate::key::{self, Key, SegmentKind};
use crate::shm::{Attached, ShmBackend};
use std::ffi::c_void;

/// Offset and width of the namespace name field inside a `Base` segment.
pub const BASE_NAME_OFFSET: usize = 1024;
/// Offset and width of the namespace name field inside a `DataStage` segment.
pub const DATA_STAGE_NAME_OFFSET: usize = 12;
/// Width in bytes of a namespace name field (NUL-padded).
pub const NAME_WIDTH: usize = 32;

/// Offset of the 4-byte version field in a `Base` segment.
pub const BASE_VERSION_OFFSET: usize = 0;
/// Offset of the 4-byte shutdown flag in a `Base` segment.
pub const BASE_SHUTDOWN_OFFSET: usize = 4;
/// Offset of the 4-byte primary arena count in a `Base` segment.
pub const BASE_ARENA_COUNT_OFFSET: usize = 2152;
/// Minimum size a `Base` segment body must have for the above fields to
/// be in range.
pub const BASE_MIN_SIZE: usize = 2156;
/// Accepted `Base` version range, inclusive.
pub const BASE_VERSION_RANGE: std::ops::RangeInclusive<u32> = 10..=12;
/// Offset of the 4-byte secondary arena count in a `Meta` segment.
pub const META_ARENA_COUNT_OFFSET: usize = 20;

/// One shared-memory segment discovered on the host.
#[derive(Clone, Debug)]
pub struct SegmentRecord {
    pub key: Key,
    pub shmid: i32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub attach_count: u64,
    pub size: usize,
    pub kind: SegmentKind,
    pub instance: u8,
    pub nsid: u16,
    pub stage: u16,
    pub namespace_name: Option<String>,
    pub crc32: Option<u32>,
}

/// Narrows a 32-byte NUL-padded field to a `String`, stopping at the
/// first NUL (or the whole field if there is none).
fn name_from_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reads `len` bytes at `offset` out of an attached region of `size`
/// bytes. Returns `None` if the region is too small to contain the
/// requested range (callers treat this as "field absent", not an error,
/// since not every kind carries every field).
///
/// # Safety
///
/// `ptr` must point to at least `size` readable bytes (i.e. it must be
/// the result of a successful attach of a segment whose `shmctl`-reported
/// size is `size`).
unsafe fn read_field(ptr: *const c_void, size: usize, offset: usize, len: usize) -> Option<Vec<u8>> {
    if offset.checked_add(len)? > size {
        return None;
    }
    let base = ptr.cast::<u8>();
    let mut out = vec![0u8; len];
    // SAFETY: offset + len <= size was just checked, and the caller's
    // invariant guarantees `size` readable bytes starting at `ptr`.
    unsafe {
        std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), len);
    }
    Some(out)
}

/// Reads the namespace name embedded in a `Base` or `DataStage` segment
/// body, attaching and detaching around the read.
///
/// This is the single `load_namespace_name` capability shared by the
/// backup path (which reads from shared memory) and
/// the restore/analyze paths (which read the same offsets from files;
/// see [`crate::file::load_namespace_name_from_file`]).
pub fn load_namespace_name(
    backend: &dyn ShmBackend,
    shmid: i32,
    size: usize,
    kind: SegmentKind,
) -> Result<Option<String>, Error> {
    let offset = match kind {
        SegmentKind::Base => BASE_NAME_OFFSET,
        SegmentKind::DataStage => DATA_STAGE_NAME_OFFSET,
        _ => return Ok(None),
    };

    let ptr = backend.attach_read_only(shmid)?;
    let attached = Attached::new(backend, ptr);
    // SAFETY: `size` is the size shmctl reported for this shmid, and
    // `attached` guarantees the mapping covers at least that many bytes.
    let bytes = unsafe { read_field(attached.as_ptr(), size, offset, NAME_WIDTH) };
    Ok(bytes.map(|b| name_from_bytes(&b)))
}

/// Computes the CRC32 over a segment's full body, attaching and
/// detaching around the computation.
pub fn compute_crc32(backend: &dyn ShmBackend, shmid: i32, size: usize) -> Result<u32, Error> {
    let ptr = backend.attach_read_only(shmid)?;
    let attached = Attached::new(backend, ptr);
    let mut hasher = crc32fast::Hasher::new();
    // SAFETY: `size` is the size shmctl reported for this shmid.
    let slice = unsafe { std::slice::from_raw_parts(attached.as_ptr().cast::<u8>(), size) };
    hasher.update(slice);
    Ok(hasher.finalize())
}

/// Reads the 4 little-endian bytes at `offset` out of an attached region.
fn read_u32_field(
    backend: &dyn ShmBackend,
    shmid: i32,
    size: usize,
    offset: usize,
) -> Result<Option<u32>, Error> {
    let ptr = backend.attach_read_only(shmid)?;
    let attached = Attached::new(backend, ptr);
    // SAFETY: `size` is the size shmctl reported for this shmid.
    let bytes = unsafe { read_field(attached.as_ptr(), size, offset, 4) };
    Ok(bytes.map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
}

/// Reads a `Base` segment's version, shutdown flag and primary arena
/// count, used by the grouper's sanity checks.
pub fn read_base_header(
    backend: &dyn ShmBackend,
    shmid: i32,
    size: usize,
) -> Result<Option<(u32, u32, u32)>, Error> {
    if size < BASE_MIN_SIZE {
        return Ok(None);
    }
    let version = read_u32_field(backend, shmid, size, BASE_VERSION_OFFSET)?;
    let shutdown = read_u32_field(backend, shmid, size, BASE_SHUTDOWN_OFFSET)?;
    let arena_count = read_u32_field(backend, shmid, size, BASE_ARENA_COUNT_OFFSET)?;
    Ok(match (version, shutdown, arena_count) {
        (Some(v), Some(s), Some(a)) => Some((v, s, a)),
        _ => None,
    })
}

/// Reads a `Meta` segment's secondary arena count.
pub fn read_meta_arena_count(
    backend: &dyn ShmBackend,
    shmid: i32,
    size: usize,
) -> Result<Option<u32>, Error> {
    read_u32_field(backend, shmid, size, META_ARENA_COUNT_OFFSET)
}

/// Options narrowing which segments [`enumerate`] returns.
#[derive(Clone, Debug)]
pub struct EnumerateOptions {
    pub instance: u8,
    pub namespace_name: Option<String>,
    pub compute_crc32: bool,
}

/// Walks every System V segment id on the host, decoding database keys
/// and filtering by instance/namespace. Attached (in-use) segments are
/// skipped.
pub fn enumerate(
    backend: &dyn ShmBackend,
    opts: &EnumerateOptions,
) -> Result<Vec<SegmentRecord>, Error> {
    let max_id = backend.max_segment_id()?;
    let mut out = Vec::new();

    for id in 0..=max_id {
        let Some(stat) = backend.stat(id)? else {
            continue;
        };

        let Ok(decoded) = key::decode(stat.key) else {
            continue; // not a database segment
        };

        if decoded.instance != opts.instance {
            continue;
        }
        if stat.attach_count > 0 {
            continue; // currently attached by the database
        }

        let namespace_name = match decoded.kind {
            SegmentKind::Base | SegmentKind::DataStage => {
                load_namespace_name(backend, stat.shmid, stat.size, decoded.kind)?
            }
            _ => None,
        };

        if decoded.kind == SegmentKind::Base {
            if let (Some(wanted), Some(actual)) = (&opts.namespace_name, &namespace_name) {
                if wanted != actual {
                    continue;
                }
            }
        }

        let crc32 = if opts.compute_crc32 {
            Some(compute_crc32(backend, stat.shmid, stat.size)?)
        } else {
            None
        };

        out.push(SegmentRecord {
            key: stat.key,
            shmid: stat.shmid,
            uid: stat.uid,
            gid: stat.gid,
            mode: stat.mode,
            attach_count: stat.attach_count,
            size: stat.size,
            kind: decoded.kind,
            instance: decoded.instance,
            nsid: decoded.nsid,
            stage: decoded.stage,
            namespace_name,
            crc32,
        });
    }

    Ok(out)
}
