// SPDX-License-Identifier: MIT OR Apache-2.0

//! Restore pipeline: files → segments.

use crate::codec;
use crate::error::Error;
use crate::file::FileRecord;
use crate::group::{self, NamespaceUnit};
use crate::key::Key;
use crate::pool::{self, WorkItem};
use crate::shm::{Ownership, ShmBackend};
use std::ffi::c_void;
use std::fs::File;
use std::sync::{Mutex, PoisonError};

/// Summary returned on a successful (or analyzed) restore.
#[derive(Clone, Debug, Default)]
pub struct RestoreOutcome {
    pub segments_created: usize,
    pub bytes: u64,
}

struct ReadJob {
    key: Key,
    ptr: usize,
    size: usize,
    compressed: bool,
    file: Mutex<File>,
    crc: Mutex<Option<u32>>,
}

impl WorkItem for ReadJob {
    fn run(&self) -> Result<u64, Error> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);

        let (data, crc) = if self.compressed {
            codec::read_compressed(&mut file, self.key, self.size as u64)?
        } else {
            codec::read_raw(&file, self.key, self.size)?
        };

        // SAFETY: `ptr` was returned by a successful `attach_read_write`
        // for a segment created with exactly `size` bytes, held attached
        // for the lifetime of this job by the caller.
        let dest = unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.size) };
        dest.copy_from_slice(&data);

        *self.crc.lock().unwrap_or_else(PoisonError::into_inner) = Some(crc);
        Ok(self.size as u64)
    }
}

/// Restores every member of `unit` from `dir` into shared memory.
///
/// # Errors
///
/// [`Error::ConflictError`] if a segment already exists for this unit's
/// `(instance, nsid)`; any I/O, IPC or integrity error aborts the unit and
/// destroys every segment created so far.
pub fn restore(
    backend: &dyn ShmBackend,
    unit: &NamespaceUnit<FileRecord>,
    verify_crc32: bool,
    max_threads: usize,
    verbose: bool,
    analyze: bool,
) -> Result<RestoreOutcome, Error> {
    group::check_restore_conflict(unit, backend)?;

    if analyze {
        return Ok(RestoreOutcome {
            segments_created: unit.members().len(),
            bytes: unit.total_bytes(),
        });
    }

    let mut created_shmids: Vec<i32> = Vec::new();
    let mut attached: Vec<*const c_void> = Vec::new();
    let mut jobs: Vec<ReadJob> = Vec::new();
    let mut ownership: Vec<(i32, Ownership)> = Vec::new();

    let setup = (|| -> Result<(), Error> {
        for member in unit.members() {
            let shmid = backend.create(member.key, member.segsz as usize)?;
            created_shmids.push(shmid);

            let ptr = backend.attach_read_write(shmid)?;
            attached.push(ptr.cast_const());

            let file = File::open(&member.path).map_err(|e| Error::io(&member.path, e))?;

            ownership.push((
                shmid,
                Ownership {
                    uid: member.uid,
                    gid: member.gid,
                    mode: member.mode,
                },
            ));

            jobs.push(ReadJob {
                key: member.key,
                ptr: ptr as usize,
                size: member.segsz as usize,
                compressed: member.compressed,
                file: Mutex::new(file),
                crc: Mutex::new(None),
            });
        }

        let total_bytes: u64 = jobs.iter().map(|j| j.size as u64).sum();
        pool::run(&jobs, max_threads, total_bytes, verbose)?;

        for (shmid, owner) in &ownership {
            backend.set_ownership(*shmid, *owner)?;
        }

        if verify_crc32 {
            for (member, job) in unit.members().into_iter().zip(jobs.iter()) {
                let shmid = backend
                    .find_by_key(member.key)?
                    .ok_or_else(|| Error::FormatError {
                        key: Some(member.key),
                        reason: "restored segment vanished before verification".to_string(),
                    })?;
                let actual = crate::segment::compute_crc32(backend, shmid, job.size)?;
                let expected = job.crc.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(expected) = *expected {
                    if expected != actual {
                        return Err(Error::IntegrityError {
                            key: member.key,
                            expected,
                            actual,
                        });
                    }
                }
            }
        }

        Ok(())
    })();

    for ptr in attached {
        let _ = backend.detach(ptr);
    }

    match setup {
        Ok(()) => Ok(RestoreOutcome {
            segments_created: jobs.len(),
            bytes: jobs.iter().map(|j| j.size as u64).sum(),
        }),
        Err(err) => {
            for shmid in created_shmids {
                let _ = backend.destroy(shmid);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::BodyInspector;
    use crate::shm::fake::InMemory;
    use std::io::Write;

    struct FixedInspector;
    impl BodyInspector<FileRecord> for FixedInspector {
        fn base_header(&self, _e: &FileRecord) -> Result<Option<(u32, u32, u32)>, Error> {
            Ok(Some((10, 1, 1)))
        }
        fn meta_arena_count(&self, _e: &FileRecord) -> Result<Option<u32>, Error> {
            Ok(Some(0))
        }
    }

    fn write_base_file(dir: &std::path::Path, key: Key, name: &str) {
        let mut body = vec![0u8; crate::segment::BASE_MIN_SIZE];
        body[crate::segment::BASE_VERSION_OFFSET..crate::segment::BASE_VERSION_OFFSET + 4]
            .copy_from_slice(&10u32.to_le_bytes());
        body[crate::segment::BASE_SHUTDOWN_OFFSET..crate::segment::BASE_SHUTDOWN_OFFSET + 4]
            .copy_from_slice(&1u32.to_le_bytes());
        body[crate::segment::BASE_NAME_OFFSET..crate::segment::BASE_NAME_OFFSET + name.len()]
            .copy_from_slice(name.as_bytes());
        body[crate::segment::BASE_ARENA_COUNT_OFFSET..crate::segment::BASE_ARENA_COUNT_OFFSET + 4]
            .copy_from_slice(&1u32.to_le_bytes());
        let path = dir.join(format!("{}.dat", key.to_hex()));
        let mut file = File::create(path).unwrap();
        file.write_all(&body).unwrap();
    }

    fn write_plain_file(dir: &std::path::Path, key: Key, size: usize) {
        let path = dir.join(format!("{}.dat", key.to_hex()));
        std::fs::write(path, vec![7u8; size]).unwrap();
    }

    fn seeded_unit(dir: &std::path::Path) -> NamespaceUnit<FileRecord> {
        let base_key = crate::key::encode(crate::key::SegmentKind::Base, 0, 1, 0).unwrap();
        write_base_file(dir, base_key, "foo");
        let treex_key = crate::key::encode(crate::key::SegmentKind::Treex, 0, 1, 0).unwrap();
        write_plain_file(dir, treex_key, 1024);
        let pri_key = crate::key::encode(crate::key::SegmentKind::PriStage, 0, 1, 0x100).unwrap();
        write_plain_file(dir, pri_key, 65536);

        let records = crate::file::enumerate(dir).unwrap();
        group::group(&records, 0, "foo", &FixedInspector).unwrap()
    }

    #[test]
    fn creates_all_segments() {
        let dir = tempfile::tempdir().unwrap();
        let unit = seeded_unit(dir.path());
        let backend = InMemory::new();

        let outcome = restore(&backend, &unit, false, 2, false, false).unwrap();
        assert_eq!(outcome.segments_created, 3);

        for member in unit.members() {
            assert!(backend.find_by_key(member.key).unwrap().is_some());
        }
    }

    #[test]
    fn conflict_rolls_back_nothing_created() {
        let dir = tempfile::tempdir().unwrap();
        let unit = seeded_unit(dir.path());
        let backend = InMemory::new();
        backend.seed(unit.base.as_ref().unwrap().key, vec![0u8; 1]);

        let err = restore(&backend, &unit, false, 2, false, false).unwrap_err();
        assert!(matches!(err, Error::ConflictError { .. }));
    }

    #[test]
    fn analyze_mode_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let unit = seeded_unit(dir.path());
        let backend = InMemory::new();

        let outcome = restore(&backend, &unit, false, 2, false, true).unwrap();
        assert_eq!(outcome.segments_created, 3);
        assert_eq!(backend.max_segment_id().unwrap(), -1);
    }
}
