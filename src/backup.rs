// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backup pipeline: segments → files.

use crate::codec;
use crate::error::Error;
use crate::group::{self, NamespaceUnit};
use crate::key::{Key, SegmentKind};
use crate::pool::{self, WorkItem};
use crate::segment::SegmentRecord;
use crate::shm::ShmBackend;
use std::ffi::c_void;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Summary returned on a successful (or analyzed) backup.
#[derive(Clone, Debug, Default)]
pub struct BackupOutcome {
    pub files_written: usize,
    pub bytes: u64,
}

fn destination_path(dir: &std::path::Path, key: Key, compress: bool) -> PathBuf {
    dir.join(format!(
        "{}.dat{}",
        key.to_hex(),
        if compress { ".gz" } else { "" }
    ))
}

struct WriteJob {
    key: Key,
    ptr: usize,
    size: usize,
    uid: u32,
    gid: u32,
    mode: u32,
    compress: bool,
    expected_crc: Option<u32>,
    file: Mutex<File>,
}

impl WorkItem for WriteJob {
    fn run(&self) -> Result<u64, Error> {
        // SAFETY: `ptr` was returned by a successful `attach_read_only` for
        // a segment of at least `size` bytes, held attached for the
        // lifetime of this job by the caller.
        let slice = unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.size) };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);

        let crc = if self.compress {
            codec::write_compressed(&mut file, slice)?
        } else {
            codec::write_raw(&file, self.key, slice)?
        };

        if let Some(expected) = self.expected_crc {
            if expected != crc {
                return Err(Error::IntegrityError {
                    key: self.key,
                    expected,
                    actual: crc,
                });
            }
        }

        codec::chown_chmod(&file, self.uid, self.gid, self.mode)?;
        Ok(self.size as u64)
    }
}

/// Backs up every member of `unit` into `dir`.
///
/// # Errors
///
/// [`Error::ConflictError`] if the destination already holds a file for
/// this unit's `(instance, nsid)`; any I/O, IPC or integrity error aborts
/// the unit and unwinds every file created so far.
pub fn backup(
    backend: &dyn ShmBackend,
    unit: &NamespaceUnit<SegmentRecord>,
    dir: &std::path::Path,
    compress: bool,
    verify_crc32: bool,
    max_threads: usize,
    verbose: bool,
    analyze: bool,
) -> Result<BackupOutcome, Error> {
    group::check_backup_conflict(unit, dir)?;

    if analyze {
        return Ok(BackupOutcome {
            files_written: unit.members().len(),
            bytes: unit.total_bytes(),
        });
    }

    let mut attached: Vec<*const c_void> = Vec::new();
    let mut created_paths: Vec<PathBuf> = Vec::new();
    let mut jobs: Vec<WriteJob> = Vec::new();

    let setup = (|| -> Result<(), Error> {
        for member in unit.members() {
            let should_compress =
                compress && !matches!(member.kind, SegmentKind::Base | SegmentKind::Meta);
            let path = destination_path(dir, member.key, should_compress);

            let ptr = backend.attach_read_only(member.shmid)?;
            attached.push(ptr);

            let file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        Error::ConflictError {
                            key: member.key,
                            reason: format!("{} already exists", path.display()),
                        }
                    } else {
                        Error::io(&path, e)
                    }
                })?;
            created_paths.push(path);

            if !should_compress {
                file.set_len(member.size as u64)?;
            }

            jobs.push(WriteJob {
                key: member.key,
                ptr: ptr as usize,
                size: member.size,
                uid: member.uid,
                gid: member.gid,
                mode: member.mode,
                compress: should_compress,
                expected_crc: if verify_crc32 { member.crc32 } else { None },
                file: Mutex::new(file),
            });
        }

        let total_bytes: u64 = jobs.iter().map(|j| j.size as u64).sum();
        pool::run(&jobs, max_threads, total_bytes, verbose)
    })();

    for ptr in attached {
        let _ = backend.detach(ptr);
    }

    match setup {
        Ok(()) => Ok(BackupOutcome {
            files_written: jobs.len(),
            bytes: jobs.iter().map(|j| j.size as u64).sum(),
        }),
        Err(err) => {
            for path in &created_paths {
                let _ = std::fs::remove_file(path);
            }
            Err(err)
        }
    }
}
