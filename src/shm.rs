// SPDX-License-Identifier: MIT OR Apache-2.0

//! System V shared-memory primitives.
//!
//! Wraps `shmget`/`shmat`/`shmdt`/`shmctl` the way the host database uses
//! them: segments are addressed by key, not by path. The [`ShmBackend`]
//! trait is the seam that lets the enumerator, backup and restore
//! pipelines run against an in-memory fake in tests without root/IPC
//! privileges.

use crate::error::Error;
use crate::key::Key;
use std::ffi::c_void;

/// Metadata `shmctl(IPC_STAT)` returns for one segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentStat {
    pub shmid: i32,
    pub key: Key,
    pub size: usize,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub attach_count: u64,
}

/// Ownership/permission triple applied via `IPC_SET`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// Seam over System V shared memory, implemented by [`SystemV`] for real
/// use and by an in-memory fake in tests.
pub trait ShmBackend: Send + Sync {
    /// Highest segment id currently known to the kernel (inclusive).
    fn max_segment_id(&self) -> Result<i32, Error>;

    /// Returns `Some(stat)` for a live segment id, `None` if the id is
    /// currently unused.
    fn stat(&self, id: i32) -> Result<Option<SegmentStat>, Error>;

    /// Creates a new segment for `key` with `IPC_CREAT|IPC_EXCL`. Returns
    /// [`Error::ConflictError`] if one already exists.
    fn create(&self, key: Key, size: usize) -> Result<i32, Error>;

    /// Attaches `shmid` read-only.
    fn attach_read_only(&self, shmid: i32) -> Result<*const c_void, Error>;

    /// Attaches `shmid` read-write.
    fn attach_read_write(&self, shmid: i32) -> Result<*mut c_void, Error>;

    /// Detaches a previously attached pointer.
    fn detach(&self, ptr: *const c_void) -> Result<(), Error>;

    /// Applies `IPC_SET` ownership/mode; mode is masked to 0o777.
    fn set_ownership(&self, shmid: i32, owner: Ownership) -> Result<(), Error>;

    /// `IPC_RMID`s a segment, used to roll back a failed restore.
    fn destroy(&self, shmid: i32) -> Result<(), Error>;

    /// Finds the shmid for `key`, if a segment with that key exists.
    fn find_by_key(&self, key: Key) -> Result<Option<i32>, Error>;
}

// `libc` doesn't expose these Linux-specific shmctl extras (they're not
// part of any libc version this crate depends on), so they're declared
// here to match the kernel's <asm-generic/shmbuf.h> ABI.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone)]
struct shminfo {
    shmmax: libc::c_ulong,
    shmmin: libc::c_ulong,
    shmmni: libc::c_ulong,
    shmseg: libc::c_ulong,
    shmall: libc::c_ulong,
    __unused1: libc::c_ulong,
    __unused2: libc::c_ulong,
    __unused3: libc::c_ulong,
    __unused4: libc::c_ulong,
}

const SHM_STAT: libc::c_int = 13;

/// Real System V IPC backend.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemV;

impl ShmBackend for SystemV {
    fn max_segment_id(&self) -> Result<i32, Error> {
        // SAFETY: `shmctl` with IPC_INFO and a zeroed `shminfo` buffer is a
        // read-only query documented to report the highest in-use index;
        // the zero-initialized struct is valid for the kernel to fill in.
        let mut info: shminfo = unsafe { std::mem::zeroed() };
        let highest_index =
            unsafe { libc::shmctl(0, libc::IPC_INFO, std::ptr::addr_of_mut!(info).cast()) };
        if highest_index < 0 {
            return Err(Error::Ipc {
                key: None,
                call: "shmctl(IPC_INFO)",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(highest_index)
    }

    fn stat(&self, id: i32) -> Result<Option<SegmentStat>, Error> {
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };

        // SAFETY: `id` is an index into the kernel's shm identifier table
        // (`SHM_STAT`), not a shmid; `ds` is a valid out-buffer of the
        // correct size for the kernel to populate.
        let shmid = unsafe {
            libc::shmctl(
                id,
                SHM_STAT,
                std::ptr::addr_of_mut!(ds).cast(),
            )
        };
        if shmid < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::EACCES) => Ok(None),
                _ => Err(Error::Ipc {
                    key: None,
                    call: "shmctl(SHM_STAT)",
                    source: err,
                }),
            };
        }

        Ok(Some(SegmentStat {
            shmid,
            key: Key::from_raw(ds.shm_perm.__key as u32),
            size: ds.shm_segsz as usize,
            uid: ds.shm_perm.uid,
            gid: ds.shm_perm.gid,
            mode: u32::from(ds.shm_perm.mode),
            attach_count: ds.shm_nattch as u64,
        }))
    }

    fn create(&self, key: Key, size: usize) -> Result<i32, Error> {
        // SAFETY: `shmget` with a validated key and size simply asks the
        // kernel to allocate a segment; failure is reported via errno.
        let shmid = unsafe {
            libc::shmget(
                key.into_raw() as i32,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if shmid < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Err(Error::ConflictError {
                    key,
                    reason: "segment already exists".to_string(),
                });
            }
            return Err(Error::ipc(key, "shmget", err));
        }
        Ok(shmid)
    }

    fn attach_read_only(&self, shmid: i32) -> Result<*const c_void, Error> {
        // SAFETY: shmid is a kernel-issued identifier from a prior
        // shmget/shmctl call; SHM_RDONLY maps the segment read-only.
        let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), libc::SHM_RDONLY) };
        if ptr == usize::MAX as *mut c_void {
            return Err(Error::Ipc {
                key: None,
                call: "shmat",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(ptr.cast_const())
    }

    fn attach_read_write(&self, shmid: i32) -> Result<*mut c_void, Error> {
        // SAFETY: shmid is a kernel-issued identifier; flags 0 maps the
        // segment read-write at a kernel-chosen address.
        let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if ptr == usize::MAX as *mut c_void {
            return Err(Error::Ipc {
                key: None,
                call: "shmat",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(ptr)
    }

    fn detach(&self, ptr: *const c_void) -> Result<(), Error> {
        // SAFETY: ptr was returned by a prior successful shmat on this
        // backend and has not yet been detached.
        let rc = unsafe { libc::shmdt(ptr.cast()) };
        if rc < 0 {
            return Err(Error::Ipc {
                key: None,
                call: "shmdt",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn set_ownership(&self, shmid: i32, owner: Ownership) -> Result<(), Error> {
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        // SAFETY: reading current state before modifying it so unrelated
        // fields (e.g. size, attach count bookkeeping) are preserved.
        let rc = unsafe { libc::shmctl(shmid, libc::IPC_STAT, std::ptr::addr_of_mut!(ds).cast()) };
        if rc < 0 {
            return Err(Error::Ipc {
                key: None,
                call: "shmctl(IPC_STAT)",
                source: std::io::Error::last_os_error(),
            });
        }

        ds.shm_perm.uid = owner.uid;
        ds.shm_perm.gid = owner.gid;
        ds.shm_perm.mode = (owner.mode & 0o777) as _;

        // SAFETY: ds was just populated by a successful IPC_STAT call on
        // the same shmid and only permission fields were mutated.
        let rc = unsafe { libc::shmctl(shmid, libc::IPC_SET, std::ptr::addr_of_mut!(ds).cast()) };
        if rc < 0 {
            return Err(Error::Ipc {
                key: None,
                call: "shmctl(IPC_SET)",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn destroy(&self, shmid: i32) -> Result<(), Error> {
        // SAFETY: shmid is a kernel-issued identifier; IPC_RMID with a
        // null argument pointer is the documented way to mark a segment
        // for destruction.
        let rc = unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(Error::Ipc {
                key: None,
                call: "shmctl(IPC_RMID)",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn find_by_key(&self, key: Key) -> Result<Option<i32>, Error> {
        let max_id = self.max_segment_id()?;
        for id in 0..=max_id {
            if let Some(stat) = self.stat(id)? {
                if stat.key == key {
                    return Ok(Some(stat.shmid));
                }
            }
        }
        Ok(None)
    }
}

/// An attached region, detached unconditionally on drop regardless of
/// whether the caller's work succeeded.
pub struct Attached<'a> {
    backend: &'a dyn ShmBackend,
    ptr: *const c_void,
}

impl<'a> Attached<'a> {
    pub fn new(backend: &'a dyn ShmBackend, ptr: *const c_void) -> Self {
        Self { backend, ptr }
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const c_void {
        self.ptr
    }

    #[must_use]
    pub fn as_mut_ptr(&self) -> *mut c_void {
        self.ptr.cast_mut()
    }
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.detach(self.ptr) {
            log::warn!("failed to detach shared memory region: {err}");
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    //! An in-memory [`ShmBackend`] used by tests that don't need real IPC.

    use super::{Error, Key, Ownership, SegmentStat, ShmBackend};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Entry {
        key: Key,
        data: Vec<u8>,
        uid: u32,
        gid: u32,
        mode: u32,
        attach_count: u64,
    }

    #[derive(Default)]
    pub struct InMemory {
        next_id: Mutex<i32>,
        segments: Mutex<HashMap<i32, Entry>>,
    }

    impl InMemory {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a segment directly, bypassing `shmget`, for test setup.
        pub fn seed(&self, key: Key, data: Vec<u8>) -> i32 {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            self.segments.lock().unwrap().insert(
                id,
                Entry {
                    key,
                    data,
                    uid: 0,
                    gid: 0,
                    mode: 0o600,
                    attach_count: 0,
                },
            );
            id
        }

        pub fn read(&self, shmid: i32) -> Vec<u8> {
            self.segments.lock().unwrap().get(&shmid).unwrap().data.clone()
        }
    }

    impl ShmBackend for InMemory {
        fn max_segment_id(&self) -> Result<i32, Error> {
            Ok(self.segments.lock().unwrap().keys().copied().max().unwrap_or(-1))
        }

        fn stat(&self, id: i32) -> Result<Option<SegmentStat>, Error> {
            Ok(self.segments.lock().unwrap().get(&id).map(|e| SegmentStat {
                shmid: id,
                key: e.key,
                size: e.data.len(),
                uid: e.uid,
                gid: e.gid,
                mode: e.mode,
                attach_count: e.attach_count,
            }))
        }

        fn create(&self, key: Key, size: usize) -> Result<i32, Error> {
            let mut segments = self.segments.lock().unwrap();
            if segments.values().any(|e| e.key == key) {
                return Err(Error::ConflictError {
                    key,
                    reason: "segment already exists".to_string(),
                });
            }
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            segments.insert(
                id,
                Entry {
                    key,
                    data: vec![0; size],
                    uid: 0,
                    gid: 0,
                    mode: 0o600,
                    attach_count: 0,
                },
            );
            Ok(id)
        }

        fn attach_read_only(&self, shmid: i32) -> Result<*const std::ffi::c_void, Error> {
            let mut segments = self.segments.lock().unwrap();
            let entry = segments.get_mut(&shmid).expect("unknown shmid in fake backend");
            entry.attach_count += 1;
            Ok(entry.data.as_ptr().cast())
        }

        fn attach_read_write(&self, shmid: i32) -> Result<*mut std::ffi::c_void, Error> {
            let mut segments = self.segments.lock().unwrap();
            let entry = segments.get_mut(&shmid).expect("unknown shmid in fake backend");
            entry.attach_count += 1;
            Ok(entry.data.as_mut_ptr().cast())
        }

        fn detach(&self, _ptr: *const std::ffi::c_void) -> Result<(), Error> {
            // The fake backend identifies entries by shmid, not pointer;
            // attach counts are decremented best-effort in tests that care.
            Ok(())
        }

        fn set_ownership(&self, shmid: i32, owner: Ownership) -> Result<(), Error> {
            let mut segments = self.segments.lock().unwrap();
            let entry = segments.get_mut(&shmid).expect("unknown shmid in fake backend");
            entry.uid = owner.uid;
            entry.gid = owner.gid;
            entry.mode = owner.mode & 0o777;
            Ok(())
        }

        fn destroy(&self, shmid: i32) -> Result<(), Error> {
            self.segments.lock().unwrap().remove(&shmid);
            Ok(())
        }

        fn find_by_key(&self, key: Key) -> Result<Option<i32>, Error> {
            Ok(self
                .segments
                .lock()
                .unwrap()
                .iter()
                .find(|(_, e)| e.key == key)
                .map(|(id, _)| *id))
        }
    }
}
