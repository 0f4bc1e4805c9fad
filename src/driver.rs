// SPDX-License-Identifier: MIT OR Apache-2.0

//! Driver: fans a multi-namespace invocation out into one
//! backup or restore per namespace name, aggregating success.

use crate::config::{Mode, Options};
use crate::error::Error;
use crate::group::{self, BodyInspector, NamespaceUnit};
use crate::segment::SegmentRecord;
use crate::shm::ShmBackend;
use crate::{backup, file, restore, segment};
use std::time::{Duration, Instant};

struct SegmentInspector<'a> {
    backend: &'a dyn ShmBackend,
}

impl BodyInspector<SegmentRecord> for SegmentInspector<'_> {
    fn base_header(&self, entry: &SegmentRecord) -> Result<Option<(u32, u32, u32)>, Error> {
        segment::read_base_header(self.backend, entry.shmid, entry.size)
    }

    fn meta_arena_count(&self, entry: &SegmentRecord) -> Result<Option<u32>, Error> {
        segment::read_meta_arena_count(self.backend, entry.shmid, entry.size)
    }
}

struct FileInspector;

impl BodyInspector<file::FileRecord> for FileInspector {
    fn base_header(&self, entry: &file::FileRecord) -> Result<Option<(u32, u32, u32)>, Error> {
        file::read_base_header(&entry.path)
    }

    fn meta_arena_count(&self, entry: &file::FileRecord) -> Result<Option<u32>, Error> {
        file::read_meta_arena_count(&entry.path)
    }
}

/// Outcome for one namespace processed by [`run`].
pub struct NamespaceResult {
    pub namespace: String,
    pub result: Result<u64, Error>,
    pub elapsed: Duration,
}

/// Runs `options.mode` for every namespace in `options.namespaces`, in
/// order. A failure in one namespace is recorded and does not stop the
/// remaining namespaces; the overall exit status the
/// caller derives from this should be failure if any entry failed.
pub fn run(backend: &dyn ShmBackend, options: &Options) -> Vec<NamespaceResult> {
    options
        .namespaces
        .iter()
        .map(|namespace| {
            let started = Instant::now();
            let result = run_one(backend, options, namespace);
            NamespaceResult {
                namespace: namespace.clone(),
                result,
                elapsed: started.elapsed(),
            }
        })
        .collect()
}

fn run_one(backend: &dyn ShmBackend, options: &Options, namespace: &str) -> Result<u64, Error> {
    match options.mode {
        Mode::Backup => {
            let opts = segment::EnumerateOptions {
                instance: options.instance,
                namespace_name: Some(namespace.to_string()),
                compute_crc32: options.verify_crc32,
            };
            let records = segment::enumerate(backend, &opts)?;
            let inspector = SegmentInspector { backend };
            let unit: NamespaceUnit<SegmentRecord> =
                group::group(&records, options.instance, namespace, &inspector)?;
            let outcome = backup::backup(
                backend,
                &unit,
                &options.dir,
                options.compress,
                options.verify_crc32,
                options.max_threads,
                options.verbose,
                options.analyze,
            )?;
            log::info!(
                "namespace \"{namespace}\": wrote {} files, {} bytes",
                outcome.files_written,
                outcome.bytes
            );
            Ok(outcome.bytes)
        }
        Mode::Restore => {
            let records = file::enumerate(&options.dir)?;
            let unit: NamespaceUnit<file::FileRecord> =
                group::group(&records, options.instance, namespace, &FileInspector)?;
            let outcome = restore::restore(
                backend,
                &unit,
                options.verify_crc32,
                options.max_threads,
                options.verbose,
                options.analyze,
            )?;
            log::info!(
                "namespace \"{namespace}\": restored {} segments, {} bytes",
                outcome.segments_created,
                outcome.bytes
            );
            Ok(outcome.bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{self, SegmentKind};
    use crate::shm::fake::InMemory;
    use std::path::PathBuf;

    fn base_body(name: &str, arena_count: u32) -> Vec<u8> {
        let mut body = vec![0u8; segment::BASE_MIN_SIZE];
        body[segment::BASE_VERSION_OFFSET..segment::BASE_VERSION_OFFSET + 4]
            .copy_from_slice(&10u32.to_le_bytes());
        body[segment::BASE_SHUTDOWN_OFFSET..segment::BASE_SHUTDOWN_OFFSET + 4]
            .copy_from_slice(&1u32.to_le_bytes());
        body[segment::BASE_NAME_OFFSET..segment::BASE_NAME_OFFSET + name.len()]
            .copy_from_slice(name.as_bytes());
        body[segment::BASE_ARENA_COUNT_OFFSET..segment::BASE_ARENA_COUNT_OFFSET + 4]
            .copy_from_slice(&arena_count.to_le_bytes());
        body
    }

    #[test]
    fn backs_up_one_namespace_end_to_end() {
        let backend = InMemory::new();
        backend.seed(key::encode(SegmentKind::Base, 0, 1, 0).unwrap(), base_body("foo", 1));
        backend.seed(key::encode(SegmentKind::Treex, 0, 1, 0).unwrap(), vec![1u8; 1024]);
        backend.seed(
            key::encode(SegmentKind::PriStage, 0, 1, 0x100).unwrap(),
            vec![2u8; 4096],
        );

        let dir = tempfile::tempdir().unwrap();
        let options = crate::config::Builder::new()
            .backup(true)
            .namespaces(vec!["foo".to_string()])
            .dir(PathBuf::from(dir.path()))
            .build()
            .unwrap();

        let results = run(&backend, &options);
        assert_eq!(results.len(), 1);
        assert!(results[0].result.is_ok());
        assert!(dir.path().join("ae001000.dat").exists());
    }

    #[test]
    fn unknown_namespace_fails_without_aborting_others() {
        let backend = InMemory::new();
        backend.seed(key::encode(SegmentKind::Base, 0, 1, 0).unwrap(), base_body("foo", 0));

        let dir = tempfile::tempdir().unwrap();
        let options = crate::config::Builder::new()
            .backup(true)
            .namespaces(vec!["foo".to_string(), "missing".to_string()])
            .dir(PathBuf::from(dir.path()))
            .build()
            .unwrap();

        let results = run(&backend, &options);
        assert!(results[0].result.is_ok());
        assert!(results[1].result.is_err());
    }
}
