// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration: validated options shared by the CLI
//! binary and the driver.

use crate::error::Error;
use std::path::PathBuf;

/// Which pipeline a run invokes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Backup,
    Restore,
}

/// Fully validated run configuration, built once per invocation and
/// passed by reference down through the driver and pipelines.
#[derive(Clone, Debug)]
pub struct Options {
    pub mode: Mode,
    pub analyze: bool,
    pub compress: bool,
    pub verify_crc32: bool,
    pub instance: u8,
    pub namespaces: Vec<String>,
    pub dir: PathBuf,
    pub max_threads: usize,
    pub verbose: bool,
}

/// Accumulates raw CLI values and validates them into [`Options`] in one
/// place, independent of which front end (CLI flags, a future API)
/// produced it.
#[derive(Default)]
pub struct Builder {
    backup: bool,
    restore: bool,
    analyze: bool,
    compress: bool,
    verify_crc32: bool,
    instance: Option<u8>,
    namespaces: Vec<String>,
    dir: Option<PathBuf>,
    max_threads: Option<usize>,
    verbose: bool,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn backup(mut self, value: bool) -> Self {
        self.backup = value;
        self
    }

    #[must_use]
    pub fn restore(mut self, value: bool) -> Self {
        self.restore = value;
        self
    }

    #[must_use]
    pub fn analyze(mut self, value: bool) -> Self {
        self.analyze = value;
        self
    }

    #[must_use]
    pub fn compress(mut self, value: bool) -> Self {
        self.compress = value;
        self
    }

    #[must_use]
    pub fn verify_crc32(mut self, value: bool) -> Self {
        self.verify_crc32 = value;
        self
    }

    #[must_use]
    pub fn instance(mut self, value: u8) -> Self {
        self.instance = Some(value);
        self
    }

    #[must_use]
    pub fn namespaces(mut self, value: Vec<String>) -> Self {
        self.namespaces = value;
        self
    }

    #[must_use]
    pub fn dir(mut self, value: PathBuf) -> Self {
        self.dir = Some(value);
        self
    }

    #[must_use]
    pub fn max_threads(mut self, value: usize) -> Self {
        self.max_threads = Some(value);
        self
    }

    #[must_use]
    pub fn verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Validates and assembles the final [`Options`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgError`] for neither or both of backup/restore
    /// chosen, no namespaces, no directory, or an instance/thread count
    /// out of range.
    pub fn build(self) -> Result<Options, Error> {
        let mode = match (self.backup, self.restore) {
            (true, false) => Mode::Backup,
            (false, true) => Mode::Restore,
            (false, false) => {
                return Err(Error::ArgError(
                    "exactly one of -b or -r must be given".to_string(),
                ))
            }
            (true, true) => {
                return Err(Error::ArgError(
                    "-b and -r are mutually exclusive".to_string(),
                ))
            }
        };

        if self.namespaces.is_empty() {
            return Err(Error::ArgError(
                "-n requires at least one namespace name".to_string(),
            ));
        }

        let dir = self
            .dir
            .ok_or_else(|| Error::ArgError("-p <dir> is required".to_string()))?;

        let instance = self.instance.unwrap_or(0);
        if instance > crate::key::MAX_INSTANCE {
            return Err(Error::ArgError(format!(
                "-i {instance} out of range 0..={}",
                crate::key::MAX_INSTANCE
            )));
        }

        let max_threads = self.max_threads.unwrap_or_else(crate::cpu::available_parallelism);
        if max_threads == 0 || max_threads > 1024 {
            return Err(Error::ArgError(format!(
                "-t {max_threads} out of range 1..=1024"
            )));
        }

        if self.compress && mode == Mode::Restore {
            log::warn!("-z has no effect on restore");
        }

        Ok(Options {
            mode,
            analyze: self.analyze,
            compress: self.compress,
            verify_crc32: self.verify_crc32,
            instance,
            namespaces: self.namespaces,
            dir,
            max_threads,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Builder {
        Builder::new()
            .backup(true)
            .namespaces(vec!["foo".to_string()])
            .dir(PathBuf::from("/tmp/backup"))
    }

    #[test]
    fn requires_exactly_one_mode() {
        assert!(Builder::new()
            .namespaces(vec!["foo".to_string()])
            .dir(PathBuf::from("/tmp"))
            .build()
            .is_err());
        assert!(Builder::new()
            .backup(true)
            .restore(true)
            .namespaces(vec!["foo".to_string()])
            .dir(PathBuf::from("/tmp"))
            .build()
            .is_err());
    }

    #[test]
    fn requires_namespaces() {
        let result = Builder::new().backup(true).dir(PathBuf::from("/tmp")).build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_bad_instance() {
        assert!(base().instance(16).build().is_err());
    }

    #[test]
    fn rejects_bad_thread_count() {
        assert!(base().max_threads(0).build().is_err());
        assert!(base().max_threads(2000).build().is_err());
    }

    #[test]
    fn defaults_thread_count_to_cpu_count() {
        let options = base().build().unwrap();
        assert!(options.max_threads >= 1);
    }

    #[test]
    fn accepts_valid_backup_config() {
        let options = base().compress(true).verify_crc32(true).build().unwrap();
        assert_eq!(options.mode, Mode::Backup);
        assert!(options.compress);
    }
}
