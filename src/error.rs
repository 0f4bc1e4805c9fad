// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed error taxonomy. Every variant carries the
//! offending key or path so context survives crossing layers.

use crate::key::Key;
use std::path::PathBuf;

/// Errors that can occur while backing up or restoring namespace units.
#[derive(Debug)]
pub enum Error {
    /// CLI misuse.
    ArgError(String),

    /// Filesystem or syscall failure.
    Io {
        path: Option<PathBuf>,
        source: std::io::Error,
    },

    /// `shmget`/`shmat`/`shmdt`/`shmctl` failure.
    Ipc {
        key: Option<Key>,
        call: &'static str,
        source: std::io::Error,
    },

    /// A key failed to encode/decode.
    InvalidKey { key: Option<Key>, reason: String },

    /// Bad compressed header, bad filename, or inconsistent body fields.
    FormatError { key: Option<Key>, reason: String },

    /// CRC32 mismatch between segment image and file image.
    IntegrityError {
        key: Key,
        expected: u32,
        actual: u32,
    },

    /// Destination already exists (file on backup, segment on restore).
    ConflictError { key: Key, reason: String },

    /// A partial transfer ended before all bytes were moved and cannot be
    /// retried.
    ShortTransfer {
        key: Key,
        expected: usize,
        actual: usize,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArgError(msg) => write!(f, "argument error: {msg}"),
            Self::Io { path, source } => match path {
                Some(p) => write!(f, "I/O error on {}: {source}", p.display()),
                None => write!(f, "I/O error: {source}"),
            },
            Self::Ipc { key, call, source } => match key {
                Some(k) => write!(f, "IPC error ({call}) on segment {k}: {source}"),
                None => write!(f, "IPC error ({call}): {source}"),
            },
            Self::InvalidKey { key, reason } => match key {
                Some(k) => write!(f, "invalid key {k}: {reason}"),
                None => write!(f, "invalid key: {reason}"),
            },
            Self::FormatError { key, reason } => match key {
                Some(k) => write!(f, "format error on segment {k}: {reason}"),
                None => write!(f, "format error: {reason}"),
            },
            Self::IntegrityError {
                key,
                expected,
                actual,
            } => write!(
                f,
                "CRC32 mismatch on segment {key}: expected {expected:#010x}, got {actual:#010x}"
            ),
            Self::ConflictError { key, reason } => {
                write!(f, "conflict for segment {key}: {reason}")
            }
            Self::ShortTransfer {
                key,
                expected,
                actual,
            } => write!(
                f,
                "short transfer on segment {key}: expected {expected} bytes, moved {actual}"
            ),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: Some(path.into()),
            source,
        }
    }

    pub(crate) fn ipc(key: Key, call: &'static str, source: std::io::Error) -> Self {
        Self::Ipc {
            key: Some(key),
            call,
            source,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            path: None,
            source: value,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
