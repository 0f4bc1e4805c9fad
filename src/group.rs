// SPDX-License-Identifier: MIT OR Apache-2.0

//! Grouper & validator: assembles segment or file records
//! into complete, immutable [`NamespaceUnit`] values.
//!
//! Units are built once from an immutable snapshot of records and never
//! hold a bare pointer into a growable table — every member is an owned,
//! cloned entry.

use crate::error::Error;
use crate::file::FileRecord;
use crate::key::{Key, SegmentKind, STAGE_MAX, STAGE_MIN};
use crate::segment::SegmentRecord;
use crate::shm::ShmBackend;
use std::collections::BTreeSet;
use std::path::Path;

/// Common view over [`SegmentRecord`] and [`FileRecord`] the grouper
/// needs, so the assembly algorithm is written once and used for both
/// backup (segments) and restore (files).
pub trait UnitEntry: Clone {
    fn key(&self) -> Key;
    fn kind(&self) -> SegmentKind;
    fn instance(&self) -> u8;
    fn nsid(&self) -> u16;
    fn stage(&self) -> u16;
    fn namespace_name(&self) -> Option<&str>;
    fn size(&self) -> u64;
}

impl UnitEntry for SegmentRecord {
    fn key(&self) -> Key {
        self.key
    }
    fn kind(&self) -> SegmentKind {
        self.kind
    }
    fn instance(&self) -> u8 {
        self.instance
    }
    fn nsid(&self) -> u16 {
        self.nsid
    }
    fn stage(&self) -> u16 {
        self.stage
    }
    fn namespace_name(&self) -> Option<&str> {
        self.namespace_name.as_deref()
    }
    fn size(&self) -> u64 {
        self.size as u64
    }
}

impl UnitEntry for FileRecord {
    fn key(&self) -> Key {
        self.key
    }
    fn kind(&self) -> SegmentKind {
        self.kind
    }
    fn instance(&self) -> u8 {
        self.instance
    }
    fn nsid(&self) -> u16 {
        self.nsid
    }
    fn stage(&self) -> u16 {
        self.stage
    }
    fn namespace_name(&self) -> Option<&str> {
        self.namespace_name.as_deref()
    }
    fn size(&self) -> u64 {
        self.segsz
    }
}

/// Reads the body fields the grouper's sanity checks need. Implemented
/// once against shared memory (for backup) and once against files (for
/// restore/analyze).
pub trait BodyInspector<T> {
    /// `(version, shutdown_flag, primary_arena_count)` for a `Base` entry.
    fn base_header(&self, entry: &T) -> Result<Option<(u32, u32, u32)>, Error>;
    /// Secondary arena count for a `Meta` entry.
    fn meta_arena_count(&self, entry: &T) -> Result<Option<u32>, Error>;
}

/// A logically complete group of segments/files for one namespace,
/// instance and base/data-only flavor.
#[derive(Clone, Debug)]
pub struct NamespaceUnit<T> {
    pub instance: u8,
    pub namespace_name: String,
    /// `Some` for a full unit (identifies the Base/Treex/PriStage nsid
    /// pool); `None` for a data-only unit, which has no Base and whose
    /// DataStage members may not even share one nsid.
    pub nsid: Option<u16>,
    pub base: Option<T>,
    pub treex: Option<T>,
    pub pri_stages: Vec<T>,
    pub meta: Option<T>,
    pub sec_stages: Vec<T>,
    pub data_stages: Vec<T>,
}

impl<T: UnitEntry> NamespaceUnit<T> {
    #[must_use]
    pub fn is_data_only(&self) -> bool {
        self.base.is_none()
    }

    /// All members of the unit, in a stable, deterministic order.
    pub fn members(&self) -> Vec<&T> {
        let mut out = Vec::new();
        out.extend(self.base.as_ref());
        out.extend(self.treex.as_ref());
        out.extend(self.pri_stages.iter());
        out.extend(self.meta.as_ref());
        out.extend(self.sec_stages.iter());
        out.extend(self.data_stages.iter());
        out
    }

    /// Every distinct `(instance, nsid)` pair touched by this unit's
    /// members, used for destination-conflict checks.
    pub fn member_nsids(&self) -> BTreeSet<(u8, u16)> {
        self.members()
            .into_iter()
            .map(|e| (e.instance(), e.nsid()))
            .collect()
    }

    /// Total logical bytes this unit would move.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.members().iter().map(|e| e.size()).sum()
    }
}

fn contiguous_stages<T: UnitEntry>(mut entries: Vec<T>) -> Result<Vec<T>, Error> {
    entries.sort_by_key(UnitEntry::stage);
    for (i, entry) in entries.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let expected = STAGE_MIN + i as u16;
        if entry.stage() != expected {
            return Err(Error::FormatError {
                key: Some(entry.key()),
                reason: format!(
                    "stage {:#x} is not contiguous from {STAGE_MIN:#x} (expected {expected:#x})",
                    entry.stage()
                ),
            });
        }
        if entry.stage() > STAGE_MAX {
            return Err(Error::FormatError {
                key: Some(entry.key()),
                reason: format!("stage {:#x} exceeds maximum {STAGE_MAX:#x}", entry.stage()),
            });
        }
    }
    Ok(entries)
}

/// Assembles and validates a [`NamespaceUnit`] for `namespace_name` on
/// `instance` out of `entries`.
///
/// # Errors
///
/// [`Error::FormatError`] on any completeness, contiguity or body sanity
/// violation; this also covers "no candidates found" (empty result for
/// both the full-unit and data-only paths).
pub fn group<T: UnitEntry>(
    entries: &[T],
    instance: u8,
    namespace_name: &str,
    inspector: &dyn BodyInspector<T>,
) -> Result<NamespaceUnit<T>, Error> {
    let base = entries.iter().find(|e| {
        e.kind() == SegmentKind::Base
            && e.instance() == instance
            && e.namespace_name() == Some(namespace_name)
    });

    let Some(base) = base else {
        return group_data_only(entries, instance, namespace_name);
    };

    let nsid = base.nsid();

    if base.size() < crate::segment::BASE_MIN_SIZE as u64 {
        return Err(Error::FormatError {
            key: Some(base.key()),
            reason: format!(
                "Base segment is {} bytes, smaller than minimum {}",
                base.size(),
                crate::segment::BASE_MIN_SIZE
            ),
        });
    }

    let treex = entries
        .iter()
        .find(|e| e.kind() == SegmentKind::Treex && e.instance() == instance && e.nsid() == nsid)
        .cloned()
        .ok_or_else(|| Error::FormatError {
            key: Some(base.key()),
            reason: "unit is missing its Treex member".to_string(),
        })?;

    let pri_raw: Vec<T> = entries
        .iter()
        .filter(|e| e.kind() == SegmentKind::PriStage && e.instance() == instance && e.nsid() == nsid)
        .cloned()
        .collect();
    if pri_raw.is_empty() {
        return Err(Error::FormatError {
            key: Some(base.key()),
            reason: "unit has no PriStage members".to_string(),
        });
    }
    let pri_stages = contiguous_stages(pri_raw)?;

    let meta = entries
        .iter()
        .find(|e| e.kind() == SegmentKind::Meta && e.instance() == instance && e.nsid() == nsid)
        .cloned();

    let sec_stages = if let Some(meta) = &meta {
        let sec_raw: Vec<T> = entries
            .iter()
            .filter(|e| {
                e.kind() == SegmentKind::SecStage && e.instance() == instance && e.nsid() == nsid
            })
            .cloned()
            .collect();
        if sec_raw.is_empty() {
            return Err(Error::FormatError {
                key: Some(meta.key()),
                reason: "Meta is present but unit has no SecStage members".to_string(),
            });
        }
        contiguous_stages(sec_raw)?
    } else {
        Vec::new()
    };

    let data_stages: Vec<T> = entries
        .iter()
        .filter(|e| {
            e.kind() == SegmentKind::DataStage
                && e.instance() == instance
                && e.namespace_name() == Some(namespace_name)
        })
        .cloned()
        .collect();

    let (version, shutdown, arena_count) =
        inspector.base_header(&base)?.ok_or_else(|| Error::FormatError {
            key: Some(base.key()),
            reason: "could not read Base header fields".to_string(),
        })?;

    if !crate::segment::BASE_VERSION_RANGE.contains(&version) {
        return Err(Error::FormatError {
            key: Some(base.key()),
            reason: format!("Base version {version} out of accepted range"),
        });
    }
    if shutdown != 1 {
        return Err(Error::FormatError {
            key: Some(base.key()),
            reason: format!("Base shutdown flag is {shutdown}, expected 1 (clean shutdown)"),
        });
    }
    if arena_count as usize != pri_stages.len() {
        return Err(Error::FormatError {
            key: Some(base.key()),
            reason: format!(
                "Base primary_arena_count {arena_count} does not match {} PriStage members",
                pri_stages.len()
            ),
        });
    }

    if let Some(meta) = &meta {
        let secondary_arena_count =
            inspector
                .meta_arena_count(meta)?
                .ok_or_else(|| Error::FormatError {
                    key: Some(meta.key()),
                    reason: "could not read Meta header fields".to_string(),
                })?;
        if secondary_arena_count as usize != sec_stages.len() {
            return Err(Error::FormatError {
                key: Some(meta.key()),
                reason: format!(
                    "Meta secondary_arena_count {secondary_arena_count} does not match {} SecStage members",
                    sec_stages.len()
                ),
            });
        }
    }

    Ok(NamespaceUnit {
        instance,
        namespace_name: namespace_name.to_string(),
        nsid: Some(nsid),
        base: Some(base.clone()),
        treex: Some(treex),
        pri_stages,
        meta,
        sec_stages,
        data_stages,
    })
}

/// Fails if `dir` already contains a file for any `(instance, nsid)` pair
/// the unit touches.
///
/// # Errors
///
/// [`Error::ConflictError`] naming the clashing file's key.
pub fn check_backup_conflict<T: UnitEntry>(unit: &NamespaceUnit<T>, dir: &Path) -> Result<(), Error> {
    let wanted = unit.member_nsids();
    let existing = crate::file::enumerate(dir)?;
    if let Some(clash) = existing
        .iter()
        .find(|f| wanted.contains(&(f.instance, f.nsid)))
    {
        return Err(Error::ConflictError {
            key: clash.key,
            reason: format!(
                "file for instance {} nsid {} already exists in {}",
                clash.instance,
                clash.nsid,
                dir.display()
            ),
        });
    }
    Ok(())
}

/// Fails if the host already has a segment for any `(instance, nsid)`
/// pair the unit touches.
///
/// # Errors
///
/// [`Error::ConflictError`] naming the clashing segment's key.
pub fn check_restore_conflict<T: UnitEntry>(
    unit: &NamespaceUnit<T>,
    backend: &dyn ShmBackend,
) -> Result<(), Error> {
    let wanted = unit.member_nsids();
    let opts = crate::segment::EnumerateOptions {
        instance: unit.instance,
        namespace_name: None,
        compute_crc32: false,
    };
    let existing = crate::segment::enumerate(backend, &opts)?;
    if let Some(clash) = existing
        .iter()
        .find(|s| wanted.contains(&(s.instance, s.nsid)))
    {
        return Err(Error::ConflictError {
            key: clash.key,
            reason: format!(
                "segment for instance {} nsid {} already exists",
                clash.instance, clash.nsid
            ),
        });
    }
    Ok(())
}

fn group_data_only<T: UnitEntry>(
    entries: &[T],
    instance: u8,
    namespace_name: &str,
) -> Result<NamespaceUnit<T>, Error> {
    let data_stages: Vec<T> = entries
        .iter()
        .filter(|e| {
            e.kind() == SegmentKind::DataStage
                && e.instance() == instance
                && e.namespace_name() == Some(namespace_name)
        })
        .cloned()
        .collect();

    if data_stages.is_empty() {
        return Err(Error::FormatError {
            key: None,
            reason: format!("no candidates found for namespace \"{namespace_name}\""),
        });
    }

    Ok(NamespaceUnit {
        instance,
        namespace_name: namespace_name.to_string(),
        nsid: None,
        base: None,
        treex: None,
        pri_stages: Vec::new(),
        meta: None,
        sec_stages: Vec::new(),
        data_stages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key;

    #[derive(Clone, Debug)]
    struct FakeEntry {
        key: Key,
        kind: SegmentKind,
        instance: u8,
        nsid: u16,
        stage: u16,
        name: Option<String>,
        size: u64,
    }

    impl UnitEntry for FakeEntry {
        fn key(&self) -> Key {
            self.key
        }
        fn kind(&self) -> SegmentKind {
            self.kind
        }
        fn instance(&self) -> u8 {
            self.instance
        }
        fn nsid(&self) -> u16 {
            self.nsid
        }
        fn stage(&self) -> u16 {
            self.stage
        }
        fn namespace_name(&self) -> Option<&str> {
            self.name.as_deref()
        }
        fn size(&self) -> u64 {
            self.size
        }
    }

    struct FakeInspector {
        version: u32,
        shutdown: u32,
        primary_arena_count: u32,
        secondary_arena_count: u32,
    }

    impl BodyInspector<FakeEntry> for FakeInspector {
        fn base_header(&self, _entry: &FakeEntry) -> Result<Option<(u32, u32, u32)>, Error> {
            Ok(Some((self.version, self.shutdown, self.primary_arena_count)))
        }
        fn meta_arena_count(&self, _entry: &FakeEntry) -> Result<Option<u32>, Error> {
            Ok(Some(self.secondary_arena_count))
        }
    }

    fn entry(kind: SegmentKind, inst: u8, nsid: u16, stage: u16, name: Option<&str>, size: u64) -> FakeEntry {
        let stage_for_key = match kind {
            SegmentKind::PriStage | SegmentKind::SecStage | SegmentKind::DataStage => stage,
            _ => 0,
        };
        let key = key::encode(kind, inst, nsid, stage_for_key).unwrap();
        FakeEntry {
            key,
            kind,
            instance: inst,
            nsid,
            stage,
            name: name.map(str::to_owned),
            size,
        }
    }

    fn inspector(arena: u32) -> FakeInspector {
        FakeInspector {
            version: 10,
            shutdown: 1,
            primary_arena_count: arena,
            secondary_arena_count: 0,
        }
    }

    #[test]
    fn groups_full_unit() {
        let entries = vec![
            entry(SegmentKind::Base, 0, 1, 0, Some("foo"), 4096),
            entry(SegmentKind::Treex, 0, 1, 0, None, 1024),
            entry(SegmentKind::PriStage, 0, 1, 0x100, None, 65536),
            entry(SegmentKind::PriStage, 0, 1, 0x101, None, 65536),
        ];
        let unit = group(&entries, 0, "foo", &inspector(2)).unwrap();
        assert!(!unit.is_data_only());
        assert_eq!(unit.pri_stages.len(), 2);
        assert_eq!(unit.nsid, Some(1));
    }

    #[test]
    fn missing_stage_is_format_error() {
        let entries = vec![
            entry(SegmentKind::Base, 0, 1, 0, Some("foo"), 4096),
            entry(SegmentKind::Treex, 0, 1, 0, None, 1024),
            entry(SegmentKind::PriStage, 0, 1, 0x100, None, 65536),
            // 0x101 missing, 0x102 present: not contiguous
            entry(SegmentKind::PriStage, 0, 1, 0x102, None, 65536),
        ];
        let err = group(&entries, 0, "foo", &inspector(2)).unwrap_err();
        assert!(matches!(err, Error::FormatError { .. }));
    }

    #[test]
    fn arena_count_mismatch_is_format_error() {
        let entries = vec![
            entry(SegmentKind::Base, 0, 1, 0, Some("foo"), 4096),
            entry(SegmentKind::Treex, 0, 1, 0, None, 1024),
            entry(SegmentKind::PriStage, 0, 1, 0x100, None, 65536),
        ];
        // inspector reports 2 arenas, but only one PriStage exists
        let err = group(&entries, 0, "foo", &inspector(2)).unwrap_err();
        assert!(matches!(err, Error::FormatError { .. }));
    }

    #[test]
    fn data_only_unit_when_no_base() {
        let entries = vec![
            entry(SegmentKind::DataStage, 0, 2, 0, Some("bar"), 4096),
            entry(SegmentKind::DataStage, 0, 2, 1, Some("bar"), 4096),
        ];
        let unit = group(&entries, 0, "bar", &inspector(0)).unwrap();
        assert!(unit.is_data_only());
        assert_eq!(unit.data_stages.len(), 2);
    }

    #[test]
    fn no_candidates_is_format_error() {
        let entries: Vec<FakeEntry> = vec![];
        let err = group(&entries, 0, "nope", &inspector(0)).unwrap_err();
        assert!(matches!(err, Error::FormatError { .. }));
    }
}
