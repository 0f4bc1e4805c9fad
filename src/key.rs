// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoding and decoding of the 32-bit segment key.
//!
//! A key is the concatenation, high to low bits, of a type tag, an
//! instance number, a namespace id and a selector.

use crate::error::Error;

/// Highest valid instance number (4-bit field).
pub const MAX_INSTANCE: u8 = 15;

/// Lowest/highest valid namespace id (8-bit field, 1-based).
pub const MIN_NSID: u16 = 1;
pub const MAX_NSID: u16 = 32;

/// Lowest/highest valid arena stage selector.
pub const STAGE_MIN: u16 = 0x100;
pub const STAGE_MAX: u16 = 0x8FF;

const TAG_PRIMARY: u8 = 0xAE;
const TAG_SECONDARY: u8 = 0xA2;
const TAG_DATA: u8 = 0xAD;

const SELECTOR_BASE_OR_META: u16 = 0x000;
const SELECTOR_TREEX: u16 = 0x001;

/// The family a key's type tag belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Family {
    /// `0xAE` — Base, Treex, PriStage.
    Primary,
    /// `0xA2` — Meta, SecStage.
    Secondary,
    /// `0xAD` — DataStage.
    Data,
}

impl Family {
    fn tag(self) -> u8 {
        match self {
            Self::Primary => TAG_PRIMARY,
            Self::Secondary => TAG_SECONDARY,
            Self::Data => TAG_DATA,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_PRIMARY => Some(Self::Primary),
            TAG_SECONDARY => Some(Self::Secondary),
            TAG_DATA => Some(Self::Data),
            _ => None,
        }
    }
}

/// The closed set of segment kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SegmentKind {
    Base,
    Treex,
    Meta,
    PriStage,
    SecStage,
    DataStage,
}

impl SegmentKind {
    /// The family that produces this kind.
    #[must_use]
    pub fn family(self) -> Family {
        match self {
            Self::Base | Self::Treex | Self::PriStage => Family::Primary,
            Self::Meta | Self::SecStage => Family::Secondary,
            Self::DataStage => Family::Data,
        }
    }
}

/// A validated 32-bit segment key.
///
/// Ordering is defined over the raw integer, so sorting a list of keys
/// (e.g. before grouping or before printing) never needs to reinterpret
/// a struct's memory layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Key(u32);

impl Key {
    /// Wraps a raw 32-bit value without validating it.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw 32-bit value.
    #[must_use]
    pub fn into_raw(self) -> u32 {
        self.0
    }

    /// Formats the key as lower-case 8-digit hex, matching the on-disk
    /// filename convention.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:08x}", self.0)
    }

    /// Parses an 8-hex-digit string (upper or lower case) into a key.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u32::from_str_radix(s, 16).ok().map(Self)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A decoded key: kind plus the addressed instance/namespace/stage.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Decoded {
    pub kind: SegmentKind,
    pub instance: u8,
    pub nsid: u16,
    /// Stage number for `PriStage`/`SecStage`; raw selector for
    /// `DataStage`; `0` for `Base`/`Meta`.
    pub stage: u16,
}

/// Encodes a key from its logical fields.
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] if `instance` or `nsid` are out of range,
/// or if `kind` requires a stage number outside `[STAGE_MIN, STAGE_MAX]`.
pub fn encode(kind: SegmentKind, instance: u8, nsid: u16, stage: u16) -> Result<Key, Error> {
    if instance > MAX_INSTANCE {
        return Err(Error::InvalidKey {
            key: None,
            reason: format!("instance {instance} out of range 0..={MAX_INSTANCE}"),
        });
    }
    if !(MIN_NSID..=MAX_NSID).contains(&nsid) {
        return Err(Error::InvalidKey {
            key: None,
            reason: format!("nsid {nsid} out of range {MIN_NSID}..={MAX_NSID}"),
        });
    }

    let selector = match kind {
        SegmentKind::Base | SegmentKind::Meta => SELECTOR_BASE_OR_META,
        SegmentKind::Treex => SELECTOR_TREEX,
        SegmentKind::PriStage | SegmentKind::SecStage => {
            if !(STAGE_MIN..=STAGE_MAX).contains(&stage) {
                return Err(Error::InvalidKey {
                    key: None,
                    reason: format!("stage {stage:#x} out of range {STAGE_MIN:#x}..={STAGE_MAX:#x}"),
                });
            }
            stage
        }
        SegmentKind::DataStage => stage,
    };

    let tag = u32::from(kind.family().tag()) << 24;
    let inst = u32::from(instance) << 20;
    let ns = u32::from(nsid) << 12;
    let sel = u32::from(selector);

    Ok(Key(tag | inst | ns | sel))
}

/// Decodes a raw key into its logical fields.
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] when the top byte is not a recognized
/// type tag, when instance/nsid are out of range, or when the selector
/// does not map to a known kind for the key's family.
pub fn decode(key: Key) -> Result<Decoded, Error> {
    let raw = key.into_raw();

    let tag = (raw >> 24) as u8;
    let family = Family::from_tag(tag).ok_or_else(|| Error::InvalidKey {
        key: Some(key),
        reason: format!("unrecognized type tag {tag:#04x}"),
    })?;

    let instance = ((raw >> 20) & 0xF) as u8;
    let nsid = ((raw >> 12) & 0xFF) as u16;
    let selector = (raw & 0xFFF) as u16;

    if instance > MAX_INSTANCE {
        return Err(Error::InvalidKey {
            key: Some(key),
            reason: format!("instance {instance} out of range 0..={MAX_INSTANCE}"),
        });
    }
    if !(MIN_NSID..=MAX_NSID).contains(&nsid) {
        return Err(Error::InvalidKey {
            key: Some(key),
            reason: format!("nsid {nsid} out of range {MIN_NSID}..={MAX_NSID}"),
        });
    }

    let kind = match (family, selector) {
        (Family::Primary, SELECTOR_BASE_OR_META) => SegmentKind::Base,
        (Family::Secondary, SELECTOR_BASE_OR_META) => SegmentKind::Meta,
        (Family::Data, SELECTOR_BASE_OR_META) => SegmentKind::DataStage,
        (Family::Primary, SELECTOR_TREEX) => SegmentKind::Treex,
        (Family::Primary, sel) if (STAGE_MIN..=STAGE_MAX).contains(&sel) => SegmentKind::PriStage,
        (Family::Secondary, sel) if (STAGE_MIN..=STAGE_MAX).contains(&sel) => SegmentKind::SecStage,
        (Family::Data, sel) => {
            return Ok(Decoded {
                kind: SegmentKind::DataStage,
                instance,
                nsid,
                stage: sel,
            })
        }
        _ => {
            return Err(Error::InvalidKey {
                key: Some(key),
                reason: format!("selector {selector:#05x} invalid for family {family:?}"),
            })
        }
    };

    let stage = match kind {
        SegmentKind::PriStage | SegmentKind::SecStage => selector,
        _ => 0,
    };

    Ok(Decoded {
        kind,
        instance,
        nsid,
        stage,
    })
}
