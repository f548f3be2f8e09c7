//! Uncompressed preamble in front of the chunked body.
//!
//! The fixed fields come first; the rest are gated by header version through
//! [`HEADER_FIELD_TABLE`], which drives both the reader and the writer.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::{ByteReader, ByteWriter, SavString};
use crate::error::{Result, SavError};

/// Oldest header layout this codec understands.
pub const MIN_HEADER_VERSION: u32 = 6;
/// Oldest body layout (world-partitioned saves) this codec understands.
pub const MIN_SAVE_VERSION: u32 = 42;

pub const TICKS_PER_SECOND: i64 = 10_000_000;
/// 0001-01-01 to 1970-01-01 in 100ns ticks.
const UNIX_EPOCH_TICKS: i64 = 719_162 * 86_400 * TICKS_PER_SECOND;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedField {
    EditorObjectVersion,
    ModMetadata,
    SaveIdentifier,
    PartitionedWorld,
    SaveDataHash,
    CreativeMode,
}

/// Field → first header version that carries it, in on-disk order.
pub const HEADER_FIELD_TABLE: [(GatedField, u32); 6] = [
    (GatedField::EditorObjectVersion, 7),
    (GatedField::ModMetadata, 8),
    (GatedField::SaveIdentifier, 10),
    (GatedField::PartitionedWorld, 11),
    (GatedField::SaveDataHash, 12),
    (GatedField::CreativeMode, 13),
];

impl GatedField {
    pub fn name(self) -> &'static str {
        match self {
            GatedField::EditorObjectVersion => "editor_object_version",
            GatedField::ModMetadata => "mod_metadata",
            GatedField::SaveIdentifier => "save_identifier",
            GatedField::PartitionedWorld => "is_partitioned_world",
            GatedField::SaveDataHash => "save_data_hash",
            GatedField::CreativeMode => "is_creative_mode_enabled",
        }
    }

    /// Whether a header of `version` carries this field.
    pub fn present_in(self, version: u32) -> bool {
        HEADER_FIELD_TABLE
            .iter()
            .any(|&(field, since)| field == self && version >= since)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModMetadata {
    pub metadata: SavString,
    pub is_modded_save: u32,
}

/// MD5 of the save payload as the engine serializes it: a validity flag then
/// the digest when valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveDataHash {
    pub digest: Option<[u8; 16]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveHeader {
    pub header_version: u32,
    pub save_version: u32,
    pub build_version: u32,
    pub map_name: SavString,
    pub map_options: SavString,
    pub session_name: SavString,
    pub play_duration_seconds: u32,
    /// 100ns ticks since 0001-01-01.
    pub save_date_time: u64,
    pub session_visibility: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_object_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_metadata: Option<ModMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_identifier: Option<SavString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_partitioned_world: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_data_hash: Option<SaveDataHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_creative_mode_enabled: Option<u32>,
}

impl SaveHeader {
    /// A header with every field its version requires, filled with neutral
    /// values. Used when building saves from scratch.
    pub fn new(header_version: u32, save_version: u32, build_version: u32) -> Self {
        let mut header = SaveHeader {
            header_version,
            save_version,
            build_version,
            map_name: SavString::new("Persistent_Level"),
            map_options: SavString::default(),
            session_name: SavString::default(),
            play_duration_seconds: 0,
            save_date_time: 0,
            session_visibility: 0,
            editor_object_version: None,
            mod_metadata: None,
            save_identifier: None,
            is_partitioned_world: None,
            save_data_hash: None,
            is_creative_mode_enabled: None,
        };
        for (field, since) in HEADER_FIELD_TABLE {
            if header_version >= since {
                header.fill_default(field);
            }
        }
        header
    }

    fn fill_default(&mut self, field: GatedField) {
        match field {
            GatedField::EditorObjectVersion => self.editor_object_version = Some(0),
            GatedField::ModMetadata => {
                self.mod_metadata = Some(ModMetadata {
                    metadata: SavString::default(),
                    is_modded_save: 0,
                })
            }
            GatedField::SaveIdentifier => self.save_identifier = Some(SavString::default()),
            GatedField::PartitionedWorld => self.is_partitioned_world = Some(1),
            GatedField::SaveDataHash => self.save_data_hash = Some(SaveDataHash { digest: None }),
            GatedField::CreativeMode => self.is_creative_mode_enabled = Some(0),
        }
    }

    fn has(&self, field: GatedField) -> bool {
        match field {
            GatedField::EditorObjectVersion => self.editor_object_version.is_some(),
            GatedField::ModMetadata => self.mod_metadata.is_some(),
            GatedField::SaveIdentifier => self.save_identifier.is_some(),
            GatedField::PartitionedWorld => self.is_partitioned_world.is_some(),
            GatedField::SaveDataHash => self.save_data_hash.is_some(),
            GatedField::CreativeMode => self.is_creative_mode_enabled.is_some(),
        }
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<SaveHeader> {
        let header_version = r.read_u32()?;
        if header_version < MIN_HEADER_VERSION {
            return Err(SavError::UnsupportedVersion {
                field: "header version",
                version: header_version,
                minimum: MIN_HEADER_VERSION,
            });
        }
        let save_version = r.read_u32()?;
        if save_version < MIN_SAVE_VERSION {
            return Err(SavError::UnsupportedVersion {
                field: "save version",
                version: save_version,
                minimum: MIN_SAVE_VERSION,
            });
        }

        let mut header = SaveHeader {
            header_version,
            save_version,
            build_version: r.read_u32()?,
            map_name: r.read_string()?,
            map_options: r.read_string()?,
            session_name: r.read_string()?,
            play_duration_seconds: r.read_u32()?,
            save_date_time: r.read_u64()?,
            session_visibility: r.read_u8()?,
            editor_object_version: None,
            mod_metadata: None,
            save_identifier: None,
            is_partitioned_world: None,
            save_data_hash: None,
            is_creative_mode_enabled: None,
        };

        for (field, since) in HEADER_FIELD_TABLE {
            if header_version >= since {
                header.read_field(field, r)?;
            }
        }
        Ok(header)
    }

    fn read_field(&mut self, field: GatedField, r: &mut ByteReader<'_>) -> Result<()> {
        match field {
            GatedField::EditorObjectVersion => self.editor_object_version = Some(r.read_u32()?),
            GatedField::ModMetadata => {
                self.mod_metadata = Some(ModMetadata {
                    metadata: r.read_string()?,
                    is_modded_save: r.read_u32()?,
                })
            }
            GatedField::SaveIdentifier => self.save_identifier = Some(r.read_string()?),
            GatedField::PartitionedWorld => self.is_partitioned_world = Some(r.read_u32()?),
            GatedField::SaveDataHash => {
                let digest = if r.read_bool32()? {
                    Some(r.read_array::<16>()?)
                } else {
                    None
                };
                self.save_data_hash = Some(SaveDataHash { digest });
            }
            GatedField::CreativeMode => self.is_creative_mode_enabled = Some(r.read_u32()?),
        }
        Ok(())
    }

    /// Check every gated field is present exactly when the stored version
    /// calls for it.
    pub fn validate(&self) -> Result<()> {
        for (field, since) in HEADER_FIELD_TABLE {
            if self.has(field) != (self.header_version >= since) {
                return Err(SavError::InconsistentHeader {
                    field: field.name(),
                    version: self.header_version,
                });
            }
        }
        Ok(())
    }

    pub fn write(&self, w: &mut ByteWriter) -> Result<()> {
        self.validate()?;
        w.write_u32(self.header_version)?;
        w.write_u32(self.save_version)?;
        w.write_u32(self.build_version)?;
        w.write_string(&self.map_name)?;
        w.write_string(&self.map_options)?;
        w.write_string(&self.session_name)?;
        w.write_u32(self.play_duration_seconds)?;
        w.write_u64(self.save_date_time)?;
        w.write_u8(self.session_visibility)?;

        for (field, since) in HEADER_FIELD_TABLE {
            if self.header_version >= since {
                self.write_field(field, w)?;
            }
        }
        Ok(())
    }

    fn write_field(&self, field: GatedField, w: &mut ByteWriter) -> Result<()> {
        let missing = || SavError::InconsistentHeader {
            field: field.name(),
            version: self.header_version,
        };
        match field {
            GatedField::EditorObjectVersion => {
                w.write_u32(self.editor_object_version.ok_or_else(missing)?)
            }
            GatedField::ModMetadata => {
                let m = self.mod_metadata.as_ref().ok_or_else(missing)?;
                w.write_string(&m.metadata)?;
                w.write_u32(m.is_modded_save)
            }
            GatedField::SaveIdentifier => {
                w.write_string(self.save_identifier.as_ref().ok_or_else(missing)?)
            }
            GatedField::PartitionedWorld => w.write_u32(self.is_partitioned_world.ok_or_else(missing)?),
            GatedField::SaveDataHash => {
                match &self.save_data_hash.as_ref().ok_or_else(missing)?.digest {
                    Some(digest) => {
                        w.write_bool32(true)?;
                        w.write_bytes(digest)
                    }
                    None => w.write_bool32(false),
                }
            }
            GatedField::CreativeMode => {
                w.write_u32(self.is_creative_mode_enabled.ok_or_else(missing)?)
            }
        }
    }

    // ── Timestamps ───────────────────────────────────────

    /// Save time as a calendar value (UTC as stored by the engine).
    pub fn saved_at(&self) -> Option<NaiveDateTime> {
        let ticks = i64::try_from(self.save_date_time).ok()? - UNIX_EPOCH_TICKS;
        let secs = ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
    }

    pub fn set_saved_at(&mut self, when: NaiveDateTime) -> Result<()> {
        let utc = when.and_utc();
        let ticks = utc
            .timestamp()
            .checked_mul(TICKS_PER_SECOND)
            .and_then(|t| t.checked_add(UNIX_EPOCH_TICKS))
            .and_then(|t| t.checked_add(i64::from(utc.timestamp_subsec_nanos() / 100)))
            .and_then(|t| u64::try_from(t).ok())
            .ok_or_else(|| SavError::malformed(0, format!("save time {when} out of range")))?;
        self.save_date_time = ticks;
        Ok(())
    }

    /// Stamp the header with the current time.
    pub fn touch(&mut self) -> Result<()> {
        self.set_saved_at(Utc::now().naive_utc())
    }

    /// Advance the save time so the game treats the file as newer than its
    /// source.
    pub fn bump_save_time(&mut self, seconds: u64) {
        self.save_date_time = self
            .save_date_time
            .saturating_add(seconds.saturating_mul(TICKS_PER_SECOND as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn encode(header: &SaveHeader) -> Vec<u8> {
        let mut w = ByteWriter::new();
        header.write(&mut w).unwrap();
        w.into_inner()
    }

    #[test]
    fn test_rejects_versions_below_minimum() {
        let mut header = SaveHeader::new(MIN_HEADER_VERSION, MIN_SAVE_VERSION, 1);
        header.header_version = MIN_HEADER_VERSION - 1;
        let raw = encode_unchecked(&header);
        match SaveHeader::read(&mut ByteReader::new(&raw)).unwrap_err() {
            SavError::UnsupportedVersion { version, minimum, .. } => {
                assert_eq!(version, 5);
                assert_eq!(minimum, 6);
            }
            other => panic!("unexpected error {other}"),
        }

        let old_body = SaveHeader::new(13, MIN_SAVE_VERSION - 1, 1);
        let raw = encode(&old_body);
        assert!(matches!(
            SaveHeader::read(&mut ByteReader::new(&raw)).unwrap_err(),
            SavError::UnsupportedVersion {
                field: "save version",
                ..
            }
        ));
    }

    fn encode_unchecked(header: &SaveHeader) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u32(header.header_version).unwrap();
        w.write_u32(header.save_version).unwrap();
        w.into_inner()
    }

    #[test]
    fn test_gated_fields_follow_table_for_every_version() {
        for version in MIN_HEADER_VERSION..=13 {
            let mut header = SaveHeader::new(version, 46, 368883);
            header.session_name = SavString::new("Factory");
            let raw = encode(&header);
            let mut r = ByteReader::new(&raw);
            let back = SaveHeader::read(&mut r).unwrap();
            assert!(r.is_empty(), "version {version} left bytes");
            assert_eq!(back, header);
            for (field, since) in HEADER_FIELD_TABLE {
                assert_eq!(back.has(field), version >= since, "{} at {version}", field.name());
            }
        }
    }

    #[test]
    fn test_current_header_layout() {
        let mut header = SaveHeader::new(13, 46, 385_000);
        header.save_data_hash = Some(SaveDataHash {
            digest: Some([7u8; 16]),
        });
        let raw = encode(&header);
        // 3 u32 + map name + two empty strings + u32 + u64 + u8
        let fixed = 12 + (4 + 17) + 4 + 4 + 4 + 8 + 1;
        // editor version, mod metadata, identifier, partition, hash, creative
        let gated = 4 + (4 + 4) + 4 + 4 + (4 + 16) + 4;
        assert_eq!(raw.len(), fixed + gated);
        let back = SaveHeader::read(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(back.save_data_hash, header.save_data_hash);
    }

    #[test]
    fn test_write_refuses_synthesized_or_dropped_fields() {
        let mut header = SaveHeader::new(9, 46, 1);
        header.is_creative_mode_enabled = Some(1);
        let mut w = ByteWriter::new();
        assert!(matches!(
            header.write(&mut w).unwrap_err(),
            SavError::InconsistentHeader {
                field: "is_creative_mode_enabled",
                version: 9
            }
        ));

        let mut header = SaveHeader::new(13, 46, 1);
        header.save_identifier = None;
        assert!(matches!(
            header.write(&mut ByteWriter::new()).unwrap_err(),
            SavError::InconsistentHeader {
                field: "save_identifier",
                ..
            }
        ));
    }

    #[test]
    fn test_tick_conversion() {
        let mut header = SaveHeader::new(13, 46, 1);
        header.save_date_time = 621_355_968_000_000_000;
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(header.saved_at(), Some(epoch));

        let when = NaiveDate::from_ymd_opt(2024, 9, 21)
            .unwrap()
            .and_hms_milli_opt(9, 27, 7, 250)
            .unwrap();
        header.set_saved_at(when).unwrap();
        assert_eq!(header.saved_at(), Some(when));

        header.bump_save_time(1);
        let later = header.saved_at().unwrap();
        assert_eq!((later - when).num_seconds(), 1);
    }
}
