//! Reader and writer for chunked, zlib-compressed factory game saves.
//!
//! [`decode`] turns file bytes into a [`ParsedSave`]; [`encode`] turns one
//! back into bytes the game accepts. Unedited saves re-encode bit for bit,
//! including properties and trailers this crate can't interpret.

pub mod chunk;
pub mod config;
pub mod containers;
pub mod cursor;
pub mod error;
pub mod header;
pub mod interchange;
pub mod object;
pub mod property;
pub mod reference;
pub mod save;
pub mod structs;
pub mod trailer;

use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub use config::{ReadOptions, ToolConfig, WriteOptions};
pub use cursor::{OpaqueBytes, SavString};
pub use error::{Result, SavError};
pub use header::SaveHeader;
pub use object::{Level, ObjectBody, ObjectData, ObjectHeader, SaveObject};
pub use property::{Property, PropertyTree, PropertyValue};
pub use reference::{ObjectId, ObjectRef, ObjectReference};
pub use save::ParsedSave;
pub use trailer::ObjectTrailer;

pub const SAVE_EXTENSION: &str = "sav";

pub fn decode(bytes: &[u8], options: &ReadOptions) -> Result<ParsedSave> {
    ParsedSave::decode(bytes, options)
}

pub fn encode(save: &ParsedSave, options: &WriteOptions) -> Result<Vec<u8>> {
    save.encode(options)
}

pub fn read_save_file(path: &Path, options: &ReadOptions) -> Result<ParsedSave> {
    let bytes = fs::read(path)?;
    info!("reading {} ({} bytes)", path.display(), bytes.len());
    decode(&bytes, options)
}

/// Encode in memory, write a sibling temp file, then rename it over `path`.
/// `path` is untouched if anything fails before the rename.
pub fn write_save_file(path: &Path, save: &ParsedSave, options: &WriteOptions) -> Result<()> {
    let bytes = encode(save, options)?;
    let tmp = temp_sibling(path);
    if let Err(e) = fs::write(&tmp, &bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    info!("wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "save".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Every `*.sav` below `dir`, sorted.
pub fn find_save_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case(SAVE_EXTENSION)))
        .collect();
    files.sort();
    files
}

/// Decode, re-encode and decode again, checking both the model and the
/// bytes survive. Returns the number of objects checked.
pub fn verify_bytes(bytes: &[u8], read: &ReadOptions) -> Result<usize> {
    let first = decode(bytes, read)?;
    let again = encode(&first, &WriteOptions::default())?;
    let second = decode(&again, read)?;
    if second != first {
        return Err(SavError::malformed(0, "save differs after a decode/encode round trip"));
    }
    let third = encode(&second, &WriteOptions::default())?;
    if third != again {
        return Err(SavError::malformed(0, "re-encoded bytes are not stable"));
    }
    debug!("round trip stable at {} bytes", again.len());
    Ok(first.object_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::tests::{sample, B_PATH};

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sav-codec-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_write_then_read_file() {
        let dir = scratch_dir();
        let path = dir.join("factory.sav");
        let save = sample();
        write_save_file(&path, &save, &WriteOptions::default()).unwrap();
        let back = read_save_file(&path, &ReadOptions::default()).unwrap();
        assert_eq!(back, save);
        // no temp files left behind
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_encode_leaves_destination_alone() {
        let dir = scratch_dir();
        let path = dir.join("factory.sav");
        fs::write(&path, b"original").unwrap();

        let mut save = sample();
        let b = save.find_object(B_PATH).unwrap();
        save.remove_object(b).unwrap();
        assert!(matches!(
            write_save_file(&path, &save, &WriteOptions::default()).unwrap_err(),
            SavError::DanglingReference { .. }
        ));
        assert_eq!(fs::read(&path).unwrap(), b"original");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_find_and_verify_saves() {
        let dir = scratch_dir();
        fs::create_dir_all(dir.join("nested")).unwrap();
        let bytes = encode(&sample(), &WriteOptions::default()).unwrap();
        fs::write(dir.join("b.sav"), &bytes).unwrap();
        fs::write(dir.join("nested").join("a.SAV"), &bytes).unwrap();
        fs::write(dir.join("notes.txt"), b"not a save").unwrap();

        let found = find_save_files(&dir);
        assert_eq!(found.len(), 2);
        for path in &found {
            let bytes = fs::read(path).unwrap();
            assert_eq!(verify_bytes(&bytes, &ReadOptions::default()).unwrap(), 3);
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_garbage_is_rejected_with_offset() {
        let err = decode(&[1, 0, 0, 0], &ReadOptions::default()).unwrap_err();
        assert!(matches!(err, SavError::UnsupportedVersion { version: 1, .. }));
        let err = decode(&[13, 0, 0, 0], &ReadOptions::default()).unwrap_err();
        assert_eq!(err.offset(), Some(4));
    }
}
