//! JSON interchange form of a parsed save.
//!
//! The document wraps the save in a small envelope naming the format
//! revision. Handles are not part of the text form: they are reassigned and
//! references relinked by path on load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, SavError};
use crate::save::ParsedSave;

pub const FORMAT_NAME: &str = "sav-codec";
pub const FORMAT_REVISION: u32 = 1;

#[derive(Serialize)]
struct DocumentRef<'a> {
    format: &'a str,
    revision: u32,
    save: &'a ParsedSave,
}

#[derive(Deserialize)]
struct Document {
    format: String,
    revision: u32,
    save: ParsedSave,
}

pub fn to_json(save: &ParsedSave) -> Result<String> {
    Ok(serde_json::to_string_pretty(&DocumentRef {
        format: FORMAT_NAME,
        revision: FORMAT_REVISION,
        save,
    })?)
}

pub fn from_json(text: &str) -> Result<ParsedSave> {
    let doc: Document = serde_json::from_str(text)?;
    if doc.format != FORMAT_NAME {
        return Err(SavError::malformed(0, format!("not a {FORMAT_NAME} document: {}", doc.format)));
    }
    if doc.revision != FORMAT_REVISION {
        return Err(SavError::UnsupportedVersion {
            field: "interchange revision",
            version: doc.revision,
            minimum: FORMAT_REVISION,
        });
    }
    let mut save = doc.save;
    save.link_references();
    Ok(save)
}

pub fn write_json_file(path: &Path, save: &ParsedSave) -> Result<()> {
    fs::write(path, to_json(save)?)?;
    Ok(())
}

pub fn read_json_file(path: &Path) -> Result<ParsedSave> {
    from_json(&fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReadOptions, WriteOptions};
    use crate::cursor::OpaqueBytes;
    use crate::save::tests::sample;
    use crate::trailer::ObjectTrailer;

    #[test]
    fn test_json_round_trip_is_lossless() {
        let mut save = sample();
        save.trailing_padding = OpaqueBytes(vec![0xAB; 3]);
        let bytes = save.encode(&WriteOptions::default()).unwrap();

        let text = to_json(&save).unwrap();
        let back = from_json(&text).unwrap();
        assert_eq!(back, save);
        assert_eq!(back.encode(&WriteOptions::default()).unwrap(), bytes);
    }

    #[test]
    fn test_opaque_blobs_are_length_tagged() {
        let text = to_json(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["format"], FORMAT_NAME);
        let trailer = &value["save"]["levels"][1]["objects"][1]["body"]["content"]["data"]["trailer"];
        assert_eq!(trailer["trailer"], "belt_items");
        assert_eq!(trailer["items"], serde_json::json!([]));

        // unknown trailers travel as blobs
        let mut save = sample();
        let a = save.find_object(crate::save::tests::A_PATH).unwrap();
        save.object_mut(a).and_then(|o| o.data_mut()).unwrap().trailer = ObjectTrailer::Opaque {
            data: OpaqueBytes(vec![0, 0, 0, 0]),
        };
        let value: serde_json::Value = serde_json::from_str(&to_json(&save).unwrap()).unwrap();
        let trailer = &value["save"]["levels"][1]["objects"][0]["body"]["content"]["data"]["trailer"];
        assert_eq!(trailer["trailer"], "opaque");
        assert_eq!(trailer["data"]["len"], 4);
        assert_eq!(trailer["data"]["base64"], "AAAAAA==");
    }

    #[test]
    fn test_lazy_bodies_survive_as_raw() {
        let bytes = sample().encode(&WriteOptions::default()).unwrap();
        let lazy = ParsedSave::decode(&bytes, &ReadOptions { lazy_bodies: true }).unwrap();
        let back = from_json(&to_json(&lazy).unwrap()).unwrap();
        assert_eq!(back.encode(&WriteOptions::default()).unwrap(), bytes);
    }

    #[test]
    fn test_foreign_document_is_rejected() {
        let text = to_json(&sample()).unwrap().replace(FORMAT_NAME, "something-else");
        assert!(from_json(&text).is_err());
        let text = to_json(&sample())
            .unwrap()
            .replace("\"revision\": 1", "\"revision\": 7");
        assert!(matches!(
            from_json(&text).unwrap_err(),
            SavError::UnsupportedVersion { version: 7, .. }
        ));
    }
}
