//! Schema validation at the deserialization boundary.
//!
//! Decrypted header and footer JSON is walked against fixed key/type tables
//! before it is turned into typed records, so a foreign or damaged container
//! fails with an error naming the offending key instead of a generic serde
//! message. Past this point the rest of the crate only sees typed structs.

use serde_json::{Map, Value};

use crate::footer::Footer;
use crate::registry::Header;
use capsule_common::{Error, Result};

/// JSON value kinds the tables distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    String,
    Integer,
    Bool,
    Array,
    Object,
}

impl JsonType {
    pub fn name(self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Integer => "integer",
            JsonType::Bool => "boolean",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Bool => value.is_boolean(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }
}

/// Name of the JSON kind of `value`.
fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Expected keys of one record shape.
pub struct Shape {
    pub name: &'static str,
    pub fields: &'static [(&'static str, JsonType)],
}

use JsonType::{Array, Bool, Integer, Object, String as Str};

pub const HEADER: Shape = Shape {
    name: "header",
    fields: &[("vault", Object), ("map", Object)],
};

pub const VAULT_STATS: Shape = Shape {
    name: "vault stats",
    fields: &[
        ("vault_name", Str),
        ("vault_extension", Str),
        ("header_size", Integer),
        ("file_size", Integer),
        ("trusted_timestamp", Str),
        ("amount_of_files", Integer),
        ("is_vault_encrypted", Bool),
    ],
};

pub const MAP: Shape = Shape {
    name: "map",
    fields: &[
        ("file_ids", Array),
        ("directory_ids", Array),
        ("note_ids", Array),
        ("directories", Object),
        ("files", Object),
        ("notes", Object),
    ],
};

pub const FILE_RECORD: Shape = Shape {
    name: "file record",
    fields: &[
        ("id", Integer),
        ("size", Integer),
        ("loc_start", Integer),
        ("loc_end", Integer),
        ("checksum", Str),
        ("file_encrypted", Bool),
        ("path", Integer),
        ("metadata", Object),
    ],
};

pub const FILE_METADATA: Shape = Shape {
    name: "file metadata",
    fields: &[
        ("name", Str),
        ("type", Str),
        ("data_created", Str),
        ("last_modified", Str),
        ("icon_data_start", Integer),
        ("icon_data_end", Integer),
        ("note_id", Integer),
    ],
};

pub const DIRECTORY_RECORD: Shape = Shape {
    name: "directory record",
    fields: &[
        ("id", Integer),
        ("name", Str),
        ("path", Integer),
        ("data_created", Str),
        ("last_modified", Str),
        ("files", Array),
    ],
};

pub const NOTE_RECORD: Shape = Shape {
    name: "note record",
    fields: &[
        ("id", Integer),
        ("owned_by_file", Integer),
        ("loc_start", Integer),
        ("loc_end", Integer),
        ("type", Str),
        ("checksum", Str),
    ],
};

pub const FOOTER: Shape = Shape {
    name: "footer",
    fields: &[("error_log", Str), ("session_log", Str)],
};

fn as_object<'a>(value: &'a Value, key: &str, shape: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| Error::InvalidData {
        key: key.to_string(),
        shape: shape.to_string(),
        expected: Object.name().to_string(),
        actual: kind_of(value).to_string(),
    })
}

/// Check every key of `shape` is present in `object` with the right type.
pub fn check_shape(object: &Map<String, Value>, shape: &Shape) -> Result<()> {
    for (key, expected) in shape.fields {
        let value = object.get(*key).ok_or_else(|| Error::MissingKey {
            key: key.to_string(),
            shape: shape.name.to_string(),
        })?;
        if !expected.matches(value) {
            return Err(Error::InvalidData {
                key: key.to_string(),
                shape: shape.name.to_string(),
                expected: expected.name().to_string(),
                actual: kind_of(value).to_string(),
            });
        }
    }
    Ok(())
}

fn check_id_list(object: &Map<String, Value>, key: &str, shape: &str) -> Result<()> {
    let Some(items) = object.get(key).and_then(Value::as_array) else {
        return Ok(());
    };
    for item in items {
        if !item.is_u64() {
            return Err(Error::InvalidData {
                key: format!("{}[]", key),
                shape: shape.to_string(),
                expected: "non-negative integer".to_string(),
                actual: kind_of(item).to_string(),
            });
        }
    }
    Ok(())
}

fn check_table(map: &Map<String, Value>, key: &str, shape: &Shape) -> Result<()> {
    let Some(table) = map.get(key).and_then(Value::as_object) else {
        return Ok(());
    };
    for (id, record) in table {
        if id.parse::<u64>().is_err() {
            return Err(Error::InvalidData {
                key: format!("{}.{}", key, id),
                shape: MAP.name.to_string(),
                expected: "integer key".to_string(),
                actual: "string".to_string(),
            });
        }
        let record = as_object(record, &format!("{}.{}", key, id), MAP.name)?;
        check_shape(record, shape)?;
        if let Some(metadata) = record.get("metadata").and_then(Value::as_object) {
            check_shape(metadata, &FILE_METADATA)?;
        }
        if shape.name == DIRECTORY_RECORD.name {
            check_id_list(record, "files", shape.name)?;
        }
    }
    Ok(())
}

/// Walk the header tables over a parsed JSON value.
pub fn check_header_value(value: &Value) -> Result<()> {
    let root = as_object(value, "<root>", HEADER.name)?;
    check_shape(root, &HEADER)?;

    let vault = as_object(&root["vault"], "vault", HEADER.name)?;
    check_shape(vault, &VAULT_STATS)?;

    let map = as_object(&root["map"], "map", HEADER.name)?;
    check_shape(map, &MAP)?;
    for key in ["file_ids", "directory_ids", "note_ids"] {
        check_id_list(map, key, MAP.name)?;
    }
    check_table(map, "files", &FILE_RECORD)?;
    check_table(map, "directories", &DIRECTORY_RECORD)?;
    check_table(map, "notes", &NOTE_RECORD)?;
    Ok(())
}

fn parse_json(bytes: &[u8], what: &str) -> Result<Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Serialization(format!("{} is not valid JSON: {}", what, e)))
}

/// Whether decrypted bytes could be one of our JSON documents at all. A wrong
/// key that slips past the padding check yields bytes failing this.
pub(crate) fn is_json_document(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes)
        .map(|text| text.trim_start().starts_with('{'))
        .unwrap_or(false)
}

/// Validate decrypted header bytes and build the typed header.
///
/// # Errors
/// - `MissingKey` / `InvalidData` naming the first failing key
/// - `Serialization` for malformed JSON or unparsable timestamps
/// - Integrity errors from [`Header::check_integrity`]
pub fn validate_header(bytes: &[u8]) -> Result<Header> {
    let value = parse_json(bytes, "header")?;
    check_header_value(&value)?;
    let header: Header =
        serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
    header.check_integrity()?;
    Ok(header)
}

/// Validate decrypted footer bytes and build the typed footer.
pub fn validate_footer(bytes: &[u8]) -> Result<Footer> {
    let value = parse_json(bytes, "footer")?;
    let root = as_object(&value, "<root>", FOOTER.name)?;
    check_shape(root, &FOOTER)?;
    serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::file_record;
    use crate::registry::ROOT_DIR;
    use capsule_common::IdKind;
    use serde_json::json;

    fn header_value() -> Value {
        let mut header = Header::new("vault", "cap", true);
        let id = header.reserve_id(IdKind::File).unwrap();
        header.insert_file(file_record(id, ROOT_DIR, 40, 80)).unwrap();
        serde_json::from_slice(&header.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_valid_header_passes() {
        let bytes = serde_json::to_vec(&header_value()).unwrap();
        let header = validate_header(&bytes).unwrap();
        assert_eq!(header.map.files.len(), 1);
    }

    #[test]
    fn test_missing_section() {
        let mut value = header_value();
        value.as_object_mut().unwrap().remove("map");
        let err = validate_header(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        match err {
            Error::MissingKey { key, shape } => {
                assert_eq!(key, "map");
                assert_eq!(shape, "header");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wrong_type_names_key_and_types() {
        let mut value = header_value();
        value["map"]["files"]["1"]["loc_start"] = json!("forty");
        let err = validate_header(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("loc_start"), "{}", msg);
        assert!(msg.contains("integer"), "{}", msg);
        assert!(msg.contains("string"), "{}", msg);
        assert!(err.is_container_fatal());
    }

    #[test]
    fn test_missing_metadata_key() {
        let mut value = header_value();
        value["map"]["files"]["1"]["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("note_id");
        assert!(matches!(
            validate_header(&serde_json::to_vec(&value).unwrap()),
            Err(Error::MissingKey { ref key, .. }) if key == "note_id"
        ));
    }

    #[test]
    fn test_negative_id_in_set_rejected() {
        let mut value = header_value();
        value["map"]["note_ids"] = json!([-3]);
        assert!(matches!(
            validate_header(&serde_json::to_vec(&value).unwrap()),
            Err(Error::InvalidData { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_surface_as_collision() {
        let mut value = header_value();
        value["map"]["file_ids"] = json!([1, 1]);
        assert!(matches!(
            validate_header(&serde_json::to_vec(&value).unwrap()),
            Err(Error::IdCollision(_))
        ));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            validate_header(b"\x00\x01garbage"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_json_document_sniff() {
        assert!(is_json_document(b"  {\"vault\":{}}"));
        assert!(!is_json_document(b"\xff\xfe{"));
        assert!(!is_json_document(b"[1,2]"));
        assert!(!is_json_document(b""));
    }

    #[test]
    fn test_footer() {
        let footer = validate_footer(br#"{"error_log":"","session_log":"line\n"}"#).unwrap();
        assert_eq!(footer.session_log, "line\n");
        assert!(matches!(
            validate_footer(br#"{"error_log":""}"#),
            Err(Error::MissingKey { ref key, .. }) if key == "session_log"
        ));
        assert!(matches!(
            validate_footer(br#"{"error_log":1,"session_log":""}"#),
            Err(Error::InvalidData { .. })
        ));
    }
}
