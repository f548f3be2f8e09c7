//! Tagged property trees.
//!
//! A tag is `name, type, u32 size, u32 index`, a type-specific header, a u8
//! GUID flag (plus GUID), then `size` bytes of value. `BoolProperty` is the
//! odd one out: its value byte sits before the GUID flag and `size` is 0.
//! A tag named `None` ends the tree.
//!
//! The value is always decoded from a reader bounded to exactly `size`
//! bytes. Unknown types, and known types whose value doesn't parse cleanly
//! within that window, are kept as [`PropertyValue::Opaque`] and written back
//! byte for byte.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::containers::{ArrayValue, MapValue, SetValue};
use crate::cursor::{ByteReader, ByteWriter, OpaqueBytes, SavString};
use crate::error::{Result, SavError};
use crate::reference::{ObjectRef, ObjectReference, ReferenceResolver, VisitRefs};
use crate::structs::StructData;

pub const TERMINATOR: &str = "None";

// ── Tree ─────────────────────────────────────────────────

/// Properties in on-disk order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyTree(pub Vec<Property>);

impl PropertyTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Property> {
        self.0.iter_mut()
    }

    /// First property called `name` (array index 0 in practice).
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.0.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.0.iter_mut().find(|p| p.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&PropertyValue> {
        self.get(name).map(|p| &p.value)
    }

    pub fn value_mut(&mut self, name: &str) -> Option<&mut PropertyValue> {
        self.get_mut(name).map(|p| &mut p.value)
    }

    /// Replace the property with the same name and index, or append.
    pub fn insert(&mut self, property: Property) -> Option<Property> {
        match self
            .0
            .iter_mut()
            .find(|p| p.name == property.name.as_str() && p.index == property.index)
        {
            Some(slot) => Some(std::mem::replace(slot, property)),
            None => {
                self.0.push(property);
                None
            }
        }
    }

    /// Remove every property called `name`, returning the first.
    pub fn remove(&mut self, name: &str) -> Option<Property> {
        let pos = self.0.iter().position(|p| p.name == name)?;
        let first = self.0.remove(pos);
        self.0.retain(|p| p.name != name);
        Some(first)
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut props = Vec::new();
        loop {
            let name = r.read_string()?;
            if name == TERMINATOR {
                break;
            }
            props.push(Property::read_tagged(name, r)?);
        }
        Ok(PropertyTree(props))
    }

    pub fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        for prop in &self.0 {
            prop.write(w, refs)?;
        }
        w.write_str(TERMINATOR)
    }
}

impl VisitRefs for PropertyTree {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        for prop in &mut self.0 {
            prop.value.visit_refs(f);
        }
    }
}

// ── Single property ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: SavString,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Uuid>,
    pub value: PropertyValue,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Property {
    pub fn new(name: impl Into<SavString>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            index: 0,
            guid: None,
            value,
        }
    }

    fn read_tagged(name: SavString, r: &mut ByteReader<'_>) -> Result<Self> {
        let type_name = r.read_string()?;
        let size_offset = r.offset();
        let size = r.read_u32()?;
        let index = r.read_u32()?;
        let kind = PropertyKind::from_type_name(type_name.as_str());

        if kind == PropertyKind::Bool {
            let value = r.read_bool8()?;
            let guid = r.read_optional_guid()?;
            if size != 0 {
                return Err(SavError::LengthMismatch {
                    offset: size_offset,
                    what: "BoolProperty",
                    declared: size as u64,
                    actual: 0,
                });
            }
            return Ok(Property {
                name,
                index,
                guid,
                value: PropertyValue::Bool(value),
            });
        }

        let header = TagHeader::read(kind, r)?;
        let guid = r.read_optional_guid()?;
        let value_offset = r.offset();
        let bytes = r.read_bytes(size as usize)?;

        let value = if kind == PropertyKind::Unknown {
            debug!("keeping {name} of unrecognized type {type_name} opaque ({size} bytes)");
            PropertyValue::Opaque {
                type_name,
                header,
                data: OpaqueBytes::from(bytes),
            }
        } else {
            let mut vr = ByteReader::with_base(bytes, value_offset);
            match decode_value(kind, &header, &mut vr).and_then(|v| vr.finish().map(|_| v)) {
                Ok(value) => value,
                Err(e) => {
                    warn!("keeping {name} ({type_name}) opaque: {e}");
                    PropertyValue::Opaque {
                        type_name,
                        header,
                        data: OpaqueBytes::from(bytes),
                    }
                }
            }
        };

        Ok(Property {
            name,
            index,
            guid,
            value,
        })
    }

    pub fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        w.write_string(&self.name)?;
        match &self.value {
            PropertyValue::Opaque { type_name, .. } => w.write_string(type_name)?,
            other => w.write_str(other.type_name())?,
        }

        if let PropertyValue::Bool(value) = self.value {
            w.write_u32(0)?;
            w.write_u32(self.index)?;
            w.write_bool8(value)?;
            return w.write_optional_guid(self.guid.as_ref());
        }

        // Value goes to a scratch buffer first so the size can be computed.
        let mut body = ByteWriter::new();
        self.value.write_value(&mut body, refs)?;
        w.write_u32(body.len_u32("property value")?)?;
        w.write_u32(self.index)?;
        self.value.write_header(w)?;
        w.write_optional_guid(self.guid.as_ref())?;
        w.write_bytes(body.as_slice())
    }
}

// ── Type dispatch ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropertyKind {
    Bool,
    Byte,
    Enum,
    Int8,
    Int,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Str,
    Name,
    Text,
    Object,
    Interface,
    SoftObject,
    Struct,
    Array,
    Set,
    Map,
    Unknown,
}

impl PropertyKind {
    fn from_type_name(name: &str) -> Self {
        match name {
            "BoolProperty" => PropertyKind::Bool,
            "ByteProperty" => PropertyKind::Byte,
            "EnumProperty" => PropertyKind::Enum,
            "Int8Property" => PropertyKind::Int8,
            "IntProperty" => PropertyKind::Int,
            "UInt32Property" => PropertyKind::UInt32,
            "Int64Property" => PropertyKind::Int64,
            "UInt64Property" => PropertyKind::UInt64,
            "FloatProperty" => PropertyKind::Float,
            "DoubleProperty" => PropertyKind::Double,
            "StrProperty" => PropertyKind::Str,
            "NameProperty" => PropertyKind::Name,
            "TextProperty" => PropertyKind::Text,
            "ObjectProperty" => PropertyKind::Object,
            "InterfaceProperty" => PropertyKind::Interface,
            "SoftObjectProperty" => PropertyKind::SoftObject,
            "StructProperty" => PropertyKind::Struct,
            "ArrayProperty" => PropertyKind::Array,
            "SetProperty" => PropertyKind::Set,
            "MapProperty" => PropertyKind::Map,
            _ => PropertyKind::Unknown,
        }
    }
}

/// Type-specific metadata between the tag's index and its GUID flag, kept on
/// opaque values so they can be re-emitted unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagHeader {
    None,
    Enum {
        enum_name: SavString,
    },
    Struct {
        struct_type: SavString,
        struct_guid: Uuid,
    },
    Inner {
        inner_type: SavString,
    },
    Map {
        key_type: SavString,
        value_type: SavString,
    },
}

impl TagHeader {
    fn read(kind: PropertyKind, r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match kind {
            PropertyKind::Byte | PropertyKind::Enum => TagHeader::Enum {
                enum_name: r.read_string()?,
            },
            PropertyKind::Struct => TagHeader::Struct {
                struct_type: r.read_string()?,
                struct_guid: r.read_guid()?,
            },
            PropertyKind::Array | PropertyKind::Set => TagHeader::Inner {
                inner_type: r.read_string()?,
            },
            PropertyKind::Map => TagHeader::Map {
                key_type: r.read_string()?,
                value_type: r.read_string()?,
            },
            _ => TagHeader::None,
        })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            TagHeader::None => Ok(()),
            TagHeader::Enum { enum_name } => w.write_string(enum_name),
            TagHeader::Struct {
                struct_type,
                struct_guid,
            } => {
                w.write_string(struct_type)?;
                w.write_guid(struct_guid)
            }
            TagHeader::Inner { inner_type } => w.write_string(inner_type),
            TagHeader::Map {
                key_type,
                value_type,
            } => {
                w.write_string(key_type)?;
                w.write_string(value_type)
            }
        }
    }
}

fn decode_value(kind: PropertyKind, header: &TagHeader, r: &mut ByteReader<'_>) -> Result<PropertyValue> {
    let offset = r.offset();
    Ok(match (kind, header) {
        (PropertyKind::Byte, TagHeader::Enum { enum_name }) => {
            let value = if *enum_name == TERMINATOR {
                ByteValue::Byte(r.read_u8()?)
            } else {
                ByteValue::Label(r.read_string()?)
            };
            PropertyValue::Byte {
                enum_name: enum_name.clone(),
                value,
            }
        }
        (PropertyKind::Enum, TagHeader::Enum { enum_name }) => PropertyValue::Enum {
            enum_name: enum_name.clone(),
            value: r.read_string()?,
        },
        (PropertyKind::Int8, _) => PropertyValue::Int8(r.read_i8()?),
        (PropertyKind::Int, _) => PropertyValue::Int(r.read_i32()?),
        (PropertyKind::UInt32, _) => PropertyValue::UInt32(r.read_u32()?),
        (PropertyKind::Int64, _) => PropertyValue::Int64(r.read_i64()?),
        (PropertyKind::UInt64, _) => PropertyValue::UInt64(r.read_u64()?),
        (PropertyKind::Float, _) => PropertyValue::Float(r.read_f32()?),
        (PropertyKind::Double, _) => PropertyValue::Double(r.read_f64()?),
        (PropertyKind::Str, _) => PropertyValue::Str(r.read_string()?),
        (PropertyKind::Name, _) => PropertyValue::Name(r.read_string()?),
        (PropertyKind::Text, _) => PropertyValue::Text(TextValue::read(r)?),
        (PropertyKind::Object, _) => PropertyValue::Object(ObjectRef::read(r)?),
        (PropertyKind::Interface, _) => PropertyValue::Interface(ObjectRef::read(r)?),
        (PropertyKind::SoftObject, _) => PropertyValue::SoftObject(SoftObjectRef::read(r)?),
        (
            PropertyKind::Struct,
            TagHeader::Struct {
                struct_type,
                struct_guid,
            },
        ) => PropertyValue::Struct {
            struct_type: struct_type.clone(),
            struct_guid: *struct_guid,
            data: StructData::read(struct_type.as_str(), r)?,
        },
        (PropertyKind::Array, TagHeader::Inner { inner_type }) => {
            PropertyValue::Array(ArrayValue::read(inner_type.clone(), r)?)
        }
        (PropertyKind::Set, TagHeader::Inner { inner_type }) => {
            PropertyValue::Set(SetValue::read(inner_type.clone(), r)?)
        }
        (
            PropertyKind::Map,
            TagHeader::Map {
                key_type,
                value_type,
            },
        ) => PropertyValue::Map(MapValue::read(key_type.clone(), value_type.clone(), r)?),
        _ => return Err(SavError::malformed(offset, format!("no decoder for {kind:?}"))),
    })
}

// ── Values ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PropertyValue {
    Bool(bool),
    Byte {
        enum_name: SavString,
        value: ByteValue,
    },
    Enum {
        enum_name: SavString,
        value: SavString,
    },
    Int8(i8),
    Int(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Str(SavString),
    Name(SavString),
    Text(TextValue),
    Object(ObjectRef),
    Interface(ObjectRef),
    SoftObject(SoftObjectRef),
    Struct {
        struct_type: SavString,
        struct_guid: Uuid,
        data: StructData,
    },
    Array(ArrayValue),
    Set(SetValue),
    Map(MapValue),
    /// Present but uninterpretable; written back verbatim.
    Opaque {
        type_name: SavString,
        header: TagHeader,
        data: OpaqueBytes,
    },
}

impl PropertyValue {
    /// Build a struct value with the all-zero struct GUID every save uses.
    pub fn structure(struct_type: impl Into<SavString>, data: StructData) -> Self {
        PropertyValue::Struct {
            struct_type: struct_type.into(),
            struct_guid: Uuid::nil(),
            data,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            PropertyValue::Bool(_) => "BoolProperty",
            PropertyValue::Byte { .. } => "ByteProperty",
            PropertyValue::Enum { .. } => "EnumProperty",
            PropertyValue::Int8(_) => "Int8Property",
            PropertyValue::Int(_) => "IntProperty",
            PropertyValue::UInt32(_) => "UInt32Property",
            PropertyValue::Int64(_) => "Int64Property",
            PropertyValue::UInt64(_) => "UInt64Property",
            PropertyValue::Float(_) => "FloatProperty",
            PropertyValue::Double(_) => "DoubleProperty",
            PropertyValue::Str(_) => "StrProperty",
            PropertyValue::Name(_) => "NameProperty",
            PropertyValue::Text(_) => "TextProperty",
            PropertyValue::Object(_) => "ObjectProperty",
            PropertyValue::Interface(_) => "InterfaceProperty",
            PropertyValue::SoftObject(_) => "SoftObjectProperty",
            PropertyValue::Struct { .. } => "StructProperty",
            PropertyValue::Array(_) => "ArrayProperty",
            PropertyValue::Set(_) => "SetProperty",
            PropertyValue::Map(_) => "MapProperty",
            PropertyValue::Opaque { type_name, .. } => type_name.as_str(),
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, PropertyValue::Opaque { .. })
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            PropertyValue::Object(r) | PropertyValue::Interface(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut ObjectRef> {
        match self {
            PropertyValue::Object(r) | PropertyValue::Interface(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructData> {
        match self {
            PropertyValue::Struct { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn as_struct_mut(&mut self) -> Option<&mut StructData> {
        match self {
            PropertyValue::Struct { data, .. } => Some(data),
            _ => None,
        }
    }

    fn write_header(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            PropertyValue::Byte { enum_name, .. } | PropertyValue::Enum { enum_name, .. } => {
                w.write_string(enum_name)
            }
            PropertyValue::Struct {
                struct_type,
                struct_guid,
                ..
            } => {
                w.write_string(struct_type)?;
                w.write_guid(struct_guid)
            }
            PropertyValue::Array(array) => w.write_string(&array.inner_type),
            PropertyValue::Set(set) => w.write_string(&set.inner_type),
            PropertyValue::Map(map) => {
                w.write_string(&map.key_type)?;
                w.write_string(&map.value_type)
            }
            PropertyValue::Opaque { header, .. } => header.write(w),
            _ => Ok(()),
        }
    }

    fn write_value(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        match self {
            PropertyValue::Bool(v) => w.write_bool8(*v),
            PropertyValue::Byte { value, .. } => match value {
                ByteValue::Byte(b) => w.write_u8(*b),
                ByteValue::Label(s) => w.write_string(s),
            },
            PropertyValue::Enum { value, .. } => w.write_string(value),
            PropertyValue::Int8(v) => w.write_i8(*v),
            PropertyValue::Int(v) => w.write_i32(*v),
            PropertyValue::UInt32(v) => w.write_u32(*v),
            PropertyValue::Int64(v) => w.write_i64(*v),
            PropertyValue::UInt64(v) => w.write_u64(*v),
            PropertyValue::Float(v) => w.write_f32(*v),
            PropertyValue::Double(v) => w.write_f64(*v),
            PropertyValue::Str(s) | PropertyValue::Name(s) => w.write_string(s),
            PropertyValue::Text(text) => text.write(w),
            PropertyValue::Object(r) | PropertyValue::Interface(r) => r.write(w, refs),
            PropertyValue::SoftObject(soft) => soft.write(w),
            PropertyValue::Struct { data, .. } => data.write(w, refs),
            PropertyValue::Array(array) => array.write(w, refs),
            PropertyValue::Set(set) => set.write(w, refs),
            PropertyValue::Map(map) => map.write(w, refs),
            PropertyValue::Opaque { data, .. } => w.write_bytes(data.as_slice()),
        }
    }
}

impl VisitRefs for PropertyValue {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        match self {
            PropertyValue::Object(r) | PropertyValue::Interface(r) => f(r),
            PropertyValue::Struct { data, .. } => data.visit_refs(f),
            PropertyValue::Array(array) => array.visit_refs(f),
            PropertyValue::Set(set) => set.visit_refs(f),
            PropertyValue::Map(map) => map.visit_refs(f),
            _ => {}
        }
    }
}

/// `ByteProperty` holds a raw byte when its enum is `None`, otherwise the
/// enumerator name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ByteValue {
    Byte(u8),
    Label(SavString),
}

/// Soft references name assets or objects by path only and are never
/// linked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftObjectRef {
    pub reference: ObjectReference,
    /// Word following the path; zero in every known save.
    pub sub_path: u32,
}

impl SoftObjectRef {
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            reference: ObjectReference::read(r)?,
            sub_path: r.read_u32()?,
        })
    }

    pub fn write(&self, w: &mut ByteWriter) -> Result<()> {
        self.reference.write(w)?;
        w.write_u32(self.sub_path)
    }
}

// ── Text ─────────────────────────────────────────────────

const HISTORY_BASE: u8 = 0;
const HISTORY_NONE: u8 = 255;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextValue {
    pub flags: u32,
    pub history: TextHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "history", rename_all = "snake_case")]
pub enum TextHistory {
    /// Localizable text keyed into a string table.
    Base {
        namespace: SavString,
        key: SavString,
        source: SavString,
    },
    /// Plain text with an optional culture-invariant string.
    None { culture_invariant: Option<SavString> },
}

impl TextValue {
    pub fn plain(text: impl Into<SavString>) -> Self {
        Self {
            flags: 0,
            history: TextHistory::None {
                culture_invariant: Some(text.into()),
            },
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let flags = r.read_u32()?;
        let offset = r.offset();
        let history = match r.read_u8()? {
            HISTORY_BASE => TextHistory::Base {
                namespace: r.read_string()?,
                key: r.read_string()?,
                source: r.read_string()?,
            },
            HISTORY_NONE => TextHistory::None {
                culture_invariant: if r.read_bool32()? {
                    Some(r.read_string()?)
                } else {
                    None
                },
            },
            other => {
                return Err(SavError::malformed(offset, format!("text history type {other}")));
            }
        };
        Ok(Self { flags, history })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u32(self.flags)?;
        match &self.history {
            TextHistory::Base {
                namespace,
                key,
                source,
            } => {
                w.write_u8(HISTORY_BASE)?;
                w.write_string(namespace)?;
                w.write_string(key)?;
                w.write_string(source)
            }
            TextHistory::None { culture_invariant } => {
                w.write_u8(HISTORY_NONE)?;
                w.write_bool32(culture_invariant.is_some())?;
                match culture_invariant {
                    Some(s) => w.write_string(s),
                    None => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Hand-assembled tag, the way the game writes it.
    pub(crate) fn raw_tag(name: &str, type_name: &str, header: &[u8], value: &[u8]) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_str(name).unwrap();
        w.write_str(type_name).unwrap();
        w.write_u32(value.len() as u32).unwrap();
        w.write_u32(0).unwrap();
        w.write_bytes(header).unwrap();
        w.write_u8(0).unwrap();
        w.write_bytes(value).unwrap();
        w.into_inner()
    }

    pub(crate) fn terminated(parts: &[Vec<u8>]) -> Vec<u8> {
        let mut out: Vec<u8> = parts.concat();
        let mut w = ByteWriter::new();
        w.write_str(TERMINATOR).unwrap();
        out.extend_from_slice(w.as_slice());
        out
    }

    fn reencode(tree: &PropertyTree) -> Vec<u8> {
        let mut w = ByteWriter::new();
        tree.write(&mut w, &ReferenceResolver::default()).unwrap();
        w.into_inner()
    }

    fn string_bytes(s: &str) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_str(s).unwrap();
        w.into_inner()
    }

    #[test]
    fn test_scalars_round_trip_bit_exact() {
        let mut bool_tag = ByteWriter::new();
        bool_tag.write_str("mIsOn").unwrap();
        bool_tag.write_str("BoolProperty").unwrap();
        bool_tag.write_u32(0).unwrap();
        bool_tag.write_u32(0).unwrap();
        bool_tag.write_u8(1).unwrap();
        bool_tag.write_u8(0).unwrap();

        let raw = terminated(&[
            bool_tag.into_inner(),
            raw_tag("mCount", "IntProperty", &[], &(-7i32).to_le_bytes()),
            raw_tag("mRate", "FloatProperty", &[], &1.5f32.to_le_bytes()),
            raw_tag("mTotal", "Int64Property", &[], &(1i64 << 40).to_le_bytes()),
            raw_tag("mLabel", "StrProperty", &[], &string_bytes("Iron Plate")),
            raw_tag("mPhase", "ByteProperty", &string_bytes("None"), &[3]),
            raw_tag(
                "mGamePhase",
                "ByteProperty",
                &string_bytes("EGamePhase"),
                &string_bytes("EGP_EarlyGame"),
            ),
        ]);
        let mut r = ByteReader::new(&raw);
        let tree = PropertyTree::read(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.value("mIsOn"), Some(&PropertyValue::Bool(true)));
        assert_eq!(tree.value("mCount"), Some(&PropertyValue::Int(-7)));
        assert!(matches!(
            tree.value("mPhase"),
            Some(PropertyValue::Byte {
                value: ByteValue::Byte(3),
                ..
            })
        ));
        assert!(matches!(
            tree.value("mGamePhase"),
            Some(PropertyValue::Byte {
                value: ByteValue::Label(_),
                ..
            })
        ));
        assert_eq!(reencode(&tree), raw);
    }

    #[test]
    fn test_unknown_type_is_opaque_and_verbatim() {
        let payload = [9u8, 8, 7, 6, 5, 4, 3, 2, 1];
        let raw = terminated(&[
            raw_tag("mBefore", "IntProperty", &[], &1i32.to_le_bytes()),
            raw_tag("mMystery", "FancyNewProperty", &[], &payload),
            raw_tag("mAfter", "IntProperty", &[], &2i32.to_le_bytes()),
        ]);
        let tree = PropertyTree::read(&mut ByteReader::new(&raw)).unwrap();
        match tree.value("mMystery") {
            Some(PropertyValue::Opaque { type_name, header, data }) => {
                assert_eq!(type_name.as_str(), "FancyNewProperty");
                assert_eq!(*header, TagHeader::None);
                assert_eq!(data.as_slice(), &payload);
            }
            other => panic!("expected opaque, got {other:?}"),
        }
        assert_eq!(tree.value("mAfter"), Some(&PropertyValue::Int(2)));
        assert_eq!(reencode(&tree), raw);
    }

    #[test]
    fn test_known_type_with_unexpected_payload_falls_back() {
        // An IntProperty claiming 6 bytes can't be an i32.
        let raw = terminated(&[raw_tag("mOdd", "IntProperty", &[], &[1, 2, 3, 4, 5, 6])]);
        let tree = PropertyTree::read(&mut ByteReader::new(&raw)).unwrap();
        assert!(tree.value("mOdd").unwrap().is_opaque());
        assert_eq!(reencode(&tree), raw);

        // A struct whose layout we don't know and that isn't a property bag.
        let mut header = string_bytes("SomeEngineStruct");
        header.extend_from_slice(&[0u8; 16]);
        let raw = terminated(&[raw_tag("mBlob", "StructProperty", &header, &[0xAA; 5])]);
        let tree = PropertyTree::read(&mut ByteReader::new(&raw)).unwrap();
        match tree.value("mBlob") {
            Some(PropertyValue::Opaque { header, .. }) => {
                assert!(matches!(header, TagHeader::Struct { .. }));
            }
            other => panic!("expected opaque, got {other:?}"),
        }
        assert_eq!(reencode(&tree), raw);
    }

    #[test]
    fn test_sizes_are_recomputed_after_edit() {
        let raw = terminated(&[raw_tag("mName", "StrProperty", &[], &string_bytes("abc"))]);
        let mut tree = PropertyTree::read(&mut ByteReader::new(&raw)).unwrap();
        if let Some(PropertyValue::Str(s)) = tree.value_mut("mName") {
            s.set("a much longer name");
        }
        let out = reencode(&tree);
        let back = PropertyTree::read(&mut ByteReader::new(&out)).unwrap();
        assert_eq!(
            back.value("mName"),
            Some(&PropertyValue::Str(SavString::new("a much longer name")))
        );
        let expected = terminated(&[raw_tag(
            "mName",
            "StrProperty",
            &[],
            &string_bytes("a much longer name"),
        )]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_text_histories() {
        let mut none = ByteWriter::new();
        none.write_u32(2).unwrap();
        none.write_u8(255).unwrap();
        none.write_u32(1).unwrap();
        none.write_str("Main Base").unwrap();

        let mut base = ByteWriter::new();
        base.write_u32(0).unwrap();
        base.write_u8(0).unwrap();
        base.write_str("").unwrap();
        base.write_str("4F1E").unwrap();
        base.write_str("Hello").unwrap();

        let raw = terminated(&[
            raw_tag("mSign", "TextProperty", &[], none.as_slice()),
            raw_tag("mLocal", "TextProperty", &[], base.as_slice()),
        ]);
        let tree = PropertyTree::read(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(
            tree.value("mSign"),
            Some(&PropertyValue::Text(TextValue {
                flags: 2,
                history: TextHistory::None {
                    culture_invariant: Some(SavString::new("Main Base"))
                }
            }))
        );
        assert!(matches!(
            tree.value("mLocal"),
            Some(PropertyValue::Text(TextValue {
                history: TextHistory::Base { .. },
                ..
            }))
        ));
        assert_eq!(reencode(&tree), raw);
    }

    #[test]
    fn test_tree_editing_keeps_order() {
        let mut tree = PropertyTree::new();
        tree.insert(Property::new("a", PropertyValue::Int(1)));
        tree.insert(Property::new("b", PropertyValue::Int(2)));
        tree.insert(Property::new("c", PropertyValue::Int(3)));
        let old = tree.insert(Property::new("b", PropertyValue::Int(20)));
        assert_eq!(old.map(|p| p.value), Some(PropertyValue::Int(2)));
        let names: Vec<&str> = tree.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(tree.remove("a").is_some());
        assert_eq!(tree.len(), 2);
        assert!(tree.remove("zzz").is_none());
    }

    #[test]
    fn test_bool_with_nonzero_size_is_rejected() {
        let mut w = ByteWriter::new();
        w.write_str("mFlag").unwrap();
        w.write_str("BoolProperty").unwrap();
        w.write_u32(1).unwrap();
        w.write_u32(0).unwrap();
        w.write_u8(0).unwrap();
        w.write_u8(0).unwrap();
        let raw = terminated(&[w.into_inner()]);
        assert!(matches!(
            PropertyTree::read(&mut ByteReader::new(&raw)).unwrap_err(),
            SavError::LengthMismatch { .. }
        ));
    }

    #[test]
    fn test_json_round_trip_preserves_opaque() {
        let raw = terminated(&[
            raw_tag("mMystery", "FancyNewProperty", &[], &[1, 2, 3]),
            raw_tag("mCount", "IntProperty", &[], &5i32.to_le_bytes()),
        ]);
        let tree = PropertyTree::read(&mut ByteReader::new(&raw)).unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        let back: PropertyTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
        assert_eq!(reencode(&back), raw);
    }
}
