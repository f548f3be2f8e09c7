//! Array, set and map values.
//!
//! Containers name their element type once in the tag header; elements are
//! decoded with that type instead of carrying tags of their own. Struct
//! arrays are the exception: they embed a second, inner tag naming the
//! struct type.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::{ByteReader, ByteWriter, SavString};
use crate::error::{Result, SavError};
use crate::property::SoftObjectRef;
use crate::reference::{ObjectRef, ReferenceResolver, VisitRefs};
use crate::structs::StructData;

const STRUCT_PROPERTY: &str = "StructProperty";
/// Set elements of struct type are bare 16-byte keys.
const SET_STRUCT_LAYOUT: &str = "Guid";
/// Map keys of struct type are integer cell coordinates.
const MAP_KEY_STRUCT_LAYOUT: &str = "IntVector";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Bool,
    Byte,
    Int8,
    Int,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Str,
    Object,
    SoftObject,
    Struct,
}

impl ElementKind {
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "BoolProperty" => ElementKind::Bool,
            "ByteProperty" => ElementKind::Byte,
            "Int8Property" => ElementKind::Int8,
            "IntProperty" => ElementKind::Int,
            "UInt32Property" => ElementKind::UInt32,
            "Int64Property" => ElementKind::Int64,
            "UInt64Property" => ElementKind::UInt64,
            "FloatProperty" => ElementKind::Float,
            "DoubleProperty" => ElementKind::Double,
            "StrProperty" | "NameProperty" | "EnumProperty" => ElementKind::Str,
            "ObjectProperty" | "InterfaceProperty" => ElementKind::Object,
            "SoftObjectProperty" => ElementKind::SoftObject,
            STRUCT_PROPERTY => ElementKind::Struct,
            _ => return None,
        })
    }
}

fn unknown_element(r: &ByteReader<'_>, type_name: &str) -> SavError {
    SavError::malformed(r.offset(), format!("no element decoder for {type_name}"))
}

fn read_count(r: &mut ByteReader<'_>) -> Result<(u32, usize)> {
    let count = r.read_u32()?;
    // Never pre-allocate more slots than there are bytes left.
    Ok((count, (count as usize).min(r.remaining())))
}

fn read_n<'a, T>(
    count: u32,
    capacity: usize,
    r: &mut ByteReader<'a>,
    mut f: impl FnMut(&mut ByteReader<'a>) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(capacity);
    for _ in 0..count {
        out.push(f(r)?);
    }
    Ok(out)
}

// ── Single element ───────────────────────────────────────

/// One map key or value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Element {
    Bool(bool),
    Byte(u8),
    Int8(i8),
    Int(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Str(SavString),
    Object(ObjectRef),
    SoftObject(SoftObjectRef),
    Struct(StructData),
}

impl Element {
    pub fn kind(&self) -> ElementKind {
        match self {
            Element::Bool(_) => ElementKind::Bool,
            Element::Byte(_) => ElementKind::Byte,
            Element::Int8(_) => ElementKind::Int8,
            Element::Int(_) => ElementKind::Int,
            Element::UInt32(_) => ElementKind::UInt32,
            Element::Int64(_) => ElementKind::Int64,
            Element::UInt64(_) => ElementKind::UInt64,
            Element::Float(_) => ElementKind::Float,
            Element::Double(_) => ElementKind::Double,
            Element::Str(_) => ElementKind::Str,
            Element::Object(_) => ElementKind::Object,
            Element::SoftObject(_) => ElementKind::SoftObject,
            Element::Struct(_) => ElementKind::Struct,
        }
    }

    /// `struct_layout` picks the struct decoder; `None` reads a property
    /// tree.
    fn read(kind: ElementKind, struct_layout: Option<&str>, r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match kind {
            ElementKind::Bool => Element::Bool(r.read_bool8()?),
            ElementKind::Byte => Element::Byte(r.read_u8()?),
            ElementKind::Int8 => Element::Int8(r.read_i8()?),
            ElementKind::Int => Element::Int(r.read_i32()?),
            ElementKind::UInt32 => Element::UInt32(r.read_u32()?),
            ElementKind::Int64 => Element::Int64(r.read_i64()?),
            ElementKind::UInt64 => Element::UInt64(r.read_u64()?),
            ElementKind::Float => Element::Float(r.read_f32()?),
            ElementKind::Double => Element::Double(r.read_f64()?),
            ElementKind::Str => Element::Str(r.read_string()?),
            ElementKind::Object => Element::Object(ObjectRef::read(r)?),
            ElementKind::SoftObject => Element::SoftObject(SoftObjectRef::read(r)?),
            ElementKind::Struct => Element::Struct(match struct_layout {
                Some(layout) => StructData::read(layout, r)?,
                None => StructData::read_properties(r)?,
            }),
        })
    }

    fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        match self {
            Element::Bool(v) => w.write_bool8(*v),
            Element::Byte(v) => w.write_u8(*v),
            Element::Int8(v) => w.write_i8(*v),
            Element::Int(v) => w.write_i32(*v),
            Element::UInt32(v) => w.write_u32(*v),
            Element::Int64(v) => w.write_i64(*v),
            Element::UInt64(v) => w.write_u64(*v),
            Element::Float(v) => w.write_f32(*v),
            Element::Double(v) => w.write_f64(*v),
            Element::Str(s) => w.write_string(s),
            Element::Object(r) => r.write(w, refs),
            Element::SoftObject(soft) => soft.write(w),
            Element::Struct(data) => data.write(w, refs),
        }
    }
}

impl VisitRefs for Element {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        match self {
            Element::Object(r) => f(r),
            Element::Struct(data) => data.visit_refs(f),
            _ => {}
        }
    }
}

// ── Homogeneous lists ────────────────────────────────────

/// Elements of an array or set, all of one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum ElementList {
    Bool(Vec<bool>),
    Byte(Vec<u8>),
    Int8(Vec<i8>),
    Int(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Str(Vec<SavString>),
    Object(Vec<ObjectRef>),
    SoftObject(Vec<SoftObjectRef>),
    Struct(Vec<StructData>),
}

impl ElementList {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementList::Bool(_) => ElementKind::Bool,
            ElementList::Byte(_) => ElementKind::Byte,
            ElementList::Int8(_) => ElementKind::Int8,
            ElementList::Int(_) => ElementKind::Int,
            ElementList::UInt32(_) => ElementKind::UInt32,
            ElementList::Int64(_) => ElementKind::Int64,
            ElementList::UInt64(_) => ElementKind::UInt64,
            ElementList::Float(_) => ElementKind::Float,
            ElementList::Double(_) => ElementKind::Double,
            ElementList::Str(_) => ElementKind::Str,
            ElementList::Object(_) => ElementKind::Object,
            ElementList::SoftObject(_) => ElementKind::SoftObject,
            ElementList::Struct(_) => ElementKind::Struct,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ElementList::Bool(v) => v.len(),
            ElementList::Byte(v) => v.len(),
            ElementList::Int8(v) => v.len(),
            ElementList::Int(v) => v.len(),
            ElementList::UInt32(v) => v.len(),
            ElementList::Int64(v) => v.len(),
            ElementList::UInt64(v) => v.len(),
            ElementList::Float(v) => v.len(),
            ElementList::Double(v) => v.len(),
            ElementList::Str(v) => v.len(),
            ElementList::Object(v) => v.len(),
            ElementList::SoftObject(v) => v.len(),
            ElementList::Struct(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        kind: ElementKind,
        count: u32,
        capacity: usize,
        struct_layout: Option<&str>,
        r: &mut ByteReader<'_>,
    ) -> Result<Self> {
        Ok(match kind {
            ElementKind::Bool => ElementList::Bool(read_n(count, capacity, r, |r| r.read_bool8())?),
            ElementKind::Byte => ElementList::Byte(r.read_bytes(count as usize)?.to_vec()),
            ElementKind::Int8 => ElementList::Int8(read_n(count, capacity, r, |r| r.read_i8())?),
            ElementKind::Int => ElementList::Int(read_n(count, capacity, r, |r| r.read_i32())?),
            ElementKind::UInt32 => ElementList::UInt32(read_n(count, capacity, r, |r| r.read_u32())?),
            ElementKind::Int64 => ElementList::Int64(read_n(count, capacity, r, |r| r.read_i64())?),
            ElementKind::UInt64 => ElementList::UInt64(read_n(count, capacity, r, |r| r.read_u64())?),
            ElementKind::Float => ElementList::Float(read_n(count, capacity, r, |r| r.read_f32())?),
            ElementKind::Double => ElementList::Double(read_n(count, capacity, r, |r| r.read_f64())?),
            ElementKind::Str => ElementList::Str(read_n(count, capacity, r, |r| r.read_string())?),
            ElementKind::Object => ElementList::Object(read_n(count, capacity, r, ObjectRef::read)?),
            ElementKind::SoftObject => {
                ElementList::SoftObject(read_n(count, capacity, r, SoftObjectRef::read)?)
            }
            ElementKind::Struct => ElementList::Struct(read_n(count, capacity, r, |r| match struct_layout {
                Some(layout) => StructData::read(layout, r),
                None => StructData::read_properties(r),
            })?),
        })
    }

    fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        match self {
            ElementList::Bool(v) => v.iter().try_for_each(|x| w.write_bool8(*x)),
            ElementList::Byte(v) => w.write_bytes(v),
            ElementList::Int8(v) => v.iter().try_for_each(|x| w.write_i8(*x)),
            ElementList::Int(v) => v.iter().try_for_each(|x| w.write_i32(*x)),
            ElementList::UInt32(v) => v.iter().try_for_each(|x| w.write_u32(*x)),
            ElementList::Int64(v) => v.iter().try_for_each(|x| w.write_i64(*x)),
            ElementList::UInt64(v) => v.iter().try_for_each(|x| w.write_u64(*x)),
            ElementList::Float(v) => v.iter().try_for_each(|x| w.write_f32(*x)),
            ElementList::Double(v) => v.iter().try_for_each(|x| w.write_f64(*x)),
            ElementList::Str(v) => v.iter().try_for_each(|s| w.write_string(s)),
            ElementList::Object(v) => v.iter().try_for_each(|r| r.write(w, refs)),
            ElementList::SoftObject(v) => v.iter().try_for_each(|s| s.write(w)),
            ElementList::Struct(v) => v.iter().try_for_each(|d| d.write(w, refs)),
        }
    }
}

impl VisitRefs for ElementList {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        match self {
            ElementList::Object(refs) => refs.iter_mut().for_each(|r| f(r)),
            ElementList::Struct(items) => items.visit_refs(f),
            _ => {}
        }
    }
}

fn check_kind(declared: &SavString, actual: ElementKind) -> Result<()> {
    match ElementKind::from_type_name(declared.as_str()) {
        Some(kind) if kind == actual => Ok(()),
        _ => Err(SavError::malformed(
            0,
            format!("{actual:?} elements in a container declared as {declared}"),
        )),
    }
}

// ── Array ────────────────────────────────────────────────

/// Inner tag that precedes the elements of a struct array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructArrayTag {
    pub name: SavString,
    pub struct_type: SavString,
    #[serde(default)]
    pub index: u32,
    pub struct_guid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    pub inner_type: SavString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub struct_tag: Option<StructArrayTag>,
    pub elements: ElementList,
}

impl ArrayValue {
    pub fn read(inner_type: SavString, r: &mut ByteReader<'_>) -> Result<Self> {
        let kind = ElementKind::from_type_name(inner_type.as_str())
            .ok_or_else(|| unknown_element(r, inner_type.as_str()))?;
        let (count, capacity) = read_count(r)?;

        if kind != ElementKind::Struct {
            let elements = ElementList::read(kind, count, capacity, None, r)?;
            return Ok(Self {
                inner_type,
                struct_tag: None,
                elements,
            });
        }

        let name = r.read_string()?;
        let tag_offset = r.offset();
        let tag_type = r.read_string()?;
        if tag_type != STRUCT_PROPERTY {
            return Err(SavError::malformed(
                tag_offset,
                format!("struct array inner tag has type {tag_type}"),
            ));
        }
        let size = r.read_u32()?;
        let index = r.read_u32()?;
        let struct_type = r.read_string()?;
        let struct_guid = r.read_guid()?;
        let guid = r.read_optional_guid()?;

        let start = r.offset();
        let mut body = r.sub_reader(size as usize)?;
        let elements = ElementList::read(kind, count, capacity, Some(struct_type.as_str()), &mut body)?;
        if !body.is_empty() {
            return Err(SavError::LengthMismatch {
                offset: start,
                what: "struct array",
                declared: size as u64,
                actual: (size as usize - body.remaining()) as u64,
            });
        }

        Ok(Self {
            inner_type,
            struct_tag: Some(StructArrayTag {
                name,
                struct_type,
                index,
                struct_guid,
                guid,
            }),
            elements,
        })
    }

    pub fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        let kind = self.elements.kind();
        check_kind(&self.inner_type, kind)?;
        if self.struct_tag.is_some() != (kind == ElementKind::Struct) {
            return Err(SavError::malformed(
                0,
                format!(
                    "{} array {} an inner struct tag",
                    self.inner_type,
                    if self.struct_tag.is_some() { "carries" } else { "lacks" }
                ),
            ));
        }
        w.write_u32(self.elements.len() as u32)?;
        let Some(tag) = &self.struct_tag else {
            return self.elements.write(w, refs);
        };

        let mut body = ByteWriter::new();
        self.elements.write(&mut body, refs)?;
        w.write_string(&tag.name)?;
        w.write_str(STRUCT_PROPERTY)?;
        w.write_u32(body.len_u32("struct array")?)?;
        w.write_u32(tag.index)?;
        w.write_string(&tag.struct_type)?;
        w.write_guid(&tag.struct_guid)?;
        w.write_optional_guid(tag.guid.as_ref())?;
        w.write_bytes(body.as_slice())
    }
}

impl VisitRefs for ArrayValue {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        self.elements.visit_refs(f)
    }
}

// ── Set ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetValue {
    pub inner_type: SavString,
    pub elements: ElementList,
}

impl SetValue {
    pub fn read(inner_type: SavString, r: &mut ByteReader<'_>) -> Result<Self> {
        let kind = ElementKind::from_type_name(inner_type.as_str())
            .ok_or_else(|| unknown_element(r, inner_type.as_str()))?;
        r.expect_u32(0, "set removal count")?;
        let (count, capacity) = read_count(r)?;
        let elements = ElementList::read(kind, count, capacity, Some(SET_STRUCT_LAYOUT), r)?;
        Ok(Self {
            inner_type,
            elements,
        })
    }

    pub fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        check_kind(&self.inner_type, self.elements.kind())?;
        w.write_u32(0)?;
        w.write_u32(self.elements.len() as u32)?;
        self.elements.write(w, refs)
    }
}

impl VisitRefs for SetValue {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        self.elements.visit_refs(f)
    }
}

// ── Map ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub key: Element,
    pub value: Element,
}

/// Entries keep their on-disk order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    pub key_type: SavString,
    pub value_type: SavString,
    pub entries: Vec<MapEntry>,
}

impl MapValue {
    pub fn read(key_type: SavString, value_type: SavString, r: &mut ByteReader<'_>) -> Result<Self> {
        let key_kind = ElementKind::from_type_name(key_type.as_str())
            .ok_or_else(|| unknown_element(r, key_type.as_str()))?;
        let value_kind = ElementKind::from_type_name(value_type.as_str())
            .ok_or_else(|| unknown_element(r, value_type.as_str()))?;
        r.expect_u32(0, "map removal count")?;
        let (count, capacity) = read_count(r)?;
        let entries = read_n(count, capacity, r, |r| {
            Ok(MapEntry {
                key: Element::read(key_kind, Some(MAP_KEY_STRUCT_LAYOUT), r)?,
                value: Element::read(value_kind, None, r)?,
            })
        })?;
        Ok(Self {
            key_type,
            value_type,
            entries,
        })
    }

    pub fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        w.write_u32(0)?;
        w.write_u32(self.entries.len() as u32)?;
        for entry in &self.entries {
            check_kind(&self.key_type, entry.key.kind())?;
            check_kind(&self.value_type, entry.value.kind())?;
            entry.key.write(w, refs)?;
            entry.value.write(w, refs)?;
        }
        Ok(())
    }
}

impl VisitRefs for MapValue {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        for entry in &mut self.entries {
            entry.key.visit_refs(f);
            entry.value.visit_refs(f);
        }
    }
}
