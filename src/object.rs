//! Object headers, object bodies and the per-level blocks that hold them.
//!
//! A level stores all of its headers first and all of its bodies second,
//! pairwise by position. Here each header travels with its body in one
//! [`SaveObject`] so the two lists can never drift apart.

use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::{ByteReader, ByteWriter, OpaqueBytes, SavString};
use crate::error::{Result, SavError};
use crate::property::PropertyTree;
use crate::reference::{ObjectId, ObjectRef, ObjectReference, ReferenceResolver, VisitRefs};
use crate::trailer::ObjectTrailer;

const KIND_COMPONENT: u32 = 0;
const KIND_ACTOR: u32 = 1;

/// Object game version written by current builds.
pub const DEFAULT_OBJECT_GAME_VERSION: u32 = 46;

// ── Header ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub class_path: SavString,
    pub root_object: SavString,
    pub instance_name: SavString,
    pub kind: HeaderKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeaderKind {
    Actor(ActorPlacement),
    Component { parent_actor: SavString },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorPlacement {
    pub need_transform: u32,
    pub rotation: [f32; 4],
    pub position: [f32; 3],
    pub scale: [f32; 3],
    pub placed_in_level: u32,
}

impl Default for ActorPlacement {
    fn default() -> Self {
        Self {
            need_transform: 0,
            rotation: [0.0, 0.0, 0.0, 1.0],
            position: [0.0; 3],
            scale: [1.0; 3],
            placed_in_level: 0,
        }
    }
}

fn read_f32s<const N: usize>(r: &mut ByteReader<'_>) -> Result<[f32; N]> {
    let mut out = [0f32; N];
    for v in &mut out {
        *v = r.read_f32()?;
    }
    Ok(out)
}

impl ObjectHeader {
    pub fn is_actor(&self) -> bool {
        matches!(self.kind, HeaderKind::Actor(_))
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let offset = r.offset();
        let kind = r.read_u32()?;
        if kind != KIND_ACTOR && kind != KIND_COMPONENT {
            return Err(SavError::malformed(offset, format!("object header kind {kind}")));
        }
        let class_path = r.read_string()?;
        let root_object = r.read_string()?;
        let instance_name = r.read_string()?;
        let kind = if kind == KIND_ACTOR {
            HeaderKind::Actor(ActorPlacement {
                need_transform: r.read_u32()?,
                rotation: read_f32s(r)?,
                position: read_f32s(r)?,
                scale: read_f32s(r)?,
                placed_in_level: r.read_u32()?,
            })
        } else {
            HeaderKind::Component {
                parent_actor: r.read_string()?,
            }
        };
        Ok(Self {
            class_path,
            root_object,
            instance_name,
            kind,
        })
    }

    pub fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u32(if self.is_actor() { KIND_ACTOR } else { KIND_COMPONENT })?;
        w.write_string(&self.class_path)?;
        w.write_string(&self.root_object)?;
        w.write_string(&self.instance_name)?;
        match &self.kind {
            HeaderKind::Actor(p) => {
                w.write_u32(p.need_transform)?;
                for v in p.rotation.iter().chain(&p.position).chain(&p.scale) {
                    w.write_f32(*v)?;
                }
                w.write_u32(p.placed_in_level)
            }
            HeaderKind::Component { parent_actor } => w.write_string(parent_actor),
        }
    }
}

// ── Body ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectBody {
    pub game_version: u32,
    pub migrate_to_persistent: u32,
    pub content: BodyContent,
}

/// A body is either still the bytes it was read from, or decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", content = "data", rename_all = "snake_case")]
pub enum BodyContent {
    Raw(OpaqueBytes),
    Decoded(ObjectData),
}

impl ObjectBody {
    pub fn decoded(data: ObjectData) -> Self {
        Self {
            game_version: DEFAULT_OBJECT_GAME_VERSION,
            migrate_to_persistent: 0,
            content: BodyContent::Decoded(data),
        }
    }

    pub fn is_decoded(&self) -> bool {
        matches!(self.content, BodyContent::Decoded(_))
    }

    pub fn data(&self) -> Option<&ObjectData> {
        match &self.content {
            BodyContent::Decoded(data) => Some(data),
            BodyContent::Raw(_) => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut ObjectData> {
        match &mut self.content {
            BodyContent::Decoded(data) => Some(data),
            BodyContent::Raw(_) => None,
        }
    }

    /// Reads the framing and either decodes the payload or keeps it raw.
    pub fn read(header: &ObjectHeader, r: &mut ByteReader<'_>, lazy: bool) -> Result<Self> {
        let game_version = r.read_u32()?;
        let migrate_to_persistent = r.read_u32()?;
        let size = r.read_u32()?;
        let mut payload = r.sub_reader(size as usize)?;
        let content = if lazy {
            BodyContent::Raw(OpaqueBytes::from(payload.read_rest()?))
        } else {
            BodyContent::Decoded(ObjectData::read(header, &mut payload)?)
        };
        Ok(Self {
            game_version,
            migrate_to_persistent,
            content,
        })
    }

    /// Decode a raw body in place. No-op for decoded bodies.
    pub fn materialize(&mut self, header: &ObjectHeader) -> Result<()> {
        if let BodyContent::Raw(bytes) = &self.content {
            let data = ObjectData::read(header, &mut ByteReader::new(bytes.as_slice()))?;
            self.content = BodyContent::Decoded(data);
        }
        Ok(())
    }

    pub fn write(&self, header: &ObjectHeader, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        w.write_u32(self.game_version)?;
        w.write_u32(self.migrate_to_persistent)?;
        match &self.content {
            BodyContent::Raw(bytes) => {
                w.write_u32(bytes.len() as u32)?;
                w.write_bytes(bytes.as_slice())
            }
            BodyContent::Decoded(data) => {
                let mut payload = ByteWriter::new();
                data.write(header, &mut payload, refs)?;
                w.write_u32(payload.len_u32("object body")?)?;
                w.write_bytes(payload.as_slice())
            }
        }
    }
}

impl VisitRefs for ObjectBody {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        if let BodyContent::Decoded(data) = &mut self.content {
            data.visit_refs(f);
        }
    }
}

/// Decoded body payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectData {
    /// Present exactly for actors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorLinks>,
    pub properties: PropertyTree,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_guid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "ObjectTrailer::is_none")]
    pub trailer: ObjectTrailer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorLinks {
    pub parent: ObjectRef,
    pub components: Vec<ObjectRef>,
}

impl ObjectData {
    /// Empty payload of the right shape for `header`.
    pub fn empty_for(header: &ObjectHeader) -> Self {
        Self {
            actor: header.is_actor().then(ActorLinks::default),
            properties: PropertyTree::new(),
            object_guid: None,
            trailer: ObjectTrailer::None,
        }
    }

    /// `r` must be bounded to exactly the body's bytes.
    pub fn read(header: &ObjectHeader, r: &mut ByteReader<'_>) -> Result<Self> {
        let actor = if header.is_actor() {
            Some(ActorLinks {
                parent: ObjectRef::read(r)?,
                components: ObjectRef::read_list(r)?,
            })
        } else {
            None
        };
        let properties = PropertyTree::read(r)?;
        let object_guid = if r.read_bool32()? { Some(r.read_guid()?) } else { None };
        let trailer = ObjectTrailer::read(header, r.read_rest()?);
        Ok(Self {
            actor,
            properties,
            object_guid,
            trailer,
        })
    }

    pub fn write(&self, header: &ObjectHeader, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        match (&self.actor, header.is_actor()) {
            (Some(links), true) => {
                links.parent.write(w, refs)?;
                ObjectRef::write_list(&links.components, w, refs)?;
            }
            (None, false) => {}
            (_, is_actor) => {
                return Err(SavError::malformed(
                    0,
                    format!(
                        "{}: actor links {} but header is {}",
                        header.instance_name,
                        if self.actor.is_some() { "present" } else { "missing" },
                        if is_actor { "an actor" } else { "a component" },
                    ),
                ));
            }
        }
        self.properties.write(w, refs)?;
        w.write_bool32(self.object_guid.is_some())?;
        if let Some(guid) = &self.object_guid {
            w.write_guid(guid)?;
        }
        self.trailer.write(w, refs)
    }
}

impl VisitRefs for ObjectData {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        if let Some(links) = &mut self.actor {
            f(&mut links.parent);
            links.components.visit_refs(f);
        }
        self.properties.visit_refs(f);
        self.trailer.visit_refs(f);
    }
}

// ── Object ───────────────────────────────────────────────

/// One persisted object: its header and its body, plus a stable handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveObject {
    #[serde(skip)]
    pub id: ObjectId,
    pub header: ObjectHeader,
    pub body: ObjectBody,
}

impl SaveObject {
    /// A new actor with default placement and an empty body. The handle is
    /// assigned when it is added to a save.
    pub fn actor(
        class_path: impl Into<SavString>,
        root_object: impl Into<SavString>,
        instance_name: impl Into<SavString>,
    ) -> Self {
        let header = ObjectHeader {
            class_path: class_path.into(),
            root_object: root_object.into(),
            instance_name: instance_name.into(),
            kind: HeaderKind::Actor(ActorPlacement::default()),
        };
        Self::with_empty_body(header)
    }

    pub fn component(
        class_path: impl Into<SavString>,
        root_object: impl Into<SavString>,
        instance_name: impl Into<SavString>,
        parent_actor: impl Into<SavString>,
    ) -> Self {
        let header = ObjectHeader {
            class_path: class_path.into(),
            root_object: root_object.into(),
            instance_name: instance_name.into(),
            kind: HeaderKind::Component {
                parent_actor: parent_actor.into(),
            },
        };
        Self::with_empty_body(header)
    }

    fn with_empty_body(header: ObjectHeader) -> Self {
        let body = ObjectBody::decoded(ObjectData::empty_for(&header));
        Self {
            id: ObjectId::default(),
            header,
            body,
        }
    }

    pub fn instance_name(&self) -> &str {
        self.header.instance_name.as_str()
    }

    pub fn data(&self) -> Option<&ObjectData> {
        self.body.data()
    }

    pub fn data_mut(&mut self) -> Option<&mut ObjectData> {
        self.body.data_mut()
    }

    pub fn properties(&self) -> Option<&PropertyTree> {
        self.data().map(|d| &d.properties)
    }

    pub fn properties_mut(&mut self) -> Option<&mut PropertyTree> {
        self.data_mut().map(|d| &mut d.properties)
    }

    pub fn materialize(&mut self) -> Result<()> {
        self.body.materialize(&self.header)
    }
}

impl VisitRefs for SaveObject {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        self.body.visit_refs(f)
    }
}

// ── Level ────────────────────────────────────────────────

/// A named sub-level, or the persistent level when `name` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub name: Option<SavString>,
    pub objects: Vec<SaveObject>,
    /// Collected-object list inside the header block. Absent and empty are
    /// different on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected: Option<Vec<ObjectReference>>,
    /// Destroyed entities; sub-levels only.
    #[serde(default)]
    pub destroyed: Vec<ObjectReference>,
}

impl Level {
    pub fn new(name: Option<SavString>) -> Self {
        Self {
            name,
            objects: Vec::new(),
            collected: None,
            destroyed: Vec::new(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.name.is_none()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_ref().map_or("Persistent_Level", SavString::as_str)
    }

    /// Read one level block. Handles are drawn from `next_id`.
    pub fn read(r: &mut ByteReader<'_>, named: bool, lazy: bool, next_id: &mut u32) -> Result<Self> {
        let name = if named { Some(r.read_string()?) } else { None };

        let header_size = r.read_u64()?;
        let header_start = r.offset();
        let mut hr = r.sub_reader(block_len(header_size, header_start)?)?;
        let header_count = hr.read_u32()?;
        let mut headers = Vec::with_capacity((header_count as usize).min(hr.remaining()));
        for _ in 0..header_count {
            headers.push(ObjectHeader::read(&mut hr)?);
        }
        let collected = if hr.is_empty() {
            None
        } else {
            Some(ObjectReference::read_list(&mut hr)?)
        };
        ensure_consumed(&hr, "object header block", header_size)?;

        let objects_size = r.read_u64()?;
        let objects_start = r.offset();
        let mut br = r.sub_reader(block_len(objects_size, objects_start)?)?;
        let count_offset = br.offset();
        let body_count = br.read_u32()?;
        if body_count != header_count {
            return Err(SavError::StructuralCountMismatch {
                offset: count_offset,
                what: "object bodies vs headers",
                expected: header_count as u64,
                actual: body_count as u64,
            });
        }
        let mut objects = Vec::with_capacity(headers.len());
        for header in headers {
            let body = ObjectBody::read(&header, &mut br, lazy)?;
            *next_id += 1;
            objects.push(SaveObject {
                id: ObjectId(*next_id),
                header,
                body,
            });
        }
        ensure_consumed(&br, "object body block", objects_size)?;

        let destroyed = if named {
            ObjectReference::read_list(r)?
        } else {
            Vec::new()
        };

        let level = Level {
            name,
            objects,
            collected,
            destroyed,
        };
        debug!("level {}: {} objects", level.display_name(), level.objects.len());
        Ok(level)
    }

    pub fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        if let Some(name) = &self.name {
            w.write_string(name)?;
        } else if !self.destroyed.is_empty() {
            return Err(SavError::malformed(0, "persistent level cannot carry destroyed entities"));
        }

        let mut headers = ByteWriter::new();
        headers.write_u32(self.objects.len() as u32)?;
        for object in &self.objects {
            object.header.write(&mut headers)?;
        }
        if let Some(collected) = &self.collected {
            ObjectReference::write_list(collected, &mut headers)?;
        }
        w.write_u64(headers.len() as u64)?;
        w.write_bytes(headers.as_slice())?;

        let mut bodies = ByteWriter::new();
        bodies.write_u32(self.objects.len() as u32)?;
        for object in &self.objects {
            object.body.write(&object.header, &mut bodies, refs)?;
        }
        w.write_u64(bodies.len() as u64)?;
        w.write_bytes(bodies.as_slice())?;

        if self.name.is_some() {
            ObjectReference::write_list(&self.destroyed, w)?;
        }
        Ok(())
    }
}

impl VisitRefs for Level {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        self.objects.visit_refs(f)
    }
}

fn block_len(size: u64, offset: u64) -> Result<usize> {
    usize::try_from(size).map_err(|_| SavError::TruncatedData {
        offset,
        needed: usize::MAX,
        available: 0,
    })
}

fn ensure_consumed(r: &ByteReader<'_>, what: &'static str, declared: u64) -> Result<()> {
    if r.is_empty() {
        return Ok(());
    }
    Err(SavError::LengthMismatch {
        offset: r.offset(),
        what,
        declared,
        actual: declared - r.remaining() as u64,
    })
}
