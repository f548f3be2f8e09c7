//! A whole save file: the uncompressed header, then a chunked body holding
//! the partition grids, every level and the trailing reference list.

use flate2::Compression;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::chunk::{compress_chunks, decompress_chunks, DEFAULT_MAX_CHUNK_SIZE};
use crate::config::{ReadOptions, WriteOptions};
use crate::cursor::{ByteReader, ByteWriter, OpaqueBytes, SavString};
use crate::error::{Result, SavError};
use crate::header::SaveHeader;
use crate::object::{Level, ObjectData, SaveObject};
use crate::reference::{ObjectId, ObjectRef, ReferenceResolver};

// ── Partition grids ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionGrid {
    pub name: SavString,
    pub cell_size: u32,
    pub hash: u32,
    pub cells: Vec<GridCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub name: SavString,
    pub hash: u32,
}

impl PartitionGrid {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let name = r.read_string()?;
        let cell_size = r.read_u32()?;
        let hash = r.read_u32()?;
        let count = r.read_u32()?;
        let mut cells = Vec::with_capacity((count as usize).min(r.remaining()));
        for _ in 0..count {
            cells.push(GridCell {
                name: r.read_string()?,
                hash: r.read_u32()?,
            });
        }
        Ok(Self {
            name,
            cell_size,
            hash,
            cells,
        })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_string(&self.name)?;
        w.write_u32(self.cell_size)?;
        w.write_u32(self.hash)?;
        w.write_u32(self.cells.len() as u32)?;
        for cell in &self.cells {
            w.write_string(&cell.name)?;
            w.write_u32(cell.hash)?;
        }
        Ok(())
    }
}

// ── Save ─────────────────────────────────────────────────

/// Sub-levels in file order, then the persistent level last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSave {
    pub header: SaveHeader,
    /// Chunk size declared by the source file; reused on write.
    pub max_chunk_size: u32,
    pub grids: Vec<PartitionGrid>,
    levels: Vec<Level>,
    /// Word between the persistent level and the extra references.
    pub persistent_marker: u32,
    /// Absent in files written by some third-party editors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_references: Option<Vec<ObjectRef>>,
    /// Bytes after the declared body length.
    #[serde(default, skip_serializing_if = "OpaqueBytes::is_empty")]
    pub trailing_padding: OpaqueBytes,
    #[serde(skip)]
    next_id: u32,
    /// Instance paths of objects removed through [`ParsedSave::remove_object`].
    #[serde(skip)]
    removed: HashSet<String>,
}

impl PartialEq for ParsedSave {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.max_chunk_size == other.max_chunk_size
            && self.grids == other.grids
            && self.levels == other.levels
            && self.persistent_marker == other.persistent_marker
            && self.extra_references == other.extra_references
            && self.trailing_padding == other.trailing_padding
    }
}

impl ParsedSave {
    /// An empty save with just the persistent level.
    pub fn new(header: SaveHeader) -> Self {
        Self {
            header,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            grids: Vec::new(),
            levels: vec![Level::new(None)],
            persistent_marker: 0,
            extra_references: Some(Vec::new()),
            trailing_padding: OpaqueBytes::default(),
            next_id: 0,
            removed: HashSet::new(),
        }
    }

    pub fn decode(bytes: &[u8], options: &ReadOptions) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let header = SaveHeader::read(&mut r)?;
        let body_start = r.offset();
        let (logical, declared_max) = decompress_chunks(r.read_rest()?, body_start)?;
        debug!(
            "header v{} save v{}: {} compressed bytes inflate to {}",
            header.header_version,
            header.save_version,
            bytes.len() as u64 - body_start,
            logical.len()
        );

        let mut save = Self::decode_body(header, &logical, options.lazy_bodies)?;
        save.max_chunk_size = declared_max.unwrap_or(DEFAULT_MAX_CHUNK_SIZE);
        if !options.lazy_bodies {
            let linked = save.link_references();
            debug!("linked {linked} references");
        }
        info!(
            "decoded {} levels, {} objects",
            save.levels.len(),
            save.object_count()
        );
        Ok(save)
    }

    fn decode_body(header: SaveHeader, logical: &[u8], lazy: bool) -> Result<Self> {
        let mut outer = ByteReader::new(logical);
        let body_len = outer.read_u64()?;
        let available = outer.remaining() as u64;
        if body_len > available {
            return Err(SavError::LengthMismatch {
                offset: 0,
                what: "save body",
                declared: body_len,
                actual: available,
            });
        }
        let mut r = outer.sub_reader(body_len as usize)?;
        let trailing_padding = OpaqueBytes::from(outer.read_rest()?);
        if !trailing_padding.is_empty() {
            debug!("{} bytes of padding after the body", trailing_padding.len());
        }

        let grid_count = r.read_u32()?;
        let mut grids = Vec::with_capacity((grid_count as usize).min(r.remaining()));
        for _ in 0..grid_count {
            grids.push(PartitionGrid::read(&mut r)?);
        }

        let sublevel_count = r.read_u32()?;
        let mut next_id = 0u32;
        let mut levels = Vec::with_capacity((sublevel_count as usize).min(r.remaining()) + 1);
        for _ in 0..sublevel_count {
            levels.push(Level::read(&mut r, true, lazy, &mut next_id)?);
        }
        levels.push(Level::read(&mut r, false, lazy, &mut next_id)?);

        let persistent_marker = r.read_u32()?;
        let extra_references = if r.is_empty() {
            debug!("no extra reference list");
            None
        } else {
            Some(ObjectRef::read_list(&mut r)?)
        };
        r.finish()?;

        Ok(Self {
            header,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            grids,
            levels,
            persistent_marker,
            extra_references,
            trailing_padding,
            next_id,
            removed: HashSet::new(),
        })
    }

    /// Encode entirely in memory. Nothing is returned unless every check
    /// passes.
    pub fn encode(&self, options: &WriteOptions) -> Result<Vec<u8>> {
        options.validate()?;
        self.check_layout()?;
        let refs = self.resolver();

        let mut out = ByteWriter::new();
        match options.bump_save_time_seconds {
            Some(seconds) => {
                let mut header = self.header.clone();
                header.bump_save_time(seconds);
                header.write(&mut out)?;
            }
            None => self.header.write(&mut out)?,
        }

        let mut body = ByteWriter::new();
        body.write_u32(self.grids.len() as u32)?;
        for grid in &self.grids {
            grid.write(&mut body)?;
        }
        let (persistent, sublevels) = self
            .levels
            .split_last()
            .ok_or_else(|| SavError::malformed(0, "save has no levels"))?;
        body.write_u32(sublevels.len() as u32)?;
        for level in sublevels {
            level.write(&mut body, &refs)?;
        }
        persistent.write(&mut body, &refs)?;
        body.write_u32(self.persistent_marker)?;
        if let Some(extra) = &self.extra_references {
            ObjectRef::write_list(extra, &mut body, &refs)?;
        }

        let mut logical = ByteWriter::with_capacity(8 + body.len() + self.trailing_padding.len());
        logical.write_u64(body.len() as u64)?;
        logical.write_bytes(body.as_slice())?;
        logical.write_bytes(self.trailing_padding.as_slice())?;

        let chunks = compress_chunks(
            logical.as_slice(),
            options.chunk_size_or(self.max_chunk_size),
            Compression::new(options.compression_level),
        )?;
        out.write_bytes(&chunks)?;
        Ok(out.into_inner())
    }

    fn check_layout(&self) -> Result<()> {
        let persistent = self.levels.iter().filter(|l| l.is_persistent()).count();
        if persistent != 1 {
            return Err(SavError::StructuralCountMismatch {
                offset: 0,
                what: "persistent levels",
                expected: 1,
                actual: persistent as u64,
            });
        }
        if !self.levels.last().is_some_and(Level::is_persistent) {
            return Err(SavError::malformed(0, "the persistent level must come last"));
        }
        let mut seen = HashSet::new();
        for object in self.objects() {
            if object.id != ObjectId::UNASSIGNED && !seen.insert(object.id) {
                return Err(SavError::malformed(
                    0,
                    format!("{} shares handle {} with another object", object.instance_name(), object.id.0),
                ));
            }
        }
        Ok(())
    }

    // ── Levels ───────────────────────────────────────────

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Direct access for structural edits. Objects added this way get a
    /// handle on the next [`ParsedSave::assign_handles`] or
    /// [`ParsedSave::link_references`].
    pub fn levels_mut(&mut self) -> &mut Vec<Level> {
        &mut self.levels
    }

    pub fn persistent_level(&self) -> Option<&Level> {
        self.levels.last().filter(|l| l.is_persistent())
    }

    /// Index of the sub-level called `name`, or of the persistent level for
    /// `None`.
    pub fn level_index(&self, name: Option<&str>) -> Option<usize> {
        self.levels
            .iter()
            .position(|l| l.name.as_ref().map(SavString::as_str) == name)
    }

    /// Append an empty sub-level ahead of the persistent level.
    pub fn add_sublevel(&mut self, name: impl Into<SavString>) -> usize {
        let at = self.levels.len().saturating_sub(1);
        self.levels.insert(at, Level::new(Some(name.into())));
        at
    }

    // ── Objects ──────────────────────────────────────────

    pub fn objects(&self) -> impl Iterator<Item = &SaveObject> {
        self.levels.iter().flat_map(|l| l.objects.iter())
    }

    pub fn object_count(&self) -> usize {
        self.levels.iter().map(|l| l.objects.len()).sum()
    }

    fn allocate_id(&mut self) -> ObjectId {
        self.next_id += 1;
        ObjectId(self.next_id)
    }

    /// Give every object without a handle a fresh one.
    pub fn assign_handles(&mut self) {
        let highest = self.objects().map(|o| o.id.0).max().unwrap_or(0);
        self.next_id = self.next_id.max(highest);
        let mut next = self.next_id;
        for object in self.levels.iter_mut().flat_map(|l| l.objects.iter_mut()) {
            if object.id == ObjectId::UNASSIGNED {
                next += 1;
                object.id = ObjectId(next);
            }
        }
        self.next_id = next;
    }

    pub fn push_object(&mut self, level: usize, object: SaveObject) -> Option<ObjectId> {
        let position = self.levels.get(level)?.objects.len();
        self.insert_object(level, position, object)
    }

    /// Insert at `position` in `level`, shifting later objects. The object
    /// gets a fresh handle and its own references are linked.
    pub fn insert_object(&mut self, level: usize, position: usize, mut object: SaveObject) -> Option<ObjectId> {
        if position > self.levels.get(level)?.objects.len() {
            return None;
        }
        let id = self.allocate_id();
        object.id = id;
        self.levels[level].objects.insert(position, object);
        let refs = ReferenceResolver::build(&self.levels);
        refs.link_all(&mut self.levels[level].objects[position]);
        Some(id)
    }

    /// Remove an object. Every body is decoded and linked first so
    /// references to it are caught as dangling on write, and its instance
    /// path is remembered so unlinked references naming it are caught too.
    pub fn remove_object(&mut self, id: ObjectId) -> Result<Option<SaveObject>> {
        self.materialize_all()?;
        let Some((level, position)) = self.position_of(id) else {
            return Ok(None);
        };
        let object = self.levels[level].objects.remove(position);
        debug!("removed {}", object.instance_name());
        self.removed.insert(object.instance_name().to_owned());
        Ok(Some(object))
    }

    pub fn position_of(&self, id: ObjectId) -> Option<(usize, usize)> {
        self.levels.iter().enumerate().find_map(|(li, level)| {
            level
                .objects
                .iter()
                .position(|o| o.id == id)
                .map(|pos| (li, pos))
        })
    }

    pub fn handle_at(&self, level: usize, position: usize) -> Option<ObjectId> {
        self.levels
            .get(level)?
            .objects
            .get(position)
            .map(|o| o.id)
            .filter(|id| *id != ObjectId::UNASSIGNED)
    }

    pub fn object(&self, id: ObjectId) -> Option<&SaveObject> {
        let (level, position) = self.position_of(id)?;
        self.levels[level].objects.get(position)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut SaveObject> {
        let (level, position) = self.position_of(id)?;
        self.levels[level].objects.get_mut(position)
    }

    pub fn find_object(&self, instance_name: &str) -> Option<ObjectId> {
        self.objects()
            .find(|o| o.instance_name() == instance_name)
            .map(|o| o.id)
    }

    /// A linked reference to `id`, named the way the game names objects of
    /// its level.
    pub fn reference_to(&self, id: ObjectId) -> Option<ObjectRef> {
        let (level, _) = self.position_of(id)?;
        let level_name = SavString::new(self.levels[level].display_name());
        ReferenceResolver::build(&self.levels).reference_to(id, level_name)
    }

    /// Resolver over the current levels that also knows the removed paths.
    pub fn resolver(&self) -> ReferenceResolver {
        ReferenceResolver::build(&self.levels).with_removed(self.removed.iter().map(String::as_str))
    }

    /// Link every reference in decoded bodies and the extra list to the
    /// object its path names. Returns how many references are linked.
    pub fn link_references(&mut self) -> usize {
        self.assign_handles();
        let refs = ReferenceResolver::build(&self.levels);
        let mut linked = 0;
        for level in &mut self.levels {
            linked += refs.link_all(level);
        }
        if let Some(extra) = &mut self.extra_references {
            linked += refs.link_all(extra);
        }
        linked
    }

    /// Decoded body of one object, decoding it first if it was read lazily.
    pub fn decoded_mut(&mut self, id: ObjectId) -> Result<Option<&mut ObjectData>> {
        let Some((level, position)) = self.position_of(id) else {
            return Ok(None);
        };
        let was_raw = !self.levels[level].objects[position].body.is_decoded();
        self.levels[level].objects[position].materialize()?;
        if was_raw {
            let refs = ReferenceResolver::build(&self.levels);
            refs.link_all(&mut self.levels[level].objects[position]);
        }
        Ok(self.levels[level].objects[position].data_mut())
    }

    /// Decode every raw body, in parallel, then link references.
    pub fn materialize_all(&mut self) -> Result<()> {
        self.levels.par_iter_mut().try_for_each(|level| {
            level
                .objects
                .par_iter_mut()
                .try_for_each(SaveObject::materialize)
        })?;
        self.link_references();
        Ok(())
    }
}
