//! Object references and the resolver that links them to objects.
//!
//! On disk a reference is a level name plus an instance path. After a parse
//! every reference that names an object in the save carries that object's
//! [`ObjectId`], a handle that survives insertions, removals and reordering.
//! The writer turns handles back into paths from the target's current header
//! and refuses to write a handle whose object is gone.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::cursor::{ByteReader, ByteWriter, SavString};
use crate::error::{Result, SavError};
use crate::object::Level;

/// Stable handle to one object of a [`crate::save::ParsedSave`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Held by objects not yet added to a save. Never resolvable.
    pub const UNASSIGNED: ObjectId = ObjectId(0);
}

/// Level name and instance path exactly as stored. Both empty is the null
/// reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    pub level_name: SavString,
    pub path_name: SavString,
}

impl ObjectReference {
    pub fn new(level_name: impl Into<SavString>, path_name: impl Into<SavString>) -> Self {
        Self {
            level_name: level_name.into(),
            path_name: path_name.into(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.level_name.is_empty() && self.path_name.is_empty()
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            level_name: r.read_string()?,
            path_name: r.read_string()?,
        })
    }

    pub fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_string(&self.level_name)?;
        w.write_string(&self.path_name)
    }

    pub fn read_list(r: &mut ByteReader<'_>) -> Result<Vec<Self>> {
        let count = r.read_u32()?;
        let mut out = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            out.push(Self::read(r)?);
        }
        Ok(out)
    }

    pub fn write_list(list: &[Self], w: &mut ByteWriter) -> Result<()> {
        w.write_u32(list.len() as u32)?;
        for reference in list {
            reference.write(w)?;
        }
        Ok(())
    }
}

/// A reference held inside an object body. `target` is filled in by
/// linking; references to assets or unloaded objects stay unlinked and are
/// written back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(flatten)]
    pub raw: ObjectReference,
    #[serde(skip)]
    pub target: Option<ObjectId>,
}

impl ObjectRef {
    /// The "no reference" sentinel.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn unlinked(raw: ObjectReference) -> Self {
        Self { raw, target: None }
    }

    pub fn is_null(&self) -> bool {
        self.target.is_none() && self.raw.is_null()
    }

    pub fn target(&self) -> Option<ObjectId> {
        self.target
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self::unlinked(ObjectReference::read(r)?))
    }

    pub fn read_list(r: &mut ByteReader<'_>) -> Result<Vec<Self>> {
        Ok(ObjectReference::read_list(r)?
            .into_iter()
            .map(Self::unlinked)
            .collect())
    }

    pub fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        refs.write_ref(self, w)
    }

    pub fn write_list(list: &[Self], w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        w.write_u32(list.len() as u32)?;
        for reference in list {
            reference.write(w, refs)?;
        }
        Ok(())
    }
}

/// Anything that holds [`ObjectRef`]s reachable for linking and checking.
pub trait VisitRefs {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef));
}

impl<T: VisitRefs> VisitRefs for Vec<T> {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        for item in self {
            item.visit_refs(f);
        }
    }
}

impl<T: VisitRefs> VisitRefs for Option<T> {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        if let Some(item) = self {
            item.visit_refs(f);
        }
    }
}

impl VisitRefs for ObjectRef {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        f(self)
    }
}

// ── Resolver ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Slot {
    level: usize,
    position: usize,
    instance_name: SavString,
}

/// Indirection table from handles to current positions, rebuilt from the
/// ordered level lists whenever they may have changed.
#[derive(Debug, Default)]
pub struct ReferenceResolver {
    by_path: HashMap<String, ObjectId>,
    slots: HashMap<ObjectId, Slot>,
    order: Vec<Vec<ObjectId>>,
    level_names: Vec<SavString>,
    /// Instance paths of removed objects that no current object reuses.
    removed: HashSet<String>,
}

impl ReferenceResolver {
    pub fn build(levels: &[Level]) -> Self {
        let mut resolver = ReferenceResolver {
            order: Vec::with_capacity(levels.len()),
            level_names: levels.iter().map(|l| SavString::new(l.display_name())).collect(),
            ..Default::default()
        };
        let mut duplicates = 0usize;
        for (level_index, level) in levels.iter().enumerate() {
            let mut ids = Vec::with_capacity(level.objects.len());
            for (position, object) in level.objects.iter().enumerate() {
                ids.push(object.id);
                if object.id == ObjectId::UNASSIGNED {
                    continue;
                }
                let name = object.header.instance_name.clone();
                if resolver
                    .by_path
                    .insert(name.as_str().to_owned(), object.id)
                    .is_some()
                {
                    duplicates += 1;
                }
                resolver.slots.insert(
                    object.id,
                    Slot {
                        level: level_index,
                        position,
                        instance_name: name,
                    },
                );
            }
            resolver.order.push(ids);
        }
        if duplicates > 0 {
            debug!("{duplicates} instance names appear in more than one level; later ones win");
        }
        resolver
    }

    /// Treat unlinked references to any of `paths` as dangling, unless an
    /// object of the save currently carries that path.
    pub fn with_removed<'a>(mut self, paths: impl IntoIterator<Item = &'a str>) -> Self {
        for path in paths {
            if !self.by_path.contains_key(path) {
                self.removed.insert(path.to_owned());
            }
        }
        self
    }

    pub fn resolve_path(&self, path: &str) -> Option<ObjectId> {
        self.by_path.get(path).copied()
    }

    /// Handle of the object at `position` in level `level`'s current order.
    pub fn handle_at(&self, level: usize, position: usize) -> Option<ObjectId> {
        self.order
            .get(level)?
            .get(position)
            .copied()
            .filter(|id| *id != ObjectId::UNASSIGNED)
    }

    /// Current `(level, position)` of a handle, if the object still exists.
    pub fn position_of(&self, id: ObjectId) -> Option<(usize, usize)> {
        self.slots.get(&id).map(|slot| (slot.level, slot.position))
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Point `r` at the object its path names. Null and foreign references
    /// stay unlinked.
    pub fn link(&self, r: &mut ObjectRef) {
        if r.target.is_none() && !r.raw.path_name.is_empty() {
            r.target = self.resolve_path(r.raw.path_name.as_str());
        }
    }

    pub fn link_all(&self, holder: &mut dyn VisitRefs) -> usize {
        let mut linked = 0usize;
        holder.visit_refs(&mut |r| {
            self.link(r);
            if r.target.is_some() {
                linked += 1;
            }
        });
        linked
    }

    /// Build a reference that names `id` from its current header.
    pub fn reference_to(&self, id: ObjectId, level_name: impl Into<SavString>) -> Option<ObjectRef> {
        let slot = self.slots.get(&id)?;
        Some(ObjectRef {
            raw: ObjectReference {
                level_name: level_name.into(),
                path_name: slot.instance_name.clone(),
            },
            target: Some(id),
        })
    }

    /// Fail with `DanglingReference` if `r` points at a removed object,
    /// either through its handle or, unlinked, through a removed path.
    pub fn check(&self, r: &ObjectRef) -> Result<()> {
        let gone = match r.target {
            Some(id) => !self.slots.contains_key(&id),
            None => self.removed.contains(r.raw.path_name.as_str()),
        };
        if gone {
            return Err(dangling(r));
        }
        Ok(())
    }

    /// Write `r` in its on-disk form. Linked references take the target's
    /// current instance name, and its current level name when the stored
    /// one names a different level of the save.
    pub fn write_ref(&self, r: &ObjectRef, w: &mut ByteWriter) -> Result<()> {
        self.check(r)?;
        let Some(slot) = r.target.and_then(|id| self.slots.get(&id)) else {
            return r.raw.write(w);
        };
        w.write_string(self.level_name_for(r, slot))?;
        if slot.instance_name.as_str() == r.raw.path_name.as_str() {
            w.write_string(&r.raw.path_name)
        } else {
            w.write_string(&slot.instance_name)
        }
    }

    fn level_name_for<'s>(&'s self, r: &'s ObjectRef, slot: &Slot) -> &'s SavString {
        let stored = r.raw.level_name.as_str();
        match self.level_names.get(slot.level) {
            Some(current)
                if current.as_str() != stored && self.level_names.iter().any(|n| n.as_str() == stored) =>
            {
                current
            }
            _ => &r.raw.level_name,
        }
    }
}

fn dangling(r: &ObjectRef) -> SavError {
    SavError::DanglingReference {
        level_name: r.raw.level_name.to_string(),
        path_name: r.raw.path_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SaveObject;

    const BELT: &str = "/Game/FactoryGame/Buildable/Factory/ConveyorBeltMk1/Build_ConveyorBeltMk1.Build_ConveyorBeltMk1_C";

    fn levels() -> Vec<Level> {
        let mut sub = Level::new(Some(SavString::new("Level_A")));
        let mut rock = SaveObject::actor("/Game/FactoryGame/World/Rock.Rock_C", "Level_A", "Level_A:PersistentLevel.Rock_1");
        rock.id = ObjectId(1);
        sub.objects.push(rock);
        let mut persistent = Level::new(None);
        let mut belt = SaveObject::actor(BELT, "Persistent_Level", "Persistent_Level:PersistentLevel.Belt_2");
        belt.id = ObjectId(2);
        persistent.objects.push(belt);
        vec![sub, persistent]
    }

    fn written(refs: &ReferenceResolver, r: &ObjectRef) -> Result<ObjectReference> {
        let mut w = ByteWriter::new();
        refs.write_ref(r, &mut w)?;
        ObjectReference::read(&mut ByteReader::new(w.as_slice()))
    }

    #[test]
    fn test_removed_paths_reject_unlinked_references() {
        let refs = ReferenceResolver::build(&levels()).with_removed([
            "Persistent_Level:PersistentLevel.Belt_9",
            "Persistent_Level:PersistentLevel.Belt_2",
        ]);
        let gone = ObjectRef::unlinked(ObjectReference::new("Persistent_Level", "Persistent_Level:PersistentLevel.Belt_9"));
        assert!(matches!(refs.check(&gone), Err(SavError::DanglingReference { .. })));
        assert!(written(&refs, &gone).is_err());

        // Belt_2 still exists, so its path is not treated as removed
        let live = ObjectRef::unlinked(ObjectReference::new("Persistent_Level", "Persistent_Level:PersistentLevel.Belt_2"));
        assert_eq!(written(&refs, &live).unwrap(), live.raw);
        assert!(refs.check(&ObjectRef::null()).is_ok());

        let stale = ObjectRef {
            raw: live.raw.clone(),
            target: Some(ObjectId(7)),
        };
        assert!(refs.check(&stale).is_err());
    }

    #[test]
    fn test_linked_reference_takes_current_level_name() {
        let refs = ReferenceResolver::build(&levels());
        let moved = ObjectRef {
            raw: ObjectReference::new("Persistent_Level", "Level_A:PersistentLevel.Rock_1"),
            target: Some(ObjectId(1)),
        };
        assert_eq!(written(&refs, &moved).unwrap().level_name, "Level_A");

        // a level name that names no level of the save is kept as stored
        let foreign = ObjectRef {
            raw: ObjectReference::new("", "Persistent_Level:PersistentLevel.Belt_2"),
            target: Some(ObjectId(2)),
        };
        assert_eq!(written(&refs, &foreign).unwrap(), foreign.raw);

        let linked = refs.reference_to(ObjectId(2), "Persistent_Level").unwrap();
        assert_eq!(written(&refs, &linked).unwrap(), linked.raw);
    }
}
