//! Struct payloads with a fixed binary layout.
//!
//! Struct values are looked up by struct type name. Anything without a known
//! layout is read as a nested property tree; if that fails too, the
//! enclosing property falls back to opaque.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::{ByteReader, ByteWriter, OpaqueBytes, SavString};
use crate::error::{Result, SavError};
use crate::property::PropertyTree;
use crate::reference::{ObjectRef, ObjectReference, ReferenceResolver, VisitRefs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layout", content = "value")]
pub enum StructData {
    Vector([f64; 3]),
    Rotator([f64; 3]),
    Vector2D([f64; 2]),
    Quat([f64; 4]),
    IntPoint([i32; 2]),
    IntVector([i32; 3]),
    LinearColor([f32; 4]),
    /// BGRA bytes.
    Color([u8; 4]),
    Box {
        min: [f64; 3],
        max: [f64; 3],
        is_valid: bool,
    },
    FluidBox(f32),
    /// 100-ns ticks since 0001-01-01.
    DateTime(i64),
    Guid(Uuid),
    RailroadTrackPosition {
        track: ObjectRef,
        offset: f32,
        forward: f32,
    },
    InventoryItem(InventoryItem),
    ClientIdentityInfo(ClientIdentityInfo),
    Properties(PropertyTree),
}

fn read_f64s<const N: usize>(r: &mut ByteReader<'_>) -> Result<[f64; N]> {
    let mut out = [0f64; N];
    for v in &mut out {
        *v = r.read_f64()?;
    }
    Ok(out)
}

fn read_i32s<const N: usize>(r: &mut ByteReader<'_>) -> Result<[i32; N]> {
    let mut out = [0i32; N];
    for v in &mut out {
        *v = r.read_i32()?;
    }
    Ok(out)
}

fn write_f64s(w: &mut ByteWriter, values: &[f64]) -> Result<()> {
    values.iter().try_for_each(|v| w.write_f64(*v))
}

fn write_i32s(w: &mut ByteWriter, values: &[i32]) -> Result<()> {
    values.iter().try_for_each(|v| w.write_i32(*v))
}

impl StructData {
    pub fn read(struct_type: &str, r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match struct_type {
            "Vector" => StructData::Vector(read_f64s(r)?),
            "Rotator" => StructData::Rotator(read_f64s(r)?),
            "Vector2D" => StructData::Vector2D(read_f64s(r)?),
            "Quat" => StructData::Quat(read_f64s(r)?),
            "IntPoint" => StructData::IntPoint(read_i32s(r)?),
            "IntVector" => StructData::IntVector(read_i32s(r)?),
            "LinearColor" => {
                let mut rgba = [0f32; 4];
                for c in &mut rgba {
                    *c = r.read_f32()?;
                }
                StructData::LinearColor(rgba)
            }
            "Color" => StructData::Color(r.read_array::<4>()?),
            "Box" => StructData::Box {
                min: read_f64s(r)?,
                max: read_f64s(r)?,
                is_valid: r.read_bool8()?,
            },
            "FluidBox" => StructData::FluidBox(r.read_f32()?),
            "DateTime" => StructData::DateTime(r.read_i64()?),
            "Guid" => StructData::Guid(r.read_guid()?),
            "RailroadTrackPosition" => StructData::RailroadTrackPosition {
                track: ObjectRef::read(r)?,
                offset: r.read_f32()?,
                forward: r.read_f32()?,
            },
            "InventoryItem" => StructData::InventoryItem(InventoryItem::read(r)?),
            "ClientIdentityInfo" => StructData::ClientIdentityInfo(ClientIdentityInfo::read(r)?),
            _ => Self::read_properties(r)?,
        })
    }

    pub fn read_properties(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(StructData::Properties(PropertyTree::read(r)?))
    }

    pub fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        match self {
            StructData::Vector(v) | StructData::Rotator(v) => write_f64s(w, v),
            StructData::Vector2D(v) => write_f64s(w, v),
            StructData::Quat(v) => write_f64s(w, v),
            StructData::IntPoint(v) => write_i32s(w, v),
            StructData::IntVector(v) => write_i32s(w, v),
            StructData::LinearColor(rgba) => rgba.iter().try_for_each(|c| w.write_f32(*c)),
            StructData::Color(bgra) => w.write_bytes(bgra),
            StructData::Box { min, max, is_valid } => {
                write_f64s(w, min)?;
                write_f64s(w, max)?;
                w.write_bool8(*is_valid)
            }
            StructData::FluidBox(v) => w.write_f32(*v),
            StructData::DateTime(ticks) => w.write_i64(*ticks),
            StructData::Guid(guid) => w.write_guid(guid),
            StructData::RailroadTrackPosition {
                track,
                offset,
                forward,
            } => {
                track.write(w, refs)?;
                w.write_f32(*offset)?;
                w.write_f32(*forward)
            }
            StructData::InventoryItem(item) => item.write(w, refs),
            StructData::ClientIdentityInfo(info) => info.write(w),
            StructData::Properties(tree) => tree.write(w, refs),
        }
    }
}

impl VisitRefs for StructData {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        match self {
            StructData::RailroadTrackPosition { track, .. } => f(track),
            StructData::InventoryItem(item) => {
                if let Some(state) = &mut item.state {
                    state.properties.visit_refs(f);
                }
            }
            StructData::Properties(tree) => tree.visit_refs(f),
            _ => {}
        }
    }
}

// ── InventoryItem ────────────────────────────────────────

/// An item slot: the item descriptor plus, for stateful items like
/// equipment, a typed property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item_class: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ItemState>,
    /// Extra zero word found in some items carried over from older builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_tail: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    pub struct_type: ObjectReference,
    pub properties: PropertyTree,
}

impl InventoryItem {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let item_class = ObjectReference::read(r)?;
        let mut item = InventoryItem {
            item_class,
            state: None,
            legacy_tail: None,
        };
        if r.read_bool32()? {
            let struct_type = ObjectReference::read(r)?;
            let size = r.read_u32()?;
            let start = r.offset();
            let mut body = r.sub_reader(size as usize)?;
            let properties = PropertyTree::read(&mut body)?;
            if !body.is_empty() {
                return Err(SavError::LengthMismatch {
                    offset: start,
                    what: "inventory item state",
                    declared: size as u64,
                    actual: (size as usize - body.remaining()) as u64,
                });
            }
            item.state = Some(ItemState {
                struct_type,
                properties,
            });
        } else if r.remaining() == 4 {
            item.legacy_tail = Some(r.read_u32()?);
        }
        Ok(item)
    }

    fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        self.item_class.write(w)?;
        w.write_bool32(self.state.is_some())?;
        match &self.state {
            Some(state) => {
                let mut body = ByteWriter::new();
                state.properties.write(&mut body, refs)?;
                state.struct_type.write(w)?;
                w.write_u32(body.len_u32("inventory item state")?)?;
                w.write_bytes(body.as_slice())
            }
            None => match self.legacy_tail {
                Some(tail) => w.write_u32(tail),
                None => Ok(()),
            },
        }
    }
}

// ── ClientIdentityInfo ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientIdentityInfo {
    pub client_id: SavString,
    pub identities: Vec<PlatformIdentity>,
}

/// Online-platform account blob; the platform byte is 1 or 6 in practice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformIdentity {
    pub platform: u8,
    pub data: OpaqueBytes,
}

impl ClientIdentityInfo {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let client_id = r.read_string()?;
        let count = r.read_u32()?;
        let mut identities = Vec::with_capacity((count as usize).min(r.remaining()));
        for _ in 0..count {
            let platform = r.read_u8()?;
            let len = r.read_u32()?;
            identities.push(PlatformIdentity {
                platform,
                data: OpaqueBytes::from(r.read_bytes(len as usize)?),
            });
        }
        Ok(Self {
            client_id,
            identities,
        })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_string(&self.client_id)?;
        w.write_u32(self.identities.len() as u32)?;
        for identity in &self.identities {
            w.write_u8(identity.platform)?;
            w.write_u32(identity.data.len() as u32)?;
            w.write_bytes(identity.data.as_slice())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::tests::{raw_tag, terminated};
    use crate::property::PropertyValue;

    fn struct_tag(name: &str, struct_type: &str, value: &[u8]) -> Vec<u8> {
        let mut header = ByteWriter::new();
        header.write_str(struct_type).unwrap();
        header.write_bytes(&[0u8; 16]).unwrap();
        raw_tag(name, "StructProperty", header.as_slice(), value)
    }

    fn reencode(tree: &PropertyTree) -> Vec<u8> {
        let mut w = ByteWriter::new();
        tree.write(&mut w, &ReferenceResolver::default()).unwrap();
        w.into_inner()
    }

    fn read_tree(raw: &[u8]) -> PropertyTree {
        let mut r = ByteReader::new(raw);
        let tree = PropertyTree::read(&mut r).unwrap();
        assert!(r.is_empty());
        tree
    }

    #[test]
    fn test_fixed_layouts() {
        let mut vector = ByteWriter::new();
        for v in [1.0f64, -2.5, 1e6] {
            vector.write_f64(v).unwrap();
        }
        let mut bounds = ByteWriter::new();
        for v in [0.0f64, 0.0, 0.0, 10.0, 20.0, 30.0] {
            bounds.write_f64(v).unwrap();
        }
        bounds.write_u8(1).unwrap();

        let raw = terminated(&[
            struct_tag("mLocation", "Vector", vector.as_slice()),
            struct_tag("mBounds", "Box", bounds.as_slice()),
            struct_tag("mFluid", "FluidBox", &0.75f32.to_le_bytes()),
            struct_tag("mSaved", "DateTime", &638_000_000_000_000_000i64.to_le_bytes()),
        ]);
        let tree = read_tree(&raw);
        assert_eq!(
            tree.value("mLocation").and_then(PropertyValue::as_struct),
            Some(&StructData::Vector([1.0, -2.5, 1e6]))
        );
        assert!(matches!(
            tree.value("mBounds").and_then(PropertyValue::as_struct),
            Some(StructData::Box { is_valid: true, .. })
        ));
        assert_eq!(
            tree.value("mFluid").and_then(PropertyValue::as_struct),
            Some(&StructData::FluidBox(0.75))
        );
        assert_eq!(reencode(&tree), raw);
    }

    #[test]
    fn test_unknown_struct_reads_as_properties() {
        let inner = terminated(&[raw_tag("mAmount", "IntProperty", &[], &12i32.to_le_bytes())]);
        let raw = terminated(&[struct_tag("mCost", "ItemAmount", &inner)]);
        let tree = read_tree(&raw);
        match tree.value("mCost").and_then(PropertyValue::as_struct) {
            Some(StructData::Properties(props)) => {
                assert_eq!(props.value("mAmount"), Some(&PropertyValue::Int(12)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reencode(&tree), raw);
    }

    #[test]
    fn test_inventory_item_variants() {
        let mut plain = ByteWriter::new();
        ObjectReference::new("", "/Game/FactoryGame/Resource/Parts/IronPlate/Desc_IronPlate.Desc_IronPlate_C")
            .write(&mut plain)
            .unwrap();
        plain.write_u32(0).unwrap();

        let mut legacy = plain.as_slice().to_vec();
        legacy.extend_from_slice(&0u32.to_le_bytes());

        let state = terminated(&[raw_tag("mCurrentAmmo", "IntProperty", &[], &30i32.to_le_bytes())]);
        let mut stateful = ByteWriter::new();
        ObjectReference::new("", "/Game/Equipment/Desc_Rifle.Desc_Rifle_C")
            .write(&mut stateful)
            .unwrap();
        stateful.write_u32(1).unwrap();
        ObjectReference::new("", "/Script/FactoryGame.FGWeaponState")
            .write(&mut stateful)
            .unwrap();
        stateful.write_u32(state.len() as u32).unwrap();
        stateful.write_bytes(&state).unwrap();

        let raw = terminated(&[
            struct_tag("mPlain", "InventoryItem", plain.as_slice()),
            struct_tag("mLegacy", "InventoryItem", &legacy),
            struct_tag("mStateful", "InventoryItem", stateful.as_slice()),
        ]);
        let tree = read_tree(&raw);
        match tree.value("mPlain").and_then(PropertyValue::as_struct) {
            Some(StructData::InventoryItem(item)) => {
                assert!(item.state.is_none());
                assert!(item.legacy_tail.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        match tree.value("mLegacy").and_then(PropertyValue::as_struct) {
            Some(StructData::InventoryItem(item)) => assert_eq!(item.legacy_tail, Some(0)),
            other => panic!("unexpected {other:?}"),
        }
        match tree.value("mStateful").and_then(PropertyValue::as_struct) {
            Some(StructData::InventoryItem(item)) => {
                let state = item.state.as_ref().unwrap();
                assert_eq!(state.properties.value("mCurrentAmmo"), Some(&PropertyValue::Int(30)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reencode(&tree), raw);
    }

    #[test]
    fn test_client_identity_info() {
        let mut value = ByteWriter::new();
        value.write_str("0a1b2c3d").unwrap();
        value.write_u32(1).unwrap();
        value.write_u8(6).unwrap();
        value.write_u32(3).unwrap();
        value.write_bytes(&[7, 8, 9]).unwrap();
        let raw = terminated(&[struct_tag("mIdentity", "ClientIdentityInfo", value.as_slice())]);
        let tree = read_tree(&raw);
        match tree.value("mIdentity").and_then(PropertyValue::as_struct) {
            Some(StructData::ClientIdentityInfo(info)) => {
                assert_eq!(info.client_id, "0a1b2c3d");
                assert_eq!(info.identities[0].platform, 6);
                assert_eq!(info.identities[0].data.as_slice(), &[7, 8, 9]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reencode(&tree), raw);
    }

    #[test]
    fn test_track_position_reference_is_visited() {
        let mut data = StructData::RailroadTrackPosition {
            track: ObjectRef::unlinked(ObjectReference::new(
                "Persistent_Level",
                "Persistent_Level:PersistentLevel.Build_RailroadTrack_C_1",
            )),
            offset: 120.0,
            forward: 1.0,
        };
        let mut seen = Vec::new();
        data.visit_refs(&mut |r| seen.push(r.raw.path_name.to_string()));
        assert_eq!(seen, ["Persistent_Level:PersistentLevel.Build_RailroadTrack_C_1"]);
    }

    #[test]
    fn test_short_vector_falls_back_to_opaque() {
        let raw = terminated(&[struct_tag("mLocation", "Vector", &[0u8; 12])]);
        let tree = read_tree(&raw);
        assert!(tree.value("mLocation").unwrap().is_opaque());
        assert_eq!(reencode(&tree), raw);
    }
}
