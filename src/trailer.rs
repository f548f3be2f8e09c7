//! Class-specific records that some actors store after their property tree.
//!
//! Only the layouts below are decoded. Anything else, or a known class whose
//! bytes don't fit its layout, is kept as an opaque blob.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::cursor::{ByteReader, ByteWriter, OpaqueBytes, SavString};
use crate::error::{Result, SavError};
use crate::object::ObjectHeader;
use crate::reference::{ObjectRef, ReferenceResolver, VisitRefs};

pub(crate) const POWER_LINE_CLASSES: [&str; 2] = [
    "/Game/FactoryGame/Buildable/Factory/PowerLine/Build_PowerLine.Build_PowerLine_C",
    "/Game/FactoryGame/Events/Christmas/Buildings/PowerLineLights/Build_XmassLightsLine.Build_XmassLightsLine_C",
];
pub(crate) const LEVEL_LIST_CLASSES: [&str; 2] = [
    "/Game/FactoryGame/-Shared/Blueprint/BP_GameMode.BP_GameMode_C",
    "/Game/FactoryGame/-Shared/Blueprint/BP_GameState.BP_GameState_C",
];
pub(crate) const CIRCUIT_SUBSYSTEM_CLASS: &str = "/Game/FactoryGame/-Shared/Blueprint/BP_CircuitSubsystem.BP_CircuitSubsystem_C";
pub(crate) const CONVEYOR_CLASSES: [&str; 12] = [
    "/Game/FactoryGame/Buildable/Factory/ConveyorBeltMk1/Build_ConveyorBeltMk1.Build_ConveyorBeltMk1_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorBeltMk2/Build_ConveyorBeltMk2.Build_ConveyorBeltMk2_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorBeltMk3/Build_ConveyorBeltMk3.Build_ConveyorBeltMk3_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorBeltMk4/Build_ConveyorBeltMk4.Build_ConveyorBeltMk4_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorBeltMk5/Build_ConveyorBeltMk5.Build_ConveyorBeltMk5_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorBeltMk6/Build_ConveyorBeltMk6.Build_ConveyorBeltMk6_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorLiftMk1/Build_ConveyorLiftMk1.Build_ConveyorLiftMk1_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorLiftMk2/Build_ConveyorLiftMk2.Build_ConveyorLiftMk2_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorLiftMk3/Build_ConveyorLiftMk3.Build_ConveyorLiftMk3_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorLiftMk4/Build_ConveyorLiftMk4.Build_ConveyorLiftMk4_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorLiftMk5/Build_ConveyorLiftMk5.Build_ConveyorLiftMk5_C",
    "/Game/FactoryGame/Buildable/Factory/ConveyorLiftMk6/Build_ConveyorLiftMk6.Build_ConveyorLiftMk6_C",
];
pub(crate) const CONVEYOR_CHAIN_CLASSES: [&str; 5] = [
    "/Script/FactoryGame.FGConveyorChainActor",
    "/Script/FactoryGame.FGConveyorChainActor_RepSizeNoCull",
    "/Script/FactoryGame.FGConveyorChainActor_RepSizeMedium",
    "/Script/FactoryGame.FGConveyorChainActor_RepSizeLarge",
    "/Script/FactoryGame.FGConveyorChainActor_RepSizeHuge",
];
pub(crate) const PLAYER_STATE_CLASS: &str = "/Game/FactoryGame/Character/Player/BP_PlayerState.BP_PlayerState_C";
pub(crate) const TRAIN_CLASSES: [&str; 2] = [
    "/Game/FactoryGame/Buildable/Vehicle/Train/Locomotive/BP_Locomotive.BP_Locomotive_C",
    "/Game/FactoryGame/Buildable/Vehicle/Train/Wagon/BP_FreightWagon.BP_FreightWagon_C",
];
pub(crate) const VEHICLE_CLASSES: [&str; 5] = [
    "/Game/FactoryGame/Buildable/Vehicle/Cyberwagon/Testa_BP_WB.Testa_BP_WB_C",
    "/Game/FactoryGame/Buildable/Vehicle/Explorer/BP_Explorer.BP_Explorer_C",
    "/Game/FactoryGame/Buildable/Vehicle/Golfcart/BP_Golfcart.BP_Golfcart_C",
    "/Game/FactoryGame/Buildable/Vehicle/Tractor/BP_Tractor.BP_Tractor_C",
    "/Game/FactoryGame/Buildable/Vehicle/Truck/BP_Truck.BP_Truck_C",
];
pub(crate) const LIGHTWEIGHT_SUBSYSTEM_CLASS: &str = "/Script/FactoryGame.FGLightweightBuildableSubsystem";

/// Per-vehicle physics snapshot size.
pub const VEHICLE_STATE_LEN: usize = 105;
/// Player state marker byte followed by a platform identity.
const PLAYER_IDENTITY_MARKER: u8 = 0xF1;
/// Player state holding nothing but its marker byte.
const PLAYER_BARE_MARKER: u8 = 3;

/// Class-specific bytes after the property tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trailer", rename_all = "snake_case")]
pub enum ObjectTrailer {
    #[default]
    None,
    /// Wire endpoints.
    PowerLine { source: ObjectRef, target: ObjectRef },
    /// Loaded level list kept by the game mode and game state.
    LevelList { levels: Vec<ObjectRef> },
    Circuits { circuits: Vec<Circuit> },
    /// Items riding a belt or lift.
    BeltItems { items: Vec<BeltItem> },
    ConveyorChain { chain: Box<ConveyorChain> },
    PlayerState { identity: PlayerIdentity },
    /// Neighbours in a train.
    Train { previous: ObjectRef, next: ObjectRef },
    Vehicles { vehicles: Vec<VehicleState> },
    LightweightBuildables { groups: Vec<LightweightGroup> },
    Opaque { data: OpaqueBytes },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circuit {
    pub id: u32,
    pub circuit: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeltItem {
    pub flags: u32,
    pub item_class: SavString,
    pub state: ObjectRef,
    pub position: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConveyorChain {
    pub first_belt: ObjectRef,
    pub last_belt: ObjectRef,
    pub segments: Vec<ChainSegment>,
    pub state: u32,
    pub offsets: [i32; 3],
    pub items: Vec<ChainItem>,
}

/// One belt of a chain, stored with its position in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSegment {
    pub chain_actor: ObjectRef,
    pub belt: ObjectRef,
    pub spline_points: Vec<[[u64; 3]; 3]>,
    pub values: [u32; 3],
    pub offsets: [i32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainItem {
    pub item_class: SavString,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerIdentity {
    /// Only a marker byte, seen on players that never joined online.
    Bare,
    Client { platform: u8, data: OpaqueBytes },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub name: SavString,
    /// Always [`VEHICLE_STATE_LEN`] bytes.
    pub data: OpaqueBytes,
}

/// Instances of one buildable class that have no actor of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightweightGroup {
    pub build_class: SavString,
    pub instances: Vec<LightweightInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightweightInstance {
    pub rotation: [f64; 4],
    pub position: [f64; 3],
    pub scale: [f64; 3],
    pub swatch: SavString,
    pub pattern: SavString,
    pub primary_color: [f32; 4],
    pub secondary_color: [f32; 4],
    pub variant: u32,
    pub recipe: SavString,
    pub blueprint_proxy: ObjectRef,
}

fn capacity(count: u32, r: &ByteReader<'_>) -> usize {
    (count as usize).min(r.remaining())
}

fn expect_u8(r: &mut ByteReader<'_>, expected: u8, what: &str) -> Result<()> {
    let offset = r.offset();
    let found = r.read_u8()?;
    if found != expected {
        return Err(SavError::malformed(
            offset,
            format!("{what}: expected {expected}, found {found}"),
        ));
    }
    Ok(())
}

fn expect_zeros(r: &mut ByteReader<'_>, words: usize, what: &str) -> Result<()> {
    for _ in 0..words {
        r.expect_u32(0, what)?;
    }
    Ok(())
}

fn write_zeros(w: &mut ByteWriter, words: usize) -> Result<()> {
    for _ in 0..words {
        w.write_u32(0)?;
    }
    Ok(())
}

fn read_f32s<const N: usize>(r: &mut ByteReader<'_>) -> Result<[f32; N]> {
    let mut out = [0f32; N];
    for v in &mut out {
        *v = r.read_f32()?;
    }
    Ok(out)
}

fn read_f64s<const N: usize>(r: &mut ByteReader<'_>) -> Result<[f64; N]> {
    let mut out = [0f64; N];
    for v in &mut out {
        *v = r.read_f64()?;
    }
    Ok(out)
}

impl ObjectTrailer {
    pub fn is_none(&self) -> bool {
        matches!(self, ObjectTrailer::None)
    }

    pub(crate) fn read(header: &ObjectHeader, bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return ObjectTrailer::None;
        }
        if header.is_actor() {
            let mut r = ByteReader::new(bytes);
            match Self::read_known(header.class_path.as_str(), &mut r) {
                Ok(Some(trailer)) => match r.finish() {
                    Ok(()) => return trailer,
                    Err(e) => warn!("{}: keeping trailer opaque: {e}", header.instance_name),
                },
                Ok(None) => debug!("{}: {} opaque trailing bytes", header.instance_name, bytes.len()),
                Err(e) => warn!("{}: keeping trailer opaque: {e}", header.instance_name),
            }
        } else {
            debug!("{}: {} opaque trailing bytes", header.instance_name, bytes.len());
        }
        ObjectTrailer::Opaque {
            data: OpaqueBytes::from(bytes),
        }
    }

    /// `Ok(None)` for classes without a known layout.
    fn read_known(class: &str, r: &mut ByteReader<'_>) -> Result<Option<Self>> {
        let trailer = if POWER_LINE_CLASSES.contains(&class) {
            ObjectTrailer::PowerLine {
                source: ObjectRef::read(r)?,
                target: ObjectRef::read(r)?,
            }
        } else if LEVEL_LIST_CLASSES.contains(&class) {
            ObjectTrailer::LevelList {
                levels: ObjectRef::read_list(r)?,
            }
        } else if class == CIRCUIT_SUBSYSTEM_CLASS {
            let count = r.read_u32()?;
            let mut circuits = Vec::with_capacity(capacity(count, r));
            for _ in 0..count {
                circuits.push(Circuit {
                    id: r.read_u32()?,
                    circuit: ObjectRef::read(r)?,
                });
            }
            ObjectTrailer::Circuits { circuits }
        } else if CONVEYOR_CLASSES.contains(&class) {
            let count = r.read_u32()?;
            let mut items = Vec::with_capacity(capacity(count, r));
            for _ in 0..count {
                items.push(BeltItem {
                    flags: r.read_u32()?,
                    item_class: r.read_string()?,
                    state: ObjectRef::read(r)?,
                    position: r.read_f32()?,
                });
            }
            ObjectTrailer::BeltItems { items }
        } else if CONVEYOR_CHAIN_CLASSES.contains(&class) {
            ObjectTrailer::ConveyorChain {
                chain: Box::new(ConveyorChain::read(r)?),
            }
        } else if class == PLAYER_STATE_CLASS {
            ObjectTrailer::PlayerState {
                identity: PlayerIdentity::read(r)?,
            }
        } else if TRAIN_CLASSES.contains(&class) {
            r.expect_u32(0, "train wagon list")?;
            ObjectTrailer::Train {
                previous: ObjectRef::read(r)?,
                next: ObjectRef::read(r)?,
            }
        } else if VEHICLE_CLASSES.contains(&class) {
            let count = r.read_u32()?;
            let mut vehicles = Vec::with_capacity(capacity(count, r));
            for _ in 0..count {
                vehicles.push(VehicleState {
                    name: r.read_string()?,
                    data: OpaqueBytes::from(r.read_bytes(VEHICLE_STATE_LEN)?),
                });
            }
            ObjectTrailer::Vehicles { vehicles }
        } else if class == LIGHTWEIGHT_SUBSYSTEM_CLASS {
            let count = r.read_u32()?;
            let mut groups = Vec::with_capacity(capacity(count, r));
            for _ in 0..count {
                groups.push(LightweightGroup::read(r)?);
            }
            ObjectTrailer::LightweightBuildables { groups }
        } else {
            return Ok(None);
        };
        Ok(Some(trailer))
    }

    pub(crate) fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        match self {
            ObjectTrailer::None => Ok(()),
            ObjectTrailer::PowerLine { source, target } => {
                source.write(w, refs)?;
                target.write(w, refs)
            }
            ObjectTrailer::LevelList { levels } => ObjectRef::write_list(levels, w, refs),
            ObjectTrailer::Circuits { circuits } => {
                w.write_u32(circuits.len() as u32)?;
                for c in circuits {
                    w.write_u32(c.id)?;
                    c.circuit.write(w, refs)?;
                }
                Ok(())
            }
            ObjectTrailer::BeltItems { items } => {
                w.write_u32(items.len() as u32)?;
                for item in items {
                    w.write_u32(item.flags)?;
                    w.write_string(&item.item_class)?;
                    item.state.write(w, refs)?;
                    w.write_f32(item.position)?;
                }
                Ok(())
            }
            ObjectTrailer::ConveyorChain { chain } => chain.write(w, refs),
            ObjectTrailer::PlayerState { identity } => identity.write(w),
            ObjectTrailer::Train { previous, next } => {
                w.write_u32(0)?;
                previous.write(w, refs)?;
                next.write(w, refs)
            }
            ObjectTrailer::Vehicles { vehicles } => {
                w.write_u32(vehicles.len() as u32)?;
                for vehicle in vehicles {
                    if vehicle.data.len() != VEHICLE_STATE_LEN {
                        return Err(SavError::malformed(
                            0,
                            format!(
                                "vehicle {} state is {} bytes, not {VEHICLE_STATE_LEN}",
                                vehicle.name,
                                vehicle.data.len()
                            ),
                        ));
                    }
                    w.write_string(&vehicle.name)?;
                    w.write_bytes(vehicle.data.as_slice())?;
                }
                Ok(())
            }
            ObjectTrailer::LightweightBuildables { groups } => {
                w.write_u32(groups.len() as u32)?;
                groups.iter().try_for_each(|g| g.write(w, refs))
            }
            ObjectTrailer::Opaque { data } => w.write_bytes(data.as_slice()),
        }
    }
}

impl VisitRefs for ObjectTrailer {
    fn visit_refs(&mut self, f: &mut dyn FnMut(&mut ObjectRef)) {
        match self {
            ObjectTrailer::PowerLine { source, target } => {
                f(source);
                f(target);
            }
            ObjectTrailer::LevelList { levels } => levels.visit_refs(f),
            ObjectTrailer::Circuits { circuits } => {
                for c in circuits {
                    f(&mut c.circuit);
                }
            }
            ObjectTrailer::BeltItems { items } => {
                for item in items {
                    f(&mut item.state);
                }
            }
            ObjectTrailer::ConveyorChain { chain } => {
                f(&mut chain.first_belt);
                f(&mut chain.last_belt);
                for segment in &mut chain.segments {
                    f(&mut segment.chain_actor);
                    f(&mut segment.belt);
                }
            }
            ObjectTrailer::Train { previous, next } => {
                f(previous);
                f(next);
            }
            ObjectTrailer::LightweightBuildables { groups } => {
                for instance in groups.iter_mut().flat_map(|g| g.instances.iter_mut()) {
                    f(&mut instance.blueprint_proxy);
                }
            }
            ObjectTrailer::None
            | ObjectTrailer::PlayerState { .. }
            | ObjectTrailer::Vehicles { .. }
            | ObjectTrailer::Opaque { .. } => {}
        }
    }
}

impl ConveyorChain {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let first_belt = ObjectRef::read(r)?;
        let last_belt = ObjectRef::read(r)?;

        let count = r.read_u32()?;
        let mut segments = Vec::with_capacity(capacity(count, r));
        for index in 0..count {
            let chain_actor = ObjectRef::read(r)?;
            let belt = ObjectRef::read(r)?;
            let points = r.read_u32()?;
            let mut spline_points = Vec::with_capacity(capacity(points, r));
            for _ in 0..points {
                let mut point = [[0u64; 3]; 3];
                for row in &mut point {
                    for v in row.iter_mut() {
                        *v = r.read_u64()?;
                    }
                }
                spline_points.push(point);
            }
            let values = [r.read_u32()?, r.read_u32()?, r.read_u32()?];
            let offsets = [r.read_i32()?, r.read_i32()?];
            r.expect_u32(index, "chain segment index")?;
            segments.push(ChainSegment {
                chain_actor,
                belt,
                spline_points,
                values,
                offsets,
            });
        }

        let state = r.read_u32()?;
        let offsets = [r.read_i32()?, r.read_i32()?, r.read_i32()?];

        let count = r.read_u32()?;
        let mut items = Vec::with_capacity(capacity(count, r));
        for _ in 0..count {
            r.expect_u32(0, "chain item")?;
            let item_class = r.read_string()?;
            r.expect_u32(0, "chain item")?;
            items.push(ChainItem {
                item_class,
                position: r.read_u32()?,
            });
        }

        Ok(Self {
            first_belt,
            last_belt,
            segments,
            state,
            offsets,
            items,
        })
    }

    fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        self.first_belt.write(w, refs)?;
        self.last_belt.write(w, refs)?;
        w.write_u32(self.segments.len() as u32)?;
        for (index, segment) in self.segments.iter().enumerate() {
            segment.chain_actor.write(w, refs)?;
            segment.belt.write(w, refs)?;
            w.write_u32(segment.spline_points.len() as u32)?;
            for v in segment.spline_points.iter().flatten().flatten() {
                w.write_u64(*v)?;
            }
            for v in segment.values {
                w.write_u32(v)?;
            }
            for v in segment.offsets {
                w.write_i32(v)?;
            }
            w.write_u32(index as u32)?;
        }
        w.write_u32(self.state)?;
        for v in self.offsets {
            w.write_i32(v)?;
        }
        w.write_u32(self.items.len() as u32)?;
        for item in &self.items {
            w.write_u32(0)?;
            w.write_string(&item.item_class)?;
            w.write_u32(0)?;
            w.write_u32(item.position)?;
        }
        Ok(())
    }
}

impl PlayerIdentity {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let offset = r.offset();
        match r.read_u8()? {
            PLAYER_IDENTITY_MARKER => {
                let platform = r.read_u8()?;
                let len = r.read_u32()?;
                Ok(PlayerIdentity::Client {
                    platform,
                    data: OpaqueBytes::from(r.read_bytes(len as usize)?),
                })
            }
            PLAYER_BARE_MARKER if r.is_empty() => Ok(PlayerIdentity::Bare),
            other => Err(SavError::malformed(offset, format!("player state marker {other}"))),
        }
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            PlayerIdentity::Bare => w.write_u8(PLAYER_BARE_MARKER),
            PlayerIdentity::Client { platform, data } => {
                w.write_u8(PLAYER_IDENTITY_MARKER)?;
                w.write_u8(*platform)?;
                w.write_u32(data.len() as u32)?;
                w.write_bytes(data.as_slice())
            }
        }
    }
}

impl LightweightGroup {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        r.expect_u32(0, "lightweight group")?;
        let build_class = r.read_string()?;
        let count = r.read_u32()?;
        let mut instances = Vec::with_capacity(capacity(count, r));
        for _ in 0..count {
            let rotation = read_f64s(r)?;
            let position = read_f64s(r)?;
            let scale = read_f64s(r)?;
            expect_zeros(r, 1, "lightweight instance")?;
            let swatch = r.read_string()?;
            expect_zeros(r, 3, "lightweight instance")?;
            let pattern = r.read_string()?;
            expect_zeros(r, 2, "lightweight instance")?;
            let primary_color = read_f32s(r)?;
            let secondary_color = read_f32s(r)?;
            expect_zeros(r, 2, "lightweight instance")?;
            let variant = r.read_u32()?;
            expect_u8(r, 0, "lightweight instance")?;
            instances.push(LightweightInstance {
                rotation,
                position,
                scale,
                swatch,
                pattern,
                primary_color,
                secondary_color,
                variant,
                recipe: r.read_string()?,
                blueprint_proxy: ObjectRef::read(r)?,
            });
        }
        Ok(Self {
            build_class,
            instances,
        })
    }

    fn write(&self, w: &mut ByteWriter, refs: &ReferenceResolver) -> Result<()> {
        w.write_u32(0)?;
        w.write_string(&self.build_class)?;
        w.write_u32(self.instances.len() as u32)?;
        for i in &self.instances {
            for v in i.rotation.iter().chain(&i.position).chain(&i.scale) {
                w.write_f64(*v)?;
            }
            write_zeros(w, 1)?;
            w.write_string(&i.swatch)?;
            write_zeros(w, 3)?;
            w.write_string(&i.pattern)?;
            write_zeros(w, 2)?;
            for v in i.primary_color.iter().chain(&i.secondary_color) {
                w.write_f32(*v)?;
            }
            write_zeros(w, 2)?;
            w.write_u32(i.variant)?;
            w.write_u8(0)?;
            w.write_string(&i.recipe)?;
            i.blueprint_proxy.write(w, refs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SaveObject;
    use crate::reference::ObjectReference;

    fn header(class: &str) -> ObjectHeader {
        SaveObject::actor(class, "Persistent_Level", "Persistent_Level:PersistentLevel.Thing_1").header
    }

    fn reference(path: &str) -> ObjectReference {
        ObjectReference::new("Persistent_Level", format!("Persistent_Level:PersistentLevel.{path}"))
    }

    fn bytes(f: impl FnOnce(&mut ByteWriter)) -> Vec<u8> {
        let mut w = ByteWriter::new();
        f(&mut w);
        w.into_inner()
    }

    /// Decode `raw` as the trailer of a `class` actor and check it re-encodes
    /// to the same bytes.
    fn decode_round_trip(class: &str, raw: &[u8]) -> ObjectTrailer {
        let trailer = ObjectTrailer::read(&header(class), raw);
        let mut w = ByteWriter::new();
        trailer.write(&mut w, &ReferenceResolver::default()).unwrap();
        assert_eq!(w.as_slice(), raw, "{class}");
        trailer
    }

    fn refs_of(mut trailer: ObjectTrailer) -> Vec<String> {
        let mut paths = Vec::new();
        trailer.visit_refs(&mut |r| paths.push(r.raw.path_name.to_string()));
        paths
    }

    #[test]
    fn test_power_line_and_circuits() {
        let raw = bytes(|w| {
            reference("A.PowerConnection").write(w).unwrap();
            reference("B.PowerConnection").write(w).unwrap();
        });
        match decode_round_trip(POWER_LINE_CLASSES[0], &raw) {
            ObjectTrailer::PowerLine { source, target } => {
                assert!(source.raw.path_name.as_str().ends_with("A.PowerConnection"));
                assert!(target.raw.path_name.as_str().ends_with("B.PowerConnection"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let raw = bytes(|w| {
            w.write_u32(1).unwrap();
            w.write_u32(7).unwrap();
            reference("FGPowerCircuit_7").write(w).unwrap();
        });
        assert!(matches!(
            decode_round_trip(CIRCUIT_SUBSYSTEM_CLASS, &raw),
            ObjectTrailer::Circuits { ref circuits } if circuits[0].id == 7
        ));
    }

    #[test]
    fn test_belt_items() {
        let raw = bytes(|w| {
            w.write_u32(2).unwrap();
            for (class, position) in [("Desc_IronPlate_C", 0.25f32), ("Desc_Wire_C", 1.5)] {
                w.write_u32(0).unwrap();
                w.write_str(&format!("/Game/FactoryGame/Resource/Parts/{class}")).unwrap();
                ObjectReference::default().write(w).unwrap();
                w.write_f32(position).unwrap();
            }
        });
        match decode_round_trip(CONVEYOR_CLASSES[7], &raw) {
            ObjectTrailer::BeltItems { items } => {
                assert_eq!(items.len(), 2);
                assert!(items[1].item_class.as_str().ends_with("Desc_Wire_C"));
                assert_eq!(items[1].position, 1.5);
                assert!(items[0].state.is_null());
            }
            other => panic!("unexpected {other:?}"),
        }
        let empty = 0u32.to_le_bytes();
        assert_eq!(
            decode_round_trip(CONVEYOR_CLASSES[0], &empty),
            ObjectTrailer::BeltItems { items: Vec::new() }
        );
    }

    #[test]
    fn test_conveyor_chain_exposes_belt_references() {
        let raw = bytes(|w| {
            reference("Build_ConveyorBeltMk1_C_1").write(w).unwrap();
            reference("Build_ConveyorBeltMk1_C_2").write(w).unwrap();
            w.write_u32(2).unwrap();
            for index in 0..2u32 {
                reference("FGConveyorChainActor_1").write(w).unwrap();
                reference(&format!("Build_ConveyorBeltMk1_C_{}", index + 1)).write(w).unwrap();
                w.write_u32(1).unwrap();
                for v in 0..9u64 {
                    w.write_u64(v * 100).unwrap();
                }
                for v in [10u32, 20, 30] {
                    w.write_u32(v).unwrap();
                }
                w.write_i32(-1).unwrap();
                w.write_i32(4).unwrap();
                w.write_u32(index).unwrap();
            }
            w.write_u32(5).unwrap();
            for v in [0i32, -1, 2] {
                w.write_i32(v).unwrap();
            }
            w.write_u32(1).unwrap();
            w.write_u32(0).unwrap();
            w.write_str("/Game/FactoryGame/Resource/Parts/IronPlate/Desc_IronPlate.Desc_IronPlate_C").unwrap();
            w.write_u32(0).unwrap();
            w.write_u32(1_234).unwrap();
        });
        let trailer = decode_round_trip(CONVEYOR_CHAIN_CLASSES[2], &raw);
        match &trailer {
            ObjectTrailer::ConveyorChain { chain } => {
                assert_eq!(chain.segments.len(), 2);
                assert_eq!(chain.segments[0].spline_points[0][2], [600, 700, 800]);
                assert_eq!(chain.offsets, [0, -1, 2]);
                assert_eq!(chain.items[0].position, 1_234);
            }
            other => panic!("unexpected {other:?}"),
        }
        let paths = refs_of(trailer);
        assert_eq!(paths.len(), 6);
        assert_eq!(
            paths.iter().filter(|p| p.ends_with("Build_ConveyorBeltMk1_C_2")).count(),
            2
        );
    }

    #[test]
    fn test_chain_segment_out_of_order_stays_opaque() {
        let raw = bytes(|w| {
            ObjectReference::default().write(w).unwrap();
            ObjectReference::default().write(w).unwrap();
            w.write_u32(1).unwrap();
            ObjectReference::default().write(w).unwrap();
            ObjectReference::default().write(w).unwrap();
            w.write_u32(0).unwrap();
            for _ in 0..5 {
                w.write_u32(0).unwrap();
            }
            // first segment claims index 3
            w.write_u32(3).unwrap();
            for _ in 0..5 {
                w.write_u32(0).unwrap();
            }
        });
        assert!(matches!(
            decode_round_trip(CONVEYOR_CHAIN_CLASSES[0], &raw),
            ObjectTrailer::Opaque { .. }
        ));
    }

    #[test]
    fn test_player_state_identities() {
        let raw = bytes(|w| {
            w.write_u8(PLAYER_IDENTITY_MARKER).unwrap();
            w.write_u8(6).unwrap();
            w.write_u32(8).unwrap();
            w.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        });
        match decode_round_trip(PLAYER_STATE_CLASS, &raw) {
            ObjectTrailer::PlayerState {
                identity: PlayerIdentity::Client { platform, data },
            } => {
                assert_eq!(platform, 6);
                assert_eq!(data.len(), 8);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            decode_round_trip(PLAYER_STATE_CLASS, &[PLAYER_BARE_MARKER]),
            ObjectTrailer::PlayerState {
                identity: PlayerIdentity::Bare
            }
        );
        // the bare marker followed by more bytes is not a layout we know
        assert!(matches!(
            decode_round_trip(PLAYER_STATE_CLASS, &[PLAYER_BARE_MARKER, 0]),
            ObjectTrailer::Opaque { .. }
        ));
    }

    #[test]
    fn test_train_neighbours() {
        let raw = bytes(|w| {
            w.write_u32(0).unwrap();
            reference("BP_Locomotive_C_1").write(w).unwrap();
            ObjectReference::default().write(w).unwrap();
        });
        let trailer = decode_round_trip(TRAIN_CLASSES[1], &raw);
        assert!(matches!(&trailer, ObjectTrailer::Train { next, .. } if next.is_null()));
        assert_eq!(refs_of(trailer)[0], "Persistent_Level:PersistentLevel.BP_Locomotive_C_1");

        let with_wagons = bytes(|w| {
            w.write_u32(1).unwrap();
            ObjectReference::default().write(w).unwrap();
            ObjectReference::default().write(w).unwrap();
        });
        assert!(matches!(
            decode_round_trip(TRAIN_CLASSES[0], &with_wagons),
            ObjectTrailer::Opaque { .. }
        ));
    }

    #[test]
    fn test_vehicle_states_have_fixed_length() {
        let raw = bytes(|w| {
            w.write_u32(1).unwrap();
            w.write_str("Explorer").unwrap();
            w.write_bytes(&[9u8; VEHICLE_STATE_LEN]).unwrap();
        });
        let trailer = decode_round_trip(VEHICLE_CLASSES[1], &raw);
        assert!(matches!(&trailer, ObjectTrailer::Vehicles { vehicles } if vehicles[0].name == "Explorer"));

        let short = ObjectTrailer::Vehicles {
            vehicles: vec![VehicleState {
                name: SavString::new("Truck"),
                data: OpaqueBytes(vec![0; 3]),
            }],
        };
        let mut w = ByteWriter::new();
        assert!(matches!(
            short.write(&mut w, &ReferenceResolver::default()),
            Err(SavError::Malformed { .. })
        ));
    }

    #[test]
    fn test_lightweight_buildables() {
        let raw = bytes(|w| {
            w.write_u32(1).unwrap();
            w.write_u32(0).unwrap();
            w.write_str("/Game/FactoryGame/Buildable/Building/Foundation/Build_Foundation_8x4_01.Build_Foundation_8x4_01_C")
                .unwrap();
            w.write_u32(1).unwrap();
            for v in [0.0, 0.0, 0.7071, 0.7071, 800.0, -1600.0, 0.0, 1.0, 1.0, 1.0] {
                w.write_f64(v).unwrap();
            }
            w.write_u32(0).unwrap();
            w.write_str("/Game/FactoryGame/Buildable/-Shared/Customization/Swatches/SwatchDesc_Slot0.SwatchDesc_Slot0_C")
                .unwrap();
            for _ in 0..3 {
                w.write_u32(0).unwrap();
            }
            w.write_string(&SavString::default()).unwrap();
            for _ in 0..2 {
                w.write_u32(0).unwrap();
            }
            for v in [0.9f32, 0.4, 0.1, 1.0, 0.1, 0.1, 0.1, 1.0] {
                w.write_f32(v).unwrap();
            }
            for _ in 0..2 {
                w.write_u32(0).unwrap();
            }
            w.write_u32(2).unwrap();
            w.write_u8(0).unwrap();
            w.write_str("/Game/FactoryGame/Recipes/Buildings/Foundations/Recipe_Foundation_8x4_01.Recipe_Foundation_8x4_01_C")
                .unwrap();
            reference("FGBlueprintProxy_3").write(w).unwrap();
        });
        let trailer = decode_round_trip(LIGHTWEIGHT_SUBSYSTEM_CLASS, &raw);
        match &trailer {
            ObjectTrailer::LightweightBuildables { groups } => {
                let instance = &groups[0].instances[0];
                assert_eq!(instance.position, [800.0, -1600.0, 0.0]);
                assert_eq!(instance.scale, [1.0; 3]);
                assert_eq!(instance.variant, 2);
                assert!(instance.pattern.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(refs_of(trailer), ["Persistent_Level:PersistentLevel.FGBlueprintProxy_3"]);
    }

    #[test]
    fn test_mismatched_trailer_stays_opaque() {
        // claims two references but holds none
        let raw = [2u8, 0, 0, 0, 0xFF];
        assert_eq!(
            decode_round_trip(LEVEL_LIST_CLASSES[0], &raw),
            ObjectTrailer::Opaque {
                data: OpaqueBytes(raw.to_vec())
            }
        );
        // components never carry a decoded trailer
        let component = SaveObject::component(
            "/Script/FactoryGame.FGInventoryComponent",
            "Persistent_Level",
            "Persistent_Level:PersistentLevel.A.Inventory",
            "Persistent_Level:PersistentLevel.A",
        );
        assert!(matches!(
            ObjectTrailer::read(&component.header, &[0, 0, 0, 0]),
            ObjectTrailer::Opaque { .. }
        ));
    }
}
