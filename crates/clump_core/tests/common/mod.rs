//! Shared fixtures: a small game-object model registered the way an engine
//! subsystem would register it.

#![allow(dead_code)]

use bytemuck::{Pod, Zeroable};
use std::io::Cursor;
use std::mem::offset_of;
use std::sync::Arc;

use clump_core::{
    load_image, registry_builder, save_image, Addr, Arena, BumpAllocator, ClumpConfig, ClumpResult,
    GraphVisitor, Handle, MemoryBlock, SharedAllocator, StableId,
};
use clump_reflect::{builtin, Dict, DynArray, Reflect, TypeRegistry};

pub const ENTITY: StableId = StableId(1024);
pub const MONSTER: StableId = StableId(1025);
pub const WEAPON: StableId = StableId(1026);
pub const SQUAD: StableId = StableId(1027);
pub const SCORES: StableId = StableId(1030);
pub const MONSTER_REF: StableId = StableId(1031);
pub const LOOT: StableId = StableId(1032);
pub const POSITION: StableId = StableId(1033);
pub const MODS: StableId = StableId(1034);
pub const MEMBERS: StableId = StableId(1035);

/// Budget of the test allocators.
pub const BUDGET: u64 = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Entity {
    pub id: u32,
    pub flags: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Monster {
    pub id: u32,
    pub flags: u32,
    pub hp: i32,
    pub level: u32,
    pub scores: DynArray,
    pub target: Addr,
    pub loot: Dict,
    pub cache: u64,
    pub pos: [f32; 3],
    pub _pad: u32,
}

impl Reflect for Monster {
    const TYPE_ID: StableId = MONSTER;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Weapon {
    pub damage: f32,
    pub durability: u32,
    pub owner: Addr,
    pub mods: DynArray,
}

impl Reflect for Weapon {
    const TYPE_ID: StableId = WEAPON;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Squad {
    pub members: DynArray,
    pub banner: u64,
}

impl Reflect for Squad {
    const TYPE_ID: StableId = SQUAD;
}

pub fn registry() -> Arc<TypeRegistry> {
    let mut b = registry_builder().unwrap();
    b.record::<Entity>("Entity", ENTITY)
        .field("id", offset_of!(Entity, id), builtin::U32)
        .field("flags", offset_of!(Entity, flags), builtin::U32)
        .finish()
        .unwrap();
    b.dynamic_array("Scores", SCORES, builtin::I32).unwrap();
    b.pointer("MonsterRef", MONSTER_REF, MONSTER).unwrap();
    b.dictionary("Loot", LOOT, builtin::U32, builtin::U64).unwrap();
    b.static_array("Position", POSITION, builtin::F32, 3).unwrap();
    b.dynamic_array("Mods", MODS, builtin::U32).unwrap();
    b.dynamic_array("Members", MEMBERS, MONSTER_REF).unwrap();
    b.record::<Monster>("Monster", MONSTER)
        .parent(ENTITY)
        .field("hp", offset_of!(Monster, hp), builtin::I32)
        .field("level", offset_of!(Monster, level), builtin::U32)
        .field("scores", offset_of!(Monster, scores), SCORES)
        .field("target", offset_of!(Monster, target), MONSTER_REF)
        .field("loot", offset_of!(Monster, loot), LOOT)
        .runtime_field("cache", offset_of!(Monster, cache), builtin::U64)
        .field("pos", offset_of!(Monster, pos), POSITION)
        .finish()
        .unwrap();
    b.record::<Weapon>("Weapon", WEAPON)
        .field("damage", offset_of!(Weapon, damage), builtin::F32)
        .field("durability", offset_of!(Weapon, durability), builtin::U32)
        .field("owner", offset_of!(Weapon, owner), MONSTER_REF)
        .field("mods", offset_of!(Weapon, mods), MODS)
        .finish()
        .unwrap();
    b.record::<Squad>("Squad", SQUAD)
        .field("members", offset_of!(Squad, members), MEMBERS)
        .field("banner", offset_of!(Squad, banner), builtin::ASSET_REF)
        .finish()
        .unwrap();
    Arc::new(b.build().unwrap())
}

pub fn shared_allocator() -> SharedAllocator<BumpAllocator> {
    SharedAllocator::new(BumpAllocator::new(BUDGET))
}

pub fn new_arena(registry: &Arc<TypeRegistry>, allocator: &SharedAllocator<BumpAllocator>) -> Arena {
    Arena::new(
        Arc::clone(registry),
        Box::new(allocator.clone()),
        ClumpConfig::default(),
    )
    .unwrap()
}

pub fn save(arena: &Arena) -> Vec<u8> {
    let mut bytes = Vec::new();
    save_image(arena, &mut bytes).unwrap();
    bytes
}

pub fn load(
    bytes: &[u8],
    registry: &Arc<TypeRegistry>,
    allocator: &SharedAllocator<BumpAllocator>,
) -> ClumpResult<Arena> {
    load_with(bytes, registry, allocator, &ClumpConfig::default())
}

pub fn load_with(
    bytes: &[u8],
    registry: &Arc<TypeRegistry>,
    allocator: &SharedAllocator<BumpAllocator>,
    config: &ClumpConfig,
) -> ClumpResult<Arena> {
    load_image(
        &mut Cursor::new(bytes),
        Box::new(allocator.clone()),
        Arc::clone(registry),
        config,
    )
}

/// Handles created by [`populate`].
pub struct Population {
    pub monsters: Vec<Handle>,
    pub weapons: Vec<Handle>,
    pub squad: Handle,
    pub freed: Handle,
}

/// Fills an arena with cross-linked monsters, weapons and a squad, then
/// frees one monster nobody points at.
pub fn populate(arena: &mut Arena) -> Population {
    let mut monsters = Vec::new();
    for i in 0..40_u32 {
        let h = arena
            .new_object(Monster {
                id: i,
                flags: i % 3,
                hp: 100 - i as i32,
                level: i / 4,
                cache: 0xDEAD,
                pos: [i as f32, 0.5, -1.0],
                ..Monster::default()
            })
            .unwrap();
        for s in 0..i % 5 {
            arena.array_push(h, "scores", (i * 10 + s) as i32).unwrap();
        }
        for k in 0..i % 4 {
            arena
                .dict_insert(h, "loot", 100 - k, u64::from(i) * 1000 + u64::from(k))
                .unwrap();
        }
        monsters.push(h);
    }

    for (i, &h) in monsters.iter().enumerate() {
        let mut m: Monster = arena.get(h).unwrap();
        m.target = if i == 6 {
            Addr::NULL
        } else {
            arena.address_of(monsters[(i + 7) % monsters.len()]).unwrap()
        };
        arena.set(h, m).unwrap();
    }

    let mut weapons = Vec::new();
    for i in 0..10_u32 {
        let owner = arena.address_of(monsters[i as usize * 3]).unwrap();
        let h = arena
            .new_object(Weapon {
                damage: i as f32 * 1.5,
                durability: 100 - i,
                owner,
                mods: DynArray::EMPTY,
            })
            .unwrap();
        for m in 0..i % 3 {
            arena.array_push(h, "mods", m + 1).unwrap();
        }
        weapons.push(h);
    }

    let squad = arena
        .new_object(Squad {
            banner: 0xABCD_EF01,
            ..Squad::default()
        })
        .unwrap();
    for &member in &monsters[..5] {
        let addr = arena.address_of(member).unwrap();
        arena.array_push(squad, "members", addr).unwrap();
    }

    let freed = monsters.remove(13);
    arena.free_object(freed).unwrap();

    Population {
        monsters,
        weapons,
        squad,
        freed,
    }
}

/// Renders every live object with pointers resolved to handles, so two
/// arenas at different addresses can be compared.
pub fn summarize(arena: &Arena) -> Vec<String> {
    let target = |addr: Addr| {
        if addr.is_null() {
            "null".to_string()
        } else {
            arena
                .handle_at(addr)
                .map_or_else(|e| format!("invalid({e})"), |h| h.to_string())
        }
    };

    let mut out = Vec::new();
    for h in arena.objects::<Monster>().unwrap() {
        let m: Monster = arena.get(h).unwrap();
        let scores: Vec<i32> = arena.array_items(h, "scores").unwrap();
        let loot: Vec<(u32, u64)> = arena.dict_entries(h, "loot").unwrap();
        out.push(format!(
            "monster {h}: id={} flags={} hp={} level={} pos={:?} scores={scores:?} loot={loot:?} target={}",
            m.id,
            m.flags,
            m.hp,
            m.level,
            m.pos,
            target(m.target)
        ));
    }
    for h in arena.objects::<Weapon>().unwrap() {
        let w: Weapon = arena.get(h).unwrap();
        let mods: Vec<u32> = arena.array_items(h, "mods").unwrap();
        out.push(format!(
            "weapon {h}: damage={} durability={} mods={mods:?} owner={}",
            w.damage,
            w.durability,
            target(w.owner)
        ));
    }
    for h in arena.objects::<Squad>().unwrap() {
        let s: Squad = arena.get(h).unwrap();
        let members: Vec<Addr> = arena.array_items(h, "members").unwrap();
        let members: Vec<String> = members.into_iter().map(target).collect();
        out.push(format!("squad {h}: banner={:#x} members={members:?}", s.banner));
    }
    out
}

/// Records every pointer of a walk that leaves `[base, base + len)`.
pub struct PointerBounds {
    pub base: u64,
    pub len: u64,
    pub pointers: usize,
    pub escaped: Vec<(Addr, Addr)>,
}

impl PointerBounds {
    pub fn new(base: Addr, len: u64) -> Self {
        Self {
            base: base.get(),
            len,
            pointers: 0,
            escaped: Vec::new(),
        }
    }
}

impl GraphVisitor for PointerBounds {
    fn visit_block(&mut self, _block: MemoryBlock) -> ClumpResult<()> {
        Ok(())
    }

    fn visit_pointer(&mut self, slot: Addr, target: Addr) -> ClumpResult<()> {
        self.pointers += 1;
        let inside = target.get() >= self.base && target.get() < self.base + self.len;
        if !inside {
            self.escaped.push((slot, target));
        }
        Ok(())
    }
}
