//! Read-only Lua snapshots of packets and players.

use mc_intercept_proto::{BlockPos, PacketContainer, Uuid};
use mlua::prelude::*;

/// Identity of the connection a filter runs for.
#[derive(Debug, Clone)]
pub struct ScriptPlayer {
    pub uuid: Uuid,
    pub name: String,
    pub address: Option<String>,
}

impl ScriptPlayer {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            address: None,
        }
    }
}

/// Build the `player` table: `{uuid, name, address?}`.
pub(crate) fn player_table(lua: &Lua, player: &ScriptPlayer) -> LuaResult<LuaTable> {
    let t = lua.create_table()?;
    t.set("uuid", player.uuid.to_string())?;
    t.set("name", player.name.as_str())?;
    if let Some(address) = &player.address {
        t.set("address", address.as_str())?;
    }
    Ok(t)
}

/// Build the `packet` table. Sequences are 1-based copies of each typed view; scripts
/// cannot write back into the packet.
pub(crate) fn packet_table(lua: &Lua, packet: &PacketContainer) -> LuaResult<LuaTable> {
    let class = packet.handle().class();
    let t = lua.create_table()?;
    t.set("type", packet.packet_type().name())?;
    t.set("class", class.name())?;
    t.set("direction", class.direction().name())?;
    t.set("phase", class.phase().name())?;

    t.set("integers", lua.create_sequence_from(packet.values::<i32>())?)?;
    t.set("longs", lua.create_sequence_from(packet.values::<i64>())?)?;
    t.set("shorts", lua.create_sequence_from(packet.values::<i16>())?)?;
    t.set("bytes", lua.create_sequence_from(packet.values::<i8>())?)?;
    t.set("doubles", lua.create_sequence_from(packet.values::<f64>())?)?;
    t.set("floats", lua.create_sequence_from(packet.values::<f32>())?)?;
    t.set("booleans", lua.create_sequence_from(packet.values::<bool>())?)?;
    t.set("strings", lua.create_sequence_from(packet.values::<String>())?)?;
    t.set(
        "uuids",
        lua.create_sequence_from(packet.values::<Uuid>().iter().map(Uuid::to_string))?,
    )?;

    let arrays = lua.create_table()?;
    for (i, bytes) in packet.values::<Vec<u8>>().iter().enumerate() {
        arrays.set(i + 1, lua.create_string(bytes)?)?;
    }
    t.set("byte_arrays", arrays)?;

    let positions = lua.create_table()?;
    for (i, pos) in packet.values::<BlockPos>().into_iter().enumerate() {
        positions.set(i + 1, block_pos_table(lua, pos)?)?;
    }
    t.set("block_positions", positions)?;

    Ok(t)
}

fn block_pos_table(lua: &Lua, pos: BlockPos) -> LuaResult<LuaTable> {
    let t = lua.create_table()?;
    t.set("x", pos.x)?;
    t.set("y", pos.y)?;
    t.set("z", pos.z)?;
    Ok(t)
}
