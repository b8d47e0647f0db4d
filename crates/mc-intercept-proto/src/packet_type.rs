//! Packet type registry.
//!
//! Every interceptable packet has a symbolic [`PacketType`] tied to a protocol phase, a
//! direction and the name of the wire class that carries it. The table is fixed at compile
//! time; wire classes the table does not know resolve to [`PacketType::Unknown`].

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use serde::Deserialize;

/// Connection protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Handshake,
    Status,
    Login,
    Configuration,
    Play,
}

/// Direction a packet travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ServerToClient,
    ClientToServer,
    Unknown,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Handshake => "handshake",
            Phase::Status => "status",
            Phase::Login => "login",
            Phase::Configuration => "configuration",
            Phase::Play => "play",
        }
    }
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Direction::ServerToClient => "server_to_client",
            Direction::ClientToServer => "client_to_server",
            Direction::Unknown => "unknown",
        }
    }

    pub fn is_outbound(self) -> bool {
        self == Direction::ServerToClient
    }

    pub fn is_inbound(self) -> bool {
        self == Direction::ClientToServer
    }
}

macro_rules! packet_types {
    ($($variant:ident => $name:literal, $phase:ident, $direction:ident, $class:literal;)*) => {
        /// Symbolic packet identifier.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum PacketType {
            $($variant,)*
            Unknown,
        }

        impl PacketType {
            /// Every known type, `Unknown` excluded.
            pub const ALL: &'static [PacketType] = &[$(PacketType::$variant,)*];

            /// Symbolic name, e.g. `PLAY_CLIENT_CHAT`.
            pub fn name(self) -> &'static str {
                match self {
                    $(PacketType::$variant => $name,)*
                    PacketType::Unknown => "UNKNOWN",
                }
            }

            /// Protocol phase. `Unknown` reports `Play`, where unmapped traffic is expected.
            pub fn phase(self) -> Phase {
                match self {
                    $(PacketType::$variant => Phase::$phase,)*
                    PacketType::Unknown => Phase::Play,
                }
            }

            pub fn direction(self) -> Direction {
                match self {
                    $(PacketType::$variant => Direction::$direction,)*
                    PacketType::Unknown => Direction::Unknown,
                }
            }

            /// Name of the wire class this type is carried by.
            pub fn class_name(self) -> Option<&'static str> {
                match self {
                    $(PacketType::$variant => Some($class),)*
                    PacketType::Unknown => None,
                }
            }
        }
    };
}

packet_types! {
    HandshakeClientSetProtocol => "HANDSHAKE_CLIENT_SET_PROTOCOL", Handshake, ClientToServer, "ClientIntentionPacket";

    StatusClientStart => "STATUS_CLIENT_START", Status, ClientToServer, "ServerboundStatusRequestPacket";
    StatusClientPing => "STATUS_CLIENT_PING", Status, ClientToServer, "ServerboundPingRequestPacket";
    StatusServerInfo => "STATUS_SERVER_INFO", Status, ServerToClient, "ClientboundStatusResponsePacket";
    StatusServerPong => "STATUS_SERVER_PONG", Status, ServerToClient, "ClientboundPongResponsePacket";

    LoginClientStart => "LOGIN_CLIENT_START", Login, ClientToServer, "ServerboundHelloPacket";
    LoginClientEncryptionBegin => "LOGIN_CLIENT_ENCRYPTION_BEGIN", Login, ClientToServer, "ServerboundKeyPacket";
    LoginClientCustomPayload => "LOGIN_CLIENT_CUSTOM_PAYLOAD", Login, ClientToServer, "ServerboundCustomQueryAnswerPacket";
    LoginServerDisconnect => "LOGIN_SERVER_DISCONNECT", Login, ServerToClient, "ClientboundLoginDisconnectPacket";
    LoginServerEncryptionBegin => "LOGIN_SERVER_ENCRYPTION_BEGIN", Login, ServerToClient, "ClientboundHelloPacket";
    LoginServerSuccess => "LOGIN_SERVER_SUCCESS", Login, ServerToClient, "ClientboundGameProfilePacket";
    LoginServerSetCompression => "LOGIN_SERVER_SET_COMPRESSION", Login, ServerToClient, "ClientboundLoginCompressionPacket";
    LoginClientLoginAck => "LOGIN_CLIENT_LOGIN_ACK", Login, ClientToServer, "ServerboundLoginAcknowledgedPacket";
    LoginServerCustomPayload => "LOGIN_SERVER_CUSTOM_PAYLOAD", Login, ServerToClient, "ClientboundCustomQueryPacket";

    ConfigurationClientSettings => "CONFIGURATION_CLIENT_SETTINGS", Configuration, ClientToServer, "ServerboundClientInformationPacket";
    ConfigurationClientCustomPayload => "CONFIGURATION_CLIENT_CUSTOM_PAYLOAD", Configuration, ClientToServer, "ServerboundConfigurationCustomPayloadPacket";
    ConfigurationClientFinishConfiguration => "CONFIGURATION_CLIENT_FINISH_CONFIGURATION", Configuration, ClientToServer, "ServerboundFinishConfigurationPacket";
    ConfigurationClientKeepAlive => "CONFIGURATION_CLIENT_KEEP_ALIVE", Configuration, ClientToServer, "ServerboundConfigurationKeepAlivePacket";
    ConfigurationClientPong => "CONFIGURATION_CLIENT_PONG", Configuration, ClientToServer, "ServerboundConfigurationPongPacket";
    ConfigurationClientResourcePackStatus => "CONFIGURATION_CLIENT_RESOURCE_PACK_STATUS", Configuration, ClientToServer, "ServerboundConfigurationResourcePackPacket";
    ConfigurationServerCustomPayload => "CONFIGURATION_SERVER_CUSTOM_PAYLOAD", Configuration, ServerToClient, "ClientboundConfigurationCustomPayloadPacket";
    ConfigurationServerFinishConfiguration => "CONFIGURATION_SERVER_FINISH_CONFIGURATION", Configuration, ServerToClient, "ClientboundFinishConfigurationPacket";
    ConfigurationServerKeepAlive => "CONFIGURATION_SERVER_KEEP_ALIVE", Configuration, ServerToClient, "ClientboundConfigurationKeepAlivePacket";
    ConfigurationServerPing => "CONFIGURATION_SERVER_PING", Configuration, ServerToClient, "ClientboundConfigurationPingPacket";
    ConfigurationServerRegistryData => "CONFIGURATION_SERVER_REGISTRY_DATA", Configuration, ServerToClient, "ClientboundRegistryDataPacket";
    ConfigurationServerUpdateEnabledFeatures => "CONFIGURATION_SERVER_UPDATE_ENABLED_FEATURES", Configuration, ServerToClient, "ClientboundUpdateEnabledFeaturesPacket";
    ConfigurationServerUpdateTags => "CONFIGURATION_SERVER_UPDATE_TAGS", Configuration, ServerToClient, "ClientboundConfigurationUpdateTagsPacket";

    PlayClientKeepAlive => "PLAY_CLIENT_KEEP_ALIVE", Play, ClientToServer, "ServerboundKeepAlivePacket";
    PlayClientChat => "PLAY_CLIENT_CHAT", Play, ClientToServer, "ServerboundChatPacket";
    PlayClientChatCommand => "PLAY_CLIENT_CHAT_COMMAND", Play, ClientToServer, "ServerboundChatCommandPacket";
    PlayClientUseEntity => "PLAY_CLIENT_USE_ENTITY", Play, ClientToServer, "ServerboundInteractPacket";
    PlayClientPosition => "PLAY_CLIENT_POSITION", Play, ClientToServer, "ServerboundMovePlayerPacket$Pos";
    PlayClientPositionLook => "PLAY_CLIENT_POSITION_LOOK", Play, ClientToServer, "ServerboundMovePlayerPacket$PosRot";
    PlayClientLook => "PLAY_CLIENT_LOOK", Play, ClientToServer, "ServerboundMovePlayerPacket$Rot";
    PlayClientFlying => "PLAY_CLIENT_FLYING", Play, ClientToServer, "ServerboundMovePlayerPacket$StatusOnly";
    PlayClientBlockDig => "PLAY_CLIENT_BLOCK_DIG", Play, ClientToServer, "ServerboundPlayerActionPacket";
    PlayClientBlockPlace => "PLAY_CLIENT_BLOCK_PLACE", Play, ClientToServer, "ServerboundUseItemOnPacket";
    PlayClientHeldItemSlot => "PLAY_CLIENT_HELD_ITEM_SLOT", Play, ClientToServer, "ServerboundSetCarriedItemPacket";
    PlayClientArmAnimation => "PLAY_CLIENT_ARM_ANIMATION", Play, ClientToServer, "ServerboundSwingPacket";
    PlayClientEntityAction => "PLAY_CLIENT_ENTITY_ACTION", Play, ClientToServer, "ServerboundPlayerCommandPacket";
    PlayClientCloseWindow => "PLAY_CLIENT_CLOSE_WINDOW", Play, ClientToServer, "ServerboundContainerClosePacket";
    PlayClientWindowClick => "PLAY_CLIENT_WINDOW_CLICK", Play, ClientToServer, "ServerboundContainerClickPacket";
    PlayClientCustomPayload => "PLAY_CLIENT_CUSTOM_PAYLOAD", Play, ClientToServer, "ServerboundCustomPayloadPacket";
    PlayClientUseItem => "PLAY_CLIENT_USE_ITEM", Play, ClientToServer, "ServerboundUseItemPacket";

    PlayServerKeepAlive => "PLAY_SERVER_KEEP_ALIVE", Play, ServerToClient, "ClientboundKeepAlivePacket";
    PlayServerChat => "PLAY_SERVER_CHAT", Play, ServerToClient, "ClientboundSystemChatPacket";
    PlayServerPlayerChat => "PLAY_SERVER_PLAYER_CHAT", Play, ServerToClient, "ClientboundPlayerChatPacket";
    PlayServerSpawnPosition => "PLAY_SERVER_SPAWN_POSITION", Play, ServerToClient, "ClientboundSetDefaultSpawnPositionPacket";
    PlayServerUpdateHealth => "PLAY_SERVER_UPDATE_HEALTH", Play, ServerToClient, "ClientboundSetHealthPacket";
    PlayServerPosition => "PLAY_SERVER_POSITION", Play, ServerToClient, "ClientboundPlayerPositionPacket";
    PlayServerAnimation => "PLAY_SERVER_ANIMATION", Play, ServerToClient, "ClientboundAnimatePacket";
    PlayServerSpawnEntity => "PLAY_SERVER_SPAWN_ENTITY", Play, ServerToClient, "ClientboundAddEntityPacket";
    PlayServerSpawnEntityLiving => "PLAY_SERVER_SPAWN_ENTITY_LIVING", Play, ServerToClient, "ClientboundAddMobPacket";
    PlayServerEntityVelocity => "PLAY_SERVER_ENTITY_VELOCITY", Play, ServerToClient, "ClientboundSetEntityMotionPacket";
    PlayServerEntityDestroy => "PLAY_SERVER_ENTITY_DESTROY", Play, ServerToClient, "ClientboundRemoveEntitiesPacket";
    PlayServerRelEntityMove => "PLAY_SERVER_REL_ENTITY_MOVE", Play, ServerToClient, "ClientboundMoveEntityPacket$Pos";
    PlayServerEntityLook => "PLAY_SERVER_ENTITY_LOOK", Play, ServerToClient, "ClientboundMoveEntityPacket$Rot";
    PlayServerEntityMoveLook => "PLAY_SERVER_ENTITY_MOVE_LOOK", Play, ServerToClient, "ClientboundMoveEntityPacket$PosRot";
    PlayServerEntityTeleport => "PLAY_SERVER_ENTITY_TELEPORT", Play, ServerToClient, "ClientboundTeleportEntityPacket";
    PlayServerEntityHeadRotation => "PLAY_SERVER_ENTITY_HEAD_ROTATION", Play, ServerToClient, "ClientboundRotateHeadPacket";
    PlayServerEntityStatus => "PLAY_SERVER_ENTITY_STATUS", Play, ServerToClient, "ClientboundEntityEventPacket";
    PlayServerEntityMetadata => "PLAY_SERVER_ENTITY_METADATA", Play, ServerToClient, "ClientboundSetEntityDataPacket";
    PlayServerBlockChange => "PLAY_SERVER_BLOCK_CHANGE", Play, ServerToClient, "ClientboundBlockUpdatePacket";
    PlayServerMultiBlockChange => "PLAY_SERVER_MULTI_BLOCK_CHANGE", Play, ServerToClient, "ClientboundSectionBlocksUpdatePacket";
    PlayServerExplosion => "PLAY_SERVER_EXPLOSION", Play, ServerToClient, "ClientboundExplodePacket";
    PlayServerWorldParticles => "PLAY_SERVER_WORLD_PARTICLES", Play, ServerToClient, "ClientboundLevelParticlesPacket";
    PlayServerNamedSoundEffect => "PLAY_SERVER_NAMED_SOUND_EFFECT", Play, ServerToClient, "ClientboundSoundPacket";
    PlayServerCustomSoundEffect => "PLAY_SERVER_CUSTOM_SOUND_EFFECT", Play, ServerToClient, "ClientboundCustomSoundPacket";
    PlayServerWorldEvent => "PLAY_SERVER_WORLD_EVENT", Play, ServerToClient, "ClientboundLevelEventPacket";
    PlayServerCustomPayload => "PLAY_SERVER_CUSTOM_PAYLOAD", Play, ServerToClient, "ClientboundCustomPayloadPacket";
    PlayServerKickDisconnect => "PLAY_SERVER_KICK_DISCONNECT", Play, ServerToClient, "ClientboundDisconnectPacket";
    PlayServerTitle => "PLAY_SERVER_TITLE", Play, ServerToClient, "ClientboundSetTitleTextPacket";
}

impl PacketType {
    /// Resolve a wire class name. Unmapped names yield `Unknown`.
    pub fn from_class(class_name: &str) -> PacketType {
        static BY_CLASS: OnceLock<HashMap<&'static str, PacketType>> = OnceLock::new();
        let table = BY_CLASS.get_or_init(|| {
            PacketType::ALL
                .iter()
                .filter_map(|t| t.class_name().map(|c| (c, *t)))
                .collect()
        });
        table.get(class_name).copied().unwrap_or(PacketType::Unknown)
    }

    /// Resolve a symbolic name (`PLAY_CLIENT_CHAT`), case-insensitively.
    pub fn from_name(name: &str) -> Option<PacketType> {
        static BY_NAME: OnceLock<HashMap<&'static str, PacketType>> = OnceLock::new();
        let table =
            BY_NAME.get_or_init(|| PacketType::ALL.iter().map(|t| (t.name(), *t)).collect());
        table.get(name.to_ascii_uppercase().as_str()).copied()
    }

    pub fn is_client_to_server(self) -> bool {
        self.direction().is_inbound()
    }

    pub fn is_server_to_client(self) -> bool {
        self.direction().is_outbound()
    }

    /// Types whose first integer slot is an entity id.
    pub fn carries_entity_id(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            PlayClientUseEntity
                | PlayClientEntityAction
                | PlayServerAnimation
                | PlayServerSpawnEntity
                | PlayServerSpawnEntityLiving
                | PlayServerEntityVelocity
                | PlayServerRelEntityMove
                | PlayServerEntityLook
                | PlayServerEntityMoveLook
                | PlayServerEntityTeleport
                | PlayServerEntityHeadRotation
                | PlayServerEntityStatus
                | PlayServerEntityMetadata
        )
    }

    /// Types whose first string slot is a chat or disconnect message.
    pub fn carries_message(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            PlayClientChat
                | PlayClientChatCommand
                | PlayServerChat
                | PlayServerPlayerChat
                | PlayServerKickDisconnect
                | PlayServerTitle
                | LoginServerDisconnect
        )
    }

    /// Types whose first block-position slot is the affected block.
    pub fn carries_block_position(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            PlayClientBlockDig
                | PlayClientBlockPlace
                | PlayServerBlockChange
                | PlayServerSpawnPosition
                | PlayServerWorldEvent
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
