//! Binary protocol message definitions
//! Message type ids and the inbound (client -> server) decoders

use glam::Vec2;

use super::bitstream::{BitReader, StreamError, DEFAULT_GAME_TYPE_BITS};

/// Protocol version clients are expected to announce in Join.
pub const PROTOCOL_VERSION: u32 = 78;

/// Longest accepted player name, in characters.
pub const MAX_NAME_LEN: usize = 16;

/// Leading byte of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Join = 1,
    Input = 3,
    Joined = 5,
    Update = 6,
    Kill = 7,
    Pickup = 9,
    Map = 10,
    Spectate = 11,
    DropItem = 12,
    Emote = 13,
    AliveCounts = 20,
}

impl TryFrom<u8> for MsgType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Join,
            3 => Self::Input,
            5 => Self::Joined,
            6 => Self::Update,
            7 => Self::Kill,
            9 => Self::Pickup,
            10 => Self::Map,
            11 => Self::Spectate,
            12 => Self::DropItem,
            13 => Self::Emote,
            20 => Self::AliveCounts,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Inbound message decoding errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("{0:?} is not a client message")]
    NotInbound(MsgType),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Discrete action codes embedded in Input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputAction {
    Interact = 7,
    Loot = 10,
    EquipPrimary = 11,
    EquipSecondary = 12,
    EquipThrowable = 13,
    EquipMelee = 14,
}

impl InputAction {
    /// Unknown codes are ignored rather than rejected.
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            7 => Self::Interact,
            10 => Self::Loot,
            11 => Self::EquipPrimary,
            12 => Self::EquipSecondary,
            13 => Self::EquipThrowable,
            14 => Self::EquipMelee,
            _ => return None,
        })
    }
}

/// Touch joystick state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchMove {
    pub dir: Vec2,
    pub len: u8,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputMsg {
    pub seq: u8,
    pub move_left: bool,
    pub move_right: bool,
    pub move_up: bool,
    pub move_down: bool,
    pub shoot_start: bool,
    pub shoot_hold: bool,
    pub portrait: bool,
    pub touch_move: Option<TouchMove>,
    pub facing: Vec2,
    pub mouse_distance: f32,
    pub actions: Vec<u8>,
    pub active_item: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmoteMsg {
    pub position: Vec2,
    pub type_id: u16,
    pub is_ping: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinMsg {
    pub protocol: u32,
    pub name: String,
    pub use_touch: bool,
    pub is_mobile: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropItemMsg {
    pub item: u16,
    pub weapon_slot: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpectateMsg {
    pub begin: bool,
    pub next: bool,
    pub prev: bool,
    pub force: bool,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    Input(InputMsg),
    Emote(EmoteMsg),
    Join(JoinMsg),
    DropItem(DropItemMsg),
    Spectate(SpectateMsg),
}

impl ClientMsg {
    /// Decode one inbound message; never panics on malformed input.
    pub fn decode(data: &[u8], game_type_bits: u32) -> Result<Self, ProtocolError> {
        let Some(&first) = data.first() else {
            return Err(ProtocolError::Empty);
        };
        let msg_type = MsgType::try_from(first)?;
        let mut r = BitReader::new(&data[1..]).with_game_type_bits(game_type_bits);

        match msg_type {
            MsgType::Input => Ok(Self::Input(decode_input(&mut r)?)),
            MsgType::Emote => Ok(Self::Emote(EmoteMsg {
                position: r.read_vec(0.0, 0.0, 1024.0, 1024.0, 16)?,
                type_id: r.read_game_type()?,
                is_ping: r.read_bool()?,
            })),
            MsgType::Join => {
                let protocol = r.read_u32()?;
                let name = sanitize_name(&r.read_string()?);
                let use_touch = r.read_bool()?;
                let is_mobile = r.read_bool()?;
                Ok(Self::Join(JoinMsg {
                    protocol,
                    name,
                    use_touch,
                    is_mobile,
                }))
            }
            MsgType::DropItem => Ok(Self::DropItem(DropItemMsg {
                item: r.read_game_type()?,
                weapon_slot: r.read_u8()?,
            })),
            MsgType::Spectate => Ok(Self::Spectate(SpectateMsg {
                begin: r.read_bool()?,
                next: r.read_bool()?,
                prev: r.read_bool()?,
                force: r.read_bool()?,
            })),
            other => Err(ProtocolError::NotInbound(other)),
        }
    }
}

fn decode_input(r: &mut BitReader<'_>) -> Result<InputMsg, ProtocolError> {
    let seq = r.read_u8()?;
    let move_left = r.read_bool()?;
    let move_right = r.read_bool()?;
    let move_up = r.read_bool()?;
    let move_down = r.read_bool()?;
    let shoot_start = r.read_bool()?;
    let shoot_hold = r.read_bool()?;
    let portrait = r.read_bool()?;

    let touch_move = if r.read_bool()? {
        Some(TouchMove {
            dir: r.read_unit_vec(8)?,
            len: r.read_u8()?,
        })
    } else {
        None
    };

    let facing = r.read_unit_vec(10)?;
    let mouse_distance = r.read_float(0.0, 64.0, 8)?;

    let count = r.read_bits(4)?;
    let mut actions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        actions.push(r.read_u8()?);
    }
    let active_item = r.read_game_type()?;

    Ok(InputMsg {
        seq,
        move_left,
        move_right,
        move_up,
        move_down,
        shoot_start,
        shoot_hold,
        portrait,
        touch_move,
        facing,
        mouse_distance,
        actions,
        active_item,
    })
}

/// Trim, strip control characters and cap the length; empty names get a default.
pub fn sanitize_name(raw: &str) -> String {
    let name: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN)
        .collect();
    if name.is_empty() {
        "Player".to_string()
    } else {
        name
    }
}

#[cfg(test)]
pub(crate) mod encode {
    //! Client-side encoders used to drive the server in tests.

    use bytes::Bytes;

    use super::*;
    use crate::ws::bitstream::BitWriter;

    pub fn input(msg: &InputMsg) -> Bytes {
        let mut w = BitWriter::with_capacity(64);
        w.write_u8(MsgType::Input as u8);
        w.write_u8(msg.seq);
        w.write_bool(msg.move_left);
        w.write_bool(msg.move_right);
        w.write_bool(msg.move_up);
        w.write_bool(msg.move_down);
        w.write_bool(msg.shoot_start);
        w.write_bool(msg.shoot_hold);
        w.write_bool(msg.portrait);
        w.write_bool(msg.touch_move.is_some());
        if let Some(touch) = msg.touch_move {
            w.write_unit_vec(touch.dir, 8);
            w.write_u8(touch.len);
        }
        w.write_unit_vec(msg.facing, 10);
        w.write_float(msg.mouse_distance, 0.0, 64.0, 8);
        w.write_bits(msg.actions.len() as u32, 4);
        for &action in &msg.actions {
            w.write_u8(action);
        }
        w.write_game_type(msg.active_item);
        w.write_bits(0, 5);
        w.finish()
    }

    pub fn emote(msg: &EmoteMsg) -> Bytes {
        let mut w = BitWriter::with_capacity(16);
        w.write_u8(MsgType::Emote as u8);
        w.write_vec(msg.position, 0.0, 0.0, 1024.0, 1024.0, 16);
        w.write_game_type(msg.type_id);
        w.write_bool(msg.is_ping);
        w.write_bits(0, 4);
        w.finish()
    }

    pub fn join(name: &str) -> Bytes {
        let mut w = BitWriter::with_capacity(64);
        w.write_u8(MsgType::Join as u8);
        w.write_u32(PROTOCOL_VERSION);
        w.write_string(name);
        w.write_bool(false);
        w.write_bool(false);
        w.align_to_next_byte();
        w.finish()
    }

    pub fn spectate(msg: SpectateMsg) -> Bytes {
        let mut w = BitWriter::with_capacity(4);
        w.write_u8(MsgType::Spectate as u8);
        w.write_bool(msg.begin);
        w.write_bool(msg.next);
        w.write_bool(msg.prev);
        w.write_bool(msg.force);
        w.write_bits(0, 4);
        w.finish()
    }

    pub fn drop_item(item: u16, slot: u8) -> Bytes {
        let mut w = BitWriter::with_capacity(8);
        w.write_u8(MsgType::DropItem as u8);
        w.write_game_type(item);
        w.write_u8(slot);
        w.align_to_next_byte();
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_decodes_fields() {
        let msg = InputMsg {
            seq: 9,
            move_right: true,
            move_up: true,
            shoot_start: true,
            touch_move: Some(TouchMove { dir: Vec2::Y, len: 200 }),
            facing: Vec2::X,
            mouse_distance: 32.0,
            actions: vec![InputAction::Interact as u8, 99],
            active_item: 2,
            ..Default::default()
        };
        let bytes = encode::input(&msg);
        let ClientMsg::Input(decoded) = ClientMsg::decode(&bytes, DEFAULT_GAME_TYPE_BITS).unwrap() else {
            panic!("expected input");
        };
        assert_eq!(decoded.seq, 9);
        assert!(decoded.move_right && decoded.move_up && !decoded.move_left);
        assert!(decoded.shoot_start && !decoded.shoot_hold);
        assert_eq!(decoded.touch_move.unwrap().len, 200);
        assert!((decoded.facing - Vec2::X).length() < 0.01);
        assert!((decoded.mouse_distance - 32.0).abs() < 0.2);
        assert_eq!(decoded.actions, vec![7, 99]);
        assert_eq!(decoded.active_item, 2);
        assert_eq!(InputAction::from_u8(99), None);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = encode::input(&InputMsg::default());
        let err = ClientMsg::decode(&bytes[..3], DEFAULT_GAME_TYPE_BITS).unwrap_err();
        assert!(matches!(err, ProtocolError::Stream(_)));
    }

    #[test]
    fn unknown_and_outbound_types_are_rejected() {
        assert!(matches!(ClientMsg::decode(&[], 11), Err(ProtocolError::Empty)));
        assert!(matches!(ClientMsg::decode(&[99, 0], 11), Err(ProtocolError::UnknownType(99))));
        assert!(matches!(
            ClientMsg::decode(&[6, 0, 0], 11),
            Err(ProtocolError::NotInbound(MsgType::Update))
        ));
    }

    #[test]
    fn join_name_is_sanitized() {
        let bytes = encode::join("  averyveryverylongplayername\u{7}  ");
        let ClientMsg::Join(join) = ClientMsg::decode(&bytes, 11).unwrap() else {
            panic!("expected join");
        };
        assert_eq!(join.protocol, PROTOCOL_VERSION);
        assert_eq!(join.name, "averyveryverylon");
        assert_eq!(sanitize_name("   "), "Player");
    }

    #[test]
    fn emote_and_spectate_decode() {
        let bytes = encode::emote(&EmoteMsg {
            position: Vec2::new(512.0, 256.0),
            type_id: 13,
            is_ping: false,
        });
        let ClientMsg::Emote(emote) = ClientMsg::decode(&bytes, 11).unwrap() else {
            panic!("expected emote");
        };
        assert_eq!(emote.type_id, 13);
        assert!((emote.position - Vec2::new(512.0, 256.0)).length() < 0.05);

        let bytes = encode::spectate(SpectateMsg { begin: true, ..Default::default() });
        assert_eq!(
            ClientMsg::decode(&bytes, 11).unwrap(),
            ClientMsg::Spectate(SpectateMsg { begin: true, ..Default::default() })
        );
    }

    #[test]
    fn ten_bit_game_types() {
        let bytes = {
            let mut w = crate::ws::bitstream::BitWriter::with_capacity(8).with_game_type_bits(10);
            w.write_u8(MsgType::DropItem as u8);
            w.write_game_type(1000);
            w.write_u8(3);
            w.align_to_next_byte();
            w.finish()
        };
        let ClientMsg::DropItem(drop) = ClientMsg::decode(&bytes, 10).unwrap() else {
            panic!("expected drop");
        };
        assert_eq!(drop.item, 1000);
        assert_eq!(drop.weapon_slot, 3);
    }
}
