//! Binary framing for [`Envelope`]s.
//!
//! Layout, little endian:
//! `type u32 | priority u32 | [order u32] | payload_len u32 | payload | checksum u32`.
//!
//! The checksum is a reversible transform of the payload length, so a
//! receiver can recover the length the sender intended and compare it with
//! the declared length and the bytes that actually arrived. It catches
//! truncation and garbage sizes, not bit flips inside the payload.

use std::io::{self, Cursor};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_64;

use super::protocol::{
    Envelope, FieldValue, MAX_PACKET_SIZE, MessageType, Payload, PeerInfo, Priority, Route,
    RouteStep, SpawnInfo, Transform,
};

const CHECKSUM_FACTOR: u32 = 0x9E37_79B1;
/// Multiplicative inverse of `CHECKSUM_FACTOR` modulo 2^32.
const CHECKSUM_FACTOR_INVERSE: u32 = 0x0E8B_2F51;
const CHECKSUM_MASK: u32 = 0x7E7E_7E7E;

/// type + priority + payload length + checksum
pub const MIN_ENVELOPE_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("datagram truncated")]
    Truncated,
    #[error("corrupted datagram: declared payload length {declared}, checksum says {derived}")]
    Corrupted { declared: u32, derived: u32 },
    #[error("unknown message type tag {0}")]
    UnknownType(u32),
    #[error("unknown priority bits {0:#x}")]
    UnknownPriority(u32),
    #[error("string is not valid UTF-16")]
    InvalidString,
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
    #[error("encoded envelope is {0} bytes, exceeds MTU")]
    TooLarge(usize),
    #[error("i/o: {0}")]
    Io(String),
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(e.to_string())
        }
    }
}

pub fn checksum(payload_len: u32) -> u32 {
    payload_len.wrapping_mul(CHECKSUM_FACTOR) ^ CHECKSUM_MASK
}

pub fn length_from_checksum(checksum: u32) -> u32 {
    (checksum ^ CHECKSUM_MASK).wrapping_mul(CHECKSUM_FACTOR_INVERSE)
}

/// Digest acknowledgements use to name the envelope they confirm.
pub fn digest(datagram: &[u8]) -> u64 {
    xxh3_64(datagram)
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut payload = Vec::with_capacity(64);
    write_payload(&mut payload, &envelope.payload)?;

    let mut out = Vec::with_capacity(payload.len() + MIN_ENVELOPE_SIZE + 4);
    out.write_u32::<LittleEndian>(envelope.message_type().tag())?;
    out.write_u32::<LittleEndian>(envelope.priority.bits())?;
    if envelope.is_ordered() {
        let order = envelope
            .order
            .ok_or(CodecError::Malformed("ordered envelope without order number"))?;
        out.write_u32::<LittleEndian>(order)?;
    }
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::TooLarge(payload.len()))?;
    out.write_u32::<LittleEndian>(len)?;
    out.extend_from_slice(&payload);
    out.write_u32::<LittleEndian>(checksum(len))?;

    if out.len() > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge(out.len()));
    }
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<Envelope, CodecError> {
    if data.len() < MIN_ENVELOPE_SIZE {
        return Err(CodecError::Truncated);
    }

    // Framing is checked before any header field is interpreted.
    let tag = LittleEndian::read_u32(&data[0..4]);
    let bits = LittleEndian::read_u32(&data[4..8]);
    let ordered = bits & Priority::ORDERED.bits() != 0;
    let header_len = if ordered { 16 } else { 12 };
    let present = data
        .len()
        .checked_sub(header_len + 4)
        .ok_or(CodecError::Truncated)?;
    let declared = LittleEndian::read_u32(&data[header_len - 4..header_len]);
    let derived = length_from_checksum(LittleEndian::read_u32(&data[data.len() - 4..]));
    if derived != declared || declared as usize != present {
        return Err(CodecError::Corrupted { declared, derived });
    }

    let message_type = MessageType::from_tag(tag).ok_or(CodecError::UnknownType(tag))?;
    let priority = Priority::from_bits(bits).ok_or(CodecError::UnknownPriority(bits))?;
    let order = ordered.then(|| LittleEndian::read_u32(&data[8..12]));

    let body = &data[header_len..header_len + present];
    let mut body_reader = Cursor::new(body);
    let payload = read_payload(message_type, &mut body_reader)?;
    if body_reader.position() as usize != body.len() {
        return Err(CodecError::Malformed("trailing payload bytes"));
    }

    Ok(Envelope {
        priority,
        order,
        payload,
    })
}

type Reader<'a> = Cursor<&'a [u8]>;

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    let units: Vec<u16> = value.encode_utf16().collect();
    let count = u16::try_from(units.len()).map_err(|_| CodecError::TooLarge(units.len()))?;
    out.write_u16::<LittleEndian>(count)?;
    for unit in units {
        out.write_u16::<LittleEndian>(unit)?;
    }
    Ok(())
}

fn read_string(reader: &mut Reader<'_>) -> Result<String, CodecError> {
    let count = reader.read_u16::<LittleEndian>()? as usize;
    if remaining(reader) < count * 2 {
        return Err(CodecError::Truncated);
    }
    let mut units = vec![0u16; count];
    reader.read_u16_into::<LittleEndian>(&mut units)?;
    String::from_utf16(&units).map_err(|_| CodecError::InvalidString)
}

fn write_bool(out: &mut Vec<u8>, value: bool) -> Result<(), CodecError> {
    out.write_u8(value as u8)?;
    Ok(())
}

fn read_bool(reader: &mut Reader<'_>) -> Result<bool, CodecError> {
    match reader.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(CodecError::Malformed("boolean out of range")),
    }
}

fn write_optional_u32(out: &mut Vec<u8>, value: Option<u32>) -> Result<(), CodecError> {
    match value {
        Some(v) => {
            out.write_u8(1)?;
            out.write_u32::<LittleEndian>(v)?;
        }
        None => out.write_u8(0)?,
    }
    Ok(())
}

fn read_optional_u32(reader: &mut Reader<'_>) -> Result<Option<u32>, CodecError> {
    if read_bool(reader)? {
        Ok(Some(reader.read_u32::<LittleEndian>()?))
    } else {
        Ok(None)
    }
}

fn write_count(out: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
    let count = u16::try_from(len).map_err(|_| CodecError::TooLarge(len))?;
    out.write_u16::<LittleEndian>(count)?;
    Ok(())
}

fn remaining(reader: &Reader<'_>) -> usize {
    reader.get_ref().len().saturating_sub(reader.position() as usize)
}

fn write_route(out: &mut Vec<u8>, route: &Route) -> Result<(), CodecError> {
    write_count(out, route.len())?;
    for step in route.steps() {
        out.write_u32::<LittleEndian>(step.field_tag)?;
        write_optional_u32(out, step.index)?;
    }
    Ok(())
}

fn read_route(reader: &mut Reader<'_>) -> Result<Route, CodecError> {
    let count = reader.read_u16::<LittleEndian>()? as usize;
    if count == 0 {
        return Err(CodecError::Malformed("empty route"));
    }
    // Each step is at least five bytes; reject counts the datagram cannot hold.
    if remaining(reader) < count * 5 {
        return Err(CodecError::Truncated);
    }
    let mut steps = Vec::with_capacity(count);
    for _ in 0..count {
        let field_tag = reader.read_u32::<LittleEndian>()?;
        let index = read_optional_u32(reader)?;
        steps.push(RouteStep { field_tag, index });
    }
    Ok(Route::from_steps(steps))
}

fn write_transform(out: &mut Vec<u8>, transform: &Transform) -> Result<(), CodecError> {
    for v in transform.position.iter().chain(transform.rotation.iter()) {
        out.write_f32::<LittleEndian>(*v)?;
    }
    Ok(())
}

fn read_transform(reader: &mut Reader<'_>) -> Result<Transform, CodecError> {
    let mut transform = Transform::default();
    reader.read_f32_into::<LittleEndian>(&mut transform.position)?;
    reader.read_f32_into::<LittleEndian>(&mut transform.rotation)?;
    Ok(transform)
}

fn write_value(out: &mut Vec<u8>, value: &FieldValue) -> Result<(), CodecError> {
    match value {
        FieldValue::Bool(v) => write_bool(out, *v)?,
        FieldValue::Int(v) => out.write_i32::<LittleEndian>(*v)?,
        FieldValue::Uint(v) | FieldValue::Enum(v) => out.write_u32::<LittleEndian>(*v)?,
        FieldValue::Float(v) => out.write_f32::<LittleEndian>(*v)?,
        FieldValue::Str(v) => write_string(out, v)?,
    }
    Ok(())
}

type ValueDecoder = fn(&mut Reader<'_>) -> Result<FieldValue, CodecError>;

fn decode_bool_value(reader: &mut Reader<'_>) -> Result<FieldValue, CodecError> {
    Ok(FieldValue::Bool(read_bool(reader)?))
}

fn decode_int_value(reader: &mut Reader<'_>) -> Result<FieldValue, CodecError> {
    Ok(FieldValue::Int(reader.read_i32::<LittleEndian>()?))
}

fn decode_uint_value(reader: &mut Reader<'_>) -> Result<FieldValue, CodecError> {
    Ok(FieldValue::Uint(reader.read_u32::<LittleEndian>()?))
}

fn decode_float_value(reader: &mut Reader<'_>) -> Result<FieldValue, CodecError> {
    Ok(FieldValue::Float(reader.read_f32::<LittleEndian>()?))
}

fn decode_string_value(reader: &mut Reader<'_>) -> Result<FieldValue, CodecError> {
    Ok(FieldValue::Str(read_string(reader)?))
}

fn decode_enum_value(reader: &mut Reader<'_>) -> Result<FieldValue, CodecError> {
    Ok(FieldValue::Enum(reader.read_u32::<LittleEndian>()?))
}

const VALUE_DECODERS: [(MessageType, ValueDecoder); 6] = [
    (MessageType::FieldBool, decode_bool_value),
    (MessageType::FieldInt, decode_int_value),
    (MessageType::FieldUint, decode_uint_value),
    (MessageType::FieldFloat, decode_float_value),
    (MessageType::FieldString, decode_string_value),
    (MessageType::FieldEnum, decode_enum_value),
];

fn value_decoder(message_type: MessageType) -> Option<ValueDecoder> {
    VALUE_DECODERS
        .iter()
        .find(|(ty, _)| *ty == message_type)
        .map(|(_, decoder)| *decoder)
}

fn write_payload(out: &mut Vec<u8>, payload: &Payload) -> Result<(), CodecError> {
    match payload {
        Payload::Ack { acked, digest } => {
            out.write_u32::<LittleEndian>(acked.tag())?;
            out.write_u64::<LittleEndian>(*digest)?;
        }
        Payload::Ping { nonce, reply } => {
            out.write_u32::<LittleEndian>(*nonce)?;
            write_bool(out, *reply)?;
        }
        Payload::Handshake { name } => write_string(out, name)?,
        Payload::Welcome { peer_id, peers } => {
            out.write_u32::<LittleEndian>(*peer_id)?;
            write_count(out, peers.len())?;
            for peer in peers {
                out.write_u32::<LittleEndian>(peer.id)?;
                write_string(out, &peer.name)?;
            }
        }
        Payload::Error { reason } => write_string(out, reason)?,
        Payload::PeerJoined(peer) => {
            out.write_u32::<LittleEndian>(peer.id)?;
            write_string(out, &peer.name)?;
        }
        Payload::Disconnect { peer_id } => out.write_u32::<LittleEndian>(*peer_id)?,
        Payload::Redirect { port } | Payload::ServerReady { port } => {
            out.write_u16::<LittleEndian>(*port)?
        }
        Payload::NameList { port, names } => {
            out.write_u16::<LittleEndian>(*port)?;
            write_count(out, names.len())?;
            for name in names {
                write_string(out, name)?;
            }
        }
        Payload::StartMatch => {}
        Payload::Spawn(spawn) => {
            out.write_u32::<LittleEndian>(spawn.instance_id)?;
            out.write_u32::<LittleEndian>(spawn.owner_id)?;
            out.write_u32::<LittleEndian>(spawn.prefab_id)?;
            write_transform(out, &spawn.transform)?;
            write_optional_u32(out, spawn.parent_id)?;
        }
        Payload::Destroy { instance_id } => out.write_u32::<LittleEndian>(*instance_id)?,
        Payload::Field { route, value } => {
            write_route(out, route)?;
            write_value(out, value)?;
        }
        Payload::Chat { from, text } => {
            out.write_u32::<LittleEndian>(*from)?;
            write_string(out, text)?;
        }
        Payload::MatchResult { winner } => out.write_u32::<LittleEndian>(*winner)?,
    }
    Ok(())
}

fn read_payload(message_type: MessageType, reader: &mut Reader<'_>) -> Result<Payload, CodecError> {
    let payload = match message_type {
        MessageType::Ack => {
            let tag = reader.read_u32::<LittleEndian>()?;
            let acked = MessageType::from_tag(tag).ok_or(CodecError::UnknownType(tag))?;
            let digest = reader.read_u64::<LittleEndian>()?;
            Payload::Ack { acked, digest }
        }
        MessageType::Ping => Payload::Ping {
            nonce: reader.read_u32::<LittleEndian>()?,
            reply: read_bool(reader)?,
        },
        MessageType::Handshake => Payload::Handshake {
            name: read_string(reader)?,
        },
        MessageType::Welcome => {
            let peer_id = reader.read_u32::<LittleEndian>()?;
            let count = reader.read_u16::<LittleEndian>()? as usize;
            let mut peers = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let id = reader.read_u32::<LittleEndian>()?;
                let name = read_string(reader)?;
                peers.push(PeerInfo { id, name });
            }
            Payload::Welcome { peer_id, peers }
        }
        MessageType::Error => Payload::Error {
            reason: read_string(reader)?,
        },
        MessageType::PeerJoined => {
            let id = reader.read_u32::<LittleEndian>()?;
            let name = read_string(reader)?;
            Payload::PeerJoined(PeerInfo { id, name })
        }
        MessageType::Disconnect => Payload::Disconnect {
            peer_id: reader.read_u32::<LittleEndian>()?,
        },
        MessageType::Redirect => Payload::Redirect {
            port: reader.read_u16::<LittleEndian>()?,
        },
        MessageType::ServerReady => Payload::ServerReady {
            port: reader.read_u16::<LittleEndian>()?,
        },
        MessageType::NameList => {
            let port = reader.read_u16::<LittleEndian>()?;
            let count = reader.read_u16::<LittleEndian>()? as usize;
            let mut names = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                names.push(read_string(reader)?);
            }
            Payload::NameList { port, names }
        }
        MessageType::StartMatch => Payload::StartMatch,
        MessageType::Spawn => Payload::Spawn(SpawnInfo {
            instance_id: reader.read_u32::<LittleEndian>()?,
            owner_id: reader.read_u32::<LittleEndian>()?,
            prefab_id: reader.read_u32::<LittleEndian>()?,
            transform: read_transform(reader)?,
            parent_id: read_optional_u32(reader)?,
        }),
        MessageType::Destroy => Payload::Destroy {
            instance_id: reader.read_u32::<LittleEndian>()?,
        },
        MessageType::FieldBool
        | MessageType::FieldInt
        | MessageType::FieldUint
        | MessageType::FieldFloat
        | MessageType::FieldString
        | MessageType::FieldEnum => {
            let route = read_route(reader)?;
            let decoder =
                value_decoder(message_type).ok_or(CodecError::Malformed("no value decoder"))?;
            Payload::Field {
                route,
                value: decoder(reader)?,
            }
        }
        MessageType::Chat => Payload::Chat {
            from: reader.read_u32::<LittleEndian>()?,
            text: read_string(reader)?,
        },
        MessageType::MatchResult => Payload::MatchResult {
            winner: reader.read_u32::<LittleEndian>()?,
        },
    };
    Ok(payload)
}
