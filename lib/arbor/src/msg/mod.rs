//! Tagged wire records and the global deserializer table.
//!
//! Every message belongs to one pattern and one of eighteen shapes; the wire
//! type-id is `pattern * PATTERN_STRIDE + shape`. A pattern only registers
//! the shapes it actually speaks, so a frame with an unregistered type-id is
//! a protocol violation and kills the connection that delivered it.

pub mod wire;

use crate::core::pattern::{Pattern, PATTERN_COUNT};
use crate::errors::{ErrorCode, Result};
use crate::identity::{Id, Identifier};

use lazy_static::lazy_static;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Number of type-ids reserved per pattern.
pub const PATTERN_STRIDE: u32 = 20;

/// Bitset attached to every Gather record, reporting how the responding side
/// handled the scattered message and whether this is the final response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Hash)]
pub struct GatherFlags(u8);

impl GatherFlags {
    pub const NONE: GatherFlags = GatherFlags(0x00);
    pub const FINISHED: GatherFlags = GatherFlags(0x01);
    pub const IGNORED: GatherFlags = GatherFlags(0x02);
    pub const DEAF: GatherFlags = GatherFlags(0x04);
    pub const BINDING_DESTROYED: GatherFlags = GatherFlags(0x08);
    pub const CONNECTION_LOST: GatherFlags = GatherFlags(0x10);

    const MASK: u8 = 0x1f;

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<GatherFlags> {
        if bits & !Self::MASK != 0 {
            return Err(ErrorCode::InvalidParam);
        }
        Ok(GatherFlags(bits))
    }

    #[inline]
    pub fn contains(self, other: GatherFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// This set with the bits of `other` cleared.
    #[inline]
    pub fn without(self, other: GatherFlags) -> GatherFlags {
        GatherFlags(self.0 & !other.0)
    }
}

impl BitOr for GatherFlags {
    type Output = GatherFlags;

    #[inline]
    fn bitor(self, rhs: GatherFlags) -> GatherFlags {
        GatherFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for GatherFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: GatherFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for GatherFlags {
    type Output = GatherFlags;

    #[inline]
    fn bitand(self, rhs: GatherFlags) -> GatherFlags {
        GatherFlags(self.0 & rhs.0)
    }
}

impl fmt::Display for GatherFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GatherFlags({:#04x})", self.0)
    }
}

/// The eighteen message shapes. Ids always refer to entities in the
/// *receiver's* numbering except where a field is documented as an echo of
/// the sender's own id (descriptions and notices).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Body {
    /// "I just created this terminal; `my_id` is my local id for it."
    TerminalDescription { identifier: Identifier, my_id: Id },
    /// "Your `peer_id` now maps to my `my_id`."
    TerminalMapping { peer_id: Id, my_id: Id },
    /// "Description seen; I have nothing to map it to." Echoes the
    /// describer's id.
    TerminalNoticed { peer_id: Id },
    /// "The terminal you know as `id` is gone on my side."
    TerminalRemoved { id: Id },
    /// "Retired; `id` is your id for the removed terminal."
    TerminalRemovedAck { id: Id },
    BindingDescription { identifier: Identifier, my_id: Id },
    BindingMapping { peer_id: Id, my_id: Id },
    BindingNoticed { peer_id: Id },
    BindingRemoved { id: Id },
    BindingRemovedAck { id: Id },
    BindingEstablished { id: Id },
    BindingReleased { id: Id },
    Subscribe { id: Id },
    Unsubscribe { id: Id },
    Data { id: Id, payload: Vec<u8> },
    CachedData { id: Id, payload: Vec<u8> },
    Scatter { target: Id, operation: Id, payload: Vec<u8> },
    Gather { operation: Id, flags: GatherFlags, payload: Vec<u8> },
}

const SHAPE_COUNT: usize = 18;

impl Body {
    fn shape(&self) -> u32 {
        match self {
            Body::TerminalDescription { .. } => 0,
            Body::TerminalMapping { .. } => 1,
            Body::TerminalNoticed { .. } => 2,
            Body::TerminalRemoved { .. } => 3,
            Body::TerminalRemovedAck { .. } => 4,
            Body::BindingDescription { .. } => 5,
            Body::BindingMapping { .. } => 6,
            Body::BindingNoticed { .. } => 7,
            Body::BindingRemoved { .. } => 8,
            Body::BindingRemovedAck { .. } => 9,
            Body::BindingEstablished { .. } => 10,
            Body::BindingReleased { .. } => 11,
            Body::Subscribe { .. } => 12,
            Body::Unsubscribe { .. } => 13,
            Body::Data { .. } => 14,
            Body::CachedData { .. } => 15,
            Body::Scatter { .. } => 16,
            Body::Gather { .. } => 17,
        }
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            Body::TerminalDescription { identifier, my_id }
            | Body::BindingDescription { identifier, my_id } => {
                wire::write_identifier(buf, identifier);
                wire::write_id(buf, *my_id);
            }
            Body::TerminalMapping { peer_id, my_id } | Body::BindingMapping { peer_id, my_id } => {
                wire::write_id(buf, *peer_id);
                wire::write_id(buf, *my_id);
            }
            Body::TerminalNoticed { peer_id } | Body::BindingNoticed { peer_id } => {
                wire::write_id(buf, *peer_id);
            }
            Body::TerminalRemoved { id }
            | Body::TerminalRemovedAck { id }
            | Body::BindingRemoved { id }
            | Body::BindingRemovedAck { id }
            | Body::BindingEstablished { id }
            | Body::BindingReleased { id }
            | Body::Subscribe { id }
            | Body::Unsubscribe { id } => {
                wire::write_id(buf, *id);
            }
            Body::Data { id, payload } | Body::CachedData { id, payload } => {
                wire::write_id(buf, *id);
                buf.extend_from_slice(payload);
            }
            Body::Scatter {
                target,
                operation,
                payload,
            } => {
                wire::write_id(buf, *target);
                wire::write_id(buf, *operation);
                buf.extend_from_slice(payload);
            }
            Body::Gather {
                operation,
                flags,
                payload,
            } => {
                wire::write_id(buf, *operation);
                buf.push(flags.bits());
                buf.extend_from_slice(payload);
            }
        }
    }
}

type Deserializer = fn(&[u8]) -> Result<Body>;

fn de_terminal_description(mut b: &[u8]) -> Result<Body> {
    Ok(Body::TerminalDescription {
        identifier: wire::read_identifier(&mut b)?,
        my_id: wire::read_id(&mut b)?,
    })
}

fn de_terminal_mapping(mut b: &[u8]) -> Result<Body> {
    Ok(Body::TerminalMapping {
        peer_id: wire::read_id(&mut b)?,
        my_id: wire::read_id(&mut b)?,
    })
}

fn de_terminal_noticed(mut b: &[u8]) -> Result<Body> {
    Ok(Body::TerminalNoticed {
        peer_id: wire::read_id(&mut b)?,
    })
}

fn de_terminal_removed(mut b: &[u8]) -> Result<Body> {
    Ok(Body::TerminalRemoved {
        id: wire::read_id(&mut b)?,
    })
}

fn de_terminal_removed_ack(mut b: &[u8]) -> Result<Body> {
    Ok(Body::TerminalRemovedAck {
        id: wire::read_id(&mut b)?,
    })
}

fn de_binding_description(mut b: &[u8]) -> Result<Body> {
    Ok(Body::BindingDescription {
        identifier: wire::read_identifier(&mut b)?,
        my_id: wire::read_id(&mut b)?,
    })
}

fn de_binding_mapping(mut b: &[u8]) -> Result<Body> {
    Ok(Body::BindingMapping {
        peer_id: wire::read_id(&mut b)?,
        my_id: wire::read_id(&mut b)?,
    })
}

fn de_binding_noticed(mut b: &[u8]) -> Result<Body> {
    Ok(Body::BindingNoticed {
        peer_id: wire::read_id(&mut b)?,
    })
}

fn de_binding_removed(mut b: &[u8]) -> Result<Body> {
    Ok(Body::BindingRemoved {
        id: wire::read_id(&mut b)?,
    })
}

fn de_binding_removed_ack(mut b: &[u8]) -> Result<Body> {
    Ok(Body::BindingRemovedAck {
        id: wire::read_id(&mut b)?,
    })
}

fn de_binding_established(mut b: &[u8]) -> Result<Body> {
    Ok(Body::BindingEstablished {
        id: wire::read_id(&mut b)?,
    })
}

fn de_binding_released(mut b: &[u8]) -> Result<Body> {
    Ok(Body::BindingReleased {
        id: wire::read_id(&mut b)?,
    })
}

fn de_subscribe(mut b: &[u8]) -> Result<Body> {
    Ok(Body::Subscribe {
        id: wire::read_id(&mut b)?,
    })
}

fn de_unsubscribe(mut b: &[u8]) -> Result<Body> {
    Ok(Body::Unsubscribe {
        id: wire::read_id(&mut b)?,
    })
}

fn de_data(mut b: &[u8]) -> Result<Body> {
    Ok(Body::Data {
        id: wire::read_id(&mut b)?,
        payload: b.to_vec(),
    })
}

fn de_cached_data(mut b: &[u8]) -> Result<Body> {
    Ok(Body::CachedData {
        id: wire::read_id(&mut b)?,
        payload: b.to_vec(),
    })
}

fn de_scatter(mut b: &[u8]) -> Result<Body> {
    Ok(Body::Scatter {
        target: wire::read_id(&mut b)?,
        operation: wire::read_id(&mut b)?,
        payload: b.to_vec(),
    })
}

fn de_gather(mut b: &[u8]) -> Result<Body> {
    let operation = wire::read_id(&mut b)?;
    let flags = if b.is_empty() {
        return Err(ErrorCode::InvalidParam);
    } else {
        let flags = GatherFlags::from_bits(b[0])?;
        b = &b[1..];
        flags
    };

    Ok(Body::Gather {
        operation,
        flags,
        payload: b.to_vec(),
    })
}

const SHAPE_DESERIALIZERS: [Deserializer; SHAPE_COUNT] = [
    de_terminal_description,
    de_terminal_mapping,
    de_terminal_noticed,
    de_terminal_removed,
    de_terminal_removed_ack,
    de_binding_description,
    de_binding_mapping,
    de_binding_noticed,
    de_binding_removed,
    de_binding_removed_ack,
    de_binding_established,
    de_binding_released,
    de_subscribe,
    de_unsubscribe,
    de_data,
    de_cached_data,
    de_scatter,
    de_gather,
];

fn pattern_admits(pattern: Pattern, shape: u32) -> bool {
    match shape {
        0..=11 => true,
        12 | 13 => pattern.subscribable(),
        14 => pattern.data_bearing(),
        15 => pattern.cached(),
        16 | 17 => pattern.scatter_bearing(),
        _ => false,
    }
}

lazy_static! {
    /// The single global table of per-type deserializers, indexed by the
    /// type-id number.
    static ref DESERIALIZERS: Vec<Option<Deserializer>> = {
        let mut table = vec![None; PATTERN_COUNT * PATTERN_STRIDE as usize];
        for &pattern in Pattern::ALL.iter() {
            for shape in 0..SHAPE_COUNT as u32 {
                if pattern_admits(pattern, shape) {
                    let id = pattern.index() * PATTERN_STRIDE as usize + shape as usize;
                    table[id] = Some(SHAPE_DESERIALIZERS[shape as usize]);
                }
            }
        }
        table
    };
}

/// One typed record travelling between two communicators.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub pattern: Pattern,
    pub body: Body,
}

impl Message {
    #[inline]
    pub fn new(pattern: Pattern, body: Body) -> Message {
        debug_assert!(pattern_admits(pattern, body.shape()));
        Message { pattern, body }
    }

    #[inline]
    pub fn type_id(&self) -> u32 {
        self.pattern.index() as u32 * PATTERN_STRIDE + self.body.shape()
    }

    /// Appends the full wire frame: `varint(size) varint(type_id) payload`,
    /// where size covers the type-id varint plus the payload.
    pub fn encode_frame(&self, out: &mut Vec<u8>) {
        let mut type_id = Vec::with_capacity(2);
        wire::write_varint(&mut type_id, self.type_id());

        let mut payload = Vec::new();
        self.body.serialize(&mut payload);

        wire::write_varint(out, (type_id.len() + payload.len()) as u32);
        out.extend_from_slice(&type_id);
        out.extend_from_slice(&payload);
    }

    /// Decodes the contents of one frame (everything after the size varint).
    /// Fails on an unregistered type-id or a malformed payload; the caller
    /// is expected to kill the connection in that case.
    pub fn decode_frame_contents(contents: &[u8]) -> Result<Message> {
        let (type_id, used) = wire::try_read_varint(contents)?.ok_or(ErrorCode::InvalidParam)?;
        let payload = &contents[used..];

        let deserializer = DESERIALIZERS
            .get(type_id as usize)
            .and_then(|entry| *entry)
            .ok_or(ErrorCode::InvalidParam)?;

        let pattern = Pattern::from_index(type_id as usize / PATTERN_STRIDE as usize)
            .expect("A registered type-id always has a pattern");

        Ok(Message {
            pattern,
            body: deserializer(payload)?,
        })
    }
}

/// A heartbeat is an empty frame: a single zero size byte.
pub const HEARTBEAT: [u8; 1] = [0];
