use crate::errors::{ErrorCode, Result};
use crate::identity::{Id, Identifier};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Appends a LEB128 varint. Seven payload bits per byte, high bit set while
/// more bytes follow.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            buf.push(byte);
            return;
        }

        buf.push(byte | 0x80);
    }
}

/// Attempts to decode a varint from the front of `bytes`. Returns the value
/// and the number of bytes consumed, or `None` if the input ends mid-varint.
/// A varint longer than five bytes cannot encode a u32 and is malformed.
pub fn try_read_varint(bytes: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;
    let mut shift = 0u32;

    for (i, &byte) in bytes.iter().enumerate() {
        if i >= 5 {
            return Err(ErrorCode::InvalidParam);
        }

        value |= u32::from(byte & 0x7f) << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if bytes.len() >= 5 {
        return Err(ErrorCode::InvalidParam);
    }

    Ok(None)
}

pub fn write_id(buf: &mut Vec<u8>, id: Id) {
    buf.write_u32::<BigEndian>(id.number()).expect("Writing to a vector cannot fail");
}

pub fn read_id(cursor: &mut &[u8]) -> Result<Id> {
    cursor
        .read_u32::<BigEndian>()
        .map(Id::new)
        .map_err(|_| ErrorCode::InvalidParam)
}

pub fn write_identifier(buf: &mut Vec<u8>, ident: &Identifier) {
    buf.write_u32::<BigEndian>(ident.signature())
        .expect("Writing to a vector cannot fail");

    let name = ident.name().as_bytes();
    debug_assert!(name.len() <= u16::max_value() as usize);
    buf.write_u16::<BigEndian>(name.len() as u16)
        .expect("Writing to a vector cannot fail");
    buf.extend_from_slice(name);

    buf.push(ident.hidden() as u8);
}

pub fn read_identifier(cursor: &mut &[u8]) -> Result<Identifier> {
    let signature = cursor.read_u32::<BigEndian>().map_err(|_| ErrorCode::InvalidParam)?;
    let name_len = cursor.read_u16::<BigEndian>().map_err(|_| ErrorCode::InvalidParam)? as usize;

    if cursor.len() < name_len {
        return Err(ErrorCode::InvalidParam);
    }

    let name = std::str::from_utf8(&cursor[..name_len])
        .map_err(|_| ErrorCode::InvalidParam)?
        .to_owned();
    *cursor = &cursor[name_len..];

    let hidden = cursor.read_u8().map_err(|_| ErrorCode::InvalidParam)? != 0;

    Ok(Identifier::new(signature, name, hidden))
}
