use crate::errors::{ErrorCode, Result};
use crate::{MAGIC_PREFIX, MAX_IDENTIFICATION_SIZE, VERSION, VERSION_INFO_SIZE};

use byteorder::{BigEndian, ByteOrder};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Major.minor prefix of a version string; the patch level does not affect
/// wire compatibility.
fn major_minor(version: &str) -> &str {
    match version.rfind('.') {
        Some(i) => &version[..i],
        None => version,
    }
}

pub(crate) fn versions_compatible(remote: &str) -> bool {
    major_minor(VERSION) == major_minor(remote)
}

/// The header every end sends: magic prefix, zero-padded version string,
/// big-endian identification length and the identification bytes.
pub(crate) fn make_header(identification: &[u8]) -> Result<Vec<u8>> {
    if identification.len() > MAX_IDENTIFICATION_SIZE {
        return Err(ErrorCode::IdentificationTooLarge);
    }

    debug_assert!(VERSION.len() < VERSION_INFO_SIZE);

    let mut header = Vec::with_capacity(6 + VERSION_INFO_SIZE + 4 + identification.len());
    header.extend_from_slice(&MAGIC_PREFIX);

    let mut version = [0u8; VERSION_INFO_SIZE];
    version[..VERSION.len()].copy_from_slice(VERSION.as_bytes());
    header.extend_from_slice(&version);

    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, identification.len() as u32);
    header.extend_from_slice(&len);
    header.extend_from_slice(identification);

    Ok(header)
}

pub(crate) struct HandshakeOutcome {
    pub remote_version: String,
    pub remote_identification: Vec<u8>,
}

fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(ErrorCode::Timeout)
            } else {
                Ok(Some(deadline - now))
            }
        }
        None => Ok(None),
    }
}

fn map_io_error(err: &std::io::Error, canceled: &AtomicBool) -> ErrorCode {
    if canceled.load(Ordering::Acquire) {
        return ErrorCode::Canceled;
    }

    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
        _ => ErrorCode::SocketBroken,
    }
}

/// Performs the symmetric handshake on a blocking socket. The caller's
/// deadline bounds every read and write; cancellation (shutting the socket
/// down and raising the flag) wins over a concurrent timeout.
pub(crate) fn shake_hands(
    stream: &TcpStream,
    identification: &[u8],
    deadline: Option<Instant>,
    canceled: &AtomicBool,
) -> Result<HandshakeOutcome> {
    let header = make_header(identification)?;

    let arm = |stream: &TcpStream| -> Result<()> {
        if canceled.load(Ordering::Acquire) {
            return Err(ErrorCode::Canceled);
        }
        let left = remaining(deadline)?;
        stream.set_read_timeout(left).map_err(|_| ErrorCode::SocketBroken)?;
        stream.set_write_timeout(left).map_err(|_| ErrorCode::SocketBroken)?;
        Ok(())
    };

    arm(stream)?;
    (&mut &*stream)
        .write_all(&header)
        .map_err(|e| map_io_error(&e, canceled))?;

    let mut read_exact = |buf: &mut [u8]| -> Result<()> {
        arm(stream)?;
        (&mut &*stream)
            .read_exact(buf)
            .map_err(|e| map_io_error(&e, canceled))
    };

    let mut magic = [0u8; 6];
    read_exact(&mut magic)?;
    if magic != MAGIC_PREFIX {
        return Err(ErrorCode::InvalidMagicPrefix);
    }

    let mut version = [0u8; VERSION_INFO_SIZE];
    read_exact(&mut version)?;
    let end = version.iter().position(|&b| b == 0).unwrap_or(version.len());
    let remote_version = String::from_utf8_lossy(&version[..end]).into_owned();
    if !versions_compatible(&remote_version) {
        return Err(ErrorCode::IncompatibleVersion);
    }

    let mut len = [0u8; 4];
    read_exact(&mut len)?;
    let len = BigEndian::read_u32(&len) as usize;
    if len > MAX_IDENTIFICATION_SIZE {
        return Err(ErrorCode::IdentificationTooLarge);
    }

    let mut remote_identification = vec![0u8; len];
    if len > 0 {
        read_exact(&mut remote_identification)?;
    }

    Ok(HandshakeOutcome {
        remote_version,
        remote_identification,
    })
}
