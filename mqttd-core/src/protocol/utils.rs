use bytes::{BufMut, BytesMut};

use crate::protocol::ProtocolError;

/// MQTT limits variable byte integers to 268,435,455 (0x0FFFFFFF)
pub const MAX_VARIABLE_LENGTH: usize = 268_435_455;

pub const fn variable_length_length(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// Decode a variable byte integer, returning `(value, bytes_read)`.
pub fn read_variable_length(bytes: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    let mut bytes_read = 0usize;

    loop {
        // four continuation bytes already read: no valid encoding can follow
        if bytes_read == 4 {
            return Err(ProtocolError::InvalidLengthEncoding);
        }
        if bytes_read >= bytes.len() {
            return Err(ProtocolError::IncompletePacket {
                available: bytes.len(),
            });
        }
        let byte = bytes[bytes_read] as usize;
        bytes_read += 1;
        value += (byte & 0x7F) * multiplier;

        if (byte & 0x80) == 0 {
            break;
        }
        multiplier *= 128;
    }

    Ok((value, bytes_read))
}

/// Append a variable byte integer. Values above [`MAX_VARIABLE_LENGTH`] are a
/// caller bug and are clamped in release builds.
pub fn write_variable_length(value: usize, buffer: &mut BytesMut) -> usize {
    debug_assert!(value <= MAX_VARIABLE_LENGTH, "variable length {value} out of range");
    let mut encoded = value.min(MAX_VARIABLE_LENGTH);
    let mut bytes_written = 0;

    loop {
        let mut byte = (encoded & 0x7F) as u8;
        encoded >>= 7;
        if encoded > 0 {
            byte |= 0x80;
        }
        buffer.put_u8(byte);
        bytes_written += 1;
        if encoded == 0 {
            break;
        }
    }

    bytes_written
}

pub fn read_u8(bytes: &[u8], offset: &mut usize) -> Result<u8, ProtocolError> {
    let byte = *bytes.get(*offset).ok_or(ProtocolError::IncompletePacket {
        available: bytes.len(),
    })?;
    *offset += 1;
    Ok(byte)
}

pub fn read_u16(bytes: &[u8], offset: &mut usize) -> Result<u16, ProtocolError> {
    if *offset + 2 > bytes.len() {
        return Err(ProtocolError::IncompletePacket {
            available: bytes.len(),
        });
    }
    let value = u16::from_be_bytes([bytes[*offset], bytes[*offset + 1]]);
    *offset += 2;
    Ok(value)
}

pub fn read_u32(bytes: &[u8], offset: &mut usize) -> Result<u32, ProtocolError> {
    if *offset + 4 > bytes.len() {
        return Err(ProtocolError::IncompletePacket {
            available: bytes.len(),
        });
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(raw))
}

/// Read a variable byte integer at `offset`, advancing it.
pub fn read_var_int(bytes: &[u8], offset: &mut usize) -> Result<u32, ProtocolError> {
    let (value, len) = read_variable_length(&bytes[(*offset).min(bytes.len())..])?;
    *offset += len;
    Ok(value as u32)
}

pub fn read_binary<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len = read_u16(bytes, offset)? as usize;
    if *offset + len > bytes.len() {
        return Err(ProtocolError::IncompletePacket {
            available: bytes.len(),
        });
    }
    let data = &bytes[*offset..*offset + len];
    *offset += len;
    Ok(data)
}

pub fn read_string<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a str, ProtocolError> {
    let raw = read_binary(bytes, offset)?;
    let s = core::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8String)?;
    if s.contains('\0') {
        return Err(ProtocolError::InvalidUtf8String);
    }
    Ok(s)
}

pub fn write_binary(data: &[u8], buffer: &mut BytesMut) {
    debug_assert!(data.len() <= u16::MAX as usize);
    buffer.put_u16(data.len() as u16);
    buffer.put_slice(data);
}

pub fn write_string(s: &str, buffer: &mut BytesMut) {
    write_binary(s.as_bytes(), buffer);
}
