use super::DecodeError;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX: u64 = (1 << 62) - 1;

pub fn encoded_len(value: u64) -> usize {
    match value {
        0..=63 => 1,
        64..=16_383 => 2,
        16_384..=1_073_741_823 => 4,
        _ => 8,
    }
}

/// Appends `value` in the QUIC variable-length integer encoding.
/// Values above [`MAX`] are clamped.
pub fn encode(value: u64, buf: &mut Vec<u8>) {
    let value = value.min(MAX);
    match encoded_len(value) {
        1 => buf.push(value as u8),
        2 => buf.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes()),
        4 => buf.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes()),
        _ => buf.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes()),
    }
}

/// Decodes one varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for byte in &buf[1..len] {
        value = (value << 8) | u64::from(*byte);
    }
    Some((value, len))
}

pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, DecodeError> {
    let first = match reader.read_u8().await {
        Ok(b) => b,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(DecodeError::Truncated)
        }
        Err(err) => return Err(err.into()),
    };
    let len = 1usize << (first >> 6);
    let mut rest = [0u8; 7];
    if len > 1 {
        match reader.read_exact(&mut rest[..len - 1]).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(DecodeError::Truncated)
            }
            Err(err) => return Err(err.into()),
        }
    }
    let mut value = u64::from(first & 0x3f);
    for byte in &rest[..len - 1] {
        value = (value << 8) | u64::from(*byte);
    }
    Ok(value)
}
