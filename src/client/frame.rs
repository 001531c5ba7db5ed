use super::{varint, DecodeError};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DATA: u64 = 0x0;
pub const HEADERS: u64 = 0x1;

/// Upper bound for a header block we are willing to buffer.
pub const MAX_HEADER_BLOCK: u64 = 64 * 1024;

pub fn encode(ty: u64, payload: &[u8], buf: &mut Vec<u8>) {
    varint::encode(ty, buf);
    varint::encode(payload.len() as u64, buf);
    buf.extend_from_slice(payload);
}

/// Reads frames until the first HEADERS frame and returns its payload.
/// Every other frame type is consumed and discarded.
pub async fn read_header_block<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, DecodeError> {
    loop {
        let ty = varint::read(reader).await?;
        let len = varint::read(reader).await?;
        if ty == HEADERS {
            if len > MAX_HEADER_BLOCK {
                return Err(DecodeError::FrameTooLarge(len));
            }
            let mut block = vec![0u8; len as usize];
            reader.read_exact(&mut block).await.map_err(eof_as_truncated)?;
            return Ok(block);
        }

        tracing::trace!(frame_type = ty, len, "skipping frame");
        let skipped = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
        if skipped != len {
            return Err(DecodeError::Truncated);
        }
    }
}

fn eof_as_truncated(err: std::io::Error) -> DecodeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        DecodeError::Truncated
    } else {
        err.into()
    }
}
