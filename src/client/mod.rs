//! Minimal HTTP/3 client used after a successful handshake: one HEAD request
//! on a fresh bidirectional stream, one header block read back.

pub mod frame;
pub mod qpack;
mod static_table;
pub mod varint;

use crate::model::HttpResponse;
use qpack::HeaderField;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub const USER_AGENT: &str = concat!("quic-scanner/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream ended before the frame was complete")]
    Truncated,
    #[error("header frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),
    #[error("integer does not fit in 62 bits")]
    IntegerOverflow,
    #[error("field section references the dynamic table")]
    DynamicTable,
    #[error("static table index {0} out of range")]
    InvalidIndex(u64),
    #[error("huffman decoding failed: {0}")]
    Huffman(String),
    #[error("response carries no :status pseudo-header")]
    MissingStatus,
    #[error("malformed status pseudo-header {0:?}")]
    InvalidStatus(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// HEADERS frame carrying `HEAD /` for the given authority.
pub fn build_request(authority: &str) -> Vec<u8> {
    let fields = [
        HeaderField::new(":method", "HEAD"),
        HeaderField::new(":path", "/"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":authority", authority),
        HeaderField::new("user-agent", USER_AGENT),
        HeaderField::new("accept", "*/*"),
    ];
    let block = qpack::encode_field_section(&fields);
    let mut buf = Vec::with_capacity(block.len() + 8);
    frame::encode(frame::HEADERS, &block, &mut buf);
    buf
}

/// Sends the request, half-closes the send side and decodes the response
/// headers.
pub async fn exchange<W, R>(
    mut send: W,
    mut recv: R,
    authority: &str,
) -> Result<HttpResponse, DecodeError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    send.write_all(&build_request(authority)).await?;
    send.shutdown().await?;
    read_response(&mut recv).await
}

pub async fn read_response<R: AsyncRead + Unpin>(
    recv: &mut R,
) -> Result<HttpResponse, DecodeError> {
    let block = frame::read_header_block(recv).await?;
    let fields = qpack::decode_field_section(&block)?;
    parse_response(fields)
}

pub fn parse_response(fields: Vec<HeaderField>) -> Result<HttpResponse, DecodeError> {
    let mut status = None;
    let mut headers = Vec::with_capacity(fields.len());
    for field in fields {
        if field.name == ":status" {
            let code = field
                .value
                .parse::<u32>()
                .map_err(|_| DecodeError::InvalidStatus(field.value.clone()))?;
            status = Some(code);
        } else {
            headers.push((field.name, field.value));
        }
    }
    Ok(HttpResponse {
        status: status.ok_or(DecodeError::MissingStatus)?,
        headers,
    })
}
