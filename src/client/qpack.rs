//! Field-section codec restricted to the static table. The scanner never
//! advertises a dynamic table, so a peer referencing one is a decode error.

use super::{static_table, DecodeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Encodes a field section with a zero required-insert-count prefix.
/// Literals are written without Huffman coding.
pub fn encode_field_section(fields: &[HeaderField]) -> Vec<u8> {
    let mut buf = vec![0x00, 0x00];
    for field in fields {
        match static_table::find(&field.name, &field.value) {
            Some((idx, true)) => {
                // indexed field line, static
                encode_int(idx as u64, 6, 0b1100_0000, &mut buf);
            }
            Some((idx, false)) => {
                // literal with static name reference
                encode_int(idx as u64, 4, 0b0101_0000, &mut buf);
                encode_string(field.value.as_bytes(), 7, 0x00, &mut buf);
            }
            None => {
                encode_string(field.name.as_bytes(), 3, 0b0010_0000, &mut buf);
                encode_string(field.value.as_bytes(), 7, 0x00, &mut buf);
            }
        }
    }
    buf
}

pub fn decode_field_section(block: &[u8]) -> Result<Vec<HeaderField>, DecodeError> {
    let mut cursor = Cursor { buf: block, pos: 0 };

    let required_insert_count = cursor.int(8)?;
    if required_insert_count != 0 {
        return Err(DecodeError::DynamicTable);
    }
    // sign bit and delta base are meaningless without a dynamic table
    cursor.int(7)?;

    let mut fields = Vec::new();
    while !cursor.is_empty() {
        let first = cursor.peek()?;
        if first & 0b1000_0000 != 0 {
            if first & 0b0100_0000 == 0 {
                return Err(DecodeError::DynamicTable);
            }
            let idx = cursor.int(6)?;
            let (name, value) = static_table::get(idx).ok_or(DecodeError::InvalidIndex(idx))?;
            fields.push(HeaderField::new(name, value));
        } else if first & 0b0100_0000 != 0 {
            if first & 0b0001_0000 == 0 {
                return Err(DecodeError::DynamicTable);
            }
            let idx = cursor.int(4)?;
            let (name, _) = static_table::get(idx).ok_or(DecodeError::InvalidIndex(idx))?;
            let value = cursor.string(7)?;
            fields.push(HeaderField::new(name, value));
        } else if first & 0b0010_0000 != 0 {
            let name = cursor.string(3)?;
            let value = cursor.string(7)?;
            fields.push(HeaderField::new(name, value));
        } else {
            // post-base forms only address the dynamic table
            return Err(DecodeError::DynamicTable);
        }
    }
    Ok(fields)
}

/// Prefixed integer (RFC 7541, section 5.1) with `prefix` low bits in the
/// first byte; `flags` fills the remaining high bits.
fn encode_int(value: u64, prefix: u8, flags: u8, buf: &mut Vec<u8>) {
    let max = (1u64 << prefix) - 1;
    if value < max {
        buf.push(flags | value as u8);
        return;
    }
    buf.push(flags | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        buf.push((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    buf.push(rest as u8);
}

fn encode_string(bytes: &[u8], prefix: u8, flags: u8, buf: &mut Vec<u8>) {
    encode_int(bytes.len() as u64, prefix, flags, buf);
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::Truncated)
    }

    fn next(&mut self) -> Result<u8, DecodeError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn int(&mut self, prefix: u8) -> Result<u64, DecodeError> {
        let max = (1u64 << prefix) - 1;
        let mut value = u64::from(self.next()?) & max;
        if value < max {
            return Ok(value);
        }
        let mut shift = 0u32;
        loop {
            let byte = self.next()?;
            if shift > 56 {
                return Err(DecodeError::IntegerOverflow);
            }
            value += u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    /// String literal whose Huffman flag sits just above the length prefix.
    fn string(&mut self, prefix: u8) -> Result<String, DecodeError> {
        let huffman = self.peek()? & (1 << prefix) != 0;
        let len = usize::try_from(self.int(prefix)?).map_err(|_| DecodeError::IntegerOverflow)?;
        let end = self.pos.checked_add(len).ok_or(DecodeError::IntegerOverflow)?;
        let raw = self.buf.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        let bytes = if huffman {
            hpack::huffman::HuffmanDecoder::new()
                .decode(raw)
                .map_err(|err| DecodeError::Huffman(format!("{err:?}")))?
        } else {
            raw.to_vec()
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
