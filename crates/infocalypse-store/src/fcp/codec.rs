//! `tokio_util` codec for FCP framing.

use std::io;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use super::message::FcpMessage;
use crate::constants::MAX_FCP_DATA_LEN;
use crate::constants::MAX_FCP_FIELDS;
use crate::constants::MAX_FCP_LINE_LEN;

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Line-oriented FCP codec with trailing data support.
#[derive(Debug, Default)]
pub struct FcpCodec;

impl FcpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FcpCodec {
    type Item = FcpMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Scan complete lines without consuming until a whole message is
        // buffered, so a partial read leaves `src` untouched.
        let mut offset = 0;
        let mut message: Option<FcpMessage> = None;

        loop {
            let Some(newline) = src[offset..].iter().position(|b| *b == b'\n') else {
                if src.len() - offset > MAX_FCP_LINE_LEN {
                    return Err(invalid("FCP line too long"));
                }
                return Ok(None);
            };
            let raw = &src[offset..offset + newline];
            let line = std::str::from_utf8(raw).map_err(|_| invalid("FCP line is not UTF-8"))?;
            let line = line.trim_end_matches('\r');
            offset += newline + 1;

            let Some(msg) = message.as_mut() else {
                if !line.is_empty() {
                    message = Some(FcpMessage::new(line));
                }
                continue;
            };

            match line {
                "EndMessage" | "End" => {
                    src.advance(offset);
                    return Ok(message);
                }
                "Data" => {
                    let len = msg.get_u64("DataLength").ok_or_else(|| invalid("Data without DataLength"))? as usize;
                    if len > MAX_FCP_DATA_LEN {
                        return Err(invalid(format!("FCP data length {len} exceeds maximum")));
                    }
                    if src.len() < offset + len {
                        src.reserve(offset + len - src.len());
                        return Ok(None);
                    }
                    src.advance(offset);
                    let data = src.split_to(len).freeze();
                    let mut msg = message.take().ok_or_else(|| invalid("missing message"))?;
                    msg.data = Some(data);
                    return Ok(Some(msg));
                }
                _ => {
                    let (name, value) = line.split_once('=').ok_or_else(|| invalid(format!("bad FCP field: {line}")))?;
                    if msg.fields.len() >= MAX_FCP_FIELDS {
                        return Err(invalid("too many FCP fields"));
                    }
                    msg.fields.push((name.to_string(), value.to_string()));
                }
            }
        }
    }
}

impl Encoder<FcpMessage> for FcpCodec {
    type Error = io::Error;

    fn encode(&mut self, mut item: FcpMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item.data.take();
        if let Some(data) = &data {
            item.set("DataLength", data.len());
        }

        dst.put_slice(item.name.as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &item.fields {
            if name.contains(['\n', '=']) || value.contains('\n') {
                return Err(invalid(format!("field {name} cannot be encoded")));
            }
            dst.put_slice(name.as_bytes());
            dst.put_u8(b'=');
            dst.put_slice(value.as_bytes());
            dst.put_u8(b'\n');
        }
        match data {
            Some(data) => {
                dst.put_slice(b"Data\n");
                dst.put_slice(&data);
            }
            None => dst.put_slice(b"EndMessage\n"),
        }
        Ok(())
    }
}
