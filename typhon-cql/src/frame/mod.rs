//! Framing layer: header encode/decode for every protocol version,
//! request serialization and body compression.

pub mod frame_errors;
pub mod protocol;
pub mod request;
pub mod response;
pub mod types;

use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;
use std::fmt::Display;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use frame_errors::FrameError;
use protocol::ProtocolVersion;
use request::SerializableRequest;
use response::ResponseOpcode;

// Frame flags
pub(crate) const FLAG_COMPRESSION: u8 = 0x01;
pub(crate) const FLAG_TRACING: u8 = 0x02;
pub(crate) const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub(crate) const FLAG_WARNING: u8 = 0x08;
pub(crate) const FLAG_USE_BETA: u8 = 0x10;

/// The wire protocol compression algorithm. Only LZ4 is supported.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    Lz4,
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Lz4 => f.write_str("lz4"),
        }
    }
}

/// A request frame, fully serialized except for the stream id, which the
/// connection's writer fills in right before the bytes hit the socket.
pub struct SerializedRequest {
    version: ProtocolVersion,
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
        use_beta: bool,
    ) -> Result<SerializedRequest, FrameError> {
        let header_size = version.header_size();
        let mut flags = 0;
        let mut data = vec![0; header_size];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let mut body = Vec::new();
            req.serialize(version, &mut body)?;
            compress_append(&body, compression, &mut data);
        } else {
            req.serialize(version, &mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }
        if use_beta {
            flags |= FLAG_USE_BETA;
        }

        data[0] = version as u8;
        data[1] = flags;
        // Stream id bytes stay zeroed until set_stream().
        data[header_size - 5] = R::OPCODE as u8;

        let body_size = (data.len() - header_size) as u32;
        data[header_size - 4..header_size].copy_from_slice(&body_size.to_be_bytes());

        Ok(Self { version, data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        if self.version.header_size() == 9 {
            self.data[2..4].copy_from_slice(&stream.to_be_bytes());
        } else {
            self.data[2] = stream as i8 as u8;
        }
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// The header fields that are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

/// Reads one response frame off the wire: header (size depending on the
/// negotiated version), then exactly `length` body bytes.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let header_size = version.header_size();
    let mut raw_header = [0u8; 9];
    reader.read_exact(&mut raw_header[..header_size]).await?;

    let mut buf = &raw_header[..header_size];

    let version_byte = buf.get_u8();
    if version_byte & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    if version_byte & 0x7f != version as u8 {
        return Err(FrameError::VersionMismatch(version_byte & 0x7f));
    }

    let flags = buf.get_u8();
    let stream = if header_size == 9 {
        buf.get_i16()
    } else {
        buf.get_i8() as i16
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())
        .map_err(FrameError::UnknownResponseOpcode)?;
    let length = buf.get_u32() as usize;

    let frame_params = FrameParams {
        version: version_byte,
        flags,
        stream,
    };

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF before the advertised body length arrived.
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// A response body with the header-flag-driven extensions stripped off.
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload = types::read_bytes_map(buf)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        Some(payload)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

fn compress_append(uncomp_body: &[u8], compression: Compression, out: &mut Vec<u8>) {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let compressed = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + compressed.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&compressed);
        }
    }
}

fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < 4 {
                return Err(FrameError::BodyLengthOverflow);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            Ok(lz4_flex::decompress(comp_body, uncomp_len)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn lz4_round_trip() {
        let body = "all work and no play makes jack a dull boy. ".repeat(64);
        let mut compressed = Vec::new();
        compress_append(body.as_bytes(), Compression::Lz4, &mut compressed);
        assert!(compressed.len() < body.len());
        let decompressed = decompress(&compressed, Compression::Lz4).unwrap();
        assert_eq!(decompressed, body.as_bytes());
    }

    #[tokio::test]
    async fn frame_header_layouts() {
        // An OPTIONS request has an empty body, which makes the header easy
        // to inspect.
        let req = request::Options;

        let mut v4 = SerializedRequest::make(&req, ProtocolVersion::V4, None, false, false)
            .unwrap();
        v4.set_stream(0x0102);
        assert_eq!(
            v4.get_data(),
            [0x04, 0x00, 0x01, 0x02, 0x05, 0x00, 0x00, 0x00, 0x00]
        );

        let mut v2 = SerializedRequest::make(&req, ProtocolVersion::V2, None, false, false)
            .unwrap();
        v2.set_stream(0x21);
        assert_eq!(v2.get_data(), [0x02, 0x00, 0x21, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn response_frame_round_trip() {
        // READY response, v4: header only.
        let raw: &[u8] = &[0x84, 0x00, 0x00, 0x07, 0x02, 0x00, 0x00, 0x00, 0x00];
        let (params, opcode, body) =
            read_response_frame(&mut &raw[..], ProtocolVersion::V4)
                .await
                .unwrap();
        assert_eq!(params.stream, 7);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn client_frame_is_rejected() {
        let raw: &[u8] = &[0x04, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00];
        let res = read_response_frame(&mut &raw[..], ProtocolVersion::V4).await;
        assert_matches!(res, Err(FrameError::FrameFromClient));
    }
}
