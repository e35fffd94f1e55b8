//! Response frames sent by the server.

pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

pub use authenticate::{AuthChallenge, AuthSuccess, Authenticate};
pub use error::Error;
pub use event::Event;
pub use supported::Supported;

use crate::frame::frame_errors::ResponseParseError;
use crate::frame::protocol::ProtocolVersion;
use crate::value::ColumnSpec;
use bytes::Bytes;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(ResponseOpcode::Error),
            0x02 => Ok(ResponseOpcode::Ready),
            0x03 => Ok(ResponseOpcode::Authenticate),
            0x06 => Ok(ResponseOpcode::Supported),
            0x08 => Ok(ResponseOpcode::Result),
            0x0C => Ok(ResponseOpcode::Event),
            0x0E => Ok(ResponseOpcode::AuthChallenge),
            0x10 => Ok(ResponseOpcode::AuthSuccess),
            other => Err(other),
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Authenticate(Authenticate),
    Supported(Supported),
    Result(result::CqlResult),
    Event(Event),
    AuthChallenge(AuthChallenge),
    AuthSuccess(AuthSuccess),
}

impl Response {
    /// A short, static name of the response kind for error messages.
    pub fn to_response_kind(&self) -> &'static str {
        match self {
            Response::Error(_) => "ERROR",
            Response::Ready => "READY",
            Response::Authenticate(_) => "AUTHENTICATE",
            Response::Supported(_) => "SUPPORTED",
            Response::Result(_) => "RESULT",
            Response::Event(_) => "EVENT",
            Response::AuthChallenge(_) => "AUTH_CHALLENGE",
            Response::AuthSuccess(_) => "AUTH_SUCCESS",
        }
    }

    /// Parses a response body. `cached_metadata` supplies column specs for
    /// RESULT/Rows responses to EXECUTEs sent with the skip-metadata flag.
    pub fn deserialize(
        version: ProtocolVersion,
        opcode: ResponseOpcode,
        body: &Bytes,
        cached_metadata: Option<&[ColumnSpec]>,
    ) -> Result<Response, ResponseParseError> {
        let buf = &mut &**body;
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(version, buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => {
                Response::Result(result::deserialize(version, buf, cached_metadata)?)
            }
            ResponseOpcode::Event => Response::Event(Event::deserialize(buf)?),
            ResponseOpcode::AuthChallenge => {
                Response::AuthChallenge(AuthChallenge::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => Response::AuthSuccess(AuthSuccess::deserialize(buf)?),
        };

        if !buf.is_empty() {
            return Err(ResponseParseError::TrailingBytes {
                remaining: buf.len(),
            });
        }

        Ok(response)
    }
}
