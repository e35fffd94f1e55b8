use std::borrow::Cow;
use std::collections::HashMap;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DEFAULT_CQL_PROTOCOL_VERSION: &str = "3.0.0";
pub const COMPRESSION: &str = "COMPRESSION";
pub const DRIVER_NAME: &str = "DRIVER_NAME";
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";

pub const DEFAULT_DRIVER_NAME: &str = "Typhon Rust Driver";
pub const DEFAULT_DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}
