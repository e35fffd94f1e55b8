use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::response::event::EventType;
use crate::frame::types;

pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        let event_types_list: Vec<String> = self
            .event_types_to_register_for
            .iter()
            .map(|event| event.to_string())
            .collect();

        types::write_string_list(&event_types_list, buf)?;
        Ok(())
    }
}
