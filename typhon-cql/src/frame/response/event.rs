//! Server-pushed EVENT frames: topology, status and schema changes.

use crate::frame::frame_errors::ResponseParseError;
use crate::frame::types;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// An event type name, as used in REGISTER requests and EVENT responses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = ResponseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(EventType::TopologyChange),
            "STATUS_CHANGE" => Ok(EventType::StatusChange),
            "SCHEMA_CHANGE" => Ok(EventType::SchemaChange),
            other => Err(ResponseParseError::UnknownEventType(other.to_owned())),
        }
    }
}

#[derive(Debug)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

impl FromStr for SchemaChangeType {
    type Err = ResponseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(SchemaChangeType::Created),
            "UPDATED" => Ok(SchemaChangeType::Updated),
            "DROPPED" => Ok(SchemaChangeType::Dropped),
            other => Err(ResponseParseError::UnknownSchemaChangeType(
                other.to_owned(),
            )),
        }
    }
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Event::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => {
                Ok(Event::StatusChange(StatusChangeEvent::deserialize(buf)?))
            }
            EventType::SchemaChange => {
                Ok(Event::SchemaChange(SchemaChangeEvent::deserialize(buf)?))
            }
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let change = types::read_string(buf)?.to_owned();
        let addr = types::read_inet(buf)?;
        match change.as_str() {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            other => Err(ResponseParseError::UnknownEventType(other.to_owned())),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let change = types::read_string(buf)?.to_owned();
        let addr = types::read_inet(buf)?;
        match change.as_str() {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            other => Err(ResponseParseError::UnknownStatusChangeType(
                other.to_owned(),
            )),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ResponseParseError> {
        let change_type: SchemaChangeType = types::read_string(buf)?.parse()?;
        let target = types::read_string(buf)?.to_owned();
        let keyspace_name = types::read_string(buf)?.to_owned();

        match target.as_str() {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type,
                keyspace_name,
            }),
            "TABLE" => Ok(Self::TableChange {
                change_type,
                keyspace_name,
                object_name: types::read_string(buf)?.to_owned(),
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type,
                keyspace_name,
                type_name: types::read_string(buf)?.to_owned(),
            }),
            "FUNCTION" => Ok(Self::FunctionChange {
                change_type,
                keyspace_name,
                function_name: types::read_string(buf)?.to_owned(),
                arguments: types::read_string_list(buf)?,
            }),
            "AGGREGATE" => Ok(Self::AggregateChange {
                change_type,
                keyspace_name,
                aggregate_name: types::read_string(buf)?.to_owned(),
                arguments: types::read_string_list(buf)?,
            }),
            other => Err(ResponseParseError::UnknownSchemaChangeType(
                other.to_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_change_round_trip() {
        let mut body = Vec::new();
        types::write_string("STATUS_CHANGE", &mut body).unwrap();
        types::write_string("UP", &mut body).unwrap();
        types::write_inet("10.0.0.1:9042".parse().unwrap(), &mut body);

        let mut slice = &body[..];
        let event = Event::deserialize(&mut slice).unwrap();
        assert!(slice.is_empty());
        match event {
            Event::StatusChange(StatusChangeEvent::Up(addr)) => {
                assert_eq!(addr, "10.0.0.1:9042".parse().unwrap())
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn schema_change_table() {
        let mut body = Vec::new();
        types::write_string("SCHEMA_CHANGE", &mut body).unwrap();
        types::write_string("UPDATED", &mut body).unwrap();
        types::write_string("TABLE", &mut body).unwrap();
        types::write_string("ks", &mut body).unwrap();
        types::write_string("t", &mut body).unwrap();

        let event = Event::deserialize(&mut &body[..]).unwrap();
        match event {
            Event::SchemaChange(SchemaChangeEvent::TableChange {
                change_type,
                keyspace_name,
                object_name,
            }) => {
                assert_eq!(change_type, SchemaChangeType::Updated);
                assert_eq!(keyspace_name, "ks");
                assert_eq!(object_name, "t");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
