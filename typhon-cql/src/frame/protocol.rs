//! Protocol version model and capability predicates.
//!
//! The driver speaks native protocol versions 1 through 5. Encodings that
//! differ between versions take a [`ProtocolVersion`] parameter; capability
//! predicates below are the single source of truth for what each version
//! supports.

use std::fmt;

/// A negotiated (or candidate) native protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    /// The newest version the driver can speak. Negotiation starts here
    /// unless the user caps it lower.
    pub const LATEST: ProtocolVersion = ProtocolVersion::V5;

    /// The oldest version the driver can speak. Servers demanding anything
    /// older are unsupported.
    pub const OLDEST: ProtocolVersion = ProtocolVersion::V1;

    pub fn from_wire(byte: u8) -> Option<ProtocolVersion> {
        match byte & 0x7f {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            3 => Some(ProtocolVersion::V3),
            4 => Some(ProtocolVersion::V4),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    /// The version one below `self`, used when the server rejects `self`
    /// during negotiation.
    pub fn predecessor(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V1 => None,
            ProtocolVersion::V2 => Some(ProtocolVersion::V1),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V5 => Some(ProtocolVersion::V4),
        }
    }

    /// Frame header size: v1/v2 use a 1-byte stream id (8-byte header),
    /// v3+ a 2-byte stream id (9-byte header).
    pub fn header_size(self) -> usize {
        if self >= ProtocolVersion::V3 {
            9
        } else {
            8
        }
    }

    /// How many stream ids a client may allocate: valid ids are
    /// `0..max_streams`.
    pub fn max_streams(self) -> usize {
        if self >= ProtocolVersion::V3 {
            32_768
        } else {
            128
        }
    }

    /// Named bind markers in QUERY/EXECUTE values.
    pub fn supports_named_values(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// The dedicated `unset` value marker (length -2).
    pub fn supports_unset(self) -> bool {
        self >= ProtocolVersion::V4
    }

    /// The `keyspace` field in QUERY/EXECUTE/PREPARE/BATCH parameters.
    pub fn supports_per_request_keyspace(self) -> bool {
        self >= ProtocolVersion::V5
    }

    /// Result-metadata ids on prepared statements and EXECUTE.
    pub fn supports_result_metadata_id(self) -> bool {
        self >= ProtocolVersion::V5
    }

    /// v5 widened the QUERY/EXECUTE/BATCH flags field from 1 to 4 bytes.
    pub fn uses_int_query_flags(self) -> bool {
        self >= ProtocolVersion::V5
    }

    /// The continuous-paging flag in QUERY parameters is defined from v5.
    pub fn supports_continuous_paging(self) -> bool {
        self >= ProtocolVersion::V5
    }

    /// v1/v2 encode collection counts and element lengths as `[short]`;
    /// v3+ use `[int]`.
    pub fn uses_short_collection_lengths(self) -> bool {
        self <= ProtocolVersion::V2
    }

    /// Prepared responses list partition-key indexes on v4+.
    pub fn supports_pk_indexes(self) -> bool {
        self >= ProtocolVersion::V4
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::ProtocolVersion::*;

    #[test]
    fn capability_boundaries() {
        assert!(!V2.supports_named_values());
        assert!(V3.supports_named_values());
        assert!(!V3.supports_unset());
        assert!(V4.supports_unset());
        assert!(!V4.supports_result_metadata_id());
        assert!(V5.supports_result_metadata_id());
        assert!(V2.uses_short_collection_lengths());
        assert!(!V3.uses_short_collection_lengths());
    }

    #[test]
    fn header_layout() {
        assert_eq!(V1.header_size(), 8);
        assert_eq!(V2.header_size(), 8);
        assert_eq!(V3.header_size(), 9);
        assert_eq!(V5.header_size(), 9);
        assert_eq!(V2.max_streams(), 128);
        assert_eq!(V4.max_streams(), 32_768);
    }

    #[test]
    fn negotiation_walks_down_to_v1() {
        let mut v = Some(super::ProtocolVersion::LATEST);
        let mut seen = vec![];
        while let Some(version) = v {
            seen.push(version as u8);
            v = version.predecessor();
        }
        assert_eq!(seen, [5, 4, 3, 2, 1]);
    }
}
