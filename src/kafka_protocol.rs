//! Kafka wire-protocol constants.
//!
//! The request dispatcher that actually decodes/encodes Kafka requests lives
//! outside this crate (see the module-level docs in `lib.rs`); what stays
//! here is the small, stable set of numbers every component needs to agree
//! on: API keys, the supported-version matrix advertised to clients, and the
//! standard error-code numbering used by [`crate::error::TektiteError::to_kafka_error_code`].

/// Kafka API keys this engine understands at the protocol level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ApiKey {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    FindCoordinator = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
    DescribeGroups = 15,
    ListGroups = 16,
    ApiVersions = 18,
    CreateTopics = 19,
    DeleteTopics = 20,
    InitProducerId = 22,
    AddPartitionsToTxn = 24,
    AddOffsetsToTxn = 25,
    EndTxn = 26,
    TxnOffsetCommit = 28,
}

/// `(min, max)` supported version range per API key, mirroring the
/// `ApiVersions` response this engine advertises to clients.
pub const SUPPORTED_API_VERSIONS: &[(ApiKey, i16, i16)] = &[
    (ApiKey::Produce, 0, 9),
    (ApiKey::Fetch, 0, 13),
    (ApiKey::ListOffsets, 0, 7),
    (ApiKey::Metadata, 0, 12),
    (ApiKey::OffsetCommit, 0, 8),
    (ApiKey::OffsetFetch, 0, 8),
    (ApiKey::FindCoordinator, 0, 4),
    (ApiKey::JoinGroup, 0, 9),
    (ApiKey::Heartbeat, 0, 4),
    (ApiKey::LeaveGroup, 0, 5),
    (ApiKey::SyncGroup, 0, 5),
    (ApiKey::DescribeGroups, 0, 5),
    (ApiKey::ListGroups, 0, 4),
    (ApiKey::ApiVersions, 0, 3),
    (ApiKey::CreateTopics, 0, 7),
    (ApiKey::DeleteTopics, 0, 6),
    (ApiKey::InitProducerId, 0, 4),
    (ApiKey::AddPartitionsToTxn, 0, 3),
    (ApiKey::AddOffsetsToTxn, 0, 3),
    (ApiKey::EndTxn, 0, 3),
    (ApiKey::TxnOffsetCommit, 0, 3),
];

/// Standard Kafka error codes. Not exhaustive — only the subset this engine
/// can actually produce via [`crate::error::TektiteError::to_kafka_error_code`]
/// or needs to recognize on the wire.
pub mod error_code {
    pub const NONE: i16 = 0;
    pub const UNKNOWN_SERVER_ERROR: i16 = -1;
    pub const CORRUPT_MESSAGE: i16 = 2;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_OR_FOLLOWER: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
    pub const GROUP_COORDINATOR_NOT_AVAILABLE: i16 = 15;
    pub const NOT_COORDINATOR: i16 = 16;
    pub const INVALID_REQUEST: i16 = 42;
    pub const UNKNOWN_MEMBER_ID: i16 = 25;
    pub const REBALANCE_IN_PROGRESS: i16 = 27;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matrix_covers_produce_and_fetch() {
        assert!(SUPPORTED_API_VERSIONS
            .iter()
            .any(|(k, _, _)| *k == ApiKey::Produce));
        assert!(SUPPORTED_API_VERSIONS
            .iter()
            .any(|(k, _, _)| *k == ApiKey::Fetch));
    }

    #[test]
    fn every_entry_has_non_decreasing_range() {
        for (_, min, max) in SUPPORTED_API_VERSIONS {
            assert!(min <= max);
        }
    }
}
