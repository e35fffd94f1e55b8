//! Scylla shard awareness: mapping tokens to shards and drawing source
//! ports that land a connection on a chosen shard.

use std::collections::HashMap;
use std::num::NonZeroU16;
use std::ops::RangeInclusive;

use rand::Rng as _;
use thiserror::Error;

use super::Token;

pub type Shard = u32;
pub type ShardCount = NonZeroU16;

/// The local port range the driver draws shard-aware source ports from.
/// Inclusive; must stay above the reserved range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAwarePortRange(RangeInclusive<u16>);

impl ShardAwarePortRange {
    /// The default range: the ephemeral ports [49152, 65535].
    pub const EPHEMERAL_PORT_RANGE: Self = Self(49152..=65535);

    pub fn new(range: impl Into<RangeInclusive<u16>>) -> Result<Self, InvalidShardAwarePortRange> {
        let range = range.into();
        if range.is_empty() || range.start() < &1024 {
            return Err(InvalidShardAwarePortRange);
        }
        Ok(Self(range))
    }
}

impl Default for ShardAwarePortRange {
    fn default() -> Self {
        Self::EPHEMERAL_PORT_RANGE
    }
}

#[derive(Debug, Error)]
#[error("Invalid shard-aware local port range")]
pub struct InvalidShardAwarePortRange;

/// Sharding parameters of one node, learned from the SUPPORTED options
/// during the handshake. Absence means the node is not shard-aware and
/// the pool treats it as single-shard.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct ShardInfo {
    /// The shard this very connection landed on.
    pub shard: u16,
    pub nr_shards: ShardCount,
    pub msb_ignore: u8,
    pub shard_aware_port: Option<u16>,
    pub shard_aware_port_ssl: Option<u16>,
}

impl ShardInfo {
    pub fn get_sharder(&self) -> Sharder {
        Sharder::new(self.nr_shards, self.msb_ignore)
    }
}

/// Computes shard assignments the way the server does.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Sharder {
    pub nr_shards: ShardCount,
    pub msb_ignore: u8,
}

impl Sharder {
    pub fn new(nr_shards: ShardCount, msb_ignore: u8) -> Self {
        Sharder {
            nr_shards,
            msb_ignore,
        }
    }

    /// The shard owning `token`: bias the token into unsigned space,
    /// discard the configured top bits, then multiply-shift into the
    /// shard range.
    #[inline]
    pub fn shard_of(&self, token: Token) -> Shard {
        let mut biased_token = (token.value as u64).wrapping_add(1u64 << 63);
        biased_token <<= self.msb_ignore;
        (((biased_token as u128) * (self.nr_shards.get() as u128)) >> 64) as Shard
    }

    /// The shard the server assigns to a connection arriving at the
    /// shard-aware port from `source_port`.
    #[inline]
    pub fn shard_of_source_port(&self, source_port: u16) -> Shard {
        (source_port % self.nr_shards.get()) as Shard
    }

    /// Iterates source ports `p` with `p % nr_shards == shard`, starting
    /// at a random position in the range and wrapping around once.
    pub fn iter_source_ports_for_shard(
        &self,
        shard: Shard,
        port_range: &ShardAwarePortRange,
    ) -> impl Iterator<Item = u16> {
        assert!(shard < self.nr_shards.get() as u32);
        let nr_shards = self.nr_shards.get();
        let (range_start, range_end) = (*port_range.0.start(), *port_range.0.end());

        // A random valid starting port for this shard.
        let starting_port = rand::rng()
            .random_range((range_start + nr_shards - 1)..(range_end - nr_shards + 1))
            / nr_shards
            * nr_shards
            + shard as u16;

        // The smallest valid port for this shard, for the wrap-around leg.
        let first_valid_port = range_start.div_ceil(nr_shards) * nr_shards + shard as u16;

        let before_wrap = (starting_port..=range_end).step_by(nr_shards.into());
        let after_wrap = (first_valid_port..starting_port).step_by(nr_shards.into());
        before_wrap.chain(after_wrap)
    }
}

#[derive(Clone, Error, Debug)]
pub enum ShardingError {
    /// No sharding options at all: a Cassandra cluster.
    #[error("Server did not provide any sharding information")]
    NoShardInfo,
    #[error("Missing some sharding info parameters")]
    MissingSomeShardInfoParameters,
    #[error("Missing some sharding info parameter values")]
    MissingShardInfoParameterValues,
    #[error("Sharding info contains an invalid number of shards (0)")]
    ZeroShards,
    #[error("Failed to parse a sharding info parameter's value: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),
}

const SHARD_ENTRY: &str = "SCYLLA_SHARD";
const NR_SHARDS_ENTRY: &str = "SCYLLA_NR_SHARDS";
const MSB_IGNORE_ENTRY: &str = "SCYLLA_SHARDING_IGNORE_MSB";
const SHARD_AWARE_PORT_ENTRY: &str = "SCYLLA_SHARD_AWARE_PORT";
const SHARD_AWARE_PORT_SSL_ENTRY: &str = "SCYLLA_SHARD_AWARE_PORT_SSL";

impl<'a> TryFrom<&'a HashMap<String, Vec<String>>> for ShardInfo {
    type Error = ShardingError;

    fn try_from(options: &'a HashMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        let shard_entry = options.get(SHARD_ENTRY);
        let nr_shards_entry = options.get(NR_SHARDS_ENTRY);
        let msb_ignore_entry = options.get(MSB_IGNORE_ENTRY);

        let (shard_entry, nr_shards_entry, msb_ignore_entry) =
            match (shard_entry, nr_shards_entry, msb_ignore_entry) {
                (Some(shard), Some(nr_shards), Some(msb)) => (shard, nr_shards, msb),
                (None, None, None) => return Err(ShardingError::NoShardInfo),
                _ => return Err(ShardingError::MissingSomeShardInfoParameters),
            };

        let (Some(shard_entry), Some(nr_shards_entry), Some(msb_ignore_entry)) = (
            shard_entry.first(),
            nr_shards_entry.first(),
            msb_ignore_entry.first(),
        ) else {
            return Err(ShardingError::MissingShardInfoParameterValues);
        };

        let first_port = |key: &str| -> Result<Option<u16>, std::num::ParseIntError> {
            options
                .get(key)
                .and_then(|v| v.first())
                .map(|v| v.parse::<u16>())
                .transpose()
        };

        let shard = shard_entry.parse::<u16>()?;
        let nr_shards = nr_shards_entry.parse::<u16>()?;
        let nr_shards = ShardCount::new(nr_shards).ok_or(ShardingError::ZeroShards)?;
        let msb_ignore = msb_ignore_entry.parse::<u8>()?;

        Ok(ShardInfo {
            shard,
            nr_shards,
            msb_ignore,
            shard_aware_port: first_port(SHARD_AWARE_PORT_ENTRY)?,
            shard_aware_port_ssl: first_port(SHARD_AWARE_PORT_SSL_ENTRY)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use crate::routing::hash_routing_key;
    use std::collections::HashSet;

    #[test]
    fn shard_of_matches_server_assignments() {
        // Values cross-checked against other shard-aware drivers.
        let sharder = Sharder::new(ShardCount::new(4).unwrap(), 12);
        assert_eq!(sharder.shard_of(Token::new(-9219783007514621794)), 3);
        assert_eq!(sharder.shard_of(Token::new(9222582454147032830)), 3);
    }

    #[test]
    fn source_ports_map_back_to_shard() {
        let nr_shards = 4u16;
        let sharder = Sharder::new(ShardCount::new(nr_shards).unwrap(), 12);
        let range = ShardAwarePortRange::EPHEMERAL_PORT_RANGE;

        for shard in 0..nr_shards as u32 {
            let mut seen: HashSet<u16> = HashSet::new();
            for port in sharder.iter_source_ports_for_shard(shard, &range) {
                assert_eq!(sharder.shard_of_source_port(port), shard);
                assert!(seen.insert(port), "port {port} returned twice");
            }

            // The iterator must exhaust every port of this shard in range.
            let first_valid = 49152u16.div_ceil(nr_shards) * nr_shards + shard as u16;
            let expected = ((65535 - first_valid) / nr_shards + 1) as usize;
            assert_eq!(seen.len(), expected);
        }
    }

    #[test]
    fn shard_distribution_is_roughly_uniform() {
        let nr_shards = 4u32;
        let sharder = Sharder::new(ShardCount::new(nr_shards as u16).unwrap(), 12);

        let mut counts = [0usize; 4];
        for i in 0..4000u32 {
            let key = format!("routing-key-{i}");
            let token = hash_routing_key(key.as_bytes());
            counts[sharder.shard_of(token) as usize] += 1;
        }

        // ~1000 per shard, within 10%.
        for (shard, count) in counts.iter().enumerate() {
            assert!(
                (900..=1100).contains(count),
                "shard {shard} got {count} of 4000 requests"
            );
        }
    }

    #[test]
    fn shard_info_requires_all_parameters() {
        let mut options: HashMap<String, Vec<String>> = HashMap::new();
        assert_matches!(
            ShardInfo::try_from(&options),
            Err(ShardingError::NoShardInfo)
        );

        options.insert(SHARD_ENTRY.into(), vec!["1".into()]);
        options.insert(NR_SHARDS_ENTRY.into(), vec!["4".into()]);
        assert_matches!(
            ShardInfo::try_from(&options),
            Err(ShardingError::MissingSomeShardInfoParameters)
        );

        options.insert(MSB_IGNORE_ENTRY.into(), vec!["12".into()]);
        options.insert(SHARD_AWARE_PORT_ENTRY.into(), vec!["19042".into()]);
        let info = ShardInfo::try_from(&options).unwrap();
        assert_eq!(info.shard, 1);
        assert_eq!(info.nr_shards.get(), 4);
        assert_eq!(info.shard_aware_port, Some(19042));
        assert_eq!(info.shard_aware_port_ssl, None);
    }
}
