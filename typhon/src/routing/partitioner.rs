//! The Murmur3 token function, in the Cassandra-compatible variant.
//!
//! Cassandra's Murmur3 differs from the reference implementation: it
//! performs its arithmetic on signed 64-bit integers, and the sign
//! carries into the final token. The implementation below reproduces
//! that behavior bit-for-bit, since tokens must agree with the server's.

use bytes::Buf;
use std::num::Wrapping;

use super::Token;

/// Builds streaming hashers that fold serialized partition-key chunks
/// into a [`Token`]. Mirrors the `BuildHasher`/`Hasher` split from std.
pub trait Partitioner {
    type Hasher: PartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher;

    fn hash_one(&self, data: &[u8]) -> Token {
        let mut hasher = self.build_hasher();
        hasher.write(data);
        hasher.finish()
    }
}

/// A stateful hasher over a stream of partition-key bytes. `finish` may
/// be called at any point without disturbing the state.
pub trait PartitionerHasher {
    fn write(&mut self, pk_part: &[u8]);
    fn finish(&self) -> Token;
}

pub struct Murmur3Partitioner;

impl Partitioner for Murmur3Partitioner {
    type Hasher = Murmur3PartitionerHasher;

    fn build_hasher(&self) -> Self::Hasher {
        Murmur3PartitionerHasher {
            total_len: 0,
            buf: Default::default(),
            h1: Wrapping(0),
            h2: Wrapping(0),
        }
    }
}

pub struct Murmur3PartitionerHasher {
    total_len: usize,
    buf: [u8; Self::BUF_CAPACITY],
    h1: Wrapping<i64>,
    h2: Wrapping<i64>,
}

impl Murmur3PartitionerHasher {
    const BUF_CAPACITY: usize = 16;

    const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
    const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

    fn hash_16_bytes(&mut self, mut k1: Wrapping<i64>, mut k2: Wrapping<i64>) {
        k1 *= Self::C1;
        k1 = Self::rotl64(k1, 31);
        k1 *= Self::C2;
        self.h1 ^= k1;

        self.h1 = Self::rotl64(self.h1, 27);
        self.h1 += self.h2;
        self.h1 = self.h1 * Wrapping(5) + Wrapping(0x52dce729);

        k2 *= Self::C2;
        k2 = Self::rotl64(k2, 33);
        k2 *= Self::C1;
        self.h2 ^= k2;

        self.h2 = Self::rotl64(self.h2, 31);
        self.h2 += self.h1;
        self.h2 = self.h2 * Wrapping(5) + Wrapping(0x38495ab5);
    }

    fn fetch_16_bytes(buf: &mut &[u8]) -> (Wrapping<i64>, Wrapping<i64>) {
        let k1 = Wrapping(buf.get_i64_le());
        let k2 = Wrapping(buf.get_i64_le());
        (k1, k2)
    }

    #[inline]
    fn rotl64(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
        Wrapping((v.0 << n) | (v.0 as u64 >> (64 - n)) as i64)
    }

    #[inline]
    fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xff51afd7ed558ccd_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k *= Wrapping(0xc4ceb9fe1a85ec53_u64 as i64);
        k ^= Wrapping((k.0 as u64 >> 33) as i64);
        k
    }
}

// The hasher consumes input in 16-byte blocks; whatever does not fill a
// block waits in `buf` for the next write, and `finish` folds the
// remainder in without mutating the state.
impl PartitionerHasher for Murmur3PartitionerHasher {
    fn write(&mut self, mut pk_part: &[u8]) {
        let mut buf_len = self.total_len % Self::BUF_CAPACITY;
        self.total_len += pk_part.len();

        // Top up a partially filled buffer first.
        if buf_len > 0 && Self::BUF_CAPACITY - buf_len <= pk_part.len() {
            let to_write = Self::BUF_CAPACITY - buf_len;
            self.buf[buf_len..].copy_from_slice(&pk_part[..to_write]);
            pk_part.advance(to_write);

            let mut buf_ptr = &self.buf[..];
            let (k1, k2) = Self::fetch_16_bytes(&mut buf_ptr);
            self.hash_16_bytes(k1, k2);
            buf_len = 0;
        }

        if buf_len == 0 {
            // Hash full blocks straight from the input.
            while pk_part.len() >= Self::BUF_CAPACITY {
                let (k1, k2) = Self::fetch_16_bytes(&mut pk_part);
                self.hash_16_bytes(k1, k2);
            }
        }

        // Stash the remainder.
        debug_assert!(pk_part.len() < Self::BUF_CAPACITY - buf_len);
        self.buf[buf_len..buf_len + pk_part.len()].copy_from_slice(pk_part);
    }

    fn finish(&self) -> Token {
        let mut h1 = self.h1;
        let mut h2 = self.h2;

        let mut k1 = Wrapping(0_i64);
        let mut k2 = Wrapping(0_i64);

        let buf_len = self.total_len % Self::BUF_CAPACITY;

        if buf_len > 8 {
            for i in (8..buf_len).rev() {
                k2 ^= Wrapping(self.buf[i] as i8 as i64) << ((i - 8) * 8);
            }
            k2 *= Self::C2;
            k2 = Self::rotl64(k2, 33);
            k2 *= Self::C1;
            h2 ^= k2;
        }

        if buf_len > 0 {
            for i in (0..std::cmp::min(8, buf_len)).rev() {
                k1 ^= Wrapping(self.buf[i] as i8 as i64) << (i * 8);
            }
            k1 *= Self::C1;
            k1 = Self::rotl64(k1, 31);
            k1 *= Self::C2;
            h1 ^= k1;
        }

        h1 ^= Wrapping(self.total_len as i64);
        h2 ^= Wrapping(self.total_len as i64);

        h1 += h2;
        h2 += h1;

        h1 = Self::fmix(h1);
        h2 = Self::fmix(h2);

        h1 += h2;

        Token::new(h1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_murmur3_tokens() {
        for (pk, expected) in [
            ("test", -6017608668500074083_i64),
            ("xd", 4507812186440344727),
            ("primary_key", -1632642444691073360),
            ("kremówki", 4354931215268080151),
        ] {
            assert_eq!(
                Murmur3Partitioner.hash_one(pk.as_bytes()).value,
                expected,
                "wrong token for {pk}"
            );
        }
    }

    #[test]
    fn chunked_input_hashes_like_contiguous_input() {
        let input = "Litwo, ojczyzno moja, ty jesteś jak zdrowie".as_bytes();
        let expected = Murmur3Partitioner.hash_one(input);

        for split in 0..input.len() {
            let (head, tail) = input.split_at(split);
            let mut hasher = Murmur3Partitioner.build_hasher();
            hasher.write(head);
            hasher.write(tail);
            assert_eq!(hasher.finish(), expected, "split at {split}");
        }

        // Byte-at-a-time.
        let mut hasher = Murmur3Partitioner.build_hasher();
        for byte in input {
            hasher.write(std::slice::from_ref(byte));
        }
        assert_eq!(hasher.finish(), expected);
    }
}
