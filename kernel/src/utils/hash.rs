//! Non-cryptographic hashing (xxHash64 and MurmurHash3 x64/128)
//!
//! xxHash64 feeds the bloomfilter double-hashing scheme and the TOSDB cache
//! keys; MurmurHash3's low 64 bits key primary-key indexes.

const XXH_PRIME64_1: u64 = 0x9E37_79B1_85EB_CA87;
const XXH_PRIME64_2: u64 = 0xC2B2_AE3D_27D4_EB4F;
const XXH_PRIME64_3: u64 = 0x1656_67B1_9E37_79F9;
const XXH_PRIME64_4: u64 = 0x85EB_CA77_C2B2_AE63;
const XXH_PRIME64_5: u64 = 0x27D4_EB2F_1656_67C5;

#[inline]
fn read_u64(data: &[u8]) -> u64 {
    u64::from_le_bytes(data[..8].try_into().unwrap())
}

#[inline]
fn read_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes(data[..4].try_into().unwrap())
}

#[inline]
fn xxh_round(acc: u64, input: u64) -> u64 {
    acc.wrapping_add(input.wrapping_mul(XXH_PRIME64_2))
        .rotate_left(31)
        .wrapping_mul(XXH_PRIME64_1)
}

#[inline]
fn xxh_merge_round(acc: u64, val: u64) -> u64 {
    (acc ^ xxh_round(0, val))
        .wrapping_mul(XXH_PRIME64_1)
        .wrapping_add(XXH_PRIME64_4)
}

/// xxHash64 with an explicit seed.
pub fn xxhash64_with_seed(data: &[u8], seed: u64) -> u64 {
    let len = data.len() as u64;
    let mut chunks = data.chunks_exact(32);

    let mut h = if data.len() >= 32 {
        let mut v1 = seed
            .wrapping_add(XXH_PRIME64_1)
            .wrapping_add(XXH_PRIME64_2);
        let mut v2 = seed.wrapping_add(XXH_PRIME64_2);
        let mut v3 = seed;
        let mut v4 = seed.wrapping_sub(XXH_PRIME64_1);

        for chunk in &mut chunks {
            v1 = xxh_round(v1, read_u64(&chunk[0..8]));
            v2 = xxh_round(v2, read_u64(&chunk[8..16]));
            v3 = xxh_round(v3, read_u64(&chunk[16..24]));
            v4 = xxh_round(v4, read_u64(&chunk[24..32]));
        }

        let mut acc = v1
            .rotate_left(1)
            .wrapping_add(v2.rotate_left(7))
            .wrapping_add(v3.rotate_left(12))
            .wrapping_add(v4.rotate_left(18));
        acc = xxh_merge_round(acc, v1);
        acc = xxh_merge_round(acc, v2);
        acc = xxh_merge_round(acc, v3);
        xxh_merge_round(acc, v4)
    } else {
        seed.wrapping_add(XXH_PRIME64_5)
    };

    h = h.wrapping_add(len);

    let mut rem = chunks.remainder();
    while rem.len() >= 8 {
        h ^= xxh_round(0, read_u64(rem));
        h = h
            .rotate_left(27)
            .wrapping_mul(XXH_PRIME64_1)
            .wrapping_add(XXH_PRIME64_4);
        rem = &rem[8..];
    }
    if rem.len() >= 4 {
        h ^= (read_u32(rem) as u64).wrapping_mul(XXH_PRIME64_1);
        h = h
            .rotate_left(23)
            .wrapping_mul(XXH_PRIME64_2)
            .wrapping_add(XXH_PRIME64_3);
        rem = &rem[4..];
    }
    for &b in rem {
        h ^= (b as u64).wrapping_mul(XXH_PRIME64_5);
        h = h.rotate_left(11).wrapping_mul(XXH_PRIME64_1);
    }

    h ^= h >> 33;
    h = h.wrapping_mul(XXH_PRIME64_2);
    h ^= h >> 29;
    h = h.wrapping_mul(XXH_PRIME64_3);
    h ^= h >> 32;
    h
}

/// xxHash64 with seed 0.
pub fn xxhash64(data: &[u8]) -> u64 {
    xxhash64_with_seed(data, 0)
}

const MUR_C1: u64 = 0x87C3_7B91_1142_53D5;
const MUR_C2: u64 = 0x4CF5_AD43_2745_937F;

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    k ^= k >> 33;
    k = k.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    k ^= k >> 33;
    k
}

/// MurmurHash3 x64/128. Returns the two 64-bit halves; callers that need a
/// single key take the first.
pub fn murmur3_128(data: &[u8], seed: u64) -> (u64, u64) {
    let len = data.len();
    let mut h1 = seed;
    let mut h2 = seed;

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        let mut k1 = read_u64(&block[0..8]);
        let mut k2 = read_u64(&block[8..16]);

        k1 = k1.wrapping_mul(MUR_C1).rotate_left(31).wrapping_mul(MUR_C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52DC_E729);

        k2 = k2.wrapping_mul(MUR_C2).rotate_left(33).wrapping_mul(MUR_C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5AB5);
    }

    let tail = blocks.remainder();
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for (i, &b) in tail.iter().enumerate() {
        if i < 8 {
            k1 |= (b as u64) << (8 * i);
        } else {
            k2 |= (b as u64) << (8 * (i - 8));
        }
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(MUR_C2).rotate_left(33).wrapping_mul(MUR_C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(MUR_C1).rotate_left(31).wrapping_mul(MUR_C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

/// The 64-bit key TOSDB derives from a primary-key byte string.
pub fn primary_key_hash(data: &[u8]) -> u64 {
    murmur3_128(data, 0).0
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_xxhash64_reference_vectors() {
        assert_eq!(xxhash64(b""), 0xEF46_DB37_51D8_E999);
        assert_eq!(xxhash64(b"abc"), 0x44BC_2CF5_AD77_0999);
    }

    #[test]
    fn test_xxhash64_seed_changes_hash() {
        let data = b"turnstone";
        assert_ne!(xxhash64_with_seed(data, 1), xxhash64_with_seed(data, 2));
    }

    #[test]
    fn test_xxhash64_long_input_stable() {
        let data: alloc::vec::Vec<u8> = (0..256u32).map(|i| (i * 7) as u8).collect();
        let a = xxhash64(&data);
        let b = xxhash64(&data);
        assert_eq!(a, b);
        assert_ne!(a, xxhash64(&data[..255]));
    }

    #[test]
    fn test_murmur3_empty_is_zero() {
        assert_eq!(murmur3_128(b"", 0), (0, 0));
    }

    #[test]
    fn test_murmur3_distinct_keys() {
        let a = primary_key_hash(b"k1");
        let b = primary_key_hash(b"k2");
        assert_ne!(a, b);
        assert_eq!(a, primary_key_hash(b"k1"));
    }
}
