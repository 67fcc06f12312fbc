use std::sync::{Mutex, OnceLock};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Max input for [`two_str_hash`]. Inputs longer than this get the stand-in
/// hash, same as any other hashing failure.
const HASH_BUF_MAX: usize = 2048;

/// Stand-in hash for inputs we refuse to hash.
const HASH_STAND_IN: i64 = 999999;

/// MurmurHash2, 64-bit version, by Austin Appleby. Public domain, as per
/// <http://murmurhash.googlepages.com/>.
///
/// Group ids stored in the catalog were computed with this exact function, so
/// it must stay byte-for-byte stable across releases.
pub fn murmur_hash64(key: &[u8], seed: u32) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: u32 = 47;

    let len = key.len();
    let mut h: u64 = (seed as u64) ^ (len as u64).wrapping_mul(M);

    let mut chunks = key.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());

        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, byte) in tail.iter().enumerate() {
            h ^= (*byte as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;

    h
}

/// Stable 63-bit id for a pair of tags, e.g. (album_artist, album).
///
/// The hash input is `lower(a) "==" lower(b)`. The result is masked down to
/// 63 bits because the catalog stores it in a signed integer column.
pub fn two_str_hash(a: Option<&str>, b: Option<&str>) -> i64 {
    let a = a.unwrap_or("");
    let b = b.unwrap_or("");

    if a.len() + b.len() + 2 > HASH_BUF_MAX {
        tracing::error!("Input too large to calculate hash: '{a}=={b}'");
        return HASH_STAND_IN;
    }

    let buf = format!("{}=={}", a.to_lowercase(), b.to_lowercase());

    (murmur_hash64(buf.as_bytes(), 0) >> 1) as i64
}

/// Process wide RNG for queue shuffling, seeded once at startup.
pub fn shuffle_rng() -> &'static Mutex<StdRng> {
    static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();
    RNG.get_or_init(|| Mutex::new(StdRng::from_os_rng()))
}

/// Shuffle a slice with the process wide queue RNG.
pub fn rng_shuffle<T>(values: &mut [T]) {
    let mut rng = shuffle_rng().lock().unwrap();
    values.shuffle(&mut rng);
}

/// Parse an integer out of a dynamically typed column value, zero on failure.
pub fn parse_or_zero<T: std::str::FromStr + Default>(s: &str) -> T {
    s.trim().parse().unwrap_or_default()
}

/// Current unix time in seconds, as stored in `db_timestamp` columns.
pub fn now_secs() -> i64 {
    jiff::Timestamp::now().as_second()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn murmur_is_stable() {
        let h1 = murmur_hash64(b"foo==bar", 0);
        let h2 = murmur_hash64(b"foo==bar", 0);
        assert_eq!(h1, h2);
        assert_ne!(murmur_hash64(b"foo==bar", 0), murmur_hash64(b"foo==baz", 0));
    }

    #[test]
    fn two_str_hash_folds_case() {
        assert_eq!(
            two_str_hash(Some("Daft Punk"), Some("Discovery")),
            two_str_hash(Some("daft punk"), Some("DISCOVERY"))
        );
    }

    #[test]
    fn two_str_hash_is_63_bit() {
        for (a, b) in [("a", "x"), ("Necry Talkie", "北上のススメ"), ("", "")] {
            assert!(two_str_hash(Some(a), Some(b)) >= 0);
        }
    }

    #[test]
    fn two_str_hash_none_same_as_empty() {
        // (artist, None) keys the artist group, (artist, album) the album group
        assert_ne!(
            two_str_hash(Some("a"), None),
            two_str_hash(Some("a"), Some("x"))
        );
        assert_eq!(
            two_str_hash(Some("a"), None),
            two_str_hash(Some("a"), Some(""))
        );
    }

    #[test]
    fn oversized_input_gets_stand_in() {
        let long = "x".repeat(HASH_BUF_MAX);
        assert_eq!(two_str_hash(Some(&long), None), HASH_STAND_IN);
    }

    #[test]
    fn parse_or_zero_handles_junk() {
        assert_eq!(parse_or_zero::<u32>("42"), 42);
        assert_eq!(parse_or_zero::<u32>(" 7 "), 7);
        assert_eq!(parse_or_zero::<u32>("nope"), 0);
        assert_eq!(parse_or_zero::<i64>(""), 0);
    }
}
