use rand::{rngs::OsRng, Rng};

pub const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Device-flow user codes: no vowels, so generated codes never spell words.
pub const USER_CODE: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ0123456789";

/// A string of `length` characters drawn uniformly from `charset` using the
/// operating system CSPRNG.
pub fn crypto_random(length: usize, charset: &[u8]) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

pub fn alphanumeric(length: usize) -> String {
    crypto_random(length, ALPHANUMERIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_length_and_charset() {
        let value = crypto_random(38, ALPHANUMERIC);
        assert_eq!(value.len(), 38);
        assert!(value.bytes().all(|b| ALPHANUMERIC.contains(&b)));

        let code = crypto_random(8, USER_CODE);
        assert!(code.bytes().all(|b| USER_CODE.contains(&b)));
    }

    #[test]
    fn values_differ() {
        assert_ne!(alphanumeric(24), alphanumeric(24));
    }
}
