use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const STRETCHED_KEY_LEN: usize = 32;
pub const MIN_STRETCH_ITERATIONS: u32 = 2_048;
pub const MAX_STRETCH_ITERATIONS: u32 = 5_000_000;
pub const DEFAULT_STRETCH_ITERATIONS: u32 = 100_000;

const FIELD_KEY_ROUNDS: u32 = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KdfError {
    #[error("stretch iteration count {0} below minimum {MIN_STRETCH_ITERATIONS}")]
    TooFewIterations(u32),
    #[error("stretch iteration count {0} above maximum {MAX_STRETCH_ITERATIONS}")]
    TooManyIterations(u32),
}

/// A passphrase stretched into key material. Never persisted; zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct StretchedKey {
    key: [u8; STRETCHED_KEY_LEN],
}

impl StretchedKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; STRETCHED_KEY_LEN] {
        &self.key
    }
}

/// Hash passphrase and salt once, then re-hash the digest `iterations` times.
/// The loop runs to completion for every input so the cost depends only on
/// the iteration count.
pub fn stretch(passphrase: &str, salt: &[u8], iterations: u32) -> Result<StretchedKey, KdfError> {
    if iterations < MIN_STRETCH_ITERATIONS {
        return Err(KdfError::TooFewIterations(iterations));
    }
    if iterations > MAX_STRETCH_ITERATIONS {
        return Err(KdfError::TooManyIterations(iterations));
    }
    let mut normalized: String = passphrase.nfkc().collect();
    let key = iterated_digest(normalized.as_bytes(), salt, iterations);
    normalized.zeroize();
    Ok(StretchedKey { key })
}

/// The value stored in the file header for passphrase verification.
#[must_use]
pub fn verification_tag(key: &StretchedKey) -> [u8; STRETCHED_KEY_LEN] {
    Sha256::digest(key.as_bytes()).into()
}

/// Recompute the verification tag from a candidate passphrase and compare in
/// constant time. Costs one full stretch regardless of outcome.
pub fn verify(
    passphrase: &str,
    salt: &[u8],
    iterations: u32,
    expected: &[u8; STRETCHED_KEY_LEN],
) -> Result<bool, KdfError> {
    let key = stretch(passphrase, salt, iterations)?;
    let tag = verification_tag(&key);
    Ok(tag.ct_eq(expected).into())
}

/// Same construction with a small fixed round count, used to derive each
/// record's field-cipher key from the session secret and the record salt.
#[must_use]
pub(crate) fn mix_field_key(secret: &[u8], salt: &[u8]) -> [u8; STRETCHED_KEY_LEN] {
    iterated_digest(secret, salt, FIELD_KEY_ROUNDS)
}

fn iterated_digest(input: &[u8], salt: &[u8], rounds: u32) -> [u8; STRETCHED_KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.update(salt);
    let mut digest = hasher.finalize();
    for _ in 0..rounds {
        digest = Sha256::digest(&digest);
    }
    let mut key = [0_u8; STRETCHED_KEY_LEN];
    key.copy_from_slice(&digest);
    digest.as_mut_slice().zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::{
        stretch, verification_tag, verify, KdfError, MIN_STRETCH_ITERATIONS, STRETCHED_KEY_LEN,
    };

    const SALT: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn stretch_is_deterministic() {
        let one = stretch("hunter2", SALT, MIN_STRETCH_ITERATIONS).expect("stretch");
        let two = stretch("hunter2", SALT, MIN_STRETCH_ITERATIONS).expect("stretch");
        assert_eq!(one.as_bytes(), two.as_bytes());
        assert_eq!(one.as_bytes().len(), STRETCHED_KEY_LEN);
    }

    #[test]
    fn stretch_depends_on_every_input() {
        let base = stretch("hunter2", SALT, MIN_STRETCH_ITERATIONS).expect("stretch");
        let other_pass = stretch("hunter3", SALT, MIN_STRETCH_ITERATIONS).expect("stretch");
        let other_salt =
            stretch("hunter2", b"ffffffffffffffffffffffffffffffff", MIN_STRETCH_ITERATIONS)
                .expect("stretch");
        let other_iter = stretch("hunter2", SALT, MIN_STRETCH_ITERATIONS + 1).expect("stretch");
        assert_ne!(base.as_bytes(), other_pass.as_bytes());
        assert_ne!(base.as_bytes(), other_salt.as_bytes());
        assert_ne!(base.as_bytes(), other_iter.as_bytes());
    }

    #[test]
    fn rejects_iteration_counts_outside_bounds() {
        let low = stretch("hunter2", SALT, MIN_STRETCH_ITERATIONS - 1);
        assert!(matches!(low, Err(KdfError::TooFewIterations(_))));
        let high = stretch("hunter2", SALT, u32::MAX);
        assert!(matches!(high, Err(KdfError::TooManyIterations(_))));
    }

    #[test]
    fn normalizes_passphrase_before_hashing() {
        // U+212B ANGSTROM SIGN normalizes to U+00C5 under NFKC.
        let composed = stretch("\u{212b}", SALT, MIN_STRETCH_ITERATIONS).expect("stretch");
        let canonical = stretch("\u{c5}", SALT, MIN_STRETCH_ITERATIONS).expect("stretch");
        assert_eq!(composed.as_bytes(), canonical.as_bytes());
    }

    #[test]
    fn verify_accepts_matching_passphrase_only() {
        let key = stretch("correct horse", SALT, MIN_STRETCH_ITERATIONS).expect("stretch");
        let tag = verification_tag(&key);
        assert!(verify("correct horse", SALT, MIN_STRETCH_ITERATIONS, &tag).expect("verify"));
        assert!(!verify("correct  horse", SALT, MIN_STRETCH_ITERATIONS, &tag).expect("verify"));
        assert!(!verify("correct horse", SALT, MIN_STRETCH_ITERATIONS + 1, &tag).expect("verify"));
    }

    #[test]
    #[ignore = "runs ten thousand full stretches; use --ignored for the exhaustive sweep"]
    fn rejects_many_random_negative_passphrases() {
        let key = stretch("the one true passphrase", SALT, MIN_STRETCH_ITERATIONS)
            .expect("stretch");
        let tag = verification_tag(&key);
        for index in 0_u32..10_000 {
            let candidate = format!("candidate-{index}");
            assert!(
                !verify(&candidate, SALT, MIN_STRETCH_ITERATIONS, &tag).expect("verify"),
                "false accept for {candidate}"
            );
        }
    }
}
