//! Content digests.
//!
//! Every stored object is addressed by `sha256:<hex>` of its bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use stowage_common::{StowageError, StowageResult};

const PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

/// A validated `sha256:<64 lowercase hex>` digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Hash `data` and return its digest.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = DigestHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Parse and validate a digest string.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::InvalidDigest`] for anything other than a
    /// sha256 digest with 64 lowercase hex characters.
    pub fn parse(value: &str) -> StowageResult<Self> {
        let invalid = || StowageError::InvalidDigest {
            value: value.to_string(),
        };

        let hex = value.strip_prefix(PREFIX).ok_or_else(invalid)?;
        if hex.len() != HEX_LEN
            || !hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid());
        }

        Ok(Self(value.to_string()))
    }

    /// Algorithm part (always `sha256`).
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.0[..PREFIX.len() - 1]
    }

    /// Hex-encoded hash part.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.0[PREFIX.len()..]
    }

    /// Full `algorithm:hex` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fail unless `data` hashes to this digest.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::DigestMismatch`] on a mismatch.
    pub fn verify(&self, data: &[u8]) -> StowageResult<()> {
        let actual = Self::of(data);
        if &actual == self {
            Ok(())
        } else {
            Err(StowageError::DigestMismatch {
                expected: self.0.clone(),
                actual: actual.0,
            })
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = StowageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Incremental sha256 hasher that also counts bytes.
#[derive(Clone, Default)]
pub struct DigestHasher {
    hasher: Sha256,
    len: u64,
}

impl fmt::Debug for DigestHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestHasher").field("len", &self.len).finish_non_exhaustive()
    }
}

impl DigestHasher {
    /// Start a new hash.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been hashed yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish and return the digest.
    #[must_use]
    pub fn finalize(self) -> Digest {
        Digest(format!("{PREFIX}{}", hex::encode(self.hasher.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn digest_of_known_input() {
        let digest = Digest::of(b"hello world");
        assert_eq!(digest.as_str(), HELLO);
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.hex().len(), 64);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Digest::parse(HELLO).is_ok());
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::parse("md5:b94d27b9934d3e08a52e52d7da7dabfa").is_err());
        assert!(Digest::parse(&HELLO.to_uppercase()).is_err());
        assert!(Digest::parse(HELLO.trim_start_matches("sha256:")).is_err());
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = DigestHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.len(), 11);
        assert_eq!(hasher.finalize(), Digest::of(b"hello world"));
    }

    #[test]
    fn verify_reports_mismatch() {
        let digest = Digest::parse(HELLO).unwrap();
        assert!(digest.verify(b"hello world").is_ok());
        assert!(matches!(
            digest.verify(b"goodbye"),
            Err(StowageError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn serde_round_trip_validates() {
        let json = format!("\"{HELLO}\"");
        let digest: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&digest).unwrap(), json);
        assert!(serde_json::from_str::<Digest>("\"sha256:nope\"").is_err());
    }

    proptest::proptest! {
        #[test]
        fn digest_is_sha256_hex(
            data in proptest::collection::vec(proptest::num::u8::ANY, 0..4096)
        ) {
            let digest = Digest::of(&data);
            let expected = hex::encode(<Sha256 as sha2::Digest>::digest(&data));
            proptest::prop_assert_eq!(digest.hex(), expected);
            proptest::prop_assert_eq!(Digest::parse(digest.as_str()).unwrap(), digest);
        }
    }
}
