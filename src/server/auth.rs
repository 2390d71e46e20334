//! Listener credentials

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256, Sha512};

use crate::error::BrokerError;

/// A password a listener accepts
///
/// Parsed from `plain:<password>`, `sha256:<hex>`, `sha512:<hex>`,
/// `blake3:<hex>`, or a bare password.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Plain(String),
    Sha256(Vec<u8>),
    Sha512(Vec<u8>),
    Blake3(Vec<u8>),
}

impl Credential {
    pub fn matches(&self, password: &str) -> bool {
        let password = password.as_bytes();
        match self {
            Self::Plain(expected) => constant_time_eq(expected.as_bytes(), password),
            Self::Sha256(digest) => constant_time_eq(digest, &Sha256::digest(password)),
            Self::Sha512(digest) => constant_time_eq(digest, &Sha512::digest(password)),
            Self::Blake3(digest) => constant_time_eq(digest, blake3::hash(password).as_bytes()),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            Self::Sha256(_) => "sha256",
            Self::Sha512(_) => "sha512",
            Self::Blake3(_) => "blake3",
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn digest(scheme: &str, hex_digest: &str, len: usize) -> Result<Vec<u8>, BrokerError> {
    let bytes = hex::decode(hex_digest.trim())
        .map_err(|err| BrokerError::Config(format!("{scheme} credential: {err}")))?;
    if bytes.len() != len {
        return Err(BrokerError::Config(format!(
            "{scheme} credential must be {} hex digits",
            len * 2
        )));
    }
    Ok(bytes)
}

impl FromStr for Credential {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("plain", password)) => Ok(Self::Plain(password.to_string())),
            Some(("sha256", hex)) => digest("sha256", hex, 32).map(Self::Sha256),
            Some(("sha512", hex)) => digest("sha512", hex, 64).map(Self::Sha512),
            Some(("blake3", hex)) => digest("blake3", hex, 32).map(Self::Blake3),
            _ => Ok(Self::Plain(s.to_string())),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({}, ***)", self.scheme())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_and_digests() {
        let plain: Credential = "secret".parse().unwrap();
        assert!(plain.matches("secret"));
        assert!(!plain.matches("secret "));

        let sha = format!("sha256:{}", hex::encode(Sha256::digest(b"secret")));
        let sha: Credential = sha.parse().unwrap();
        assert_eq!(sha.scheme(), "sha256");
        assert!(sha.matches("secret"));
        assert!(!sha.matches("other"));

        let sha512 = format!("sha512:{}", hex::encode(Sha512::digest(b"pw")));
        assert!(sha512.parse::<Credential>().unwrap().matches("pw"));

        let b3 = format!("blake3:{}", blake3::hash(b"pw").to_hex());
        assert!(b3.parse::<Credential>().unwrap().matches("pw"));
    }

    #[test]
    fn test_invalid_digest() {
        assert!(matches!(
            "sha256:xyz".parse::<Credential>(),
            Err(BrokerError::Config(_))
        ));
        assert!(matches!(
            "sha256:abcd".parse::<Credential>(),
            Err(BrokerError::Config(_))
        ));
        // explicit plain keeps colons
        let cred: Credential = "plain:sha256:x".parse().unwrap();
        assert!(cred.matches("sha256:x"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let cred = Credential::Plain("hunter2".into());
        assert!(!format!("{cred:?}").contains("hunter2"));
    }
}
