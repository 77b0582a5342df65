use super::traits::{KeyPair, KeyPairGenerator};
use anyhow::{Context, Result};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;

const DEFAULT_BITS: usize = 2048;

/// RSA key pairs for RS256 access tokens. The private key comes out as PKCS#1
/// ("RSA PRIVATE KEY"), the public key as SPKI ("PUBLIC KEY"); both are what
/// jsonwebtoken's `from_rsa_pem` reads.
#[derive(Debug, Clone, Copy)]
pub struct RsaKeyPairGenerator {
    bits: usize,
}

impl RsaKeyPairGenerator {
    pub fn new() -> Self {
        Self { bits: DEFAULT_BITS }
    }

    #[cfg(test)]
    pub fn with_bits(bits: usize) -> Self {
        Self { bits }
    }
}

impl Default for RsaKeyPairGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyPairGenerator for RsaKeyPairGenerator {
    fn generate(&self) -> Result<KeyPair> {
        let mut rng = OsRng;
        let private_key =
            RsaPrivateKey::new(&mut rng, self.bits).context("failed to generate RSA key")?;

        let private_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .context("failed to encode private key")?
            .to_string();
        let public_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .context("failed to encode public key")?;

        Ok(KeyPair {
            private_pem,
            public_pem,
        })
    }
}

/// Hands out the checked-in client A key pair; RSA generation is too slow for
/// most tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureKeyPairs;

#[cfg(test)]
impl KeyPairGenerator for FixtureKeyPairs {
    fn generate(&self) -> Result<KeyPair> {
        use super::token::fixtures::{CLIENT_A_PRIVATE, CLIENT_A_PUBLIC};
        Ok(KeyPair {
            private_pem: CLIENT_A_PRIVATE.to_string(),
            public_pem: CLIENT_A_PUBLIC.to_string(),
        })
    }
}
