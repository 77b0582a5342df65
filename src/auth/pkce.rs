use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// How the client derived its code challenge from the verifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[default]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

/// PKCE verification (RFC 7636). Pure, and the final comparison is constant time.
pub fn verify_pkce(
    code_challenge: &str,
    code_verifier: &str,
    method: CodeChallengeMethod,
) -> bool {
    let derived = match method {
        CodeChallengeMethod::S256 => s256_challenge(code_verifier),
        // only honoured when the client asked for it at login
        CodeChallengeMethod::Plain => code_verifier.to_string(),
    };
    derived.as_bytes().ct_eq(code_challenge.as_bytes()).into()
}

pub fn s256_challenge(code_verifier: &str) -> String {
    let hash = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
