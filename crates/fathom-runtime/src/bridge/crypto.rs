//! Cryptographic primitives behind the `@fathom/crypto` shim.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

/// Digest `data` with `algorithm`, encoded as `hex` or `base64`.
pub fn hash(algorithm: &str, data: &str, encoding: &str) -> anyhow::Result<String> {
    let digest = match algorithm.to_ascii_lowercase().replace('-', "").as_str() {
        "sha224" => Sha224::digest(data.as_bytes()).to_vec(),
        "sha256" => Sha256::digest(data.as_bytes()).to_vec(),
        "sha384" => Sha384::digest(data.as_bytes()).to_vec(),
        "sha512" => Sha512::digest(data.as_bytes()).to_vec(),
        other => anyhow::bail!("unsupported hash algorithm '{other}'"),
    };
    match encoding {
        "hex" => Ok(hex::encode(digest)),
        "base64" => Ok(STANDARD.encode(digest)),
        other => anyhow::bail!("unsupported encoding '{other}'"),
    }
}

pub fn random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `len` random bytes, refusing requests above `max`.
pub fn random_bytes(len: usize, max: usize) -> anyhow::Result<Vec<u8>> {
    if len > max {
        anyhow::bail!("randomBytes({len}) exceeds the {max} byte limit");
    }
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    Ok(bytes)
}

/// Uniform integer in `[min, max)`.
pub fn random_int(min: i64, max: i64) -> anyhow::Result<i64> {
    if min >= max {
        anyhow::bail!("randomInt requires min < max, got [{min}, {max})");
    }
    Ok(rand::rng().random_range(min..max))
}
