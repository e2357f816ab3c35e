//! Content digests for buffers and files

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{KgenError, KgenResult};

const FILE_BUF_SIZE: usize = 64 * 1024;

/// Digest algorithms recognized in attested records.
///
/// The algorithm named by a record is the one used to recompute it; an
/// unknown name is a hard error, never a silent upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "sha-256")]
    Sha256,
    #[serde(rename = "blake3")]
    Blake3,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha-256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    pub fn parse(name: &str) -> KgenResult<Self> {
        match name {
            "sha-256" | "sha256" => Ok(HashAlgorithm::Sha256),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(KgenError::Crypto(format!("unknown hash algorithm: {}", other))),
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        32
    }
}

/// Hash a byte buffer, returning lowercase hex.
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
        HashAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(data);
            hex::encode(hasher.finalize().as_bytes())
        }
    }
}

/// Hash raw digest material without re-encoding; used by the Merkle tree.
pub fn hash_concat(algorithm: HashAlgorithm, left: &[u8], right: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(left);
            hasher.update(right);
            hasher.finalize().to_vec()
        }
        HashAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(left);
            hasher.update(right);
            hasher.finalize().as_bytes().to_vec()
        }
    }
}

/// Hash a file with streaming reads and constant memory.
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> KgenResult<String> {
    let mut file = File::open(path).map_err(|e| KgenError::ArtifactUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut buf = vec![0u8; FILE_BUF_SIZE];

    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = read_retrying(&mut file, &mut buf, path)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        HashAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let n = read_retrying(&mut file, &mut buf, path)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize().as_bytes()))
        }
    }
}

// One retry on interrupted reads; anything else surfaces.
fn read_retrying(file: &mut File, buf: &mut [u8], path: &Path) -> KgenResult<usize> {
    match file.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
            file.read(buf).map_err(|e| KgenError::ArtifactUnreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        }
        Err(e) => Err(KgenError::ArtifactUnreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Timing-safe equality of two hex digests.
///
/// Case is normalized before comparison; a length mismatch is an immediate
/// `false` since digest lengths are public.
pub fn constant_time_hex_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hash_bytes(HashAlgorithm::Sha256, b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_and_buffer_agree() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!\n").unwrap();
        file.flush().unwrap();

        let from_file = hash_file(HashAlgorithm::Sha256, file.path()).unwrap();
        let from_bytes = hash_bytes(HashAlgorithm::Sha256, b"Hello, World!\n");
        assert_eq!(from_file, from_bytes);
    }

    #[test]
    fn test_blake3_differs_from_sha256() {
        let data = b"same input";
        assert_ne!(
            hash_bytes(HashAlgorithm::Sha256, data),
            hash_bytes(HashAlgorithm::Blake3, data)
        );
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        assert!(HashAlgorithm::parse("md5").is_err());
        assert!(HashAlgorithm::parse("sha-256").is_ok());
    }

    #[test]
    fn test_constant_time_compare() {
        let h = hash_bytes(HashAlgorithm::Sha256, b"x");
        assert!(constant_time_hex_eq(&h, &h.to_uppercase()));
        let other = hash_bytes(HashAlgorithm::Sha256, b"y");
        assert!(!constant_time_hex_eq(&h, &other));
        assert!(!constant_time_hex_eq(&h, &h[..10]));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let err = hash_file(HashAlgorithm::Sha256, Path::new("/nonexistent/file")).unwrap_err();
        assert!(matches!(err, KgenError::ArtifactUnreadable { .. }));
    }
}
