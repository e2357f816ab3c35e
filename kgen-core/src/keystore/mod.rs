//! Keypair lifecycle, signing, and signature verification

pub mod trust;

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use aes_gcm::aead::{generic_array::GenericArray, Aead};
use aes_gcm::{Aes256Gcm, KeyInit};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey as EdSigningKey, VerifyingKey as EdVerifyingKey};
use hmac::Hmac;
use lru::LruCache;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::pss::{
    BlindedSigningKey as PssSigningKey, Signature as PssSignature,
    VerifyingKey as PssVerifyingKey,
};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{CoreConfig, DeterministicClock};
use crate::error::{KgenError, KgenResult};
use crate::hashing::{hash_bytes, HashAlgorithm};
use trust::{TrustStatus, TrustStore};

/// Default private key file inside the keys directory.
pub const PRIVATE_KEY_FILE: &str = "kgen.key";
/// Default public key file inside the keys directory.
pub const PUBLIC_KEY_FILE: &str = "kgen.pub";

const WRAP_KDF: &str = "pbkdf2-hmac-sha256";
const WRAP_ITERATIONS: u32 = 310_000;
const SIGNATURE_CACHE_SIZE: usize = 1024;
const RSA_KEY_BITS: usize = 2048;

/// Signature suites. Chosen at keypair creation and recorded with every
/// signature; there is no runtime negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SignatureSuite {
    #[default]
    #[serde(rename = "ed25519")]
    Ed25519,
    #[serde(rename = "rsa-pss-sha256")]
    RsaPssSha256,
}

impl SignatureSuite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureSuite::Ed25519 => "ed25519",
            SignatureSuite::RsaPssSha256 => "rsa-pss-sha256",
        }
    }

    pub fn parse(name: &str) -> KgenResult<Self> {
        match name {
            "ed25519" => Ok(SignatureSuite::Ed25519),
            "rsa-pss-sha256" => Ok(SignatureSuite::RsaPssSha256),
            other => Err(KgenError::Config(format!("unsupported suite: {}", other))),
        }
    }
}

/// A signature over canonical bytes, as embedded in records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    pub suite: SignatureSuite,
    /// Hex-encoded signature bytes.
    pub value: String,
    pub key_fingerprint: String,
    pub signed_at: DateTime<Utc>,
}

/// Private key material; scrubbed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
enum SecretMaterial {
    Ed25519([u8; 32]),
    /// PKCS#8 DER.
    Rsa(Vec<u8>),
}

/// A loaded keypair. The secret never leaves this handle except wrapped
/// for disk.
pub struct KeypairHandle {
    pub suite: SignatureSuite,
    pub fingerprint: String,
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    secret: SecretMaterial,
}

impl std::fmt::Debug for KeypairHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypairHandle")
            .field("suite", &self.suite)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Short identifier of a public key: leading 32 hex chars of its SHA-256.
pub fn fingerprint(public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hex::encode(hasher.finalize())[..32].to_string()
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeypair {
    suite: SignatureSuite,
    fingerprint: String,
    public_key: String,
    private_key: StoredPrivateKey,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum StoredPrivateKey {
    #[serde(rename = "plain")]
    Plain { value: String },
    #[serde(rename = "wrapped")]
    Wrapped {
        kdf: String,
        iterations: u32,
        salt: String,
        nonce: String,
        ciphertext: String,
    },
}

/// Outcome of a key rotation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationOutcome {
    pub old_fingerprint: String,
    pub new_fingerprint: String,
    pub backup_paths: Vec<PathBuf>,
}

type CacheKey = (String, SignatureSuite, String);

/// Key material owner: generation, wrapped storage, signing, verification,
/// rotation, and the trust store.
///
/// Mutating operations serialize through an internal lock; `sign` and
/// `verify` touch only the handle and the fine-grained cache lock.
pub struct KeyStore {
    keys_dir: PathBuf,
    trust: RwLock<TrustStore>,
    cache: Mutex<LruCache<CacheKey, bool>>,
    mutate: Mutex<()>,
    max_backups: usize,
    allow_insecure_key_perms: bool,
}

impl KeyStore {
    pub fn open(config: &CoreConfig) -> KgenResult<Self> {
        std::fs::create_dir_all(&config.keys_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config.keys_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        let trust = TrustStore::open(&config.trust_store_path, config.rotation_grace_secs)?;
        Ok(Self {
            keys_dir: config.keys_dir.clone(),
            trust: RwLock::new(trust),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SIGNATURE_CACHE_SIZE).expect("nonzero cache size"),
            )),
            mutate: Mutex::new(()),
            max_backups: config.max_key_backups,
            allow_insecure_key_perms: config.allow_insecure_key_perms,
        })
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.keys_dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.keys_dir.join(PUBLIC_KEY_FILE)
    }

    /// Generate a fresh keypair from the system CSPRNG.
    pub fn generate_keypair(
        &self,
        suite: SignatureSuite,
        clock: &DeterministicClock,
    ) -> KgenResult<KeypairHandle> {
        match suite {
            SignatureSuite::Ed25519 => {
                let signing = EdSigningKey::generate(&mut rand::rngs::OsRng);
                let public_key = signing.verifying_key().to_bytes().to_vec();
                Ok(KeypairHandle {
                    suite,
                    fingerprint: fingerprint(&public_key),
                    public_key,
                    created_at: clock.now(),
                    secret: SecretMaterial::Ed25519(signing.to_bytes()),
                })
            }
            SignatureSuite::RsaPssSha256 => {
                let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
                    .map_err(|e| KgenError::Crypto(format!("rsa key generation failed: {}", e)))?;
                let public_key = private
                    .to_public_key()
                    .to_public_key_der()
                    .map_err(|e| KgenError::Crypto(format!("rsa public key encoding: {}", e)))?
                    .into_vec();
                let der = private
                    .to_pkcs8_der()
                    .map_err(|e| KgenError::Crypto(format!("rsa private key encoding: {}", e)))?;
                Ok(KeypairHandle {
                    suite,
                    fingerprint: fingerprint(&public_key),
                    public_key,
                    created_at: clock.now(),
                    secret: SecretMaterial::Rsa(der.as_bytes().to_vec()),
                })
            }
        }
    }

    /// Persist a keypair under the keys directory and register it as the
    /// active key in the trust store.
    pub fn save_keypair(
        &self,
        handle: &KeypairHandle,
        passphrase: Option<&str>,
    ) -> KgenResult<(PathBuf, PathBuf)> {
        let _guard = self.mutate.lock().expect("keystore lock poisoned");
        self.write_keypair_files(handle, passphrase)?;

        let mut trust = self.trust.write().expect("trust lock poisoned");
        trust.insert_active(
            handle.fingerprint.clone(),
            handle.suite,
            hex::encode(&handle.public_key),
            handle.created_at,
        );
        trust.save()?;
        info!(fingerprint = %handle.fingerprint, suite = handle.suite.as_str(), "keypair saved");
        Ok((self.private_key_path(), self.public_key_path()))
    }

    fn write_keypair_files(
        &self,
        handle: &KeypairHandle,
        passphrase: Option<&str>,
    ) -> KgenResult<()> {
        let secret_bytes = match &handle.secret {
            SecretMaterial::Ed25519(bytes) => bytes.to_vec(),
            SecretMaterial::Rsa(der) => der.clone(),
        };
        let private_key = match passphrase {
            Some(pass) => wrap_secret(&secret_bytes, pass)?,
            None => StoredPrivateKey::Plain { value: hex::encode(&secret_bytes) },
        };
        let stored = StoredKeypair {
            suite: handle.suite,
            fingerprint: handle.fingerprint.clone(),
            public_key: hex::encode(&handle.public_key),
            private_key,
            created_at: handle.created_at,
        };

        write_atomic(
            &self.private_key_path(),
            &serde_json::to_vec_pretty(&stored)
                .map_err(|e| KgenError::Config(e.to_string()))?,
            0o600,
        )?;
        write_atomic(&self.public_key_path(), hex::encode(&handle.public_key).as_bytes(), 0o644)?;
        Ok(())
    }

    /// Load the keypair from the keys directory.
    pub fn load_keypair(&self, passphrase: Option<&str>) -> KgenResult<KeypairHandle> {
        self.load_keypair_from(&self.private_key_path(), passphrase)
    }

    /// Load a keypair from an explicit path, unwrapping with the passphrase
    /// when the stored key is wrapped.
    pub fn load_keypair_from(
        &self,
        path: &Path,
        passphrase: Option<&str>,
    ) -> KgenResult<KeypairHandle> {
        self.check_private_key_perms(path)?;
        let raw = std::fs::read(path).map_err(|e| {
            KgenError::Config(format!("cannot read private key {}: {}", path.display(), e))
        })?;
        let stored: StoredKeypair = serde_json::from_slice(&raw)
            .map_err(|e| KgenError::Config(format!("private key file malformed: {}", e)))?;

        let mut secret_bytes = match &stored.private_key {
            StoredPrivateKey::Plain { value } => hex::decode(value)
                .map_err(|e| KgenError::Config(format!("private key is not hex: {}", e)))?,
            StoredPrivateKey::Wrapped { kdf, iterations, salt, nonce, ciphertext } => {
                let pass = passphrase.ok_or_else(|| {
                    KgenError::Config("private key is wrapped but no passphrase given".to_string())
                })?;
                unwrap_secret(kdf, *iterations, salt, nonce, ciphertext, pass)?
            }
        };

        let public_key = hex::decode(&stored.public_key)
            .map_err(|e| KgenError::Config(format!("public key is not hex: {}", e)))?;
        let secret = match stored.suite {
            SignatureSuite::Ed25519 => {
                let len = secret_bytes.len();
                if len != 32 {
                    secret_bytes.zeroize();
                    return Err(KgenError::Crypto(format!(
                        "ed25519 private key must be 32 bytes, got {}",
                        len
                    )));
                }
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&secret_bytes);
                secret_bytes.zeroize();
                SecretMaterial::Ed25519(bytes)
            }
            SignatureSuite::RsaPssSha256 => {
                // Refuse moduli below the suite minimum.
                let private = RsaPrivateKey::from_pkcs8_der(&secret_bytes)
                    .map_err(|e| KgenError::Crypto(format!("rsa private key invalid: {}", e)))?;
                if private.size() * 8 < RSA_KEY_BITS {
                    secret_bytes.zeroize();
                    return Err(KgenError::Crypto(format!(
                        "rsa modulus below {} bits",
                        RSA_KEY_BITS
                    )));
                }
                SecretMaterial::Rsa(secret_bytes)
            }
        };

        Ok(KeypairHandle {
            suite: stored.suite,
            fingerprint: stored.fingerprint,
            public_key,
            created_at: stored.created_at,
            secret,
        })
    }

    fn check_private_key_perms(&self, path: &Path) -> KgenResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(path) {
                let mode = meta.permissions().mode();
                if mode & 0o077 != 0 && !self.allow_insecure_key_perms {
                    return Err(KgenError::Config(format!(
                        "private key {} is group/world readable (mode {:o}); fix permissions or allow the override",
                        path.display(),
                        mode & 0o777
                    )));
                }
            }
        }
        let _ = path;
        Ok(())
    }

    /// Sign canonical bytes. The input must be the canonical form itself,
    /// never a digest computed elsewhere.
    pub fn sign(
        &self,
        handle: &KeypairHandle,
        canonical: &[u8],
        clock: &DeterministicClock,
    ) -> KgenResult<SignatureRecord> {
        let value = match &handle.secret {
            SecretMaterial::Ed25519(bytes) => {
                let signing = EdSigningKey::from_bytes(bytes);
                hex::encode(signing.sign(canonical).to_bytes())
            }
            SecretMaterial::Rsa(der) => {
                let private = RsaPrivateKey::from_pkcs8_der(der)
                    .map_err(|e| KgenError::Crypto(format!("rsa private key invalid: {}", e)))?;
                let signing = PssSigningKey::<Sha256>::new(private);
                let sig = signing.sign_with_rng(&mut rand::rngs::OsRng, canonical);
                hex::encode(sig.to_vec())
            }
        };
        Ok(SignatureRecord {
            suite: handle.suite,
            value,
            key_fingerprint: handle.fingerprint.clone(),
            signed_at: clock.now(),
        })
    }

    /// Verify a signature against an explicit public key.
    ///
    /// Returns `false` on any parse failure; never panics on malformed
    /// signature bytes.
    pub fn verify_with_key(
        suite: SignatureSuite,
        public_key: &[u8],
        canonical: &[u8],
        signature: &[u8],
    ) -> bool {
        match suite {
            SignatureSuite::Ed25519 => {
                let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
                    return false;
                };
                let Ok(verifying) = EdVerifyingKey::from_bytes(&key_bytes) else {
                    return false;
                };
                let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
                    return false;
                };
                verifying.verify(canonical, &sig).is_ok()
            }
            SignatureSuite::RsaPssSha256 => {
                let Ok(public) = RsaPublicKey::from_public_key_der(public_key) else {
                    return false;
                };
                let Ok(sig) = PssSignature::try_from(signature) else {
                    return false;
                };
                PssVerifyingKey::<Sha256>::new(public).verify(canonical, &sig).is_ok()
            }
        }
    }

    /// Verify a signature record against the trust store, going through the
    /// LRU cache. The cache is a pure speedup and never changes outcomes.
    pub fn verify_record(&self, canonical: &[u8], signature: &SignatureRecord) -> bool {
        let projection_digest = hash_bytes(HashAlgorithm::Sha256, canonical);
        let key = (
            projection_digest,
            signature.suite,
            format!("{}:{}", signature.key_fingerprint, signature.value),
        );
        if let Some(hit) = self.cache.lock().expect("cache lock poisoned").get(&key) {
            return *hit;
        }

        let public_key = {
            let trust = self.trust.read().expect("trust lock poisoned");
            match trust.public_key_bytes(&signature.key_fingerprint) {
                Ok(bytes) => bytes,
                Err(_) => return false,
            }
        };
        let sig_bytes = match hex::decode(&signature.value) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let valid = Self::verify_with_key(signature.suite, &public_key, canonical, &sig_bytes);
        self.cache.lock().expect("cache lock poisoned").put(key, valid);
        valid
    }

    /// Trust decision for a signature, per the store's lifecycle rules.
    pub fn trust_status(&self, fingerprint: &str, signed_at: DateTime<Utc>) -> TrustStatus {
        self.trust.read().expect("trust lock poisoned").evaluate(fingerprint, signed_at)
    }

    /// Register an externally supplied public key as trusted.
    pub fn import_public_key(
        &self,
        suite: SignatureSuite,
        public_key: &[u8],
        clock: &DeterministicClock,
    ) -> KgenResult<String> {
        let _guard = self.mutate.lock().expect("keystore lock poisoned");
        let fp = fingerprint(public_key);
        let mut trust = self.trust.write().expect("trust lock poisoned");
        trust.insert_active(fp.clone(), suite, hex::encode(public_key), clock.now());
        trust.save()?;
        Ok(fp)
    }

    pub fn revoke(&self, fingerprint: &str) -> KgenResult<()> {
        let _guard = self.mutate.lock().expect("keystore lock poisoned");
        let mut trust = self.trust.write().expect("trust lock poisoned");
        trust.mark_revoked(fingerprint)?;
        trust.save()?;
        warn!(%fingerprint, "key revoked");
        Ok(())
    }

    /// Rotate the stored keypair: generate a successor of the same suite,
    /// move the old files into `backup/`, and mark the old key rotated.
    pub fn rotate(
        &self,
        passphrase: Option<&str>,
        clock: &DeterministicClock,
    ) -> KgenResult<RotationOutcome> {
        let old = self.load_keypair(passphrase)?;
        let _guard = self.mutate.lock().expect("keystore lock poisoned");

        let new = self.generate_keypair(old.suite, clock)?;

        let backup_dir = self.keys_dir.join("backup");
        std::fs::create_dir_all(&backup_dir)?;
        let stamp = clock.now().format("%Y%m%dT%H%M%SZ");
        let mut backup_paths = Vec::new();
        for (src, name) in [
            (self.private_key_path(), PRIVATE_KEY_FILE),
            (self.public_key_path(), PUBLIC_KEY_FILE),
        ] {
            let dest = backup_dir.join(format!("{}-{}", stamp, name));
            std::fs::rename(&src, &dest)?;
            backup_paths.push(dest);
        }
        self.prune_backups(&backup_dir)?;

        self.write_keypair_files(&new, passphrase)?;

        let mut trust = self.trust.write().expect("trust lock poisoned");
        trust.insert_active(
            new.fingerprint.clone(),
            new.suite,
            hex::encode(&new.public_key),
            clock.now(),
        );
        trust.mark_rotated(&old.fingerprint, new.fingerprint.clone(), clock.now())?;
        trust.save()?;

        info!(old = %old.fingerprint, new = %new.fingerprint, "keypair rotated");
        Ok(RotationOutcome {
            old_fingerprint: old.fingerprint.clone(),
            new_fingerprint: new.fingerprint,
            backup_paths,
        })
    }

    // Keep the newest max_backups private/public pairs, by name (names
    // embed the rotation timestamp).
    fn prune_backups(&self, backup_dir: &Path) -> KgenResult<()> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(backup_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        let keep = self.max_backups * 2;
        if entries.len() > keep {
            let surplus = entries.len() - keep;
            for path in entries.into_iter().take(surplus) {
                debug!(path = %path.display(), "pruning key backup");
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn wrap_secret(secret: &[u8], passphrase: &str) -> KgenResult<StoredPrivateKey> {
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let mut wrap_key = derive_wrap_key(passphrase, &salt, WRAP_ITERATIONS)?;
    let cipher = Aes256Gcm::new_from_slice(&wrap_key)
        .map_err(|e| KgenError::Crypto(format!("wrap key invalid: {}", e)))?;
    wrap_key.zeroize();

    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), secret)
        .map_err(|_| KgenError::Crypto("private key wrapping failed".to_string()))?;

    Ok(StoredPrivateKey::Wrapped {
        kdf: WRAP_KDF.to_string(),
        iterations: WRAP_ITERATIONS,
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    })
}

fn unwrap_secret(
    kdf: &str,
    iterations: u32,
    salt: &str,
    nonce: &str,
    ciphertext: &str,
    passphrase: &str,
) -> KgenResult<Vec<u8>> {
    if kdf != WRAP_KDF {
        return Err(KgenError::Crypto(format!("unknown key wrap kdf: {}", kdf)));
    }
    let salt = hex::decode(salt)
        .map_err(|e| KgenError::Crypto(format!("wrap salt is not hex: {}", e)))?;
    let nonce = hex::decode(nonce)
        .map_err(|e| KgenError::Crypto(format!("wrap nonce is not hex: {}", e)))?;
    if nonce.len() != 12 {
        return Err(KgenError::Crypto("wrap nonce must be 12 bytes".to_string()));
    }
    let ciphertext = hex::decode(ciphertext)
        .map_err(|e| KgenError::Crypto(format!("wrap ciphertext is not hex: {}", e)))?;

    let mut wrap_key = derive_wrap_key(passphrase, &salt, iterations)?;
    let cipher = Aes256Gcm::new_from_slice(&wrap_key)
        .map_err(|e| KgenError::Crypto(format!("wrap key invalid: {}", e)))?;
    wrap_key.zeroize();

    cipher
        .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| KgenError::Crypto("private key unwrap failed; wrong passphrase?".to_string()))
}

fn derive_wrap_key(passphrase: &str, salt: &[u8], iterations: u32) -> KgenResult<[u8; 32]> {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(passphrase.as_bytes(), salt, iterations, &mut key)
        .map_err(|e| KgenError::Crypto(format!("kdf failed: {}", e)))?;
    Ok(key)
}

fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> KgenResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(path).map_err(|e| KgenError::Io(e.error))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
