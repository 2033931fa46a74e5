//! Hybrid identities: X25519 key agreement combined with ML-KEM-768.
//!
//! An [`Identity`] is derived from a 32-byte seed. The seed is either random
//! or stretched from a passphrase with Argon2id. Both sub-keys always come
//! from the same seed and every secret derived for a recipient mixes the
//! classical and post-quantum shared secrets through HKDF-SHA256, so breaking
//! one primitive alone does not expose block keys.
//!
//! Encapsulation layouts, selected by length on decode:
//!
//! ```text
//! 32    ephemeral x25519 public                           (legacy, classical only)
//! 80    ephemeral x25519 public || wrapped key            (legacy, classical bundle)
//! 1120  ephemeral x25519 public || ML-KEM ciphertext      (hybrid)
//! 1168  ephemeral x25519 public || ML-KEM ciphertext || wrapped key (hybrid bundle)
//! ```
//!
//! The length dispatch exists for compatibility with data written before
//! the hybrid scheme. New layouts must carry an explicit tag instead.

use crate::{Error, Result};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem768};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

type DecapsulationKey = <MlKem768 as KemCore>::DecapsulationKey;
type EncapsulationKey = <MlKem768 as KemCore>::EncapsulationKey;

pub const KEY_SIZE: usize = 32;
pub const SEED_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

pub const X25519_PUBLIC_SIZE: usize = 32;
pub const ML_KEM_PUBLIC_SIZE: usize = 1184;
pub const ML_KEM_CIPHERTEXT_SIZE: usize = 1088;
pub const WRAPPED_KEY_SIZE: usize = KEY_SIZE + TAG_SIZE;

pub const CLASSICAL_ENCAPSULATION: usize = X25519_PUBLIC_SIZE;
pub const CLASSICAL_BUNDLE_ENCAPSULATION: usize = CLASSICAL_ENCAPSULATION + WRAPPED_KEY_SIZE;
pub const HYBRID_ENCAPSULATION: usize = X25519_PUBLIC_SIZE + ML_KEM_CIPHERTEXT_SIZE;
pub const HYBRID_BUNDLE_ENCAPSULATION: usize = HYBRID_ENCAPSULATION + WRAPPED_KEY_SIZE;

const CLASSICAL_INFO: &[u8] = b"shardvault classical v1";
const HYBRID_INFO: &[u8] = b"shardvault hybrid v1";

/// A symmetric 256-bit key protecting one block. Zeroized on drop.
#[derive(Clone)]
pub struct BlockKey {
    bytes: [u8; KEY_SIZE],
}

impl BlockKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for BlockKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

impl Default for KdfParams {
    fn default() -> Self {
        let mut salt = vec![0u8; 32];
        OsRng.fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations: 3,
            memory: 65536,
            parallelism: 4,
            salt,
        }
    }
}

/// Public half of an identity. Anyone holding it can encrypt block keys
/// that only the matching [`Identity`] can recover.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    classical: [u8; X25519_PUBLIC_SIZE],
    post_quantum: Vec<u8>,
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PublicIdentity {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(X25519_PUBLIC_SIZE + ML_KEM_PUBLIC_SIZE);
        bytes.extend_from_slice(&self.classical);
        bytes.extend_from_slice(&self.post_quantum);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != X25519_PUBLIC_SIZE + ML_KEM_PUBLIC_SIZE {
            return Err(Error::Encryption(format!(
                "public identity must be {} bytes, got {}",
                X25519_PUBLIC_SIZE + ML_KEM_PUBLIC_SIZE,
                bytes.len()
            )));
        }
        let (classical, post_quantum) = bytes.split_at(X25519_PUBLIC_SIZE);
        let mut classical_bytes = [0u8; X25519_PUBLIC_SIZE];
        classical_bytes.copy_from_slice(classical);
        // Reject encodings the KEM cannot parse before they reach a record.
        parse_encapsulation_key(post_quantum)?;
        Ok(Self {
            classical: classical_bytes,
            post_quantum: post_quantum.to_vec(),
        })
    }

    pub fn encode(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn decode(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|e| Error::Encryption(format!("invalid public identity: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Short stable identifier used to key encapsulations in record metadata.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.to_bytes());
        hex::encode(&hash.as_bytes()[..8])
    }

    /// Derives a fresh block key for this recipient.
    pub fn encapsulate<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<(Vec<u8>, BlockKey)> {
        let mut ephemeral_bytes = Zeroizing::new([0u8; KEY_SIZE]);
        rng.fill_bytes(ephemeral_bytes.as_mut());
        let ephemeral = StaticSecret::from(*ephemeral_bytes);
        let ephemeral_public = X25519Public::from(&ephemeral);
        let classical_secret = ephemeral.diffie_hellman(&X25519Public::from(self.classical));

        let encapsulation_key = parse_encapsulation_key(&self.post_quantum)?;
        let (ciphertext, pq_secret) = encapsulation_key
            .encapsulate(rng)
            .map_err(|_| Error::Encryption("ML-KEM encapsulation failed".to_string()))?;

        let mut encapsulation = Vec::with_capacity(HYBRID_ENCAPSULATION);
        encapsulation.extend_from_slice(ephemeral_public.as_bytes());
        encapsulation.extend_from_slice(ciphertext.as_slice());

        let key = combine(
            classical_secret.as_bytes(),
            Some(pq_secret.as_slice()),
            &transcript(&encapsulation, &self.classical),
        )?;
        Ok((encapsulation, key))
    }

    /// Encapsulates an existing block key so this recipient can recover it
    /// independently of the record's primary recipient.
    pub fn encapsulate_key<R: RngCore + CryptoRng>(
        &self,
        key: &BlockKey,
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let (mut encapsulation, kek) = self.encapsulate(rng)?;
        encapsulation.extend_from_slice(&wrap_key(&kek, key)?);
        Ok(encapsulation)
    }

    #[cfg(test)]
    pub(crate) fn encapsulate_classical<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<(Vec<u8>, BlockKey)> {
        let mut ephemeral_bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut ephemeral_bytes);
        let ephemeral = StaticSecret::from(ephemeral_bytes);
        let encapsulation = X25519Public::from(&ephemeral).as_bytes().to_vec();
        let shared = ephemeral.diffie_hellman(&X25519Public::from(self.classical));
        let key = combine(shared.as_bytes(), None, &transcript(&encapsulation, &self.classical))?;
        Ok((encapsulation, key))
    }

    #[cfg(test)]
    pub(crate) fn encapsulate_key_classical<R: RngCore + CryptoRng>(
        &self,
        key: &BlockKey,
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let (mut encapsulation, kek) = self.encapsulate_classical(rng)?;
        encapsulation.extend_from_slice(&wrap_key(&kek, key)?);
        Ok(encapsulation)
    }
}

/// Private hybrid identity.
pub struct Identity {
    seed: Zeroizing<[u8; SEED_SIZE]>,
    classical: StaticSecret,
    post_quantum: DecapsulationKey,
    public: PublicIdentity,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.public.fingerprint())
            .finish()
    }
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; SEED_SIZE];
        OsRng.fill_bytes(&mut seed);
        let identity = Self::from_seed(seed);
        seed.zeroize();
        identity
    }

    /// Stretches `passphrase` with Argon2id and derives the identity from it.
    pub fn derive(passphrase: &str, params: &KdfParams) -> Result<Self> {
        if params.algorithm != "argon2id" {
            return Err(Error::Configuration(format!(
                "unsupported key derivation '{}'",
                params.algorithm
            )));
        }
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::new(
                params.memory,
                params.iterations,
                params.parallelism,
                Some(SEED_SIZE),
            )
            .map_err(|e| Error::Encryption(e.to_string()))?,
        );

        let mut seed = [0u8; SEED_SIZE];
        argon2
            .hash_password_into(passphrase.as_bytes(), &params.salt, &mut seed)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        let identity = Self::from_seed(seed);
        seed.zeroize();
        identity
    }

    /// Creates a passphrase-protected identity together with the file that
    /// lets it be recovered later.
    pub fn create(passphrase: &str, params: KdfParams) -> Result<(Self, IdentityFile)> {
        let identity = Self::derive(passphrase, &params)?;
        let file = IdentityFile {
            fingerprint: identity.public.fingerprint(),
            public: identity.public.encode(),
            kdf_params: params,
        };
        Ok((identity, file))
    }

    pub fn recover(passphrase: &str, file: &IdentityFile) -> Result<Self> {
        let identity = Self::derive(passphrase, &file.kdf_params)?;
        if identity.public.fingerprint() != file.fingerprint {
            return Err(Error::InvalidPassword);
        }
        Ok(identity)
    }

    pub fn from_seed(seed: [u8; SEED_SIZE]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, &seed);
        let mut classical_bytes = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(b"shardvault identity x25519", classical_bytes.as_mut())
            .map_err(|e| Error::Encryption(format!("HKDF expand failed: {e}")))?;
        let mut pq_seed = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(b"shardvault identity ml-kem-768", pq_seed.as_mut())
            .map_err(|e| Error::Encryption(format!("HKDF expand failed: {e}")))?;

        let classical = StaticSecret::from(*classical_bytes);
        let mut rng = ChaCha20Rng::from_seed(*pq_seed);
        let (post_quantum, encapsulation_key) = MlKem768::generate(&mut rng);

        let public = PublicIdentity {
            classical: *X25519Public::from(&classical).as_bytes(),
            post_quantum: encapsulation_key.as_bytes().to_vec(),
        };

        Ok(Self {
            seed: Zeroizing::new(seed),
            classical,
            post_quantum,
            public,
        })
    }

    pub fn seed(&self) -> &[u8; SEED_SIZE] {
        &self.seed
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    /// Recovers the block key carried by `encapsulation`.
    pub fn decapsulate(&self, encapsulation: &[u8]) -> Result<BlockKey> {
        match encapsulation.len() {
            CLASSICAL_ENCAPSULATION => self.decapsulate_classical(encapsulation),
            CLASSICAL_BUNDLE_ENCAPSULATION => {
                let (head, wrapped) = encapsulation.split_at(CLASSICAL_ENCAPSULATION);
                let kek = self.decapsulate_classical(head)?;
                unwrap_key(&kek, wrapped)
            }
            HYBRID_ENCAPSULATION => self.decapsulate_hybrid(encapsulation),
            HYBRID_BUNDLE_ENCAPSULATION => {
                let (head, wrapped) = encapsulation.split_at(HYBRID_ENCAPSULATION);
                let kek = self.decapsulate_hybrid(head)?;
                unwrap_key(&kek, wrapped)
            }
            len => Err(Error::InvalidEncapsulation { len }),
        }
    }

    fn decapsulate_classical(&self, encapsulation: &[u8]) -> Result<BlockKey> {
        let ephemeral = x25519_public(encapsulation)?;
        let shared = self.classical.diffie_hellman(&ephemeral);
        combine(
            shared.as_bytes(),
            None,
            &transcript(encapsulation, &self.public.classical),
        )
    }

    fn decapsulate_hybrid(&self, encapsulation: &[u8]) -> Result<BlockKey> {
        let (classical, pq) = encapsulation.split_at(X25519_PUBLIC_SIZE);
        let ephemeral = x25519_public(classical)?;
        let shared = self.classical.diffie_hellman(&ephemeral);

        let ciphertext = Ciphertext::<MlKem768>::try_from(pq)
            .map_err(|_| Error::InvalidEncapsulation { len: encapsulation.len() })?;
        let pq_secret = self
            .post_quantum
            .decapsulate(&ciphertext)
            .map_err(|_| Error::DecryptionFailed("ML-KEM decapsulation failed".to_string()))?;

        combine(
            shared.as_bytes(),
            Some(pq_secret.as_slice()),
            &transcript(encapsulation, &self.public.classical),
        )
    }
}

/// What gets persisted for a passphrase-derived identity. Holds no secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityFile {
    pub fingerprint: String,
    pub public: String,
    pub kdf_params: KdfParams,
}

impl IdentityFile {
    pub fn public_identity(&self) -> Result<PublicIdentity> {
        PublicIdentity::decode(&self.public)
    }

    pub async fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    pub async fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Deterministic RNG for stable encryption: same recipient and same
/// plaintext always produce the same encapsulation.
pub fn stable_rng(recipient: &PublicIdentity, plaintext_hash: &[u8]) -> ChaCha20Rng {
    let mut hasher = blake3::Hasher::new_derive_key("shardvault stable encapsulation v1");
    hasher.update(&recipient.to_bytes());
    hasher.update(plaintext_hash);
    ChaCha20Rng::from_seed(*hasher.finalize().as_bytes())
}

/// HKDF-SHA256 expansion of a block key into a secondary value.
pub fn derive_bytes(key: &BlockKey, info: &[u8], out: &mut [u8]) -> Result<()> {
    let hkdf = Hkdf::<Sha256>::new(None, key.as_bytes());
    hkdf.expand(info, out)
        .map_err(|e| Error::Encryption(format!("HKDF expand failed: {e}")))
}

fn parse_encapsulation_key(bytes: &[u8]) -> Result<EncapsulationKey> {
    let encoded = Encoded::<EncapsulationKey>::try_from(bytes)
        .map_err(|_| Error::Encryption("invalid ML-KEM public key".to_string()))?;
    Ok(EncapsulationKey::from_bytes(&encoded))
}

fn x25519_public(bytes: &[u8]) -> Result<X25519Public> {
    let array: [u8; X25519_PUBLIC_SIZE] = bytes
        .try_into()
        .map_err(|_| Error::InvalidEncapsulation { len: bytes.len() })?;
    Ok(X25519Public::from(array))
}

fn transcript(encapsulation: &[u8], recipient: &[u8; X25519_PUBLIC_SIZE]) -> Vec<u8> {
    let mut transcript = Vec::with_capacity(encapsulation.len() + X25519_PUBLIC_SIZE);
    transcript.extend_from_slice(encapsulation);
    transcript.extend_from_slice(recipient);
    transcript
}

fn combine(classical: &[u8], post_quantum: Option<&[u8]>, salt: &[u8]) -> Result<BlockKey> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(64));
    ikm.extend_from_slice(classical);
    let info = match post_quantum {
        Some(secret) => {
            ikm.extend_from_slice(secret);
            HYBRID_INFO
        }
        None => CLASSICAL_INFO,
    };

    let hkdf = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| Error::Encryption(format!("HKDF expand failed: {e}")))?;
    Ok(BlockKey::from_bytes(okm))
}

// Every KEK comes from a fresh encapsulation, so a fixed nonce is never reused
// under the same key.
fn wrap_key(kek: &BlockKey, key: &BlockKey) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(kek.as_bytes().into());
    cipher
        .encrypt(&Nonce::default(), key.as_bytes().as_ref())
        .map_err(|e| Error::Encryption(format!("key wrapping failed: {e}")))
}

fn unwrap_key(kek: &BlockKey, wrapped: &[u8]) -> Result<BlockKey> {
    let cipher = ChaCha20Poly1305::new(kek.as_bytes().into());
    let mut plaintext = cipher
        .decrypt(&Nonce::default(), wrapped)
        .map_err(|_| Error::DecryptionFailed("key unwrapping failed".to_string()))?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(Error::DecryptionFailed(format!(
            "unwrapped key has wrong size: {} bytes",
            plaintext.len()
        )));
    }
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(BlockKey::from_bytes(bytes))
}
