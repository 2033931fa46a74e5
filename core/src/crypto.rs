//! Block encryption algorithms and the name → implementation registry.

use crate::identity::{BlockKey, Identity, PublicIdentity, derive_bytes, stable_rng};
use crate::types::Metadata;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NONCE_SIZE: usize = 24;
pub const CBC_IV_SIZE: usize = 16;

pub const NONE: &str = "none";
pub const AES_256_CBC: &str = "aes-256-cbc";
pub const XCHACHA20_POLY1305: &str = "xchacha20-poly1305";

const RECIPIENT_PREFIX: &str = "recipient:";
const IV_KEY: &str = "iv";

/// Who may decrypt a block: the owner plus any active share keys.
#[derive(Debug, Clone, Copy)]
pub struct Recipients<'a> {
    pub primary: &'a PublicIdentity,
    pub shares: &'a [PublicIdentity],
}

impl<'a> Recipients<'a> {
    pub fn new(primary: &'a PublicIdentity, shares: &'a [PublicIdentity]) -> Self {
        Self { primary, shares }
    }
}

pub trait BlockEncryptor: Send + Sync {
    fn algorithm(&self) -> &'static str;

    /// Encrypts a block, recording what is needed to decrypt it in `metadata`.
    fn encrypt(
        &self,
        metadata: &mut Metadata,
        plaintext: &[u8],
        recipients: Recipients<'_>,
    ) -> Result<Vec<u8>>;

    fn decrypt(&self, metadata: &Metadata, ciphertext: &[u8], identity: &Identity) -> Result<Vec<u8>>;

    /// Whether `metadata` carries everything this algorithm needs. A record
    /// failing this check has not been encrypted under this scheme yet.
    fn is_valid(&self, metadata: &Metadata) -> bool;
}

pub fn recipient_key(fingerprint: &str) -> String {
    format!("{}{}", RECIPIENT_PREFIX, fingerprint)
}

/// Fingerprints of every recipient recorded in `metadata`.
pub fn recipients_of(metadata: &Metadata) -> Vec<String> {
    metadata
        .keys()
        .filter_map(|k| k.strip_prefix(RECIPIENT_PREFIX))
        .map(str::to_string)
        .collect()
}

fn has_recipient(metadata: &Metadata) -> bool {
    metadata.keys().any(|k| k.starts_with(RECIPIENT_PREFIX))
}

/// Finds and opens the encapsulation addressed to `identity`.
fn block_key_for(metadata: &Metadata, identity: &Identity) -> Result<BlockKey> {
    let encoded = metadata
        .get(&recipient_key(&identity.fingerprint()))
        .ok_or_else(|| {
            Error::DecryptionFailed(format!(
                "no encapsulation for identity {}",
                identity.fingerprint()
            ))
        })?;
    let encapsulation = BASE64
        .decode(encoded)
        .map_err(|e| Error::DecryptionFailed(format!("invalid encapsulation encoding: {}", e)))?;
    identity.decapsulate(&encapsulation)
}

pub struct NoneEncryptor;

impl BlockEncryptor for NoneEncryptor {
    fn algorithm(&self) -> &'static str {
        NONE
    }

    fn encrypt(&self, _metadata: &mut Metadata, plaintext: &[u8], _: Recipients<'_>) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, _metadata: &Metadata, ciphertext: &[u8], _: &Identity) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }

    fn is_valid(&self, _metadata: &Metadata) -> bool {
        true
    }
}

/// AES-256-CBC with PKCS#7 padding, keyed by a classical-only
/// encapsulation. Kept only so old records stay readable.
pub struct LegacyCbcEncryptor;

impl BlockEncryptor for LegacyCbcEncryptor {
    fn algorithm(&self) -> &'static str {
        AES_256_CBC
    }

    fn encrypt(&self, _: &mut Metadata, _: &[u8], _: Recipients<'_>) -> Result<Vec<u8>> {
        Err(Error::Configuration(format!(
            "{} is decode-only and cannot encrypt new blocks",
            AES_256_CBC
        )))
    }

    fn decrypt(&self, metadata: &Metadata, ciphertext: &[u8], identity: &Identity) -> Result<Vec<u8>> {
        use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

        let iv = metadata
            .get(IV_KEY)
            .and_then(|iv| hex::decode(iv).ok())
            .filter(|iv| iv.len() == CBC_IV_SIZE)
            .ok_or_else(|| Error::DecryptionFailed("missing or invalid iv".to_string()))?;
        let key = block_key_for(metadata, identity)?;

        cbc::Decryptor::<aes::Aes256>::new(key.as_bytes().into(), iv.as_slice().into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::DecryptionFailed("invalid padding".to_string()))
    }

    fn is_valid(&self, metadata: &Metadata) -> bool {
        metadata.contains_key(IV_KEY) && has_recipient(metadata)
    }
}

/// XChaCha20-Poly1305 under a per-block hybrid-encapsulated key.
///
/// Ciphertext layout: `[24-byte nonce][ciphertext + 16-byte tag]`.
///
/// In stable mode the encapsulation randomness and nonce derive from the
/// recipient key and the plaintext hash, so identical plaintext encrypted
/// for the same recipient yields identical bytes.
pub struct AeadEncryptor {
    stable: bool,
}

impl AeadEncryptor {
    pub fn new(stable: bool) -> Self {
        Self { stable }
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }
}

impl BlockEncryptor for AeadEncryptor {
    fn algorithm(&self) -> &'static str {
        XCHACHA20_POLY1305
    }

    fn encrypt(
        &self,
        metadata: &mut Metadata,
        plaintext: &[u8],
        recipients: Recipients<'_>,
    ) -> Result<Vec<u8>> {
        let plaintext_hash = blake3::hash(plaintext);

        let (encapsulation, key) = if self.stable {
            let mut rng = stable_rng(recipients.primary, plaintext_hash.as_bytes());
            recipients.primary.encapsulate(&mut rng)?
        } else {
            recipients.primary.encapsulate(&mut OsRng)?
        };
        metadata.insert(
            recipient_key(&recipients.primary.fingerprint()),
            BASE64.encode(&encapsulation),
        );

        for share in recipients.shares {
            let bundle = if self.stable {
                let mut rng = stable_rng(share, plaintext_hash.as_bytes());
                share.encapsulate_key(&key, &mut rng)?
            } else {
                share.encapsulate_key(&key, &mut OsRng)?
            };
            metadata.insert(recipient_key(&share.fingerprint()), BASE64.encode(&bundle));
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        if self.stable {
            derive_bytes(&key, b"shardvault block nonce", &mut nonce_bytes)?;
        } else {
            OsRng.fill_bytes(&mut nonce_bytes);
        }

        let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, metadata: &Metadata, ciphertext: &[u8], identity: &Identity) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(Error::DecryptionFailed("ciphertext too short".to_string()));
        }
        let key = block_key_for(metadata, identity)?;

        let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
        cipher
            .decrypt(XNonce::from_slice(nonce_bytes), encrypted)
            .map_err(|_| Error::DecryptionFailed("authentication tag mismatch".to_string()))
    }

    fn is_valid(&self, metadata: &Metadata) -> bool {
        has_recipient(metadata)
    }
}

pub type EncryptorFactory = fn(stable: bool) -> Arc<dyn BlockEncryptor>;

/// Maps algorithm identifiers stored in configuration and storage records
/// to encryptor constructors.
#[derive(Clone)]
pub struct EncryptorRegistry {
    factories: BTreeMap<&'static str, EncryptorFactory>,
}

impl EncryptorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(NONE, |_| Arc::new(NoneEncryptor));
        registry.register(AES_256_CBC, |_| Arc::new(LegacyCbcEncryptor));
        registry.register(XCHACHA20_POLY1305, |stable| Arc::new(AeadEncryptor::new(stable)));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: EncryptorFactory) {
        self.factories.insert(name, factory);
    }

    pub fn resolve(&self, name: &str, stable: bool) -> Result<Arc<dyn BlockEncryptor>> {
        self.factories
            .get(name)
            .map(|factory| factory(stable))
            .ok_or_else(|| Error::Configuration(format!("unknown encryption algorithm '{}'", name)))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for EncryptorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt_with(
        encryptor: &dyn BlockEncryptor,
        plaintext: &[u8],
        owner: &Identity,
        shares: &[PublicIdentity],
    ) -> (Metadata, Vec<u8>) {
        let mut metadata = Metadata::new();
        let ciphertext = encryptor
            .encrypt(&mut metadata, plaintext, Recipients::new(owner.public(), shares))
            .unwrap();
        (metadata, ciphertext)
    }

    #[test]
    fn test_aead_roundtrip() {
        let owner = Identity::generate().unwrap();
        let encryptor = AeadEncryptor::new(false);
        let plaintext = b"Hello, shardvault!";

        let (metadata, ciphertext) = encrypt_with(&encryptor, plaintext, &owner, &[]);
        assert!(encryptor.is_valid(&metadata));
        let decrypted = encryptor.decrypt(&metadata, &ciphertext, &owner).unwrap();
        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_stable_mode_is_deterministic() {
        let owner = Identity::generate().unwrap();
        let stable = AeadEncryptor::new(true);
        let plaintext = vec![42u8; 4096];

        let (meta_a, a) = encrypt_with(&stable, &plaintext, &owner, &[]);
        let (meta_b, b) = encrypt_with(&stable, &plaintext, &owner, &[]);
        assert_eq!(a, b);
        assert_eq!(meta_a, meta_b);

        let random = AeadEncryptor::new(false);
        let (meta_c, c) = encrypt_with(&random, &plaintext, &owner, &[]);
        let (meta_d, d) = encrypt_with(&random, &plaintext, &owner, &[]);
        assert_ne!(c, d);
        assert_eq!(random.decrypt(&meta_c, &c, &owner).unwrap(), plaintext);
        assert_eq!(random.decrypt(&meta_d, &d, &owner).unwrap(), plaintext);
    }

    #[test]
    fn test_every_share_decrypts_independently() {
        let owner = Identity::generate().unwrap();
        let shares: Vec<Identity> = (0..3).map(|_| Identity::generate().unwrap()).collect();
        let share_keys: Vec<PublicIdentity> = shares.iter().map(|s| s.public().clone()).collect();
        let outsider = Identity::generate().unwrap();
        let encryptor = AeadEncryptor::new(false);
        let plaintext = b"shared block";

        let (metadata, ciphertext) = encrypt_with(&encryptor, plaintext, &owner, &share_keys);
        assert_eq!(recipients_of(&metadata).len(), 4);

        for identity in shares.iter().chain(std::iter::once(&owner)) {
            let decrypted = encryptor.decrypt(&metadata, &ciphertext, identity).unwrap();
            assert_eq!(decrypted, plaintext);
        }
        let result = encryptor.decrypt(&metadata, &ciphertext, &outsider);
        assert!(matches!(result, Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let owner = Identity::generate().unwrap();
        let encryptor = AeadEncryptor::new(false);
        let (metadata, mut ciphertext) = encrypt_with(&encryptor, b"integrity", &owner, &[]);
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;

        let result = encryptor.decrypt(&metadata, &ciphertext, &owner);
        assert!(matches!(result, Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_missing_metadata_is_not_valid() {
        let metadata = Metadata::new();
        assert!(!AeadEncryptor::new(false).is_valid(&metadata));
        assert!(!LegacyCbcEncryptor.is_valid(&metadata));
        assert!(NoneEncryptor.is_valid(&metadata));
    }

    #[test]
    fn test_legacy_cbc_decodes() {
        use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

        let owner = Identity::generate().unwrap();
        let (encapsulation, key) = owner.public().encapsulate_classical(&mut OsRng).unwrap();
        let iv = [9u8; CBC_IV_SIZE];
        let plaintext = b"written by an older client".to_vec();
        let ciphertext = cbc::Encryptor::<aes::Aes256>::new(key.as_bytes().into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let mut metadata = Metadata::new();
        metadata.insert(IV_KEY.to_string(), hex::encode(iv));
        metadata.insert(recipient_key(&owner.fingerprint()), BASE64.encode(&encapsulation));

        let encryptor = LegacyCbcEncryptor;
        assert!(encryptor.is_valid(&metadata));
        assert_eq!(encryptor.decrypt(&metadata, &ciphertext, &owner).unwrap(), plaintext);

        let mut fresh = Metadata::new();
        let result = encryptor.encrypt(&mut fresh, &plaintext, Recipients::new(owner.public(), &[]));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_registry_rejects_unknown_algorithm() {
        let registry = EncryptorRegistry::builtin();
        assert!(registry.resolve(XCHACHA20_POLY1305, true).is_ok());
        assert!(matches!(
            registry.resolve("rot13", false),
            Err(Error::Configuration(_))
        ));
        assert_eq!(registry.names(), vec![AES_256_CBC, NONE, XCHACHA20_POLY1305]);
    }
}
