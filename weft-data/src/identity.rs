//! Identities and their signing key pairs.
//!
//! An [`Identity`] is a hashed object whose literal embeds its ed25519
//! verifying key, with a custom hash computed from that key alone — so an
//! identity's hash is stable whether or not the private half is around. The
//! [`KeyPair`] holding the signing key is a separate hashed object with a
//! hash derived from the same key, which lets a store find the pair for an
//! identity it just loaded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use weft_base::{Hash, Value};

use crate::error::LiteralError;
use crate::object::{FieldValue, HashedObject, ObjectFields, ObjectMeta, ObjectRc};

const KEYPAIR_SEED: &str = "keypair";

/// A signing identity, identified by the hash of its public key.
#[derive(Debug, Clone)]
pub struct Identity {
    meta: ObjectMeta,
    public_key: VerifyingKey,
    info: BTreeMap<String, FieldValue>,
    key_pair: OnceLock<Arc<KeyPair>>,
}

impl Identity {
    /// Class tag.
    pub const CLASS: &'static str = "Identity";

    /// Create an identity from a verifying key.
    pub fn from_public_key(public_key: VerifyingKey) -> Self {
        Identity {
            meta: ObjectMeta::default(),
            public_key,
            info: BTreeMap::new(),
            key_pair: OnceLock::new(),
        }
    }

    /// Create an identity carrying extra application info (display names,
    /// endpoints, and the like). The info participates in the literal but
    /// not in the identity's hash.
    pub fn with_info(
        public_key: VerifyingKey,
        info: impl IntoIterator<Item = (String, FieldValue)>,
    ) -> Self {
        Identity {
            info: info.into_iter().collect(),
            ..Self::from_public_key(public_key)
        }
    }

    /// The verifying key.
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Hex form of the verifying key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.as_bytes())
    }

    /// The canonical value of the public key, which the identity hash
    /// covers.
    fn key_value(&self) -> Value {
        Value::String(self.public_key_hex())
    }

    /// The identity's hash. Cheap: computed from the key alone.
    pub fn id_hash(&self) -> Hash {
        Hash::of_value(&self.key_value()).expect("strings always render")
    }

    /// Extra application info.
    pub fn info(&self) -> &BTreeMap<String, FieldValue> {
        &self.info
    }

    /// Attach the signing key pair, if it matches this identity's key.
    pub fn attach_key_pair(&self, key_pair: Arc<KeyPair>) -> bool {
        if key_pair.public_key() != &self.public_key {
            return false;
        }
        self.key_pair.set(key_pair).is_ok()
    }

    /// The attached key pair, when the private half is held locally.
    pub fn key_pair(&self) -> Option<&Arc<KeyPair>> {
        self.key_pair.get()
    }

    /// Sign an object hash, when the key pair is attached.
    pub fn sign(&self, hash: &Hash) -> Option<String> {
        self.key_pair.get().map(|kp| kp.sign(hash))
    }

    /// Verify a hex signature over an object hash.
    pub fn verify(&self, hash: &Hash, signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&bytes);
        self.public_key
            .verify_strict(hash.to_hex().as_bytes(), &signature)
            .is_ok()
    }

    pub(crate) fn construct(
        mut fields: ObjectFields,
        meta: ObjectMeta,
    ) -> Result<Box<dyn HashedObject>, LiteralError> {
        let public_key = take_key(&mut fields, "public_key")?;
        let info = match fields.remove("info") {
            Some(FieldValue::Record(info)) => info,
            Some(_) => return Err(LiteralError::invalid("identity info is not a record")),
            None => BTreeMap::new(),
        };
        Ok(Box::new(Identity {
            meta,
            public_key,
            info,
            key_pair: OnceLock::new(),
        }))
    }
}

impl HashedObject for Identity {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn fields(&self) -> ObjectFields {
        let mut fields = ObjectFields::new();
        fields.insert(
            "public_key".to_string(),
            FieldValue::String(self.public_key_hex()),
        );
        if !self.info.is_empty() {
            fields.insert("info".to_string(), FieldValue::Record(self.info.clone()));
        }
        fields
    }

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn clone_rc(&self) -> ObjectRc {
        Arc::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn custom_hash(&self) -> Option<Hash> {
        Some(self.id_hash())
    }
}

/// An ed25519 key pair, persistable as a hashed object.
#[derive(Clone)]
pub struct KeyPair {
    meta: ObjectMeta,
    signing_key: SigningKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Class tag.
    pub const CLASS: &'static str = "KeyPair";

    /// Generate a fresh key pair.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        KeyPair {
            meta: ObjectMeta::default(),
            signing_key: SigningKey::generate(rng),
        }
    }

    /// Rebuild from the signing key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        KeyPair {
            meta: ObjectMeta::default(),
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// The verifying key.
    pub fn public_key(&self) -> &VerifyingKey {
        self.signing_key.as_ref()
    }

    /// Create the identity for this key pair, with the pair attached.
    pub fn identity(&self) -> Identity {
        let identity = Identity::from_public_key(*self.public_key());
        identity.attach_key_pair(Arc::new(self.clone()));
        identity
    }

    /// Sign an object hash. The signature covers the hash's hex form.
    pub fn sign(&self, hash: &Hash) -> String {
        let signature = self.signing_key.sign(hash.to_hex().as_bytes());
        hex::encode(signature.to_bytes())
    }

    /// The hash under which the pair for `public_key` is stored.
    ///
    /// Derived from the key with a seed, so a store can locate the private
    /// half for an identity without an index.
    pub fn hash_for_public_key(public_key: &VerifyingKey) -> Hash {
        let value = Value::String(hex::encode(public_key.as_bytes()));
        Hash::of_value_seeded(&value, KEYPAIR_SEED).expect("strings always render")
    }

    pub(crate) fn construct(
        mut fields: ObjectFields,
        meta: ObjectMeta,
    ) -> Result<Box<dyn HashedObject>, LiteralError> {
        let public_key = take_key(&mut fields, "public_key")?;
        let signing_key = match fields.remove("signing_key").as_ref().and_then(|f| f.as_str()) {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)
                    .ok()
                    .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
                    .ok_or_else(|| LiteralError::invalid("malformed signing key"))?;
                SigningKey::from_bytes(&bytes)
            }
            None => return Err(LiteralError::invalid("key pair has no signing key")),
        };
        if signing_key.verifying_key() != public_key {
            return Err(LiteralError::invalid(
                "signing key does not match public key",
            ));
        }
        Ok(Box::new(KeyPair { meta, signing_key }))
    }
}

impl HashedObject for KeyPair {
    fn class_name(&self) -> &'static str {
        Self::CLASS
    }

    fn fields(&self) -> ObjectFields {
        let mut fields = ObjectFields::new();
        fields.insert(
            "public_key".to_string(),
            FieldValue::String(hex::encode(self.public_key().as_bytes())),
        );
        fields.insert(
            "signing_key".to_string(),
            FieldValue::String(hex::encode(self.signing_key.to_bytes())),
        );
        fields
    }

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn clone_rc(&self) -> ObjectRc {
        Arc::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn custom_hash(&self) -> Option<Hash> {
        Some(Self::hash_for_public_key(self.public_key()))
    }
}

fn take_key(fields: &mut ObjectFields, name: &str) -> Result<VerifyingKey, LiteralError> {
    let hex_key = fields
        .remove(name)
        .and_then(|f| f.as_str().map(str::to_string))
        .ok_or_else(|| LiteralError::invalid(format!("missing key field {name:?}")))?;
    let bytes = hex::decode(&hex_key)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
        .ok_or_else(|| LiteralError::invalid(format!("malformed key field {name:?}")))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| LiteralError::invalid(format!("invalid key in field {name:?}")))
}
