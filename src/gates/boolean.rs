//! TFHE boolean backend.
//!
//! The server key keeps its bootstrapping buffers in thread-local storage, so one
//! `TfheGates` can be shared by every rayon worker.

use serde::{Deserialize, Serialize};
use tfhe::boolean::prelude::{gen_keys, BinaryBooleanGates, Ciphertext, ClientKey, PublicKey, ServerKey};

use super::{BinaryGates, BitDecryptor, BitEncryptor};
use crate::error::Result;

#[derive(Clone, Serialize, Deserialize)]
pub struct TfheGates {
    key: ServerKey,
}

/// Holder of the secret key. Encrypts queries and decrypts results.
#[derive(Clone, Serialize, Deserialize)]
pub struct TfheClient {
    key: ClientKey,
}

/// Public encryption key handed to key custodians.
#[derive(Clone, Serialize, Deserialize)]
pub struct TfhePublicKey {
    key: PublicKey,
}

/// Generates a fresh key set with the default boolean parameters.
pub fn generate_keys() -> (TfheClient, TfheGates) {
    let (client_key, server_key) = gen_keys();
    (TfheClient { key: client_key }, TfheGates { key: server_key })
}

impl TfheClient {
    pub fn public_key(&self) -> TfhePublicKey {
        TfhePublicKey {
            key: PublicKey::new(&self.key),
        }
    }
}

impl TfheGates {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TfheGates> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl TfhePublicKey {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TfhePublicKey> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl BinaryGates for TfheGates {
    type Bit = Ciphertext;

    fn zero(&self) -> Ciphertext {
        self.key.trivial_encrypt(false)
    }

    fn one(&self) -> Ciphertext {
        self.key.trivial_encrypt(true)
    }

    fn and(&self, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
        self.key.and(a, b)
    }

    fn or(&self, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
        self.key.or(a, b)
    }

    fn xor(&self, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
        self.key.xor(a, b)
    }

    fn xnor(&self, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
        self.key.xnor(a, b)
    }

    fn not(&self, a: &Ciphertext) -> Ciphertext {
        self.key.not(a)
    }
}

impl BitEncryptor for TfheClient {
    type Bit = Ciphertext;

    fn encrypt_bit(&self, value: bool) -> Ciphertext {
        self.key.encrypt(value)
    }
}

impl BitDecryptor for TfheClient {
    type Bit = Ciphertext;

    fn decrypt_bit(&self, bit: &Ciphertext) -> bool {
        self.key.decrypt(bit)
    }
}

impl BitEncryptor for TfhePublicKey {
    type Bit = Ciphertext;

    fn encrypt_bit(&self, value: bool) -> Ciphertext {
        self.key.encrypt(value)
    }
}
