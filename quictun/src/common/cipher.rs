// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-datagram AES-GCM sealing used as a link-level obfuscation layer beneath QUIC
//!
//! Wire format of every sealed datagram:
//!
//! ```text
//! [ nonce (12) | ciphertext (n) | tag (16) ]
//! ```
//!
//! There is no length prefix; one UDP datagram carries exactly one sealed unit.

use aes_gcm::{
  aead::{consts::U12, generic_array::GenericArray, Aead, KeyInit},
  aes::Aes192,
  Aes128Gcm, Aes256Gcm, AesGcm,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use super::error::CipherError;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Size of the random nonce prefixed to each datagram
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag
pub const TAG_SIZE: usize = 16;
/// Bytes added to every datagram by [`PacketCipher::seal`]
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Pre-shared key material for the obfuscation layer, wiped on drop
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey(Zeroizing<Vec<u8>>);

impl CipherKey {
  pub fn new<T: Into<Vec<u8>>>(key: T) -> Self {
    Self(Zeroizing::new(key.into()))
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl std::fmt::Debug for CipherKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CipherKey")
      .field("len", &self.0.len())
      .finish_non_exhaustive()
  }
}

#[derive(Clone)]
enum Variant {
  Aes128(Aes128Gcm),
  Aes192(Aes192Gcm),
  Aes256(Aes256Gcm),
}

#[derive(Clone)]
pub struct PacketCipher {
  variant: Variant,
}

impl PacketCipher {
  /// Builds the AES-GCM variant matching the key length
  pub fn new(key: &CipherKey) -> Result<Self, CipherError> {
    let bytes = key.as_bytes();
    let invalid = |_| CipherError::InvalidKeyLength(bytes.len());
    let variant = match bytes.len() {
      16 => Variant::Aes128(Aes128Gcm::new_from_slice(bytes).map_err(invalid)?),
      24 => Variant::Aes192(Aes192Gcm::new_from_slice(bytes).map_err(invalid)?),
      32 => Variant::Aes256(Aes256Gcm::new_from_slice(bytes).map_err(invalid)?),
      len => return Err(CipherError::InvalidKeyLength(len)),
    };
    Ok(Self { variant })
  }

  /// Key size in bits, for diagnostics
  pub fn key_bits(&self) -> usize {
    match self.variant {
      Variant::Aes128(_) => 128,
      Variant::Aes192(_) => 192,
      Variant::Aes256(_) => 256,
    }
  }

  /// Seals `plaintext` under a fresh random nonce, returning `nonce || ciphertext`
  pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let nonce_ref = GenericArray::from_slice(&nonce);
    let ciphertext = match &self.variant {
      Variant::Aes128(aead) => aead.encrypt(nonce_ref, plaintext),
      Variant::Aes192(aead) => aead.encrypt(nonce_ref, plaintext),
      Variant::Aes256(aead) => aead.encrypt(nonce_ref, plaintext),
    }
    .map_err(|_| CipherError::Encryption)?;
    let mut datagram = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    datagram.extend_from_slice(&nonce);
    datagram.extend_from_slice(&ciphertext);
    Ok(datagram)
  }

  /// Authenticates and decrypts one sealed datagram
  pub fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, CipherError> {
    if datagram.len() < NONCE_SIZE {
      return Err(CipherError::TooShort {
        len: datagram.len(),
        nonce_size: NONCE_SIZE,
      });
    }
    let (nonce, ciphertext) = datagram.split_at(NONCE_SIZE);
    let nonce = GenericArray::from_slice(nonce);
    match &self.variant {
      Variant::Aes128(aead) => aead.decrypt(nonce, ciphertext),
      Variant::Aes192(aead) => aead.decrypt(nonce, ciphertext),
      Variant::Aes256(aead) => aead.decrypt(nonce, ciphertext),
    }
    .map_err(|_| CipherError::Authentication)
  }
}

impl std::fmt::Debug for PacketCipher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PacketCipher")
      .field("key_bits", &self.key_bits())
      .finish_non_exhaustive()
  }
}
