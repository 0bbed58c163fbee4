//! Crypto primitives for the handshake and the encrypted command channel.
//!
//! The controller speaks RSA-PKCS#1v1.5 for sealing the session key,
//! AES-256-CBC with PKCS#5 padding for commands, and HMAC-SHA1 or
//! HMAC-SHA256 (its choice) for the credential proof.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{block_padding::NoPadding, BlockDecrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::ApiError;

/// AES block size, also the PKCS#5 padding block.
pub const AES_BLOCK: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Hash algorithm negotiated by `getkey2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
}

impl HashAlg {
    pub fn from_wire(name: &str) -> Result<Self, ApiError> {
        match name {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            other => Err(ApiError::UnknownHashAlg(other.to_string())),
        }
    }
}

/// Decode the controller's public key.
///
/// The controller serves the key with a `CERTIFICATE` label and strips the
/// newlines around the base64 body; relabel and reflow before decoding.
pub fn parse_public_key(raw: &str) -> Result<RsaPublicKey, ApiError> {
    let pem = raw
        .replace("CERTIFICATE", "PUBLIC KEY")
        .replace("KEY-----", "KEY-----\n")
        .replace("-----END", "\n-----END");
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| ApiError::PublicKeyPem(e.to_string()))
}

/// RSA-PKCS#1v1.5 encrypt under the controller's public key.
pub fn rsa_encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, ApiError> {
    key.encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plaintext)
        .map_err(|e| ApiError::RsaEncrypt(e.to_string()))
}

/// PKCS#5 padding: appends 1..=block bytes, each holding the pad length.
pub fn pkcs5_pad(data: &[u8], block: usize) -> Vec<u8> {
    let pad = block - data.len() % block;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad as u8).take(pad));
    out
}

/// AES-256-CBC over data already aligned to the block size.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], padded: &[u8]) -> Result<Vec<u8>, ApiError> {
    if padded.len() % AES_BLOCK != 0 {
        return Err(ApiError::KeyMaterial("plaintext not block aligned"));
    }
    let enc = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| ApiError::KeyMaterial("AES key must be 32 bytes, IV 16"))?;
    let mut buf = padded.to_vec();
    let len = buf.len();
    let ciphertext = enc
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|_| ApiError::KeyMaterial("plaintext not block aligned"))?;
    Ok(ciphertext.to_vec())
}

/// Raw single-block AES decrypt. The key-exchange reply is exactly one
/// block, so no chaining mode is involved.
pub fn aes_decrypt_block(key: &[u8], data: &[u8]) -> Result<[u8; AES_BLOCK], ApiError> {
    if data.len() < AES_BLOCK {
        return Err(ApiError::KeyMaterial("ciphertext shorter than one block"));
    }
    let cipher =
        Aes256::new_from_slice(key).map_err(|_| ApiError::KeyMaterial("AES key must be 32 bytes"))?;
    let mut block = GenericArray::clone_from_slice(&data[..AES_BLOCK]);
    cipher.decrypt_block(&mut block);
    let mut out = [0u8; AES_BLOCK];
    out.copy_from_slice(&block);
    Ok(out)
}

/// Plain digest, upper-hex (the password hash `uSum`).
pub fn hash_upper_hex(alg: HashAlg, data: &[u8]) -> String {
    match alg {
        HashAlg::Sha1 => hex::encode_upper(Sha1::digest(data)),
        HashAlg::Sha256 => hex::encode_upper(Sha256::digest(data)),
    }
}

fn hmac_bytes(alg: HashAlg, key: &[u8], data: &[u8]) -> Result<Vec<u8>, ApiError> {
    Ok(match alg {
        HashAlg::Sha1 => {
            let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
                .map_err(|_| ApiError::KeyMaterial("empty HMAC key"))?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlg::Sha256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                .map_err(|_| ApiError::KeyMaterial("empty HMAC key"))?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    })
}

/// HMAC, upper-hex (the credential proof).
pub fn hmac_upper_hex(alg: HashAlg, key: &[u8], data: &[u8]) -> Result<String, ApiError> {
    Ok(hex::encode_upper(hmac_bytes(alg, key, data)?))
}

/// HMAC, lower-hex (the token hash for refresh/check).
pub fn hmac_lower_hex(alg: HashAlg, key: &[u8], data: &[u8]) -> Result<String, ApiError> {
    Ok(hex::encode(hmac_bytes(alg, key, data)?))
}
