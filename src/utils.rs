use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Error, Debug, PartialEq)]
pub enum DecryptError {
    #[error("encrypted payload must have the form '<iv>.<ciphertext>'")]
    Format,
    #[error("invalid base64 content ({0})")]
    Base64(String),
    #[error("decryption key must be 16 or 32 bytes long, got {0}")]
    KeyLength(usize),
    #[error("decryption failed, the key is probably wrong")]
    Cipher,
    #[error("decrypted content is not valid UTF-8")]
    Utf8,
}

pub fn sha1(payload: &str) -> String {
    let hash = Sha1::digest(payload);
    base16ct::lower::encode_string(&hash)
}

/// Decrypts a `base64(iv).base64(ciphertext)` string with a base64 encoded AES key.
pub fn decrypt(encrypted: &str, key: &str) -> Result<String, DecryptError> {
    let (iv_part, cipher_part) = encrypted.split_once('.').ok_or(DecryptError::Format)?;
    let key_bytes = decode_b64(key)?;
    let iv = decode_b64(iv_part)?;
    let cipher_text = decode_b64(cipher_part)?;

    let plain = match key_bytes.len() {
        16 => Aes128CbcDec::new_from_slices(&key_bytes, &iv)
            .map_err(|_| DecryptError::Format)?
            .decrypt_padded_vec_mut::<Pkcs7>(&cipher_text)
            .map_err(|_| DecryptError::Cipher)?,
        32 => Aes256CbcDec::new_from_slices(&key_bytes, &iv)
            .map_err(|_| DecryptError::Format)?
            .decrypt_padded_vec_mut::<Pkcs7>(&cipher_text)
            .map_err(|_| DecryptError::Cipher)?,
        len => return Err(DecryptError::KeyLength(len)),
    };
    String::from_utf8(plain).map_err(|_| DecryptError::Utf8)
}

fn decode_b64(val: &str) -> Result<Vec<u8>, DecryptError> {
    STANDARD
        .decode(val.trim())
        .map_err(|err| DecryptError::Base64(err.to_string()))
}
