use aes::Aes128;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use sha2::{Digest, Sha256};

use crate::envelope::Payload;
use crate::error::{Error, ErrorKind, Result};

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

/// Cipher key length in bytes.
pub const KEY_SIZE: usize = 16;

/// Initialization vector length in bytes.
pub const IV_SIZE: usize = 16;

// AES block size in bytes.
const BLOCK_SIZE: usize = 16;

fn cipher_error(description: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Cipher, description)
}

/// A symmetric cipher for opaque payloads, keyed by a shared password.
///
/// The key is the `SHA-256` digest of the password truncated to the
/// `AES-128` key length. Each encryption draws a fresh random initialization
/// vector, prepends it to the `CBC` ciphertext and encodes the whole as
/// base64 text.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Creates a [`Cipher`] from a shared password.
    #[must_use]
    pub fn new(password: &str) -> Self {
        let digest = Sha256::digest(password.as_bytes());
        let mut key = [0; KEY_SIZE];
        key.copy_from_slice(&digest[..KEY_SIZE]);
        Self { key }
    }

    /// Encrypts a plaintext and returns `base64(IV ‖ ciphertext)`.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let iv: [u8; IV_SIZE] = rand::random();
        let ciphertext =
            Encryptor::new(&self.key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut data = Vec::with_capacity(IV_SIZE + ciphertext.len());
        data.extend_from_slice(&iv);
        data.extend_from_slice(&ciphertext);
        STANDARD.encode(data)
    }

    /// Decrypts a text produced by [`Cipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Malformed base64 text, a truncated ciphertext, or an invalid padding
    /// produce a [`ErrorKind::Cipher`] error. Such an error means the data was
    /// corrupted in transit.
    pub fn decrypt(&self, text: &str) -> Result<Vec<u8>> {
        let data = STANDARD
            .decode(text)
            .map_err(|e| cipher_error(format!("Invalid base64 text: {e}")))?;

        if data.len() < IV_SIZE + BLOCK_SIZE {
            return Err(cipher_error(format!(
                "Ciphertext too short: {} bytes",
                data.len()
            )));
        }

        let (iv, ciphertext) = data.split_at(IV_SIZE);
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(cipher_error(format!(
                "Ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            )));
        }

        let mut iv_block = [0; IV_SIZE];
        iv_block.copy_from_slice(iv);

        Decryptor::new(&self.key.into(), &iv_block.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| cipher_error("Invalid padding"))
    }

    /// Serializes and encrypts a [`Payload`].
    ///
    /// # Errors
    ///
    /// The payload could not be serialized.
    pub fn encrypt_payload(&self, payload: &Payload) -> Result<String> {
        let plaintext = serde_json::to_vec(payload)?;
        Ok(self.encrypt(&plaintext))
    }

    /// Decrypts and deserializes a [`Payload`].
    ///
    /// # Errors
    ///
    /// The text could not be decrypted, or the plaintext is not a valid
    /// payload. In both cases the data should be considered corrupted.
    pub fn decrypt_payload(&self, text: &str) -> Result<Payload> {
        let plaintext = self.decrypt(text)?;
        serde_json::from_slice(&plaintext).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    use serde_json::json;

    use crate::envelope::Payload;
    use crate::error::ErrorKind;

    use super::{Cipher, IV_SIZE};

    #[test]
    fn round_trip() {
        let cipher = Cipher::new("secret");

        for plaintext in [
            &b""[..],
            b"a",
            b"exactly sixteen!",
            "a longer payload with some non-ascii text: àèìòù".as_bytes(),
        ] {
            let text = cipher.encrypt(plaintext);
            assert_eq!(cipher.decrypt(&text).unwrap(), plaintext);
        }
    }

    #[test]
    fn fresh_iv_for_each_encryption() {
        let cipher = Cipher::new("secret");

        let first = cipher.encrypt(b"same plaintext");
        let second = cipher.encrypt(b"same plaintext");
        assert_ne!(first, second);

        let first = STANDARD.decode(first).unwrap();
        let second = STANDARD.decode(second).unwrap();
        assert_ne!(first[..IV_SIZE], second[..IV_SIZE]);
    }

    #[test]
    fn padded_length() {
        let cipher = Cipher::new("secret");

        // A full block of plaintext gains a full block of padding.
        let data = STANDARD.decode(cipher.encrypt(&[0; 16])).unwrap();
        assert_eq!(data.len(), IV_SIZE + 32);

        let data = STANDARD.decode(cipher.encrypt(&[0; 5])).unwrap();
        assert_eq!(data.len(), IV_SIZE + 16);
    }

    #[test]
    fn malformed_ciphertexts() {
        let cipher = Cipher::new("secret");

        let error = cipher.decrypt("not base64 at all!").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cipher);
        assert!(error.is_corruption());

        // Only an initialization vector.
        let error = cipher.decrypt(&STANDARD.encode([0; IV_SIZE])).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cipher);

        // Not a multiple of the block size.
        let error = cipher.decrypt(&STANDARD.encode([0; IV_SIZE + 20])).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cipher);
    }

    #[test]
    fn wrong_password() {
        let payload = Payload::notification(json!({ "node": 1, "value": 42 }));
        let text = Cipher::new("secret").encrypt_payload(&payload).unwrap();

        let error = Cipher::new("another secret")
            .decrypt_payload(&text)
            .unwrap_err();
        assert!(error.is_corruption());
    }

    #[test]
    fn payload_round_trip() {
        let cipher = Cipher::new("secret");
        let payload = Payload::notification(json!({ "node": 1, "value": 42 }));

        let text = cipher.encrypt_payload(&payload).unwrap();
        assert_eq!(cipher.decrypt_payload(&text).unwrap(), payload);
    }
}
