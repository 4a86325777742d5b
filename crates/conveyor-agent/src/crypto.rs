// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poll response decryption.
//!
//! The registration step generates an RSA keypair; the private half stays
//! in a local file and the public half goes to the server. Encrypted poll
//! responses arrive as concatenated key-sized PKCS#1 v1.5 blocks.

use std::path::Path;

use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

use crate::pool::Error;

const KEY_BITS: usize = 2048;

/// Generate a keypair, persist the private key, return the public PEM.
pub fn generate_private_key(private_key_file: &Path) -> Result<String, Error> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| Error::Crypto(format!("key generation failed: {e}")))?;

    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Crypto(format!("key encoding failed: {e}")))?;
    std::fs::write(private_key_file, private_pem.as_bytes())?;

    let public_pem = private_key
        .to_public_key()
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Crypto(format!("key encoding failed: {e}")))?;

    Ok(public_pem)
}

/// Load the private key written by [`generate_private_key`].
pub fn load_private_key(private_key_file: &Path) -> Result<RsaPrivateKey, Error> {
    let pem = std::fs::read_to_string(private_key_file)?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .map_err(|e| Error::Crypto(format!("invalid private key: {e}")))
}

/// Decrypt a response of concatenated RSA blocks.
pub fn decrypt_chunked(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let block_size = private_key.size();
    let mut plaintext = Vec::with_capacity(ciphertext.len());

    for block in ciphertext.chunks(block_size) {
        let chunk = private_key
            .decrypt(Pkcs1v15Encrypt, block)
            .map_err(|e| Error::Crypto(format!("response decryption failed: {e}")))?;
        plaintext.extend_from_slice(&chunk);
    }

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::RsaPublicKey;

    #[test]
    fn generated_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("runner.key");

        let public_pem = generate_private_key(&key_file).unwrap();
        let public_key = RsaPublicKey::from_pkcs1_pem(&public_pem).unwrap();
        let private_key = load_private_key(&key_file).unwrap();

        let mut rng = rand::thread_rng();
        let payload = vec![b'x'; 600];
        let mut ciphertext = Vec::new();
        for chunk in payload.chunks(public_key.size() - 11) {
            ciphertext.extend(
                public_key
                    .encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
                    .unwrap(),
            );
        }

        assert_eq!(decrypt_chunked(&private_key, &ciphertext).unwrap(), payload);
    }
}
