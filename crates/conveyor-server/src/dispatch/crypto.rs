// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poll response encryption.
//!
//! An agent may register an RSA public key; from then on its poll
//! responses are PKCS#1 v1.5 encrypted. RSA can only seal one block at a
//! time, so the plaintext is split into block-sized chunks and the
//! ciphertext blocks are concatenated; the agent decrypts per key-sized
//! block and reassembles.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};

use conveyor_core::{Error, Result};

/// PKCS#1 v1.5 padding overhead per block.
const PADDING_OVERHEAD: usize = 11;

fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
        .map_err(|e| Error::Validation(format!("invalid runner public key: {e}")))
}

/// Encrypt `plaintext` for the runner's registered public key.
pub fn encrypt_chunked(public_key_pem: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = parse_public_key(public_key_pem)?;
    let block_size = key.size();
    let chunk_size = block_size - PADDING_OVERHEAD;

    let mut rng = rand::thread_rng();
    let mut ciphertext = Vec::with_capacity(plaintext.len() + block_size);

    for chunk in plaintext.chunks(chunk_size) {
        let block = key
            .encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
            .map_err(|e| Error::Other(format!("response encryption failed: {e}")))?;
        ciphertext.extend_from_slice(&block);
    }

    Ok(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

    fn decrypt_chunked(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Vec<u8> {
        let block_size = private_key.size();
        let mut plaintext = Vec::new();
        for block in ciphertext.chunks(block_size) {
            plaintext.extend(private_key.decrypt(Pkcs1v15Encrypt, block).unwrap());
        }
        plaintext
    }

    #[test]
    fn multi_block_round_trip() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_pem = private_key
            .to_public_key()
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .unwrap();

        // longer than one RSA block forces chunking
        let payload = vec![b'j'; 700];
        let ciphertext = encrypt_chunked(&public_pem, &payload).unwrap();
        assert!(ciphertext.len() > payload.len());
        assert_eq!(ciphertext.len() % private_key.size(), 0);

        assert_eq!(decrypt_chunked(&private_key, &ciphertext), payload);
    }

    #[test]
    fn rejects_garbage_key() {
        assert!(encrypt_chunked("not a pem", b"payload").is_err());
    }
}
