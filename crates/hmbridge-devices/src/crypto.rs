//! Device identifier obfuscation for current-epoch topics.
//!
//! Some families address their current-epoch topics with an AES-128-CBC
//! transform of the raw device id (fixed key, zero IV, PKCS#7 padding),
//! rendered as lowercase hex. The transform is deterministic, so the bridge
//! can compute topics up front; `reveal_id` exists for diagnostics only.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use hmbridge_core::{BridgeError, BridgeResult};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const KEY: [u8; 16] = *b"hame_energy_2024";
const IV: [u8; 16] = [0u8; 16];

/// Obfuscate a raw device id.
pub fn obfuscate_id(device_id: &str) -> String {
    let ciphertext =
        Aes128CbcEnc::new(&KEY.into(), &IV.into()).encrypt_padded_vec_mut::<Pkcs7>(device_id.as_bytes());
    hex::encode(ciphertext)
}

/// Recover the raw device id from its obfuscated form.
pub fn reveal_id(obfuscated: &str) -> BridgeResult<String> {
    let ciphertext = hex::decode(obfuscated.trim())
        .map_err(|e| BridgeError::Crypto(format!("Invalid hex identifier: {}", e)))?;
    let plaintext = Aes128CbcDec::new(&KEY.into(), &IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| BridgeError::Crypto("Identifier padding is invalid".into()))?;
    String::from_utf8(plaintext)
        .map_err(|_| BridgeError::Crypto("Identifier is not valid UTF-8".into()))
}
