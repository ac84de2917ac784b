//! Symmetric encryption capability (CBC cipher contexts).
//!
//! A cipher context is a pooled handle holding the normalized algorithm and
//! the prepared key. Encryption generates a fresh random IV per call and
//! returns hex(iv ‖ ciphertext); decryption splits the IV back off, so
//! round-trips hold under one context for every supported algorithm. The
//! primitives themselves come from the linked OpenSSL library.

use std::sync::{Arc, OnceLock};

use ferry_proto::ParamMap;
use ferry_types::HandleKind;
use openssl::symm::{Cipher, decrypt as symm_decrypt, encrypt as symm_encrypt};
use serde_json::{Value, json};

use super::{NativeState, opt_str, require_str, unknown_function};
use crate::error::BridgeError;
use crate::state::AppState;

/// Supported CBC algorithms. `Rijndael` is an alias the legacy clients use
/// for AES and normalizes away at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Blowfish,
    Aes,
    Des,
    TripleDes,
}

impl CipherAlgorithm {
    fn parse(name: &str) -> Result<Self, BridgeError> {
        match name {
            "Blowfish" => Ok(CipherAlgorithm::Blowfish),
            "AES" | "Rijndael" | "rijndael" | "RIJNDAEL" => Ok(CipherAlgorithm::Aes),
            "DES" => Ok(CipherAlgorithm::Des),
            "3DES" => Ok(CipherAlgorithm::TripleDes),
            other => Err(BridgeError::Execution(format!(
                "unsupported cipher algorithm: {other}. Supported: Blowfish, AES, Rijndael, DES, 3DES"
            ))),
        }
    }

    fn display_name(self) -> &'static str {
        match self {
            CipherAlgorithm::Blowfish => "Blowfish",
            CipherAlgorithm::Aes => "AES",
            CipherAlgorithm::Des => "DES",
            CipherAlgorithm::TripleDes => "3DES",
        }
    }

    /// Size the raw key material to what the algorithm accepts: zero-pad
    /// short keys, truncate long ones. AES picks 128/192/256 by key size.
    fn prepare_key(self, raw: &[u8]) -> Vec<u8> {
        let target = match self {
            CipherAlgorithm::Blowfish => 16,
            CipherAlgorithm::Des => 8,
            CipherAlgorithm::TripleDes => 24,
            CipherAlgorithm::Aes => {
                if raw.len() <= 16 {
                    16
                } else if raw.len() <= 24 {
                    24
                } else {
                    32
                }
            }
        };
        let mut key = raw.to_vec();
        key.resize(target, 0);
        key.truncate(target);
        key
    }

    fn openssl_cipher(self, key_len: usize) -> Cipher {
        match self {
            CipherAlgorithm::Blowfish => Cipher::bf_cbc(),
            CipherAlgorithm::Des => Cipher::des_cbc(),
            CipherAlgorithm::TripleDes => Cipher::des_ede3_cbc(),
            CipherAlgorithm::Aes => match key_len {
                24 => Cipher::aes_192_cbc(),
                32 => Cipher::aes_256_cbc(),
                _ => Cipher::aes_128_cbc(),
            },
        }
    }
}

/// Pooled cipher context
pub struct CipherState {
    pub algorithm: CipherAlgorithm,
    pub key: Vec<u8>,
}

impl CipherState {
    fn cipher(&self) -> Cipher {
        self.algorithm.openssl_cipher(self.key.len())
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            algorithm: CipherAlgorithm::Aes,
            key: CipherAlgorithm::Aes.prepare_key(b"test-key"),
        }
    }
}

/// Entry point for the `crypto` module.
///
/// # Errors
///
/// Handle errors for dead cipher ids, execution errors from the cipher
/// library, invalid-parameter errors for malformed input.
// Uniform handler interface; the other capability modules genuinely await
#[allow(clippy::unused_async)]
pub async fn handle(
    state: &Arc<AppState>,
    function: &str,
    params: &ParamMap,
) -> Result<Value, BridgeError> {
    match function {
        "new" => new_context(state, params),
        "encrypt" => encrypt(state, params),
        "decrypt" => decrypt(state, params),
        "cleanup_cipher" => cleanup_cipher(state, params),
        other => Err(unknown_function("crypto", other)),
    }
}

// Blowfish and single DES live in OpenSSL 3's legacy provider; load it once
// and keep it loaded for the daemon's lifetime. On OpenSSL 1.x the load
// fails harmlessly.
fn ensure_legacy_provider() {
    static LEGACY: OnceLock<()> = OnceLock::new();
    LEGACY.get_or_init(|| {
        if let Ok(provider) = openssl::provider::Provider::try_load(None, "legacy", true) {
            std::mem::forget(provider);
        }
    });
}

fn new_context(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    ensure_legacy_provider();
    let cipher_name = opt_str(params, "cipher")?.unwrap_or("Blowfish");
    let algorithm = CipherAlgorithm::parse(cipher_name)?;

    let raw_key = match (opt_str(params, "key")?, opt_str(params, "key_file")?) {
        (Some(key), _) => decode_key_material(key),
        (None, Some(path)) => {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                BridgeError::Execution(format!("failed to read key from file {path}: {e}"))
            })?;
            decode_key_material(&strip_pem_armor(&pem))
        }
        (None, None) => {
            return Err(BridgeError::InvalidParams(
                "either key or key_file must be provided".to_string(),
            ));
        }
    };

    let key = algorithm.prepare_key(&raw_key);
    let key_length = key.len();
    let payload = NativeState::Cipher(Arc::new(CipherState { algorithm, key }));
    let cipher_id = state.pool.create(HandleKind::CipherContext, payload)?;

    Ok(json!({
        "cipher_id": cipher_id,
        "cipher": algorithm.display_name(),
        "key_length": key_length,
    }))
}

fn encrypt(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let cipher_id = require_str(params, "cipher_id")?;
    let plaintext = require_str(params, "plaintext")?;
    let ctx = cipher_state(state, cipher_id)?;

    let cipher = ctx.cipher();
    let mut iv = vec![0u8; cipher.iv_len().unwrap_or(0)];
    openssl::rand::rand_bytes(&mut iv)?;

    let ciphertext = symm_encrypt(cipher, &ctx.key, Some(&iv), plaintext.as_bytes())?;
    let mut packed = iv;
    packed.extend_from_slice(&ciphertext);
    let encrypted = hex::encode(packed);

    state.pool.touch(cipher_id);
    Ok(json!({
        "encrypted": encrypted,
        "length": encrypted.len(),
        "algorithm": ctx.algorithm.display_name(),
    }))
}

fn decrypt(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let cipher_id = require_str(params, "cipher_id")?;
    let hex_ciphertext = require_str(params, "hex_ciphertext")?;
    let ctx = cipher_state(state, cipher_id)?;

    let packed = hex::decode(hex_ciphertext)
        .map_err(|e| BridgeError::Execution(format!("invalid hex input: {e}")))?;

    let cipher = ctx.cipher();
    let iv_len = cipher.iv_len().unwrap_or(0);
    if packed.len() < iv_len {
        return Err(BridgeError::Execution(format!(
            "ciphertext too short: {} bytes, need at least {iv_len} for the IV",
            packed.len()
        )));
    }
    let (iv, ciphertext) = packed.split_at(iv_len);

    let decrypted_bytes = symm_decrypt(cipher, &ctx.key, Some(iv), ciphertext)
        .map_err(|e| BridgeError::Execution(format!("decryption failed: {e}")))?;
    let decrypted = String::from_utf8_lossy(&decrypted_bytes).into_owned();

    state.pool.touch(cipher_id);
    Ok(json!({
        "decrypted": decrypted,
        "length": decrypted.len(),
        "algorithm": ctx.algorithm.display_name(),
    }))
}

fn cleanup_cipher(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let cipher_id = require_str(params, "cipher_id")?;
    state.pool.get_kind(cipher_id, HandleKind::CipherContext)?;
    state.pool.remove(cipher_id)?;
    Ok(json!({ "removed": cipher_id }))
}

fn cipher_state(state: &Arc<AppState>, id: &str) -> Result<Arc<CipherState>, BridgeError> {
    match state.pool.get_kind(id, HandleKind::CipherContext)? {
        NativeState::Cipher(ctx) => Ok(ctx),
        _ => Err(BridgeError::Internal(format!(
            "handle {id} tagged cipher-context holds foreign state"
        ))),
    }
}

/// Keys arrive base64 (PEM material), hex, or raw; detect in that order.
fn decode_key_material(key: &str) -> Vec<u8> {
    let trimmed = key.trim();
    if let Ok(decoded) = openssl::base64::decode_block(trimmed) {
        return decoded;
    }
    if let Ok(decoded) = hex::decode(trimmed) {
        return decoded;
    }
    trimmed.as_bytes().to_vec()
}

fn strip_pem_armor(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("")
}
