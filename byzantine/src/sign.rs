//! # Summary
//!
//! Signature plumbing for the signed-messages Byzantine variant:
//! canonical JSON encoding, nonce generation, and sign/verify helpers.
//! Replaces the original's PyNaCl-based signing with `ed25519-dalek`,
//! the Ed25519 implementation already precedented elsewhere in this
//! workspace's dependency pack.

use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serializes `value` with sorted object keys and no extraneous
/// whitespace. `serde_json::Value`'s default `Map` is key-sorted (this
/// crate does not enable the `preserve_order` feature), so a plain
/// compact `to_string` already matches the original's
/// `json.dumps(sort_keys=True, separators=(",", ":"))`.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).expect("[INTERNAL ERROR]: json values are always serializable")
}

pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

/// A signed message as it travels over the wire: the payload plus who
/// signed it, a nonce guarding against replay within a round, and the
/// signature covering `payload`, `signer`, and `nonce` together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signed {
    pub payload: Value,
    pub signer: usize,
    pub nonce: String,
    pub signature: String,
}

fn signing_bytes(payload: &Value, signer: usize, nonce: &str) -> Vec<u8> {
    let envelope = serde_json::json!({ "payload": payload, "signer": signer, "nonce": nonce });
    canonical_json(&envelope).into_bytes()
}

pub fn sign(keypair: &Keypair, signer: usize, payload: Value) -> Signed {
    let nonce = generate_nonce();
    let bytes = signing_bytes(&payload, signer, &nonce);
    let signature = keypair.sign(&bytes);
    Signed { payload, signer, nonce, signature: base64::encode(signature.to_bytes()) }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("signature is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed signature bytes")]
    BadSignature,
    #[error("signature does not verify")]
    Invalid,
}

pub fn verify(public_key: &PublicKey, signed: &Signed) -> Result<(), VerifyError> {
    let bytes = signing_bytes(&signed.payload, signed.signer, &signed.nonce);
    let raw = base64::decode(&signed.signature)?;
    let signature = Signature::from_bytes(&raw).map_err(|_| VerifyError::BadSignature)?;
    public_key.verify(&bytes, &signature).map_err(|_| VerifyError::Invalid)
}
