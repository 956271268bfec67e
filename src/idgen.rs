//! Key generation, signing, and miscellaneous id helpers: the relay's own
//! keypair, invite codes, short content fingerprints.

use secp256k1::hashes::sha256;
use secp256k1::hashes::Hash as HashTrait;
use secp256k1::{Keypair, Message, Secp256k1, SecretKey};

/// Generate a fresh secp256k1 keypair, returning `(secret_hex, xonly_pubkey_hex)`.
pub fn generate_keypair() -> (String, String) {
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();
    let (sk, _pk) = secp.generate_keypair(&mut rng);
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = keypair.x_only_public_key();
    (hex::encode(sk.secret_bytes()), hex::encode(xonly.serialize()))
}

/// Sign a 32-byte hex digest (typically an event id) with a hex-encoded secret key.
pub fn sign(secret_hex: &str, digest_hex: &str) -> String {
    let secp = Secp256k1::new();
    let sk_bytes = hex::decode(secret_hex).expect("valid secret hex");
    let sk = SecretKey::from_slice(&sk_bytes).expect("valid secret key");
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let digest = hex::decode(digest_hex).expect("valid digest hex");
    let msg = Message::from_digest_slice(&digest).expect("32-byte digest");
    let sig = secp.sign_schnorr(&msg, &keypair);
    hex::encode(sig.as_ref())
}

/// The relay's own long-lived keypair, generated once at startup if absent
/// from the environment.
pub struct RelayIdentity {
    pub secret_hex: String,
    pub pubkey_hex: String,
}

impl RelayIdentity {
    pub fn load_or_generate(env_secret: Option<&str>) -> Self {
        if let Some(secret_hex) = env_secret {
            let secp = Secp256k1::new();
            if let Ok(bytes) = hex::decode(secret_hex) {
                if let Ok(sk) = SecretKey::from_slice(&bytes) {
                    let keypair = Keypair::from_secret_key(&secp, &sk);
                    let (xonly, _) = keypair.x_only_public_key();
                    return Self {
                        secret_hex: secret_hex.to_string(),
                        pubkey_hex: hex::encode(xonly.serialize()),
                    };
                }
            }
        }
        let (secret_hex, pubkey_hex) = generate_keypair();
        Self { secret_hex, pubkey_hex }
    }
}

/// A single-use code a prospective member redeems to join a closed group.
pub fn generate_invite_code() -> String {
    nanoid::nanoid!()
}

/// A stable, content-derived hash used where a short fingerprint is wanted
/// (e.g. log correlation), not a security boundary.
pub fn short_digest(s: &str) -> String {
    let digest = sha256::Hash::hash(s.as_bytes());
    hex::encode(&digest.as_byte_array()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypair_signs_and_verifies() {
        let (sk, pk) = generate_keypair();
        let digest = "a".repeat(64);
        let sig = sign(&sk, &digest);
        let event = crate::model::Event {
            id: digest,
            pubkey: pk,
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig,
        };
        assert!(event.verify_signature().is_ok());
    }
}
