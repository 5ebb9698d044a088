//! Cryptographic primitives behind a constructor-injected provider trait,
//! so handshake code can be tested against fixed key material instead of
//! the OS RNG.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rsa::pkcs1v15;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{Result, TorError};

pub type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Injected source of randomness and crypto operations. Production code
/// uses `SystemCryptoProvider`; tests construct providers from fixed
/// bytes to get deterministic handshakes.
pub trait CryptoProvider {
    fn random_bytes(&self, out: &mut [u8]);

    fn x25519_keypair(&self) -> (StaticSecret, X25519Public) {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret);
        (secret, public)
    }
}

pub struct SystemCryptoProvider;

impl CryptoProvider for SystemCryptoProvider {
    fn random_bytes(&self, out: &mut [u8]) {
        use rand_core::RngCore;
        rand_core::OsRng.fill_bytes(out);
    }
}

/// Verifies an Ed25519 signature. Never panics on malformed input.
pub fn ed25519_verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let sig = EdSignature::from_bytes(&sig_bytes);
    vk.verify(message, &sig).is_ok()
}

/// X25519 scalar multiplication against a peer public key. Rejects the
/// all-zero output (small-subgroup contribution).
pub fn x25519_derive(private: &StaticSecret, peer_public: &[u8; 32]) -> Result<[u8; 32]> {
    let peer = X25519Public::from(*peer_public);
    let shared = private.diffie_hellman(&peer);
    let bytes = shared.to_bytes();
    if bytes == [0u8; 32] {
        return Err(TorError::crypto("x25519: all-zero shared secret"));
    }
    Ok(bytes)
}

pub fn x25519_base_point_mul(private: &StaticSecret) -> [u8; 32] {
    X25519Public::from(private).to_bytes()
}

/// RSASSA-PKCS1-v1_5 verify over SHA-256, with the standard DigestInfo
/// prefix (as produced by common RSA libraries).
pub fn rsa_verify_prefixed_sha256(public_key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    let scheme = pkcs1v15::Pkcs1v15Sign::new::<Sha256>();
    public_key.verify(scheme, &digest, signature).is_ok()
}

/// RSA PKCS#1-v1.5 verify on a raw digest with no DigestInfo prefix:
/// decrypt `signature` with the public exponent and check the padded
/// block is `0x00 0x01 {0xFF}*(>=8) 0x00 digest`.
pub fn rsa_verify_unprefixed(public_key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> bool {
    use num_bigint_dig::BigUint;

    let modulus = public_key.n();
    let exponent = public_key.e();
    let k = modulus.to_bytes_be().len();
    if signature.len() != k {
        return false;
    }

    let c = BigUint::from_bytes_be(signature);
    if &c >= modulus {
        return false;
    }
    let m = c.modpow(exponent, modulus);
    let mut block = m.to_bytes_be();
    if block.len() < k {
        let mut padded = vec![0u8; k - block.len()];
        padded.extend_from_slice(&block);
        block = padded;
    }

    if block.len() != k || block[0] != 0x00 || block[1] != 0x01 {
        return false;
    }
    let mut i = 2;
    while i < block.len() && block[i] == 0xFF {
        i += 1;
    }
    let ff_run = i - 2;
    if ff_run < 8 || i >= block.len() || block[i] != 0x00 {
        return false;
    }
    let payload = &block[i + 1..];
    payload == digest
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let digest = Sha1::digest(data);
    digest.into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    Sha3_256::digest(data).into()
}

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// HKDF-SHA256 expand-only, into `out.len()` bytes of key material.
pub fn hkdf_sha256_expand(pseudorandom_key: &[u8], info: &[u8], out: &mut [u8]) {
    let hk = hkdf::Hkdf::<Sha256>::from_prk(pseudorandom_key).expect("PRK length valid for SHA-256");
    hk.expand(info, out).expect("output length within HKDF bounds");
}

/// Wraps AES-128-CTR with an explicit IV, used as the cell-payload stream
/// cipher. Keeps persistent cipher state across calls so callers can
/// maintain a running keystream across many cells.
pub struct CellCipher {
    cipher: Aes128Ctr,
}

impl CellCipher {
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128Ctr::new(key.into(), iv.into()),
        }
    }

    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_derive_matches_known_vector() {
        // RFC 7748 test vector (scalar, u-coordinate) -> shared secret.
        let priv_bytes = hex_decode("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac");
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&priv_bytes);
        let secret = StaticSecret::from(pk);

        let peer_bytes = hex_decode("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4");
        let mut peer = [0u8; 32];
        peer.copy_from_slice(&peer_bytes);

        let shared = x25519_derive(&secret, &peer).unwrap();
        let expected = hex_decode("c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a2826");
        assert_eq!(shared.to_vec(), expected);
    }

    #[test]
    fn x25519_derive_rejects_all_zero_output() {
        // A low-order peer point forces an all-zero shared secret under
        // any private scalar.
        let low_order_point = [0u8; 32];
        let mut pk = [1u8; 32];
        pk[0] &= 248;
        pk[31] &= 127;
        pk[31] |= 64;
        let secret = StaticSecret::from(pk);
        assert!(x25519_derive(&secret, &low_order_point).is_err());
    }

    #[test]
    fn ed25519_verify_rejects_malformed_without_panicking() {
        assert!(!ed25519_verify(&[0u8; 32], b"hello", &[0u8; 63]));
        assert!(!ed25519_verify(&[0xFFu8; 32], b"hello", &[0u8; 64]));
    }

    #[test]
    fn aes_ctr_roundtrips() {
        let key = [0x42u8; 16];
        let iv = [0x01u8; 16];
        let mut enc = CellCipher::new(&key, &iv);
        let mut dec = CellCipher::new(&key, &iv);
        let mut data = b"the quick brown fox jumps".to_vec();
        let original = data.clone();
        enc.apply_keystream(&mut data);
        assert_ne!(data, original);
        dec.apply_keystream(&mut data);
        assert_eq!(data, original);
    }

    fn hex_decode(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn rsa_unprefixed_verify_flips_to_false_on_bit_flip() {
        use rand::rngs::OsRng;
        use rsa::RsaPrivateKey;

        let mut rng = OsRng;
        let priv_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pub_key = RsaPublicKey::from(&priv_key);

        let digest = sha256(b"directory-signature payload");
        let scheme = pkcs1v15::Pkcs1v15Sign::new_unprefixed();
        let sig = priv_key.sign(scheme.clone(), &digest).unwrap();

        assert!(rsa_verify_unprefixed(&pub_key, &digest, &sig));

        let mut bad_digest = digest;
        bad_digest[0] ^= 0x01;
        assert!(!rsa_verify_unprefixed(&pub_key, &bad_digest, &sig));

        let mut bad_sig = sig.clone();
        bad_sig[0] ^= 0x01;
        assert!(!rsa_verify_unprefixed(&pub_key, &digest, &bad_sig));
    }
}
