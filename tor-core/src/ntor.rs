//! The ntor circuit-extension handshake (CREATE2/CREATED2, handshake
//! type 0x0002): Curve25519 DH plus an HMAC-SHA256 KDF, per the spec's
//! `"ntor-curve25519-sha256-1"` protocol id.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::crypto::{hkdf_sha256_expand, hmac_sha256, x25519_base_point_mul, x25519_derive, CryptoProvider};
use crate::error::{Result, TorError};

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";

fn tagged(tag: &str) -> Vec<u8> {
    let mut out = PROTOID.to_vec();
    out.extend_from_slice(tag.as_bytes());
    out
}

/// Client-side handshake state between sending CREATE2 and receiving
/// CREATED2.
pub struct ClientHandshake {
    x_private: StaticSecret,
    x_public: X25519Public,
}

/// Key material derived from a completed ntor handshake, expanded per
/// spec step 7: forward-digest seed, backward-digest seed, forward key,
/// backward key.
pub struct NtorKeys {
    pub forward_digest_seed: [u8; 20],
    pub backward_digest_seed: [u8; 20],
    pub forward_key: [u8; 16],
    pub backward_key: [u8; 16],
}

impl ClientHandshake {
    pub fn new(crypto: &dyn CryptoProvider) -> Self {
        let (x_private, x_public) = crypto.x25519_keypair();
        Self { x_private, x_public }
    }

    /// The CREATE2 payload: `server-identity ‖ server-ntor-key ‖ X`.
    pub fn create2_payload(&self, server_identity: &[u8; 20], server_ntor_key: &[u8; 32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + 32 + 32);
        out.extend_from_slice(server_identity);
        out.extend_from_slice(server_ntor_key);
        out.extend_from_slice(self.x_public.as_bytes());
        out
    }

    /// Completes the handshake from a CREATED2 payload (`Y ‖ auth`),
    /// given the relay's identity fingerprint and long-term ntor key
    /// (matching what was sent in CREATE2).
    pub fn complete(
        self,
        created2_payload: &[u8],
        server_identity: &[u8; 20],
        server_ntor_key: &[u8; 32],
    ) -> Result<NtorKeys> {
        if created2_payload.len() != 64 {
            return Err(TorError::protocol("CREATED2 payload must be 64 bytes"));
        }
        let y_bytes: [u8; 32] = created2_payload[0..32].try_into().unwrap();
        let auth: [u8; 32] = created2_payload[32..64].try_into().unwrap();

        let exp_y_x = x25519_derive(&self.x_private, &y_bytes)?;
        let exp_b_x = x25519_derive(&self.x_private, server_ntor_key)?;

        let x_bytes = self.x_public.to_bytes();

        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
        secret_input.extend_from_slice(&exp_y_x);
        secret_input.extend_from_slice(&exp_b_x);
        secret_input.extend_from_slice(server_identity);
        secret_input.extend_from_slice(server_ntor_key);
        secret_input.extend_from_slice(&x_bytes);
        secret_input.extend_from_slice(&y_bytes);
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_sha256(&tagged(":key_extract"), &secret_input);
        let verify = hmac_sha256(&tagged(":verify"), &secret_input);

        let mut auth_input = Vec::with_capacity(32 + 20 + 32 * 3 + PROTOID.len() + b"Server".len());
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(server_identity);
        auth_input.extend_from_slice(server_ntor_key);
        auth_input.extend_from_slice(&y_bytes);
        auth_input.extend_from_slice(&x_bytes);
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let expected_auth = hmac_sha256(&tagged(":mac"), &auth_input);
        if !constant_time_eq(&expected_auth, &auth) {
            return Err(TorError::crypto("ntor auth mismatch"));
        }

        let mut expanded = [0u8; 72];
        hkdf_sha256_expand(&key_seed, &tagged(":key_expand"), &mut expanded);

        Ok(NtorKeys {
            forward_digest_seed: expanded[0..20].try_into().unwrap(),
            backward_digest_seed: expanded[20..40].try_into().unwrap(),
            forward_key: expanded[40..56].try_into().unwrap(),
            backward_key: expanded[56..72].try_into().unwrap(),
        })
    }
}

/// Exposed for tests that want the client's own public key without
/// consuming the handshake (e.g. to build a server-side responder).
impl ClientHandshake {
    pub fn public_key(&self) -> [u8; 32] {
        self.x_public.to_bytes()
    }
}

pub fn base_point_mul(private: &StaticSecret) -> [u8; 32] {
    x25519_base_point_mul(private)
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SystemCryptoProvider;
    use rand_core::OsRng;

    /// A minimal server-side responder used only to exercise the client
    /// handshake end-to-end in tests; production code never plays the
    /// server role.
    fn server_respond(
        client_x_public: &X25519Public,
        server_identity: &[u8; 20],
        server_ntor_secret: &StaticSecret,
        server_ntor_public: &[u8; 32],
    ) -> ([u8; 32], [u8; 32]) {
        use rand_core::RngCore;
        let mut y_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut y_bytes);
        let y_private = StaticSecret::from(y_bytes);
        let y_public = X25519Public::from(&y_private);

        let exp_x_y = y_private.diffie_hellman(client_x_public).to_bytes();
        let exp_x_b = server_ntor_secret.diffie_hellman(client_x_public).to_bytes();

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(&exp_x_y);
        secret_input.extend_from_slice(&exp_x_b);
        secret_input.extend_from_slice(server_identity);
        secret_input.extend_from_slice(server_ntor_public);
        secret_input.extend_from_slice(client_x_public.as_bytes());
        secret_input.extend_from_slice(y_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let verify = hmac_sha256(&tagged(":verify"), &secret_input);
        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(server_identity);
        auth_input.extend_from_slice(server_ntor_public);
        auth_input.extend_from_slice(y_public.as_bytes());
        auth_input.extend_from_slice(client_x_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let auth = hmac_sha256(&tagged(":mac"), &auth_input);

        (y_public.to_bytes(), auth)
    }

    #[test]
    fn handshake_succeeds_with_matching_server() {
        let crypto = SystemCryptoProvider;
        let client = ClientHandshake::new(&crypto);
        let client_pub = X25519Public::from(client.public_key());

        let mut id_bytes = [0u8; 20];
        id_bytes[0] = 0x42;
        let (server_secret, server_public) = {
            use rand_core::RngCore;
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            let secret = StaticSecret::from(bytes);
            let public = X25519Public::from(&secret).to_bytes();
            (secret, public)
        };

        let (y, auth) = server_respond(&client_pub, &id_bytes, &server_secret, &server_public);
        let mut created2 = Vec::with_capacity(64);
        created2.extend_from_slice(&y);
        created2.extend_from_slice(&auth);

        let keys = client.complete(&created2, &id_bytes, &server_public).unwrap();
        assert_ne!(keys.forward_key, [0u8; 16]);
        assert_ne!(keys.forward_key, keys.backward_key);
    }

    #[test]
    fn handshake_rejects_tampered_auth() {
        let crypto = SystemCryptoProvider;
        let client = ClientHandshake::new(&crypto);
        let client_pub = X25519Public::from(client.public_key());

        let id_bytes = [0x11u8; 20];
        let (server_secret, server_public) = {
            use rand_core::RngCore;
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            let secret = StaticSecret::from(bytes);
            let public = X25519Public::from(&secret).to_bytes();
            (secret, public)
        };

        let (y, mut auth) = server_respond(&client_pub, &id_bytes, &server_secret, &server_public);
        auth[0] ^= 0xFF;
        let mut created2 = Vec::with_capacity(64);
        created2.extend_from_slice(&y);
        created2.extend_from_slice(&auth);

        assert!(client.complete(&created2, &id_bytes, &server_public).is_err());
    }
}
