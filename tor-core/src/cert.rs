//! Tor's native Ed25519Cert format and the RSA→Ed25519 cross-certification
//! chain carried in a `CERTS` cell.

use rsa::RsaPublicKey;

use crate::crypto::{ed25519_verify, rsa_verify_unprefixed, sha256};
use crate::cursor::Reader;
use crate::error::{Result, TorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertType {
    EdToSign = 4,
    SignToTls = 5,
    SignToAuth = 6,
}

impl CertType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            4 => Self::EdToSign,
            5 => Self::SignToTls,
            6 => Self::SignToAuth,
            _ => return None,
        })
    }
}

/// Extension type `signed-with-ed25519-key` (0x04): carries the signer's
/// public key when the signature is not verifiable from the cert-key
/// alone.
const EXT_SIGNED_WITH_ED25519_KEY: u8 = 0x04;
const EXT_FLAG_AFFECTS_VALIDATION: u8 = 0x01;

pub struct Extension {
    pub ext_type: u8,
    pub flags: u8,
    pub data: Vec<u8>,
}

pub struct Ed25519Cert {
    pub cert_type: CertType,
    pub version: u8,
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub cert_key: [u8; 32],
    pub extensions: Vec<Extension>,
    /// The cert body minus the trailing signature: everything the
    /// signature is computed over.
    pub payload: Vec<u8>,
    pub signature: [u8; 64],
}

impl Ed25519Cert {
    /// Parses the Tor cert wire format: version(1) cert-type(1)
    /// expiration-hours(4) cert-key-type(1) cert-key(32) n-extensions(1)
    /// {ext-length(2) ext-type(1) ext-flags(1) ext-data(ext-length)}*
    /// signature(64).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let version = r.read_u8()?;
        if version != 1 {
            return Err(TorError::parse(format!("unsupported Ed25519Cert version {version}")));
        }
        let cert_type_byte = r.read_u8()?;
        let cert_type = CertType::from_u8(cert_type_byte)
            .ok_or_else(|| TorError::parse(format!("unknown cert type {cert_type_byte}")))?;
        let expiration_hours = r.read_u32()?;
        let cert_key_type = r.read_u8()?;
        let cert_key_bytes = r.read_bytes(32)?;
        let cert_key: [u8; 32] = cert_key_bytes.try_into().unwrap();

        let body_start = 0;
        let n_extensions = r.read_u8()?;
        let mut extensions = Vec::with_capacity(n_extensions as usize);
        for _ in 0..n_extensions {
            let ext_len = r.read_u16()? as usize;
            let ext_type = r.read_u8()?;
            let flags = r.read_u8()?;
            let ext_data = r.read_bytes(ext_len)?.to_vec();
            if flags & EXT_FLAG_AFFECTS_VALIDATION != 0 && ext_type != EXT_SIGNED_WITH_ED25519_KEY {
                return Err(TorError::protocol(format!(
                    "unknown extension type {ext_type} with AFFECTS_VALIDATION set"
                )));
            }
            extensions.push(Extension {
                ext_type,
                flags,
                data: ext_data,
            });
        }

        let payload_end = r.pos();
        let signature_bytes = r.read_bytes(64)?;
        let signature: [u8; 64] = signature_bytes.try_into().unwrap();

        Ok(Self {
            cert_type,
            version,
            expiration_hours,
            cert_key_type,
            cert_key,
            extensions,
            payload: data[body_start..payload_end].to_vec(),
            signature,
        })
    }

    /// Hours-since-epoch `now` must not exceed `expiration_hours`.
    pub fn is_expired(&self, now_hours_since_epoch: u32) -> bool {
        now_hours_since_epoch > self.expiration_hours
    }

    /// The signer key embedded via the `signed-with-ed25519-key`
    /// extension, if present.
    pub fn signer_key(&self) -> Option<[u8; 32]> {
        self.extensions
            .iter()
            .find(|e| e.ext_type == EXT_SIGNED_WITH_ED25519_KEY && e.data.len() == 32)
            .map(|e| e.data[..32].try_into().unwrap())
    }

    pub fn verify_signature(&self, signer_public_key: &[u8; 32]) -> bool {
        ed25519_verify(signer_public_key, &self.payload, &self.signature)
    }
}

/// Verifies the full RSA→Ed25519→TLS chain described in a CERTS cell,
/// per spec 4.4 steps 1-5. `tls_leaf_spki` is the SPKI bytes of the TLS
/// peer certificate actually presented on the link.
pub fn verify_cross_cert_chain(
    rsa_identity_key: &RsaPublicKey,
    cross_cert_payload: &[u8],
    cross_cert_signature: &[u8],
    ed_to_sign: &Ed25519Cert,
    sign_to_tls: &Ed25519Cert,
    tls_leaf_spki: Option<&[u8]>,
    now_hours_since_epoch: u32,
) -> Result<()> {
    for cert in [ed_to_sign, sign_to_tls] {
        if cert.is_expired(now_hours_since_epoch) {
            return Err(TorError::Expired("Ed25519 cert past expiration".into()));
        }
    }

    // Step 3: cross-cert payload is the fixed 32-byte Ed key + 4-byte
    // expiration, signed unprefixed-PKCS1.5-SHA256 by the RSA identity key.
    let digest = sha256(cross_cert_payload);
    if !rsa_verify_unprefixed(rsa_identity_key, &digest, cross_cert_signature) {
        return Err(TorError::crypto("RSA cross-cert signature invalid"));
    }
    if cross_cert_payload.len() < 32 {
        return Err(TorError::parse("cross-cert payload too short"));
    }
    let rsa_certified_ed_identity: [u8; 32] = cross_cert_payload[0..32].try_into().unwrap();

    // Step 4: ED_TO_SIGN is signed by the RSA-certified identity key.
    if !ed_to_sign.verify_signature(&rsa_certified_ed_identity) {
        return Err(TorError::crypto("ED_TO_SIGN signature invalid"));
    }

    // Step 5: SIGN_TO_TLS is signed by ED_TO_SIGN's cert-key, and its
    // own cert-key must equal SHA-256 of the TLS leaf's SPKI.
    if !sign_to_tls.verify_signature(&ed_to_sign.cert_key) {
        return Err(TorError::crypto("SIGN_TO_TLS signature invalid"));
    }
    match tls_leaf_spki {
        Some(spki) => {
            let spki_hash = sha256(spki);
            if sign_to_tls.cert_key != spki_hash {
                return Err(TorError::crypto("SIGN_TO_TLS cert-key does not match TLS leaf SPKI"));
            }
        }
        None => {
            log::warn!("no TLS leaf SPKI available, skipping SIGN_TO_TLS leaf-match check");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;

    fn build_cert_bytes(cert_type: u8, cert_key: [u8; 32], expiration_hours: u32, signing_key: &SigningKey) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(1); // version
        body.push(cert_type);
        body.extend_from_slice(&expiration_hours.to_be_bytes());
        body.push(1); // cert-key-type
        body.extend_from_slice(&cert_key);
        body.push(1); // n-extensions
        let signer_pub = signing_key.verifying_key().to_bytes();
        body.extend_from_slice(&(signer_pub.len() as u16).to_be_bytes());
        body.push(EXT_SIGNED_WITH_ED25519_KEY);
        body.push(0); // flags
        body.extend_from_slice(&signer_pub);

        let signature = signing_key.sign(&body);
        body.extend_from_slice(&signature.to_bytes());
        body
    }

    #[test]
    fn parses_ed_to_sign_cert_shape() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let cert_key = [0x77u8; 32];
        let bytes = build_cert_bytes(4, cert_key, 500_000, &signing_key);

        let cert = Ed25519Cert::parse(&bytes).unwrap();
        assert_eq!(cert.cert_type, CertType::EdToSign);
        assert_eq!(cert.version, 1);
        assert_eq!(cert.cert_key_type, 1);
        assert_eq!(cert.cert_key.len(), 32);
        assert_eq!(cert.signature.len(), 64);
        assert_eq!(cert.signer_key().unwrap().len(), 32);
    }

    #[test]
    fn rejects_unknown_extension_with_affects_validation() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut bytes = build_cert_bytes(4, [0u8; 32], 1, &signing_key);
        // Layout: version(1) type(1) expiration(4) key-type(1) key(32)
        // n-ext(1) ext-len(2) ext-type(1) @42 flags(1) @43 ext-data...
        bytes[42] = 0xEE; // unknown ext type
        bytes[43] = EXT_FLAG_AFFECTS_VALIDATION;
        assert!(Ed25519Cert::parse(&bytes).is_err());
    }

    #[test]
    fn verify_signature_detects_tamper() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let bytes = build_cert_bytes(4, [1u8; 32], 999_999, &signing_key);
        let cert = Ed25519Cert::parse(&bytes).unwrap();
        let signer = signing_key.verifying_key().to_bytes();
        assert!(cert.verify_signature(&signer));

        let mut wrong_signer = signer;
        wrong_signer[0] ^= 0xFF;
        assert!(!cert.verify_signature(&wrong_signer));
    }

    #[test]
    fn expiration_check() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let bytes = build_cert_bytes(4, [1u8; 32], 1000, &signing_key);
        let cert = Ed25519Cert::parse(&bytes).unwrap();
        assert!(!cert.is_expired(999));
        assert!(!cert.is_expired(1000));
        assert!(cert.is_expired(1001));
    }
}
