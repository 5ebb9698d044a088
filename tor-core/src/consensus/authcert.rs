//! Directory-authority certificate documents (`dir-key-certificate-3`):
//! supplies the signing `RsaPublicKey`s that [`super::verify`] checks
//! consensus signatures against.
//!
//! Each certificate carries its keys PEM-armoured but DER-encoded as a
//! bare PKCS#1 `RSAPublicKey` (`SEQUENCE { INTEGER n, INTEGER e }`), not
//! a full X.509 `SubjectPublicKeyInfo` — parsing that one small,
//! fixed-shape SEQUENCE is in scope even though generic X.509 is not.

use std::collections::HashMap;

use num_bigint_dig::BigUint;
use rsa::RsaPublicKey;

use crate::crypto::sha1;
use crate::cursor::Reader;
use crate::error::{Result, TorError};

const SEQUENCE_TAG: u8 = 0x30;
const INTEGER_TAG: u8 = 0x02;

fn read_der_integer(r: &mut Reader) -> Result<BigUint> {
    let tag = r.read_u8()?;
    if tag != INTEGER_TAG {
        return Err(TorError::parse(format!("expected DER INTEGER, got tag {tag:#x}")));
    }
    let (len, _) = r.read_der_length()?;
    let bytes = r.read_bytes(len)?;
    Ok(BigUint::from_bytes_be(bytes))
}

/// Parses a bare PKCS#1 `RSAPublicKey` DER SEQUENCE (not a full
/// `SubjectPublicKeyInfo`) and returns both the key and the exact DER
/// bytes it spanned, since the key fingerprint is the SHA-1 of those
/// bytes.
fn parse_pkcs1_rsa_public_key(der: &[u8]) -> Result<(RsaPublicKey, &[u8])> {
    let mut r = Reader::new(der);
    let tag = r.read_u8()?;
    if tag != SEQUENCE_TAG {
        return Err(TorError::parse(format!("expected DER SEQUENCE, got tag {tag:#x}")));
    }
    let (seq_len, len_width) = r.read_der_length()?;
    let seq_start = 1 + len_width;
    let seq_bytes = r.read_bytes(seq_len)?;

    let mut inner = Reader::new(seq_bytes);
    let n = read_der_integer(&mut inner)?;
    let e = read_der_integer(&mut inner)?;

    let key = RsaPublicKey::new(n, e).map_err(|err| TorError::parse(format!("bad RSA public key: {err}")))?;
    let whole = &der[..seq_start + seq_len];
    Ok((key, whole))
}

fn strip_pem_armour(body: &str) -> Result<Vec<u8>> {
    let start = body
        .find("-----BEGIN RSA PUBLIC KEY-----")
        .ok_or_else(|| TorError::parse("missing RSA PUBLIC KEY armour"))?;
    let after_begin = &body[start..];
    let content_start = after_begin
        .find('\n')
        .map(|i| i + 1)
        .ok_or_else(|| TorError::parse("malformed PEM armour"))?;
    let end = after_begin
        .find("-----END RSA PUBLIC KEY-----")
        .ok_or_else(|| TorError::parse("missing RSA PUBLIC KEY end armour"))?;
    let b64: String = after_begin[content_start..end].split_whitespace().collect();
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &b64)
        .map_err(|e| TorError::parse(format!("bad base64 in key armour: {e}")))
}

/// One authority's published signing key, with its fingerprint computed
/// the way directory documents reference it: uppercase hex SHA-1 of the
/// key's DER encoding.
pub struct AuthoritySigningKey {
    pub fingerprint: String,
    pub key: RsaPublicKey,
}

fn fingerprint_of(der: &[u8]) -> String {
    sha1(der).iter().map(|b| format!("{b:02X}")).collect()
}

/// Parses one `dir-key-certificate-3` document and extracts its
/// `dir-signing-key` (the key consensus signatures are made with; the
/// longer-lived `dir-identity-key` only certifies this one).
pub fn parse_authority_certificate(document: &str) -> Result<AuthoritySigningKey> {
    let marker = "dir-signing-key";
    let idx = document
        .find(marker)
        .ok_or_else(|| TorError::parse("missing dir-signing-key"))?;
    let der = strip_pem_armour(&document[idx..])?;
    let (key, der_bytes) = parse_pkcs1_rsa_public_key(&der)?;
    Ok(AuthoritySigningKey { fingerprint: fingerprint_of(der_bytes), key })
}

/// Parses a `/tor/keys/all`-style concatenation of certificate documents
/// into a fingerprint -> signing key map, skipping (and logging) any
/// individual certificate that fails to parse rather than failing the
/// whole fetch.
pub fn parse_all_authority_certificates(document: &str) -> HashMap<String, RsaPublicKey> {
    let mut out = HashMap::new();
    for block in document.split("dir-key-certificate-version").skip(1) {
        match parse_authority_certificate(block) {
            Ok(signing_key) => {
                out.insert(signing_key.fingerprint, signing_key.key);
            }
            Err(e) => {
                log::warn!("skipping unparseable authority certificate: {e}");
            }
        }
    }
    out
}
