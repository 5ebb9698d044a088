//! Directory-authority signature verification: strict-majority
//! acceptance over unprefixed PKCS#1-v1.5-over-SHA-256 signatures on the
//! consensus's signed preimage.

use rsa::RsaPublicKey;

use crate::crypto::{rsa_verify_unprefixed, sha1, sha256};
use crate::error::{Result, TorError};

/// A known directory authority: identity fingerprint and v3 signing key
/// fingerprint, keyed by nickname. Real fingerprints, current as of this
/// codebase's consensus format.
pub struct DirectoryAuthority {
    pub nickname: &'static str,
    pub v3ident: &'static str,
}

pub const DIRECTORY_AUTHORITIES: &[DirectoryAuthority] = &[
    DirectoryAuthority { nickname: "moria1", v3ident: "D586D18309DED4CD6D57C18FDB97EFA96D330566" },
    DirectoryAuthority { nickname: "tor26", v3ident: "14C131DFC5C6F93646BE72FA1401C02A8DF2E8B4" },
    DirectoryAuthority { nickname: "dizum", v3ident: "E8A9C45EDE6D711294FADF8E7951F4DE6CA56B58" },
    DirectoryAuthority { nickname: "gabelmoo", v3ident: "ED03BB616EB2F60BEC80151114BB25CEF515B226" },
    DirectoryAuthority { nickname: "dannenberg", v3ident: "0232AF901C31A04EE9848595AF9BB7620D4C5B2E" },
    DirectoryAuthority { nickname: "maatuska", v3ident: "49015F787433103580E3B66A1707A00E60F2D15B" },
    DirectoryAuthority { nickname: "Faravahar", v3ident: "EFCBE720AB3A82B99F9E953CD5BF50F7EEFC7B97" },
    DirectoryAuthority { nickname: "longclaw", v3ident: "23D15D965BC35114467363C165C4F724B64B4F66" },
    DirectoryAuthority { nickname: "bastet", v3ident: "27102BC123E7AF1D4741AE047E160C91ADC76B21" },
];

pub struct DirectorySignature {
    pub algorithm: String,
    pub identity_fingerprint: String,
    pub signing_key_fingerprint: String,
    pub signature: Vec<u8>,
}

/// Locates the byte range from the start of the document through the
/// literal `directory-signature ` (inclusive of the trailing space) that
/// opens the first signature block.
pub fn signed_preimage(document: &str) -> Result<&str> {
    let marker = "directory-signature ";
    match document.find(marker) {
        Some(idx) => Ok(&document[..idx + marker.len()]),
        None => Err(TorError::parse("document has no directory-signature marker")),
    }
}

/// Parses every `directory-signature` block in the document's footer.
pub fn parse_signatures(document: &str) -> Result<Vec<DirectorySignature>> {
    let mut out = Vec::new();
    let mut lines = document.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("directory-signature ") {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let (algorithm, identity_fp, signing_fp) = match fields.len() {
                3 => (fields[0].to_string(), fields[1].to_string(), fields[2].to_string()),
                2 => (String::new(), fields[0].to_string(), fields[1].to_string()),
                _ => return Err(TorError::parse("malformed directory-signature line")),
            };

            let mut armoured = String::new();
            let begin = lines.next().ok_or_else(|| TorError::parse("missing signature armour"))?;
            if begin != "-----BEGIN SIGNATURE-----" {
                return Err(TorError::parse("expected BEGIN SIGNATURE armour"));
            }
            for l in lines.by_ref() {
                if l == "-----END SIGNATURE-----" {
                    break;
                }
                armoured.push_str(l);
            }
            let signature = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, armoured.trim())
                .map_err(|e| TorError::parse(format!("bad base64 signature: {e}")))?;

            out.push(DirectorySignature {
                algorithm,
                identity_fingerprint: identity_fp,
                signing_key_fingerprint: signing_fp,
                signature,
            });
        }
    }
    Ok(out)
}

/// Verifies `document`'s directory-signature blocks against the supplied
/// map of identity-fingerprint -> signing RSA public key, accepting only
/// authorities known in `DIRECTORY_AUTHORITIES`. Returns `Ok(())` iff a
/// strict majority (`> n/2`) of known authorities verify.
pub fn verify_consensus_signatures(
    document: &str,
    signing_keys: &std::collections::HashMap<String, RsaPublicKey>,
) -> Result<()> {
    let preimage = signed_preimage(document)?;
    let sha256_digest = sha256(preimage.as_bytes());
    let sha1_digest = sha1(preimage.as_bytes());
    let signatures = parse_signatures(document)?;

    let known_identities: std::collections::HashSet<&str> =
        DIRECTORY_AUTHORITIES.iter().map(|a| a.v3ident).collect();

    let mut verified = 0usize;
    for sig in &signatures {
        if !known_identities.contains(sig.identity_fingerprint.as_str()) {
            continue;
        }
        let Some(key) = signing_keys.get(&sig.signing_key_fingerprint) else {
            continue;
        };
        // Legacy signatures (empty algorithm field) are over a SHA-1
        // preimage digest; modern ones specify "sha256" explicitly.
        let digest: &[u8] = if sig.algorithm.is_empty() { &sha1_digest } else { &sha256_digest };
        if rsa_verify_unprefixed(key, digest, &sig.signature) {
            verified += 1;
        }
    }

    let required = DIRECTORY_AUTHORITIES.len() / 2 + 1;
    if verified < required {
        return Err(TorError::crypto(format!(
            "only {verified} of {required} required authority signatures verified"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_preimage_includes_trailing_space() {
        let doc = "line one\nline two\ndirectory-signature sha256 AAAA BBBB\n-----BEGIN SIGNATURE-----\nZm9v\n-----END SIGNATURE-----\n";
        let preimage = signed_preimage(doc).unwrap();
        assert!(preimage.ends_with("directory-signature "));
    }

    #[test]
    fn parses_signature_block() {
        use base64::Engine;
        let sig_bytes = b"hello signature bytes";
        let armoured = base64::engine::general_purpose::STANDARD.encode(sig_bytes);
        let doc = format!(
            "preamble\ndirectory-signature sha256 AAAA BBBB\n-----BEGIN SIGNATURE-----\n{armoured}\n-----END SIGNATURE-----\n"
        );
        let sigs = parse_signatures(&doc).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].identity_fingerprint, "AAAA");
        assert_eq!(sigs[0].signature, sig_bytes);
    }

    #[test]
    fn rejects_below_strict_majority() {
        let doc = "preamble\ndirectory-signature ";
        let empty_keys = std::collections::HashMap::new();
        assert!(verify_consensus_signatures(doc, &empty_keys).is_err());
    }
}
