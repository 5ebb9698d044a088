//! Microdesc-flavor consensus parsing: an `r` line opens a record;
//! subsequent `a`, `m`, `s`, `v`, `pr`, `w` lines attach to it until the
//! next `r` line or `directory-footer`.

use crate::error::{Result, TorError};

#[derive(Debug, Clone, Default)]
pub struct Microdesc {
    pub nickname: String,
    pub identity_fingerprint: String,
    pub hostname: String,
    pub orport: u16,
    pub dirport: u16,
    pub ipv6: Option<String>,
    pub microdesc_digest: Option<String>,
    pub flags: Vec<String>,
    pub protocol_versions: Option<String>,
    pub version: Option<String>,
    pub bandwidth: Option<u64>,
}

/// Parses every microdesc record out of a consensus document body
/// (everything between the preamble and `directory-footer`).
pub fn parse_microdescs(body: &str) -> Result<Vec<Microdesc>> {
    let mut out = Vec::new();
    let mut current: Option<Microdesc> = None;

    for line in body.lines() {
        if line == "directory-footer" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let keyword = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");

        match keyword {
            "r" => {
                if let Some(m) = current.take() {
                    out.push(m);
                }
                current = Some(parse_r_line(rest)?);
            }
            "a" => {
                if let Some(m) = current.as_mut() {
                    m.ipv6 = Some(rest.to_string());
                }
            }
            "m" => {
                if let Some(m) = current.as_mut() {
                    m.microdesc_digest = Some(rest.to_string());
                }
            }
            "s" => {
                if let Some(m) = current.as_mut() {
                    m.flags = rest.split_whitespace().map(|s| s.to_string()).collect();
                }
            }
            "pr" => {
                if let Some(m) = current.as_mut() {
                    m.protocol_versions = Some(rest.to_string());
                }
            }
            "v" => {
                if let Some(m) = current.as_mut() {
                    m.version = Some(rest.to_string());
                }
            }
            "w" => {
                if let Some(m) = current.as_mut() {
                    m.bandwidth = parse_bandwidth(rest);
                }
            }
            _ => {}
        }
    }
    if let Some(m) = current.take() {
        out.push(m);
    }
    Ok(out)
}

fn parse_r_line(rest: &str) -> Result<Microdesc> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(TorError::parse("r line has too few fields"));
    }
    let nickname = fields[0].to_string();
    let identity_fingerprint = fields.get(1).copied().unwrap_or("").to_string();
    let dirport: u16 = fields[fields.len() - 1]
        .parse()
        .map_err(|_| TorError::parse("r line: bad dirport"))?;
    let orport: u16 = fields[fields.len() - 2]
        .parse()
        .map_err(|_| TorError::parse("r line: bad orport"))?;
    let hostname = fields[fields.len() - 3].to_string();

    Ok(Microdesc {
        nickname,
        identity_fingerprint,
        hostname,
        orport,
        dirport,
        ..Default::default()
    })
}

/// Extracts the ntor onion key from one microdescriptor's own body (a
/// separate document from the consensus, addressed by the `m` line's
/// digest and fetched individually): a line of the form
/// `ntor-onion-key <base64>`.
pub fn parse_ntor_key(microdesc_body: &str) -> Result<[u8; 32]> {
    let line = microdesc_body
        .lines()
        .find_map(|l| l.strip_prefix("ntor-onion-key "))
        .ok_or_else(|| TorError::parse("microdescriptor missing ntor-onion-key"))?;
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(line.trim().trim_end_matches('='))
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(line.trim()))
        .map_err(|_| TorError::parse("ntor-onion-key is not valid base64"))?;
    bytes
        .try_into()
        .map_err(|_| TorError::parse("ntor-onion-key must decode to 32 bytes"))
}

fn parse_bandwidth(rest: &str) -> Option<u64> {
    for kv in rest.split_whitespace() {
        if let Some(v) = kv.strip_prefix("Bandwidth=") {
            return v.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_one_parses_nickname_hostname_orport_flags_ipv6() {
        let body = "r c0der AAAAAAAAAAAAAAAAAAAAAAAAAAAA 2026-01-01 00:00:00 95.216.20.80 8080 0\n\
                    a [2a01:4f9:2a:14af::2]:8080\n\
                    m someDigestBase64\n\
                    s Fast Guard Running Valid\n\
                    w Bandwidth=34000\n";
        let recs = parse_microdescs(body).unwrap();
        assert_eq!(recs.len(), 1);
        let r = &recs[0];
        assert_eq!(r.nickname, "c0der");
        assert_eq!(r.hostname, "95.216.20.80");
        assert_eq!(r.orport, 8080);
        assert!(r.flags.contains(&"Fast".to_string()));
        assert!(r.flags.contains(&"Guard".to_string()));
        assert_eq!(r.ipv6.as_deref(), Some("[2a01:4f9:2a:14af::2]:8080"));
        assert_eq!(r.bandwidth, Some(34000));
    }

    #[test]
    fn multiple_records_split_on_r_lines() {
        let body = "r relayOne id1 2026-01-01 00:00:00 1.2.3.4 443 0\n\
                     s Fast\n\
                     r relayTwo id2 2026-01-01 00:00:00 5.6.7.8 9001 0\n\
                     s Exit\n";
        let recs = parse_microdescs(body).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].nickname, "relayOne");
        assert_eq!(recs[1].nickname, "relayTwo");
    }

    #[test]
    fn ntor_key_parses_from_its_own_base64_line() {
        use base64::Engine;
        let key = [9u8; 32];
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        let body = format!("onion-key\n-----BEGIN RSA PUBLIC KEY-----\n-----END RSA PUBLIC KEY-----\nntor-onion-key {encoded}\nid ed25519 abc\n");
        assert_eq!(parse_ntor_key(&body).unwrap(), key);
    }

    #[test]
    fn ntor_key_missing_is_a_parse_error() {
        assert!(parse_ntor_key("onion-key\nid ed25519 abc\n").is_err());
    }

    #[test]
    fn stops_at_directory_footer() {
        let body = "r relayOne id1 2026-01-01 00:00:00 1.2.3.4 443 0\ndirectory-footer\nr ignored id2 2026-01-01 00:00:00 9.9.9.9 1 0\n";
        let recs = parse_microdescs(body).unwrap();
        assert_eq!(recs.len(), 1);
    }
}
