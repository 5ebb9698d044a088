//! Ed-style consensus diffs: `<a,b>d` deletes a line range, `<a>a` and
//! `<a,b>c` append/change a block of body lines terminated by a lone `.`.
//! Commands are applied in reverse source order so earlier line numbers
//! stay stable as later edits are made.

use crate::crypto::{sha256, sha3_256};
use crate::error::{Result, TorError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Change,
    Delete,
    Append,
}

#[derive(Debug, Clone)]
pub struct DiffCommand {
    pub range: (usize, usize),
    pub op: DiffOp,
    pub body: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConsensusDiff {
    pub from_hash: String,
    pub to_hash: String,
    pub commands: Vec<DiffCommand>,
}

/// Parses a diff document whose first line is
/// `network-status-diff-version 1` and second line is `hash <from> <to>`.
pub fn parse_diff(text: &str) -> Result<ConsensusDiff> {
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| TorError::parse("empty diff document"))?;
    if header != "network-status-diff-version 1" {
        return Err(TorError::parse("unexpected diff version header"));
    }
    let hash_line = lines.next().ok_or_else(|| TorError::parse("missing hash line"))?;
    let hash_fields: Vec<&str> = hash_line.split_whitespace().collect();
    if hash_fields.len() != 3 || hash_fields[0] != "hash" {
        return Err(TorError::parse("malformed hash line"));
    }
    let from_hash = hash_fields[1].to_string();
    let to_hash = hash_fields[2].to_string();

    let mut commands = Vec::new();
    let rest: Vec<&str> = lines.collect();
    let mut i = 0;
    while i < rest.len() {
        let line = rest[i];
        i += 1;
        if line.is_empty() {
            continue;
        }
        let (range, op_char) = parse_command_head(line)?;
        match op_char {
            'd' => commands.push(DiffCommand {
                range,
                op: DiffOp::Delete,
                body: Vec::new(),
            }),
            'a' | 'c' => {
                let mut body = Vec::new();
                while i < rest.len() && rest[i] != "." {
                    body.push(rest[i].to_string());
                    i += 1;
                }
                if i >= rest.len() {
                    return Err(TorError::parse("unterminated diff body block"));
                }
                i += 1; // consume the lone '.'
                commands.push(DiffCommand {
                    range,
                    op: if op_char == 'a' { DiffOp::Append } else { DiffOp::Change },
                    body,
                });
            }
            other => return Err(TorError::parse(format!("unknown diff op '{other}'"))),
        }
    }

    Ok(ConsensusDiff {
        from_hash,
        to_hash,
        commands,
    })
}

/// Parses `<a,b>d`, `<a>a`, `<a,b>c`, or `<a>c` into `((start,end), op)`,
/// where a single-number range has `start == end`.
fn parse_command_head(line: &str) -> Result<((usize, usize), char)> {
    let op_char = line
        .chars()
        .last()
        .ok_or_else(|| TorError::parse("empty diff command line"))?;
    let range_part = &line[..line.len() - 1];
    if let Some((a, b)) = range_part.split_once(',') {
        let a: usize = a.parse().map_err(|_| TorError::parse("bad range start"))?;
        let b: usize = b.parse().map_err(|_| TorError::parse("bad range end"))?;
        Ok(((a, b), op_char))
    } else {
        let a: usize = range_part.parse().map_err(|_| TorError::parse("bad line number"))?;
        Ok(((a, a), op_char))
    }
}

/// Applies `diff` to `base` (1-indexed lines), executing commands in
/// reverse source order so earlier edits don't shift later line numbers.
pub fn apply_diff(base: &str, diff: &ConsensusDiff) -> Result<String> {
    let mut lines: Vec<String> = base.lines().map(|l| l.to_string()).collect();

    let mut ordered = diff.commands.clone();
    ordered.sort_by(|a, b| b.range.0.cmp(&a.range.0));

    for cmd in ordered {
        let (start, end) = cmd.range;
        if start == 0 || start > lines.len() + 1 || end > lines.len() {
            return Err(TorError::parse("diff command references out-of-range lines"));
        }
        match cmd.op {
            DiffOp::Delete => {
                lines.drain(start - 1..end);
            }
            DiffOp::Change => {
                lines.splice(start - 1..end, cmd.body.iter().cloned());
            }
            DiffOp::Append => {
                // Append after line `start` (start may be 0, meaning
                // "before the first line", per ed semantics).
                lines.splice(start..start, cmd.body.iter().cloned());
            }
        }
    }

    let mut out = lines.join("\n");
    if base.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// Applies `diff` to `base` and verifies the result hashes to
/// `diff.to_hash`. Accepts either a SHA-256 or SHA3-256 hex digest.
pub fn apply_and_verify(base: &str, diff: &ConsensusDiff) -> Result<String> {
    let applied = apply_diff(base, diff)?;
    let sha256_hex = hex::encode(sha256(applied.as_bytes()));
    let sha3_hex = hex::encode(sha3_256(applied.as_bytes()));
    let to_hash_lower = diff.to_hash.to_lowercase();
    if to_hash_lower != sha256_hex && to_hash_lower != sha3_hex {
        return Err(TorError::protocol("applied diff hash mismatch"));
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_range_removes_lines() {
        let base = "one\ntwo\nthree\nfour\n";
        let diff = ConsensusDiff {
            from_hash: "x".into(),
            to_hash: "y".into(),
            commands: vec![DiffCommand {
                range: (2, 3),
                op: DiffOp::Delete,
                body: vec![],
            }],
        };
        let applied = apply_diff(base, &diff).unwrap();
        assert_eq!(applied, "one\nfour\n");
    }

    #[test]
    fn change_replaces_range_with_new_body() {
        let base = "a\nb\nc\nd\ne\n";
        let diff = ConsensusDiff {
            from_hash: "x".into(),
            to_hash: "y".into(),
            commands: vec![DiffCommand {
                range: (2, 4),
                op: DiffOp::Change,
                body: vec!["X".into(), "Y".into(), "Z".into()],
            }],
        };
        let applied = apply_diff(base, &diff).unwrap();
        assert_eq!(applied, "a\nX\nY\nZ\ne\n");
    }

    #[test]
    fn parses_and_applies_full_diff_document() {
        let base = "a\nb\nc\nd\ne\n";
        let text = "network-status-diff-version 1\nhash fromhash tohash\n2,4c\nX\nY\nZ\n.\n";
        let diff = parse_diff(text).unwrap();
        assert_eq!(diff.from_hash, "fromhash");
        assert_eq!(diff.to_hash, "tohash");
        let applied = apply_diff(base, &diff).unwrap();
        assert_eq!(applied, "a\nX\nY\nZ\ne\n");
    }

    #[test]
    fn apply_and_verify_matches_to_hash() {
        let base = "a\nb\nc\n";
        let applied_expected = "a\nX\nc\n";
        let to_hash = hex::encode(sha256(applied_expected.as_bytes()));
        let diff = ConsensusDiff {
            from_hash: "f".into(),
            to_hash,
            commands: vec![DiffCommand {
                range: (2, 2),
                op: DiffOp::Change,
                body: vec!["X".into()],
            }],
        };
        assert_eq!(apply_and_verify(base, &diff).unwrap(), applied_expected);
    }

    #[test]
    fn apply_and_verify_rejects_hash_mismatch() {
        let base = "a\nb\nc\n";
        let diff = ConsensusDiff {
            from_hash: "f".into(),
            to_hash: "0000".into(),
            commands: vec![DiffCommand {
                range: (2, 2),
                op: DiffOp::Change,
                body: vec!["X".into()],
            }],
        };
        assert!(apply_and_verify(base, &diff).is_err());
    }

    #[test]
    fn reverse_order_application_keeps_earlier_line_numbers_stable() {
        let base = "1\n2\n3\n4\n5\n";
        let diff = ConsensusDiff {
            from_hash: "f".into(),
            to_hash: "t".into(),
            commands: vec![
                DiffCommand {
                    range: (4, 5),
                    op: DiffOp::Delete,
                    body: vec![],
                },
                DiffCommand {
                    range: (1, 1),
                    op: DiffOp::Change,
                    body: vec!["ONE".into()],
                },
            ],
        };
        let applied = apply_diff(base, &diff).unwrap();
        assert_eq!(applied, "ONE\n2\n3\n");
    }
}
