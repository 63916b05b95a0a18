//! Deterministic entropy stream.
//!
//! All randomness in play is drawn from a pre-rolled, append-only ndjson
//! stream: one JSON object per line, 1-based dense `i`, a pool of d20
//! values, a pool of d100 values, and raw bytes. Entries are immutable
//! once written; the stream may only grow, via the seeded extension used
//! by the operator tool. Replaying a session against the same stream
//! reproduces every roll exactly.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};

/// Seed for deterministic stream extension. Changing this breaks replay
/// of any session that consumed extended entries.
pub const REPO_SEED: u64 = 20240301;

/// Number of d20 values pre-rolled per entry.
const D20_POOL: usize = 10;
/// Number of d100 values pre-rolled per entry.
const D100_POOL: usize = 5;

/// A single stream record at index `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntropyEntry {
    pub i: u64,
    pub d20: Vec<u32>,
    pub d100: Vec<u32>,
    /// Hex-encoded raw bytes for consumers that need more than dice.
    pub bytes: String,
}

/// Map a raw d20 value onto an arbitrary die size.
///
/// Identity for X=20; for any X >= 1 the result lands in [1, X].
pub fn map_raw(raw: u32, sides: u32) -> u32 {
    1 + ((raw - 1) % sides)
}

/// Parse and validate the whole stream: every line a well-formed entry,
/// indices dense and 1-based.
pub fn read_stream(path: &Path) -> EngineResult<Vec<EntropyEntry>> {
    if !path.exists() {
        return Err(EngineError::internal(format!(
            "entropy file missing: {}",
            path.display()
        )));
    }
    let raw = std::fs::read_to_string(path)?;
    parse_stream(&raw)
}

/// Parse stream text (used by both backends and the operator tool).
pub fn parse_stream(raw: &str) -> EngineResult<Vec<EntropyEntry>> {
    let mut entries = Vec::new();
    let mut last_i = 0u64;
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: EntropyEntry = serde_json::from_str(line).map_err(|e| {
            EngineError::internal(format!("entropy line {} corrupt: {e}", line_no + 1))
        })?;
        if entry.i != last_i + 1 {
            return Err(EngineError::internal(format!(
                "entropy line {} has non-monotonic index {}",
                line_no + 1,
                entry.i
            )));
        }
        if entry.d20.iter().any(|&v| v < 1 || v > 20) {
            return Err(EngineError::internal(format!(
                "entropy entry {} has out-of-range d20 value",
                entry.i
            )));
        }
        if entry.d100.iter().any(|&v| v < 1 || v > 100) {
            return Err(EngineError::internal(format!(
                "entropy entry {} has out-of-range d100 value",
                entry.i
            )));
        }
        last_i = entry.i;
        entries.push(entry);
    }
    Ok(entries)
}

/// Yield the first `limit` entries.
pub fn peek(path: &Path, limit: usize) -> EngineResult<Vec<EntropyEntry>> {
    let mut entries = read_stream(path)?;
    entries.truncate(limit);
    Ok(entries)
}

/// Highest stored index, or 0 for an empty stream.
pub fn stream_length(path: &Path) -> EngineResult<u64> {
    Ok(read_stream(path)?.last().map(|e| e.i).unwrap_or(0))
}

/// Load the entry at `index`, failing with `EntropyMissing` when the
/// stream is shorter.
pub fn load_entry(path: &Path, index: u64) -> EngineResult<EntropyEntry> {
    read_stream(path)?
        .into_iter()
        .find(|e| e.i == index)
        .ok_or(EngineError::EntropyMissing(index))
}

/// No-op when `target_index <= highest`, otherwise `EntropyExhausted`.
/// Extension is an operator action, never done on the request path.
pub fn ensure_available(highest: u64, target_index: u64) -> EngineResult<()> {
    if target_index <= highest {
        Ok(())
    } else {
        Err(EngineError::EntropyExhausted {
            needed: target_index,
            have: highest,
        })
    }
}

/// Deterministically append `count` entries from the fixed seed.
///
/// The seed incorporates the current length, so extending by 5 then 5
/// produces the same stream as extending by 10.
pub fn extend_stream(path: &Path, count: u64) -> EngineResult<u64> {
    let last_i = if path.exists() { stream_length(path)? } else { 0 };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut rng = StdRng::seed_from_u64(REPO_SEED + last_i);
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for offset in 1..=count {
        let entry = EntropyEntry {
            i: last_i + offset,
            d20: (0..D20_POOL).map(|_| rng.gen_range(1..=20)).collect(),
            d100: (0..D100_POOL).map(|_| rng.gen_range(1..=100)).collect(),
            bytes: hex_bytes(rng.gen::<u32>()),
        };
        let line = serde_json::to_string(&entry)?;
        writeln!(file, "{line}")?;
    }
    file.sync_all()?;
    Ok(last_i + count)
}

fn hex_bytes(value: u32) -> String {
    format!("{value:08x}")
}

/// Audit a changelog for entropy discipline: every referenced index must
/// be unique, 1-based, and within the stream. Returns the number of
/// distinct indices referenced.
pub fn audit_changelog(changelog_lines: &[String], max_index: u64) -> EngineResult<usize> {
    let mut used: HashSet<u64> = HashSet::new();
    for (line_no, line) in changelog_lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            EngineError::internal(format!("changelog line {} invalid JSON: {e}", line_no + 1))
        })?;
        let indices = entry
            .get("entropy_indices")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for idx in indices {
            let idx = idx.as_u64().ok_or_else(|| {
                EngineError::internal(format!(
                    "changelog line {} has a non-integer entropy index",
                    line_no + 1
                ))
            })?;
            if idx < 1 || idx > max_index {
                return Err(EngineError::EntropyMissing(idx));
            }
            if !used.insert(idx) {
                return Err(EngineError::conflict(format!(
                    "entropy index {idx} referenced twice (changelog line {})",
                    line_no + 1
                )));
            }
        }
    }
    Ok(used.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_line(i: u64) -> String {
        format!(
            r#"{{"i":{i},"d20":[17,4,20,1,9,12,3,18,6,11],"d100":[55,3,97,41,72],"bytes":"00c0ffee"}}"#
        )
    }

    #[test]
    fn test_parse_stream_dense() {
        let raw = format!("{}\n{}\n", sample_line(1), sample_line(2));
        let entries = parse_stream(&raw).expect("valid stream");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].i, 2);
        assert_eq!(entries[0].d20[0], 17);
    }

    #[test]
    fn test_parse_stream_rejects_gap() {
        let raw = format!("{}\n{}\n", sample_line(1), sample_line(3));
        assert!(parse_stream(&raw).is_err());
    }

    #[test]
    fn test_parse_stream_rejects_extra_keys() {
        let raw = r#"{"i":1,"d20":[1],"d100":[1],"bytes":"00","who":"dm"}"#;
        assert!(parse_stream(raw).is_err());
    }

    #[test]
    fn test_map_raw_identity_and_range() {
        for n in 1..=20 {
            assert_eq!(map_raw(n, 20), n);
            for sides in [2u32, 4, 6, 8, 10, 12, 100] {
                let mapped = map_raw(n, sides);
                assert!((1..=sides).contains(&mapped), "n={n} sides={sides}");
            }
        }
        assert_eq!(map_raw(1, 6), 1);
        assert_eq!(map_raw(7, 6), 1);
        assert_eq!(map_raw(20, 6), 2);
    }

    #[test]
    fn test_ensure_available() {
        assert!(ensure_available(5, 5).is_ok());
        assert!(ensure_available(5, 0).is_ok());
        let err = ensure_available(5, 6).unwrap_err();
        assert_eq!(err.kind(), "EntropyExhausted");
    }

    #[test]
    fn test_extend_is_deterministic_and_incremental() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.ndjson");
        let b = dir.path().join("b.ndjson");

        extend_stream(&a, 10).expect("extend a");
        extend_stream(&b, 5).expect("extend b");
        extend_stream(&b, 5).expect("extend b again");

        let sa = std::fs::read_to_string(&a).expect("read a");
        let sb = std::fs::read_to_string(&b).expect("read b");
        assert_eq!(sa, sb, "5+5 must equal 10 from the same seed");

        let entries = parse_stream(&sa).expect("parse");
        assert_eq!(entries.len(), 10);
        assert_eq!(entries.last().map(|e| e.i), Some(10));
        assert!(entries.iter().all(|e| e.d20.len() == D20_POOL));
    }

    #[test]
    fn test_audit_changelog_detects_reuse() {
        let lines = vec![
            r#"{"turn":1,"entropy_indices":[1,2]}"#.to_string(),
            r#"{"turn":2,"entropy_indices":[3]}"#.to_string(),
        ];
        assert_eq!(audit_changelog(&lines, 10).expect("audit"), 3);

        let reused = vec![
            r#"{"turn":1,"entropy_indices":[1]}"#.to_string(),
            r#"{"turn":2,"entropy_indices":[1]}"#.to_string(),
        ];
        assert_eq!(audit_changelog(&reused, 10).unwrap_err().kind(), "Conflict");

        let out_of_range = vec![r#"{"turn":1,"entropy_indices":[99]}"#.to_string()];
        assert_eq!(
            audit_changelog(&out_of_range, 10).unwrap_err().kind(),
            "EntropyMissing"
        );
    }
}
