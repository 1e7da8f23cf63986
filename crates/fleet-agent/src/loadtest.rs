//! Fleet emulation
//!
//! Runs one session per identity from a credentials file against a single
//! engine, to exercise the engine with a realistic number of agents.

use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use fleet_core::AgentIdentity;

/// Parse a credentials file of `agent_id secret` lines
///
/// Blank lines and `#` comments are skipped; malformed lines are logged.
pub fn load_identities(path: &Path) -> Result<Vec<AgentIdentity>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    parse_identities(BufReader::new(file), path)
}

fn parse_identities(reader: impl BufRead, path: &Path) -> Result<Vec<AgentIdentity>> {
    let mut identities = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line =
            line.with_context(|| format!("Failed to read line {} of {:?}", line_num + 1, path))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(secret), None) => identities.push(AgentIdentity::new(id, secret)),
            _ => tracing::warn!(
                "Skipping malformed credentials on line {} of {:?}",
                line_num + 1,
                path
            ),
        }
    }

    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_identities() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# fleet").unwrap();
        writeln!(file, "A1 s1").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "A2   s2").unwrap();
        writeln!(file, "broken").unwrap();
        writeln!(file, "A3 s3 extra").unwrap();

        let identities = load_identities(file.path()).unwrap();
        let ids: Vec<&str> = identities.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["A1", "A2"]);
        assert_eq!(identities[1].secret_key, "s2");
    }

    #[test]
    fn test_missing_file() {
        assert!(load_identities(Path::new("/nonexistent/creds")).is_err());
    }
}
