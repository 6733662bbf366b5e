//! Parsing of the `shallow` file: one 40-hex object id per line, `#`
//! comments ignored, naming the commits at the boundary of a shallow clone.

use std::collections::HashSet;
use std::path::Path;

use git_hash::ObjectId;

use crate::OdbError;

/// Parse a `shallow` file's content into the set of boundary commit ids.
///
/// Lines starting with `#` are ignored. Blank lines are ignored. Any other
/// line that isn't a valid hex object id is a `CorruptShallowFile`.
pub fn parse_shallow_commits(contents: &str) -> Result<HashSet<ObjectId>, OdbError> {
    let mut out = HashSet::new();
    for line in contents.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let oid = ObjectId::from_hex(line)
            .map_err(|_| OdbError::CorruptShallowFile(line.to_string()))?;
        out.insert(oid);
    }
    Ok(out)
}

/// Read and parse the `shallow` file at `objects_dir`'s parent (the `.git`
/// directory). Returns an empty set if the file doesn't exist — a
/// non-shallow repository is the common case, not an error.
pub fn read_shallow_file(git_dir: impl AsRef<Path>) -> Result<HashSet<ObjectId>, OdbError> {
    let path = git_dir.as_ref().join("shallow");
    match std::fs::read_to_string(&path) {
        Ok(contents) => parse_shallow_commits(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(OdbError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_oid_with_comments_and_blank_lines() {
        let text = "# shallow boundary\nd3148f9410b071edd4a4c85d2a43d1fa2574b0d2\n\n";
        let set = parse_shallow_commits(text).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&ObjectId::from_hex("d3148f9410b071edd4a4c85d2a43d1fa2574b0d2").unwrap()));
    }

    #[test]
    fn rejects_malformed_line() {
        let text = "X3148f9410b071edd4a4c85d2a43d1fa2574b0d2\n";
        let err = parse_shallow_commits(text).unwrap_err();
        assert!(matches!(err, OdbError::CorruptShallowFile(_)));
    }

    #[test]
    fn missing_file_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let set = read_shallow_file(dir.path()).unwrap();
        assert!(set.is_empty());
    }
}
