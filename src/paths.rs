use crate::error::{AggError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DEFAULT_INPUT_PATTERN: &str = r"\.(jsonl|ndjson|json|zst)$";

/// One input file. `index` is its position in sorted discovery order and
/// names its staging pieces, so re-runs stage identically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputFile {
    pub index: usize,
    pub path: PathBuf,
}

/// Expand files and directories (recursively) into a sorted, de-duplicated
/// list of input files whose names match `pattern`.
pub fn discover_inputs(inputs: &[PathBuf], pattern: Option<&str>) -> Result<Vec<InputFile>> {
    let re = Regex::new(pattern.unwrap_or(DEFAULT_INPUT_PATTERN))
        .map_err(|e| AggError::config(format!("invalid input file pattern: {e}")))?;
    if inputs.is_empty() {
        return Err(AggError::config("no inputs given"));
    }
    let mut found: Vec<PathBuf> = Vec::new();
    for input in inputs {
        if !input.exists() {
            return Err(AggError::config(format!("input {} does not exist", input.display())));
        }
        if input.is_file() {
            found.push(input.clone());
            continue;
        }
        for ent in WalkDir::new(input).min_depth(1).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if ent.file_type().is_file() && name_matches(&re, ent.path()) {
                found.push(ent.path().to_path_buf());
            }
        }
    }
    found.sort();
    found.dedup();
    Ok(found.into_iter().enumerate().map(|(index, path)| InputFile { index, path }).collect())
}

fn name_matches(re: &Regex, path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).map(|n| re.is_match(n)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walks_directories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2021/08")).unwrap();
        fs::write(dir.path().join("2021/08/b.jsonl"), "").unwrap();
        fs::write(dir.path().join("2021/a.jsonl.zst"), "").unwrap();
        fs::write(dir.path().join("2021/notes.txt"), "").unwrap();

        let files = discover_inputs(&[dir.path().to_path_buf()], None).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.path.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["b.jsonl", "a.jsonl.zst"]);
        assert_eq!(files[1].index, 1);
    }

    #[test]
    fn missing_input_is_configuration_error() {
        let err = discover_inputs(&[PathBuf::from("/definitely/not/here")], None).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }
}
