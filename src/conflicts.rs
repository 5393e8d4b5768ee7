//! Scanner for unresolved git merge conflict markers.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const CONFLICT_MARKERS: [&str; 3] = ["<<<<<<<", "=======", ">>>>>>>"];
pub const DEFAULT_EXCLUDES: [&str; 4] = [".git", ".venv", "__pycache__", "target"];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Conflict {
    pub path: PathBuf,
    pub line_number: usize,
    pub marker: &'static str,
}

/// Every marker occurrence under `roots`. Entries whose name is in `exclude`
/// are skipped along with everything below them; files that are not UTF-8
/// are ignored.
pub fn find_conflicts(roots: &[PathBuf], exclude: &[String]) -> Vec<Conflict> {
    let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();
    let mut conflicts = Vec::new();

    for root in roots {
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| exclude.contains(name))
            });
        for entry in walker.flatten() {
            if entry.file_type().is_file() {
                conflicts.extend(conflicts_in_file(entry.path()));
            }
        }
    }
    conflicts
}

fn conflicts_in_file(path: &Path) -> Vec<Conflict> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for (index, line) in text.lines().enumerate() {
        for marker in CONFLICT_MARKERS {
            if line.contains(marker) {
                found.push(Conflict {
                    path: path.to_path_buf(),
                    line_number: index + 1,
                    marker,
                });
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Vec<String> {
        DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reports_each_marker_with_its_line() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.rs");
        fs::write(
            &file,
            "fn main() {\n<<<<<<< HEAD\n    a();\n=======\n    b();\n>>>>>>> feature\n}\n",
        )
        .unwrap();

        let conflicts = find_conflicts(&[dir.path().to_path_buf()], &defaults());
        let summary: Vec<(usize, &str)> = conflicts
            .iter()
            .map(|c| (c.line_number, c.marker))
            .collect();
        assert_eq!(summary, [(2, "<<<<<<<"), (4, "======="), (6, ">>>>>>>")]);
        assert!(conflicts.iter().all(|c| c.path == file));
    }

    #[test]
    fn excluded_directories_and_binary_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        fs::create_dir(&git).unwrap();
        fs::write(git.join("MERGE_MSG"), "<<<<<<< ours\n").unwrap();
        fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, b'<', b'<']).unwrap();
        fs::write(dir.path().join("clean.txt"), "all good\n").unwrap();

        assert!(find_conflicts(&[dir.path().to_path_buf()], &defaults()).is_empty());
        assert_eq!(find_conflicts(&[dir.path().to_path_buf()], &[]).len(), 1);
    }

    #[test]
    fn single_file_roots_are_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        fs::write(&file, ">>>>>>> theirs\n").unwrap();
        let conflicts = find_conflicts(std::slice::from_ref(&file), &defaults());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].line_number, 1);
    }
}
