use std::collections::HashMap;
use std::path::Path;

/// Top-level file-type census of the working directory. The router uses it to
/// decide whether a test layer is available; the validator uses the detected
/// commands directly.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceCensus {
    pub file_counts: HashMap<String, usize>,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
}

impl WorkspaceCensus {
    pub fn scan(root: &Path) -> Self {
        let mut file_counts: HashMap<String, usize> = HashMap::new();

        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() {
                    let ext = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("(none)")
                        .to_lowercase();
                    *file_counts.entry(ext).or_default() += 1;
                }
            }
        }

        let (build_command, test_command) = detect_commands(root);
        Self {
            file_counts,
            build_command,
            test_command,
        }
    }

    pub fn has_test_runner(&self) -> bool {
        self.test_command.is_some()
    }
}

/// Build and test commands by manifest sniffing, most specific first.
fn detect_commands(root: &Path) -> (Option<String>, Option<String>) {
    if root.join("Cargo.toml").exists() {
        (
            Some("cargo check".to_string()),
            Some("cargo test".to_string()),
        )
    } else if root.join("go.mod").exists() {
        (
            Some("go build ./...".to_string()),
            Some("go test ./...".to_string()),
        )
    } else if root.join("package.json").exists() {
        let test = std::fs::read_to_string(root.join("package.json"))
            .ok()
            .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok())
            .filter(|pkg| pkg["scripts"]["test"].is_string())
            .map(|_| "npm test".to_string());
        (Some("npm run build --if-present".to_string()), test)
    } else if root.join("pyproject.toml").exists() || root.join("setup.py").exists() {
        (None, Some("python -m pytest".to_string()))
    } else {
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cargo_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();

        let census = WorkspaceCensus::scan(dir.path());
        assert_eq!(census.build_command.as_deref(), Some("cargo check"));
        assert!(census.has_test_runner());
        assert_eq!(census.file_counts.get("rs"), Some(&1));
    }

    #[test]
    fn empty_dir_has_no_commands() {
        let dir = tempfile::tempdir().unwrap();
        let census = WorkspaceCensus::scan(dir.path());
        assert!(census.build_command.is_none());
        assert!(!census.has_test_runner());
    }

    #[test]
    fn node_without_test_script_has_no_test_runner() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name": "p"}"#).unwrap();
        let census = WorkspaceCensus::scan(dir.path());
        assert!(census.build_command.is_some());
        assert!(!census.has_test_runner());
    }
}
