use sha2::{Digest, Sha256};

/// Verbs that usually indicate what the user wants done; surfaced as a task
/// feature and used by the router's heuristics.
const ACTION_VERBS: &[&str] = &[
    "add", "build", "change", "create", "delete", "deploy", "fix", "implement", "migrate", "move",
    "refactor", "remove", "rename", "rewrite", "test", "update", "write",
];

/// An immutable snapshot of one user request plus the structured features the
/// router and recommender key off.
#[derive(Debug, Clone)]
pub struct Task {
    pub text: String,
    pub fingerprint: String,
    pub features: TaskFeatures,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFeatures {
    pub char_count: usize,
    pub word_count: usize,
    pub approx_tokens: usize,
    pub file_refs: Vec<String>,
    pub verbs: Vec<String>,
}

impl Task {
    pub fn new(text: &str) -> Self {
        let text = text.trim().to_string();
        Self {
            fingerprint: fingerprint(&text),
            features: TaskFeatures::extract(&text),
            text,
        }
    }
}

impl TaskFeatures {
    fn extract(text: &str) -> Self {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();

        let file_refs = words
            .iter()
            .filter(|w| looks_like_path(w))
            .map(|w| w.trim_matches(|c: char| c == '`' || c == '\'' || c == '"').to_string())
            .collect();

        let verbs = ACTION_VERBS
            .iter()
            .filter(|v| words.iter().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == **v))
            .map(|v| v.to_string())
            .collect();

        Self {
            char_count: text.len(),
            word_count: words.len(),
            approx_tokens: text.len() / 4,
            file_refs,
            verbs,
        }
    }
}

fn looks_like_path(word: &str) -> bool {
    let trimmed = word.trim_matches(|c: char| c == '`' || c == '\'' || c == '"' || c == ',');
    if trimmed.len() < 3 || trimmed.starts_with("http") {
        return false;
    }
    trimmed.contains('/') && !trimmed.ends_with('/')
        || std::path::Path::new(trimmed)
            .extension()
            .is_some_and(|ext| ext.len() <= 4 && ext.to_str().is_some_and(|e| e.chars().all(|c| c.is_ascii_alphanumeric())))
}

/// First 16 hex chars of SHA-256 over the whitespace-normalized, lowercased
/// task text. Stable across trivial rephrasing of spacing only.
pub fn fingerprint(text: &str) -> String {
    let normalized = text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_whitespace_insensitive() {
        assert_eq!(fingerprint("Fix  the   bug"), fingerprint("fix the bug"));
        assert_ne!(fingerprint("fix the bug"), fingerprint("fix the bugs"));
        assert_eq!(fingerprint("x").len(), 16);
    }

    #[test]
    fn extracts_file_refs_and_verbs() {
        let task = Task::new("Fix the parser in src/lexer.rs and update README.md");
        assert!(task.features.file_refs.contains(&"src/lexer.rs".to_string()));
        assert!(task.features.file_refs.contains(&"readme.md".to_string()));
        assert!(task.features.verbs.contains(&"fix".to_string()));
        assert!(task.features.verbs.contains(&"update".to_string()));
    }

    #[test]
    fn urls_are_not_file_refs() {
        let task = Task::new("see https://example.com/docs for details");
        assert!(task.features.file_refs.is_empty());
    }
}
