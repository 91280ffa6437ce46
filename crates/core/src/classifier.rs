use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

/// Class order is fixed; logits and probabilities index into it.
pub const CLASSES: [&str; 4] = ["trivial", "simple", "complex", "multistep"];

pub const TRIVIAL: usize = 0;
pub const SIMPLE: usize = 1;
pub const COMPLEX: usize = 2;
pub const MULTISTEP: usize = 3;

/// Linear text classifier over TF-IDF features of {1,2,3}-grams. The model is
/// a plain numeric table (term -> per-class weight, idf folded in), so
/// inference is a dense dot-product with no ML runtime behind it.
pub struct Classifier {
    vocab: Vec<(String, [f32; 4])>,
    bias: [f32; 4],
}

#[derive(Deserialize)]
struct ClassifierTable {
    vocab: Vec<(String, [f32; 4])>,
    bias: [f32; 4],
}

impl Classifier {
    /// The table compiled into the binary.
    pub fn embedded() -> Self {
        Self {
            vocab: EMBEDDED_VOCAB
                .iter()
                .map(|(term, w)| (term.to_string(), *w))
                .collect(),
            bias: EMBEDDED_BIAS,
        }
    }

    /// An externally trained table overrides the embedded one when present.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let table: ClassifierTable = serde_json::from_str(&content)?;
        Ok(Self {
            vocab: table.vocab,
            bias: table.bias,
        })
    }

    /// Class logits for the raw task text.
    pub fn logits(&self, text: &str) -> [f32; 4] {
        let grams = extract_grams(text);
        let total = grams.len().max(1) as f32;

        let mut logits = self.bias;
        for (term, weights) in &self.vocab {
            let count = grams.iter().filter(|g| *g == term).count();
            if count == 0 {
                continue;
            }
            let tf = count as f32 / total;
            for (logit, w) in logits.iter_mut().zip(weights.iter()) {
                *logit += tf * w;
            }
        }
        logits
    }

    pub fn probabilities(&self, text: &str) -> [f32; 4] {
        softmax(self.logits(text))
    }
}

/// Lowercased word {1,2,3}-grams, punctuation stripped per word.
fn extract_grams(text: &str) -> Vec<String> {
    let words: Vec<String> = text
        .to_lowercase()
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.')
                .to_string()
        })
        .filter(|w| !w.is_empty())
        .collect();

    let mut grams = Vec::with_capacity(words.len() * 3);
    for n in 1..=3 {
        for window in words.windows(n) {
            grams.push(window.join(" "));
        }
    }
    grams
}

/// Numerically stable softmax: subtract the max logit before exponentiating.
fn softmax(logits: [f32; 4]) -> [f32; 4] {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps = logits.map(|l| (l - max).exp());
    let sum: f32 = exps.iter().sum();
    exps.map(|e| e / sum)
}

const EMBEDDED_BIAS: [f32; 4] = [0.1, 0.6, -0.3, -0.6];

// Per-class weights: [trivial, simple, complex, multistep]. The magnitudes
// fold in idf; terms absent from a task contribute nothing.
const EMBEDDED_VOCAB: &[(&str, [f32; 4])] = &[
    // Trivial indicators
    ("typo", [9.0, 1.0, -2.0, -2.0]),
    ("rename", [7.0, 2.0, -1.0, -2.0]),
    ("comment", [6.0, 2.0, -1.0, -2.0]),
    ("readme", [6.0, 2.0, -1.0, -2.0]),
    ("format", [5.0, 2.0, -1.0, -1.0]),
    ("lint", [5.0, 2.0, -1.0, -1.0]),
    ("whitespace", [6.0, 1.0, -1.0, -1.0]),
    ("version bump", [6.0, 1.0, -1.0, -1.0]),
    ("one line", [6.0, 1.0, -2.0, -2.0]),
    // Simple indicators
    ("fix", [1.0, 5.0, 0.5, -0.5]),
    ("add", [0.5, 4.0, 0.5, 0.0]),
    ("update", [1.0, 4.0, 0.5, 0.0]),
    ("remove", [1.0, 4.0, 0.0, -0.5]),
    ("change", [0.5, 3.5, 0.5, 0.0]),
    ("bug", [0.0, 4.0, 1.0, -0.5]),
    ("flag", [0.5, 4.0, 0.0, -0.5]),
    ("test for", [0.0, 3.5, 0.5, 0.0]),
    ("error message", [1.0, 4.0, 0.0, -0.5]),
    // Complex indicators
    ("oauth", [-2.0, -1.0, 10.0, 1.0]),
    ("migrate", [-2.0, -1.0, 9.0, 2.0]),
    ("migration", [-2.0, -1.0, 9.0, 2.0]),
    ("deploy", [-2.0, -1.0, 8.0, 2.0]),
    ("docker", [-1.0, 0.0, 7.0, 1.0]),
    ("kubernetes", [-2.0, -1.0, 9.0, 1.0]),
    ("k8s", [-2.0, -1.0, 9.0, 1.0]),
    ("terraform", [-2.0, -1.0, 9.0, 1.0]),
    ("kafka", [-2.0, -1.0, 9.0, 1.0]),
    ("payment", [-2.0, -1.0, 9.0, 1.0]),
    ("pipeline", [-1.0, -1.0, 7.0, 2.0]),
    ("refactor", [-1.0, 0.5, 6.0, 1.0]),
    ("architecture", [-2.0, -1.0, 8.0, 1.0]),
    ("concurrency", [-2.0, -1.0, 8.0, 0.5]),
    ("race condition", [-2.0, -1.0, 8.0, 0.5]),
    ("authentication", [-1.0, 0.0, 7.0, 1.0]),
    ("database schema", [-2.0, -1.0, 8.0, 1.0]),
    ("end to end", [-1.0, -0.5, 5.0, 3.0]),
    ("performance", [-1.0, 0.0, 6.0, 0.5]),
    ("security", [-1.0, 0.0, 6.0, 0.5]),
    // Multi-step indicators
    ("then", [-1.0, -0.5, 0.5, 6.0]),
    ("and then", [-2.0, -1.0, 0.5, 9.0]),
    ("after", [-0.5, 0.0, 0.5, 4.0]),
    ("after that", [-1.0, -0.5, 0.5, 8.0]),
    ("followed by", [-2.0, -1.0, 0.5, 9.0]),
    ("first", [-0.5, 0.0, 0.5, 5.0]),
    ("second", [-0.5, 0.0, 0.5, 5.0]),
    ("finally", [-1.0, -0.5, 0.5, 7.0]),
    ("step", [-0.5, 0.0, 0.5, 5.0]),
    ("steps", [-0.5, 0.0, 0.5, 5.0]),
    ("once done", [-1.0, -0.5, 0.5, 7.0]),
    ("set up", [-0.5, 0.5, 2.0, 3.0]),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let probs = softmax([1000.0, 999.0, 998.0, 997.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(probs[0] > probs[1]);
    }

    #[test]
    fn grams_include_bigrams_and_trigrams() {
        let grams = extract_grams("fix the bug");
        assert!(grams.contains(&"fix".to_string()));
        assert!(grams.contains(&"fix the".to_string()));
        assert!(grams.contains(&"fix the bug".to_string()));
    }

    #[test]
    fn classifies_obvious_cases() {
        let clf = Classifier::embedded();

        let probs = clf.probabilities("fix typo in readme");
        let argmax = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(CLASSES[argmax], "trivial");

        let probs = clf.probabilities("migrate the payment service to oauth and deploy to k8s");
        assert!(probs[COMPLEX] > probs[TRIVIAL]);
        assert!(probs[COMPLEX] > probs[SIMPLE]);
    }

    #[test]
    fn external_table_overrides_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.json");
        std::fs::write(
            &path,
            r#"{"vocab": [["zap", [0.0, 0.0, 50.0, 0.0]]], "bias": [0.0, 0.0, 0.0, 0.0]}"#,
        )
        .unwrap();
        let clf = Classifier::load(&path).unwrap();
        let probs = clf.probabilities("zap");
        assert!(probs[COMPLEX] > 0.9);
    }

    #[test]
    fn missing_table_file_is_an_error() {
        assert!(Classifier::load(Path::new("/nonexistent/classifier.json")).is_err());
    }
}
