use std::path::Path;

use regex::Regex;

use crate::core::domain::Language;

struct ContentPatterns {
    language: Language,
    patterns: Vec<Regex>,
}

/// Compiled content heuristics. Build once and share by reference.
pub struct LanguageDetector {
    content_patterns: Vec<ContentPatterns>,
}

impl LanguageDetector {
    pub fn new() -> Self {
        let compile = |language, patterns: &[&str]| ContentPatterns {
            language,
            patterns: patterns
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect(),
        };
        Self {
            content_patterns: vec![
                compile(
                    Language::Cpp,
                    &[
                        r#"(?m)#include\s*[<"]"#,
                        r"using\s+namespace\s+std",
                        r"std::\w+",
                        r"int\s+main\s*\(",
                    ],
                ),
                compile(
                    Language::Python,
                    &[
                        r"(?m)^\s*def\s+\w+\s*\(",
                        r"(?m)^\s*import\s+\w+",
                        r"(?m)^\s*from\s+\w+\s+import",
                        r#"if\s+__name__\s*==\s*["']__main__["']"#,
                    ],
                ),
                compile(
                    Language::Java,
                    &[
                        r"public\s+class\s+\w+",
                        r"public\s+static\s+void\s+main",
                        r"(?m)^\s*import\s+java\.",
                        r"System\.out\.print",
                    ],
                ),
            ],
        }
    }

    /// Best-scoring language by content patterns; ties keep the earlier language.
    pub fn from_content(&self, content: &str) -> Option<Language> {
        let mut best: Option<(Language, usize)> = None;
        for entry in &self.content_patterns {
            let score = entry
                .patterns
                .iter()
                .filter(|pattern| pattern.is_match(content))
                .count();
            if score > 0 && best.is_none_or(|(_, top)| score > top) {
                best = Some((entry.language, score));
            }
        }
        best.map(|(language, _)| language)
    }

    /// Extension first, content only when the extension is missing or ambiguous.
    pub fn detect(&self, path: &Path, content: &str) -> Option<Language> {
        from_extension(path).or_else(|| self.from_content(content))
    }
}

impl Default for LanguageDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Language implied by a file extension. `None` for headers shared between
/// languages and for unknown extensions.
pub fn from_extension(path: &Path) -> Option<Language> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "cpp" | "cc" | "cxx" | "c++" | "hpp" | "hxx" => Some(Language::Cpp),
        "py" | "pyw" => Some(Language::Python),
        "java" => Some(Language::Java),
        _ => None,
    }
}

/// Whether the snapshot builder should look at a file with this name at all.
pub fn is_source_candidate(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        None => true,
        Some(ext) => from_extension(path).is_some() || ext.eq_ignore_ascii_case("h"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_detection() {
        assert_eq!(from_extension(Path::new("test.cpp")), Some(Language::Cpp));
        assert_eq!(from_extension(Path::new("gen.PY")), Some(Language::Python));
        assert_eq!(from_extension(Path::new("Main.java")), Some(Language::Java));
        assert_eq!(from_extension(Path::new("lib.h")), None);
        assert_eq!(from_extension(Path::new("generator")), None);
        assert_eq!(from_extension(Path::new("notes.txt")), None);
    }

    #[test]
    fn test_content_detection() {
        let detector = LanguageDetector::new();
        assert_eq!(
            detector.from_content("#include <bits/stdc++.h>\nint main() { return 0; }\n"),
            Some(Language::Cpp)
        );
        assert_eq!(
            detector.from_content("import sys\n\ndef solve():\n    print(1)\n"),
            Some(Language::Python)
        );
        assert_eq!(
            detector.from_content("public class Main {\n public static void main(String[] a) {}\n}\n"),
            Some(Language::Java)
        );
        assert_eq!(detector.from_content("just some words"), None);
    }

    #[test]
    fn test_detect_prefers_extension() {
        let detector = LanguageDetector::new();
        let python_looking = "def f():\n    pass\n";
        assert_eq!(
            detector.detect(Path::new("test.cpp"), python_looking),
            Some(Language::Cpp)
        );
        assert_eq!(
            detector.detect(Path::new("helpers.h"), "#include <vector>\n"),
            Some(Language::Cpp)
        );
        assert_eq!(
            detector.detect(Path::new("generator"), python_looking),
            Some(Language::Python)
        );
    }

    #[test]
    fn test_source_candidates() {
        assert!(is_source_candidate(Path::new("test.cpp")));
        assert!(is_source_candidate(Path::new("common.h")));
        assert!(is_source_candidate(Path::new("generator")));
        assert!(!is_source_candidate(Path::new("input_1.txt")));
        assert!(!is_source_candidate(Path::new("test.exe")));
    }
}
