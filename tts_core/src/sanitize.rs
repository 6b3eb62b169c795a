//! Strips presentation markup from LLM output so speech engines do not read
//! asterisks, hashes and URLs aloud.

use once_cell::sync::Lazy;
use regex::Regex;

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

fn rule(pattern: &str, replacement: &'static str) -> Rule {
    Rule {
        pattern: Regex::new(pattern).expect("sanitizer pattern"),
        replacement,
    }
}

// Order matters: code blocks before inline code, links before stray brackets.
// No replacement is longer than the shortest text its pattern can match.
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?s)```.*?```", " "),
        rule(r"`([^`\n]+)`", "$1"),
        rule(r"!\[([^\]]*)\]\([^)]*\)", "$1"),
        rule(r"\[([^\]]+)\]\([^)]*\)", "$1"),
        rule(r"(?m)^[ \t]*#{1,6}[ \t]*", ""),
        rule(r"(?m)^[ \t]*>+[ \t]?", ""),
        rule(r"(?m)^[ \t]*[-*+•][ \t]+", ""),
        rule(r"(?m)^[ \t]*\d+[.)][ \t]+", ""),
        rule(r"[*~`]+", ""),
        // underscores only where they open or close a word
        rule(r"(^|[^\w])_+(\w)", "$1$2"),
        rule(r"(\w)_+([^\w]|$)", "$1$2"),
        rule(r"(^|\s)_+(\s|$)", "$1$2"),
        rule(r"[#•]+", " "),
        rule(r"\s+", " "),
    ]
});

fn pass(text: &str) -> String {
    let mut out = text.to_string();
    for rule in RULES.iter() {
        let replaced = rule.pattern.replace_all(&out, rule.replacement);
        if let std::borrow::Cow::Owned(s) = replaced {
            out = s;
        }
    }
    out.trim().to_string()
}

/// Removes markup and collapses whitespace.
///
/// The rules run until the text stops changing, so `sanitize(sanitize(x))`
/// equals `sanitize(x)`, and the result is never longer than the input.
/// An empty result means there is nothing worth speaking.
pub fn sanitize(text: &str) -> String {
    let mut current = pass(text);
    loop {
        let next = pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_emphasis_and_headings() {
        assert_eq!(sanitize("## **Bold** and *italic*"), "Bold and italic");
        assert_eq!(sanitize("__under__ _score_"), "under score");
    }

    #[test]
    fn test_underscores_inside_words_survive() {
        assert_eq!(sanitize("snake_case_name here"), "snake_case_name here");
        assert_eq!(sanitize("call _my_var_ now"), "call my_var now");
        assert_eq!(sanitize("a __b__ c"), "a b c");
        assert_eq!(sanitize("___"), "");
    }

    #[test]
    fn test_links_keep_their_text() {
        assert_eq!(
            sanitize("See [the docs](https://example.com/x) now."),
            "See the docs now."
        );
        assert_eq!(sanitize("![a cat](cat.png) sits."), "a cat sits.");
    }

    #[test]
    fn test_code_blocks_removed_inline_code_kept() {
        let text = "Run `cargo build` first.\n```rust\nfn main() {}\n```\nDone.";
        assert_eq!(sanitize(text), "Run cargo build first. Done.");
    }

    #[test]
    fn test_list_markers_and_quotes() {
        let text = "- first\n* second\n1. third\n> quoted";
        assert_eq!(sanitize(text), "first second third quoted");
    }

    #[test]
    fn test_markup_only_becomes_empty() {
        assert_eq!(sanitize("**"), "");
        assert_eq!(sanitize("  \n\t "), "");
        assert_eq!(sanitize("# ###"), "");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "**nested *emphasis* here**",
            "[[link](x)](y)",
            "` `` ` text",
            "#### • bullet • and # hash",
            "```unterminated code",
            "plain sentence.",
            "_*_*_*",
        ];
        for s in samples {
            let once = sanitize(s);
            assert_eq!(sanitize(&once), once, "input: {s:?}");
        }
    }

    #[test]
    fn test_never_longer_than_input() {
        let samples = [
            "a • b",
            "[x](y)",
            "```a```b",
            "1. item",
            "tabs\t\tand\n\nnewlines",
            "नमस्ते **दुनिया**",
        ];
        for s in samples {
            let out = sanitize(s);
            assert!(out.len() <= s.len(), "{s:?} grew to {out:?}");
            assert!(out.chars().count() <= s.chars().count());
        }
    }
}
