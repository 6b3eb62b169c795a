use std::time::Duration;

const SIMPLE_PATTERNS: [&str; 8] = [
    "what is", "who is", "calculate", "plus", "minus", "times", "divided", "what's",
];
const DETAILED_PATTERNS: [&str; 5] = [
    "explain",
    "describe",
    "how does",
    "tell me about",
    "in detail",
];

/// Guesses the reply language from the script of the query.
///
/// Telugu and Devanagari letters win over everything else; anything
/// without them is treated as English.
pub fn detect_language(text: &str) -> &'static str {
    if text.chars().any(|c| ('\u{0C00}'..='\u{0C7F}').contains(&c)) {
        "te"
    } else if text.chars().any(|c| ('\u{0900}'..='\u{097F}').contains(&c)) {
        "hi"
    } else {
        "en"
    }
}

/// Token and wall-clock allowance for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryBudget {
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for QueryBudget {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            timeout: Duration::from_secs(15),
        }
    }
}

impl QueryBudget {
    pub fn for_query(text: &str) -> Self {
        let query = text.to_lowercase();
        if query.chars().count() < 30 && SIMPLE_PATTERNS.iter().any(|p| query.contains(p)) {
            return Self {
                max_tokens: 150,
                timeout: Duration::from_secs(5),
            };
        }
        if DETAILED_PATTERNS.iter().any(|p| query.contains(p)) {
            return Self {
                max_tokens: 1200,
                ..Self::default()
            };
        }
        Self::default()
    }
}

pub fn default_system_prompt() -> &'static str {
    "You are a helpful voice assistant. Be accurate and conversational. \
     Your replies are read aloud, so write every response as continuous flowing paragraphs. \
     Never use bullet points, numbered lists, headings, tables or code blocks. \
     Connect ideas with full sentences instead of separate points or step-by-step instructions. \
     Be concise for simple questions and more detailed for complex ones."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("hello there"), "en");
        assert_eq!(detect_language("नमस्ते दोस्त"), "hi");
        assert_eq!(detect_language("నమస్కారం"), "te");
        assert_eq!(detect_language("mixed నమస్కారం नमस्ते"), "te");
        assert_eq!(detect_language(""), "en");
    }

    #[test]
    fn test_budget_for_simple_query() {
        let budget = QueryBudget::for_query("What is 2 plus 2?");
        assert_eq!(budget.max_tokens, 150);
        assert_eq!(budget.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_long_simple_query_is_not_simple() {
        let budget =
            QueryBudget::for_query("What is the capital city of the country with most lakes?");
        assert_eq!(budget, QueryBudget::default());
    }

    #[test]
    fn test_budget_for_detailed_query() {
        let budget = QueryBudget::for_query("Explain how rainbows form");
        assert_eq!(budget.max_tokens, 1200);
        assert_eq!(budget.timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_budget_default() {
        assert_eq!(QueryBudget::for_query("Good morning"), QueryBudget::default());
    }
}
