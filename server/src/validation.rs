use crate::error::ApiError;

/// Maximum text length for speech and chat requests, in characters.
const MAX_TEXT_LENGTH: usize = 5000;

/// Validate the text and optional language of a request.
pub fn validate_text_request(text: &str, language: Option<&str>) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    if text.chars().count() > MAX_TEXT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }

    if let Some(lang) = language {
        if !is_valid_language_code(lang) {
            return Err(ApiError::InvalidInput(format!(
                "Invalid language code format: {}. Expected format: ll or ll_CC (e.g., en, hi_IN)",
                lang
            )));
        }
    }

    Ok(())
}

pub fn validate_session_id(id: &str) -> Result<(), ApiError> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| ApiError::InvalidInput(format!("Invalid session id: {id}")))
}

/// `ll` or `ll_CC`: two lowercase letters, optionally an underscore and two
/// uppercase letters.
fn is_valid_language_code(code: &str) -> bool {
    let parts: Vec<&str> = code.split('_').collect();
    match parts.as_slice() {
        [lang] => is_lower_pair(lang),
        [lang, country] => {
            is_lower_pair(lang)
                && country.len() == 2
                && country.chars().all(|c| c.is_ascii_uppercase())
        }
        _ => false,
    }
}

fn is_lower_pair(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_lowercase())
}

/// Routing key for a validated language code (`hi_IN` routes as `hi`).
pub fn route_language(code: &str) -> &str {
    code.split('_').next().unwrap_or(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_text_request_valid() {
        assert!(validate_text_request("Hello", Some("hi_IN")).is_ok());
        assert!(validate_text_request("Test", None).is_ok());
        assert!(validate_text_request(&"न".repeat(5000), Some("hi")).is_ok());
    }

    #[test]
    fn test_validate_text_request_empty_text() {
        for text in ["", "   \n"] {
            match validate_text_request(text, None) {
                Err(ApiError::InvalidInput(msg)) => assert!(msg.contains("empty")),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate_text_request_too_long() {
        let long_text = "a".repeat(5001);
        match validate_text_request(&long_text, None) {
            Err(ApiError::InvalidInput(msg)) => assert!(msg.contains("too long")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_language_codes() {
        assert!(validate_text_request("Hello", Some("invalid")).is_err());
        assert!(validate_text_request("Hello", Some("EN")).is_err());
        assert!(validate_text_request("Hello", Some("en_us")).is_err());
        assert!(validate_text_request("Hello", Some("te")).is_ok());
        assert!(validate_text_request("Hello", Some("en_US")).is_ok());
    }

    #[test]
    fn test_session_id() {
        assert!(validate_session_id("6f1c1f5e-3b7a-4c61-9d59-0d3c8a1b2e4f").is_ok());
        assert!(validate_session_id("not-a-uuid").is_err());
    }

    #[test]
    fn test_route_language() {
        assert_eq!(route_language("hi_IN"), "hi");
        assert_eq!(route_language("en"), "en");
    }
}
