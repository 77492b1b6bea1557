//! Message language detection.
//!
//! The engine only needs to pick between the Russian and English reply
//! prompts, so detection is a deterministic script count rather than a
//! statistical model. Short texts are skipped entirely.

/// Detects the language of inbound message text.
pub trait LanguageDetector: Send + Sync {
    /// Returns an ISO 639-1 code, or `None` when the text is too short or
    /// carries no alphabetic signal.
    fn detect(&self, text: &str) -> Option<&'static str>;
}

/// Script-counting detector: Cyrillic vs Latin letters.
pub struct ScriptDetector {
    min_chars: usize,
}

impl ScriptDetector {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }
}

impl LanguageDetector for ScriptDetector {
    fn detect(&self, text: &str) -> Option<&'static str> {
        let text = text.trim();
        if text.chars().count() < self.min_chars {
            return None;
        }

        let mut cyrillic = 0usize;
        let mut latin = 0usize;
        for ch in text.chars() {
            if ('\u{0400}'..='\u{04FF}').contains(&ch) {
                cyrillic += 1;
            } else if ch.is_ascii_alphabetic() {
                latin += 1;
            }
        }

        if cyrillic == 0 && latin == 0 {
            return None;
        }
        Some(if cyrillic >= latin { "ru" } else { "en" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ScriptDetector {
        ScriptDetector::new(20)
    }

    #[test]
    fn detects_russian() {
        let text = "Здравствуйте, подскажите пожалуйста статус моего заказа";
        assert_eq!(detector().detect(text), Some("ru"));
    }

    #[test]
    fn detects_english() {
        let text = "Hello, could you tell me the status of my order please?";
        assert_eq!(detector().detect(text), Some("en"));
    }

    #[test]
    fn short_text_is_skipped() {
        assert_eq!(detector().detect("Спасибо!"), None);
        assert_eq!(detector().detect("Thanks!"), None);
    }

    #[test]
    fn mixed_text_follows_majority_script() {
        let text = "Здравствуйте! My order number is 42, подскажите статус доставки";
        assert_eq!(detector().detect(text), Some("ru"));
    }

    #[test]
    fn digits_and_punctuation_only_yield_nothing() {
        assert_eq!(detector().detect("1234567890 !!! ??? 000 111 222"), None);
    }
}
