pub mod packages;
pub mod pricing;
pub mod staff;
pub mod testimonials;

use scraper::ElementRef;

/// What one stage of the pipeline did for one facility.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageOutcome {
    pub attempted: bool,
    pub success: bool,
    pub count: usize,
}

impl StageOutcome {
    /// Stage disabled by configuration; never attempted.
    pub fn skipped() -> Self {
        Self { attempted: false, success: false, count: 0 }
    }

    /// Attempted but failed (no page, navigation error, parse error).
    pub fn failed() -> Self {
        Self { attempted: true, success: false, count: 0 }
    }

    /// Attempted and completed. A heuristic miss is `ok(0)`: an empty
    /// result is not an error.
    pub fn ok(count: usize) -> Self {
        Self { attempted: true, success: true, count }
    }
}

/// Whitespace-normalized text content of an element and its descendants.
pub fn element_text(el: ElementRef) -> String {
    normalize_ws(&el.text().collect::<Vec<_>>().join(" "))
}

pub fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased alphanumeric form used for near-identical comparisons.
pub fn normalized_key(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Byte-range slice clamped to valid char boundaries; used for text
/// windows around keyword hits.
pub fn char_window(s: &str, start: usize, end: usize) -> &str {
    let mut a = start.min(s.len());
    while a > 0 && !s.is_char_boundary(a) {
        a -= 1;
    }
    let mut b = end.min(s.len());
    while b < s.len() && !s.is_char_boundary(b) {
        b += 1;
    }
    &s[a..b]
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_key_strips_case_and_punctuation() {
        assert_eq!(normalized_key("All-Inclusive  Hair Package!"), "allinclusivehairpackage");
    }

    #[test]
    fn char_window_respects_boundaries() {
        let s = "résumé of care";
        // Byte 2 falls inside the 'é'; the window must widen, not panic.
        let w = char_window(s, 2, 5);
        assert!(!w.is_empty());
    }

    #[test]
    fn outcome_constructors() {
        assert!(!StageOutcome::skipped().attempted);
        let failed = StageOutcome::failed();
        assert!(failed.attempted && !failed.success);
        let ok = StageOutcome::ok(0);
        assert!(ok.attempted && ok.success);
    }
}
