//! Stateless text-to-value miners. Every function is total: no input
//! panics, and a miss is an empty/None result, never an error.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

// Prices below/above this band are noise: currency codes, phone numbers,
// years, item counts. Exclusive on both ends.
const PRICE_FLOOR: f64 = 100.0;
const PRICE_CEIL: f64 = 1_000_000.0;

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s*(\d(?:[\d,]*\d)?(?:\.\d+)?)\s*[-–—]\s*\$?\s*(\d(?:[\d,]*\d)?(?:\.\d+)?)")
        .unwrap()
});
static BARE_PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s*(\d(?:[\d,]*\d)?(?:\.\d+)?)").unwrap());
static WORDED_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d(?:[\d,]*\d)?(?:\.\d+)?)\s*(?:usd|dollars?)\b").unwrap()
});
static LABELED_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:price|cost|from|starting at)\s*:?\s*\$?\s*(\d(?:[\d,]*\d)?(?:\.\d+)?)")
        .unwrap()
});

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:duration\s*:?\s*)?(\d{1,3})\s*(?:days?|nights?)\b").unwrap()
});

static EXPERIENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\+?\s*years?(?:\s+of)?\s+experience\b").unwrap()
});
static EXPERIENCE_REV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bexperience\s*:?\s*(?:of\s+)?(\d{1,2})\+?\s*years?\b").unwrap()
});

static QUALIFICATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(MBBS|MRCS|FRCS|FACS|FRCP|MDS|MSc|MCh|MD|PhD|DDS|DMD|BDS)\b").unwrap()
});
const QUALIFICATIONS: &[&str] = &[
    "MBBS", "MRCS", "FRCS", "FACS", "FRCP", "MDS", "MSc", "MCh", "MD", "PhD", "DDS", "DMD", "BDS",
];

static LANGUAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(English|Spanish|German|French|Russian|Arabic|Turkish|Italian|Portuguese|Polish|Dutch|Hindi|Mandarin|Chinese|Korean|Japanese|Thai)\b",
    )
    .unwrap()
});
const LANGUAGES: &[&str] = &[
    "English", "Spanish", "German", "French", "Russian", "Arabic", "Turkish", "Italian",
    "Portuguese", "Polish", "Dutch", "Hindi", "Mandarin", "Chinese", "Korean", "Japanese", "Thai",
];

static RATING_SLASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})\s*/\s*5\b").unwrap());
static RATING_STARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d)\s*stars?\b").unwrap());
static RATING_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\brating\s*:?\s*(\d)").unwrap());
static RATING_OUT_OF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d)\s+out\s+of\s+5\b").unwrap());

static DATE_NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})[/.](\d{1,2})[/.](\d{4})\b").unwrap());
static DATE_ISO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").unwrap());
static DATE_MONTH_FIRST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b")
        .unwrap()
});
static DATE_DAY_FIRST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?\s+(Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\.?,?\s+(\d{4})\b")
        .unwrap()
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9][A-Za-z0-9._%+-]*@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
});

const INCLUSIONS: &[&str] = &[
    "accommodation", "hotel", "transfer", "consultation", "medication", "aftercare",
    "translator", "interpreter", "breakfast", "city tour", "follow-up",
];

// Procedure vocabulary shared by the pricing text-window scan and the
// testimonial procedure matcher.
pub const PROCEDURES: &[&str] = &[
    "hair transplant", "rhinoplasty", "dental implant", "veneers", "dental crown", "root canal",
    "teeth whitening", "all-on-4", "ivf", "lasik", "cataract", "liposuction", "facelift",
    "tummy tuck", "breast augmentation", "gastric sleeve", "gastric bypass", "knee replacement",
    "hip replacement", "botox",
];

/// A price recovered from text, with its original display form.
#[derive(Debug, Clone, PartialEq)]
pub struct MinedPrice {
    pub usd: f64,
    pub display: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

fn parse_amount(s: &str) -> Option<f64> {
    s.replace(',', "").parse::<f64>().ok()
}

/// The plausible-price band, exclusive on both ends.
pub fn plausible_price(v: f64) -> bool {
    v > PRICE_FLOOR && v < PRICE_CEIL
}

/// Mine one representative price from a text span. A price range whose
/// bounds both lie in the plausible band wins outright and yields the
/// arithmetic mean; otherwise single-price patterns are tried in order.
pub fn mine_price(text: &str) -> Option<MinedPrice> {
    if let Some(caps) = RANGE_RE.captures(text) {
        if let (Some(lo), Some(hi)) = (parse_amount(&caps[1]), parse_amount(&caps[2])) {
            if plausible_price(lo) && plausible_price(hi) && lo < hi {
                return Some(MinedPrice {
                    usd: (lo + hi) / 2.0,
                    display: caps[0].trim().to_string(),
                    min: Some(lo),
                    max: Some(hi),
                });
            }
        }
    }

    for re in [&*BARE_PRICE_RE, &*WORDED_PRICE_RE, &*LABELED_PRICE_RE] {
        for caps in re.captures_iter(text) {
            if let Some(v) = parse_amount(&caps[1]) {
                if plausible_price(v) {
                    return Some(MinedPrice {
                        usd: v,
                        display: caps[0].trim().to_string(),
                        min: None,
                        max: None,
                    });
                }
            }
        }
    }

    None
}

pub fn mine_duration_days(text: &str) -> Option<u32> {
    DURATION_RE
        .captures(text)
        .and_then(|c| c[1].parse::<u32>().ok())
        .filter(|&d| d > 0)
}

/// Independent keyword hits against a fixed inclusion vocabulary; a
/// package may match several.
pub fn mine_inclusions(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    INCLUSIONS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .map(|kw| kw.to_string())
        .collect()
}

fn vocab_matches(re: &Regex, vocab: &[&str], text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in re.find_iter(text) {
        if let Some(canonical) = vocab.iter().find(|v| v.eq_ignore_ascii_case(m.as_str())) {
            if !found.iter().any(|f| f == canonical) {
                found.push(canonical.to_string());
            }
        }
    }
    found
}

pub fn mine_qualifications(text: &str) -> Vec<String> {
    vocab_matches(&QUALIFICATION_RE, QUALIFICATIONS, text)
}

pub fn mine_languages(text: &str) -> Vec<String> {
    vocab_matches(&LANGUAGE_RE, LANGUAGES, text)
}

pub fn mine_experience_years(text: &str) -> Option<u32> {
    EXPERIENCE_RE
        .captures(text)
        .or_else(|| EXPERIENCE_REV_RE.captures(text))
        .and_then(|c| c[1].parse::<u32>().ok())
}

/// Rating on a 1–5 scale. Numeric patterns first; out-of-band numbers are
/// rejected, not clamped. Falls back to counting star glyphs.
pub fn mine_rating(text: &str) -> Option<u8> {
    for re in [&*RATING_SLASH_RE, &*RATING_STARS_RE, &*RATING_LABEL_RE, &*RATING_OUT_OF_RE] {
        if let Some(caps) = re.captures(text) {
            if let Ok(n) = caps[1].parse::<u8>() {
                if (1..=5).contains(&n) {
                    return Some(n);
                }
            }
        }
    }

    let stars = text.chars().filter(|c| *c == '★' || *c == '⭐').count();
    if (1..=5).contains(&stars) {
        return Some(stars as u8);
    }
    None
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: &[&str] = &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let prefix = name.get(..3)?.to_lowercase();
    MONTHS.iter().position(|m| *m == prefix).map(|i| i as u32 + 1)
}

/// Normalize the first recognizable date in `text` to a calendar date.
/// Unparsable matches (bad month/day combinations) are discarded rather
/// than treated as errors.
pub fn mine_date(text: &str) -> Option<NaiveDate> {
    for caps in DATE_NUMERIC_RE.captures_iter(text) {
        let a: u32 = caps[1].parse().ok()?;
        let b: u32 = caps[2].parse().ok()?;
        let y: i32 = caps[3].parse().ok()?;
        // Month-first, falling back to day-first when the leading
        // component cannot be a month.
        let parsed = NaiveDate::from_ymd_opt(y, a, b).or_else(|| NaiveDate::from_ymd_opt(y, b, a));
        if parsed.is_some() {
            return parsed;
        }
    }

    for caps in DATE_ISO_RE.captures_iter(text) {
        let y: i32 = caps[1].parse().ok()?;
        let m: u32 = caps[2].parse().ok()?;
        let d: u32 = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            return Some(date);
        }
    }

    for caps in DATE_MONTH_FIRST_RE.captures_iter(text) {
        if let (Some(m), Ok(d), Ok(y)) =
            (month_number(&caps[1]), caps[2].parse::<u32>(), caps[3].parse::<i32>())
        {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                return Some(date);
            }
        }
    }

    for caps in DATE_DAY_FIRST_RE.captures_iter(text) {
        if let (Ok(d), Some(m), Ok(y)) =
            (caps[1].parse::<u32>(), month_number(&caps[2]), caps[3].parse::<i32>())
        {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                return Some(date);
            }
        }
    }

    None
}

pub fn mine_email(text: &str) -> Option<String> {
    EMAIL_RE.find(text).map(|m| m.as_str().to_string())
}

/// First known procedure mentioned in the text, if any.
pub fn match_procedure(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    PROCEDURES.iter().find(|p| lower.contains(*p)).copied()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_band_is_exclusive() {
        assert!(mine_price("$50").is_none());
        assert!(mine_price("$100").is_none());
        assert!(mine_price("$101").is_some());
        assert!(mine_price("$999,999").is_some());
        assert!(mine_price("$1,000,000").is_none());
    }

    #[test]
    fn phone_numbers_and_years_are_rejected() {
        assert!(mine_price("Call us: 5550134").is_none());
        assert!(mine_price("Established 1995, over 40 dentists").is_none());
    }

    #[test]
    fn range_yields_mean_and_bounds() {
        let p = mine_price("Hair transplant $3,000 - $8,000 all inclusive").unwrap();
        assert_eq!(p.usd, 5500.0);
        assert_eq!(p.min, Some(3000.0));
        assert_eq!(p.max, Some(8000.0));
        assert_eq!(p.display, "$3,000 - $8,000");
    }

    #[test]
    fn implausible_range_falls_through() {
        // Both bounds below the floor: not a price range worth keeping.
        assert!(mine_price("$5 - $20").is_none());
    }

    #[test]
    fn worded_and_labeled_prices() {
        assert_eq!(mine_price("2500 USD per eye").unwrap().usd, 2500.0);
        assert_eq!(mine_price("Price: 3,200 dollars").unwrap().usd, 3200.0);
        assert_eq!(mine_price("Starting at 450").unwrap().usd, 450.0);
    }

    #[test]
    fn qualifications_experience_languages_combined() {
        let text = "MD, FRCS, 15 years experience, speaks English and Spanish";
        assert_eq!(mine_qualifications(text), vec!["MD", "FRCS"]);
        assert_eq!(mine_experience_years(text), Some(15));
        assert_eq!(mine_languages(text), vec!["English", "Spanish"]);
    }

    #[test]
    fn qualifications_are_whole_word() {
        // "md" inside a word must not count.
        assert!(mine_qualifications("Amsterdam clinic").is_empty());
        assert_eq!(mine_qualifications("Jane Roe, md"), vec!["MD"]);
    }

    #[test]
    fn experience_either_word_order() {
        assert_eq!(mine_experience_years("Experience: 20 years"), Some(20));
        assert_eq!(mine_experience_years("8 years of experience"), Some(8));
        assert_eq!(mine_experience_years("no numbers here"), None);
    }

    #[test]
    fn rating_patterns() {
        assert_eq!(mine_rating("4/5 would recommend"), Some(4));
        assert_eq!(mine_rating("gave it 5 stars"), Some(5));
        assert_eq!(mine_rating("Rating: 3"), Some(3));
        assert_eq!(mine_rating("4 out of 5"), Some(4));
    }

    #[test]
    fn rating_star_glyph_fallback() {
        assert_eq!(mine_rating("★★★★"), Some(4));
        assert_eq!(mine_rating("★★★★★★"), None);
    }

    #[test]
    fn rating_out_of_bounds_is_none() {
        assert_eq!(mine_rating("7/5"), None);
        assert_eq!(mine_rating("0/5"), None);
    }

    #[test]
    fn duration_patterns() {
        assert_eq!(mine_duration_days("Duration: 7 days"), Some(7));
        assert_eq!(mine_duration_days("10 nights in Istanbul"), Some(10));
        assert_eq!(mine_duration_days("same-day procedure"), None);
    }

    #[test]
    fn inclusions_are_independent_hits() {
        let found = mine_inclusions("Includes hotel accommodation and airport transfers");
        assert!(found.contains(&"accommodation".to_string()));
        assert!(found.contains(&"hotel".to_string()));
        assert!(found.contains(&"transfer".to_string()));
    }

    #[test]
    fn date_numeric_month_first_then_day_first() {
        assert_eq!(
            mine_date("03/15/2024"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(
            mine_date("Reviewed 25/12/2023"),
            NaiveDate::from_ymd_opt(2023, 12, 25)
        );
    }

    #[test]
    fn date_iso_and_month_name() {
        assert_eq!(mine_date("2024-03-15"), NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(
            mine_date("March 15, 2024"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(
            mine_date("visited on 3rd January 2025"),
            NaiveDate::from_ymd_opt(2025, 1, 3)
        );
    }

    #[test]
    fn unparsable_dates_are_discarded() {
        assert_eq!(mine_date("99/99/2024 was great"), None);
        assert_eq!(mine_date("no date at all"), None);
    }

    #[test]
    fn email_miner() {
        assert_eq!(
            mine_email("Contact: info@clinic-example.com or call us").as_deref(),
            Some("info@clinic-example.com")
        );
        assert_eq!(mine_email("no address"), None);
    }

    #[test]
    fn procedure_matching() {
        assert_eq!(match_procedure("Full IVF cycle with ICSI"), Some("ivf"));
        assert_eq!(match_procedure("General checkup"), None);
    }
}
