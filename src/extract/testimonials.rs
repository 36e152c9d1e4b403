use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::{element_text, normalized_key, truncate_chars, StageOutcome};
use crate::db::{self, Facility, InsertOutcome, MetricRow, TestimonialRow};
use crate::fetch::PageFetcher;
use crate::locate::{self, Topic};
use crate::miners;

static CARD_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        ".testimonial, .review, .patient-story, blockquote, \
         [class*=\"testimonial\"], [class*=\"review\"]",
    )
    .unwrap()
});
static REVIEW_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[itemtype*=\"Review\"]").unwrap());
static REVIEW_BODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[itemprop=\"reviewBody\"]").unwrap());
static AUTHOR_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".author, .patient-name, .name, cite, [itemprop=\"author\"]").unwrap()
});
static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

static TRAILING_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[—–-]\s*([A-Z][A-Za-z.]+(?:\s+[A-Z][A-Za-z.]+){0,2})\s*$").unwrap());

const MIN_TEXT_LEN: usize = 20;
const DEDUPE_PREFIX_LEN: usize = 60;
const DEFAULT_RATING: u8 = 5;

/// One aggregate success statistic kind. The set is closed; persistence
/// upserts on (facility, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    SuccessfulSurgeries,
    PatientsTreated,
    YearsExperience,
    SuccessRate,
    SatisfactionRate,
    ProceduresPerformed,
    DoctorsCount,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::SuccessfulSurgeries,
        MetricKind::PatientsTreated,
        MetricKind::YearsExperience,
        MetricKind::SuccessRate,
        MetricKind::SatisfactionRate,
        MetricKind::ProceduresPerformed,
        MetricKind::DoctorsCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::SuccessfulSurgeries => "successful_surgeries",
            MetricKind::PatientsTreated => "patients_treated",
            MetricKind::YearsExperience => "years_experience",
            MetricKind::SuccessRate => "success_rate",
            MetricKind::SatisfactionRate => "satisfaction_rate",
            MetricKind::ProceduresPerformed => "procedures_performed",
            MetricKind::DoctorsCount => "doctors_count",
        }
    }

    fn pattern(self) -> &'static Regex {
        static SURGERIES: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b([\d,]+)\+?\s+successful\s+(?:surgeries|operations|treatments)\b")
                .unwrap()
        });
        static PATIENTS: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b([\d,]+)\+?\s+(?:happy\s+|satisfied\s+)?patients(?:\s+treated|\s+served)?\b")
                .unwrap()
        });
        static YEARS: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b(\d{1,2})\+?\s+years?\s+(?:of\s+)?experience\b").unwrap()
        });
        static SUCCESS: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b(\d{1,3}(?:\.\d+)?)\s*%\s*success(?:\s+rate)?\b").unwrap()
        });
        static SATISFACTION: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b(\d{1,3}(?:\.\d+)?)\s*%\s*(?:patient\s+)?satisfaction\b").unwrap()
        });
        static PROCEDURES: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b([\d,]+)\+?\s+procedures(?:\s+performed)?\b").unwrap()
        });
        static DOCTORS: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b(\d{1,4})\+?\s+(?:doctors|surgeons|dentists|specialists)\b").unwrap()
        });
        match self {
            MetricKind::SuccessfulSurgeries => &*SURGERIES,
            MetricKind::PatientsTreated => &*PATIENTS,
            MetricKind::YearsExperience => &*YEARS,
            MetricKind::SuccessRate => &*SUCCESS,
            MetricKind::SatisfactionRate => &*SATISFACTION,
            MetricKind::ProceduresPerformed => &*PROCEDURES,
            MetricKind::DoctorsCount => &*DOCTORS,
        }
    }
}

/// The testimonials stage also harvests facility-level success metrics
/// from the same page; its outcome reports both counts.
pub struct TestimonialsOutcome {
    pub stage: StageOutcome,
    pub metrics: usize,
}

pub async fn run(
    fetcher: &PageFetcher,
    conn: &Connection,
    facility: &Facility,
) -> TestimonialsOutcome {
    match enrich(fetcher, conn, facility).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("testimonials stage failed for {}: {:#}", facility.name, e);
            TestimonialsOutcome { stage: StageOutcome::failed(), metrics: 0 }
        }
    }
}

async fn enrich(
    fetcher: &PageFetcher,
    conn: &Connection,
    facility: &Facility,
) -> anyhow::Result<TestimonialsOutcome> {
    let base = Url::parse(&facility.website)?;
    let home = fetcher.fetch_page(base.as_str()).await?;

    let page = match locate::locate(fetcher, &base, &home.html, Topic::Testimonials).await {
        Some(url) if url != home.url => fetcher.fetch_page(&url).await?,
        _ => {
            debug!("mining home page for testimonials: {}", facility.name);
            home
        }
    };

    let records = extract(&page.html, &facility.id, &page.url);
    for r in &records {
        match db::insert_testimonial(conn, r) {
            Ok(InsertOutcome::Inserted) | Ok(InsertOutcome::Skipped) => {}
            Err(e) => warn!("testimonial insert failed: {}", e),
        }
    }
    db::update_testimonials_count(conn, &facility.id)?;

    let metrics = extract_metrics(&page.html, &facility.id, &page.url);
    for m in &metrics {
        if let Err(e) = db::upsert_metric(conn, m) {
            warn!("metric upsert failed ({}): {}", m.metric_type, e);
        }
    }
    if !metrics.is_empty() {
        db::update_metrics_snapshot(conn, &facility.id, &metrics)?;
    }

    Ok(TestimonialsOutcome { stage: StageOutcome::ok(records.len()), metrics: metrics.len() })
}

/// Mine patient reviews from one rendered page.
pub fn extract(html: &str, facility_id: &str, page_url: &str) -> Vec<TestimonialRow> {
    let doc = Html::parse_document(html);

    let containers: Vec<(String, Option<String>)> = {
        let cards: Vec<_> = doc
            .select(&CARD_SEL)
            .map(|el| {
                let author = el.select(&AUTHOR_SEL).next().map(element_text);
                (element_text(el), author)
            })
            .collect();
        if !cards.is_empty() {
            cards
        } else {
            doc.select(&REVIEW_SEL)
                .map(|el| {
                    let body = el
                        .select(&REVIEW_BODY_SEL)
                        .next()
                        .map(element_text)
                        .unwrap_or_else(|| element_text(el));
                    let author = el.select(&AUTHOR_SEL).next().map(element_text);
                    (body, author)
                })
                .collect()
        }
    };

    let mut seen_prefixes: HashSet<String> = HashSet::new();
    let mut rows = Vec::new();
    for (raw_text, author) in containers {
        let text = raw_text.trim().to_string();
        if text.chars().count() <= MIN_TEXT_LEN {
            continue;
        }
        let prefix = truncate_chars(&normalized_key(&text), DEDUPE_PREFIX_LEN);
        if !seen_prefixes.insert(prefix) {
            continue;
        }

        let patient_name = author
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty() && a.chars().count() < 60)
            .or_else(|| trailing_name(&text));

        rows.push(TestimonialRow {
            facility_id: facility_id.to_string(),
            patient_name,
            procedure: miners::match_procedure(&text).map(String::from),
            rating: miners::mine_rating(&text).unwrap_or(DEFAULT_RATING),
            review_date: miners::mine_date(&text).map(|d| d.format("%Y-%m-%d").to_string()),
            text,
            source_url: page_url.to_string(),
        });
    }
    rows
}

/// "... — Maria S." style signatures at the end of a review.
fn trailing_name(text: &str) -> Option<String> {
    TRAILING_NAME_RE
        .captures(text)
        .map(|c| c[1].trim().to_string())
}

/// Scan the whole page for aggregate statistics, at most one per kind.
pub fn extract_metrics(html: &str, facility_id: &str, page_url: &str) -> Vec<MetricRow> {
    let doc = Html::parse_document(html);
    let text = match doc.select(&BODY_SEL).next() {
        Some(body) => element_text(body),
        None => return Vec::new(),
    };

    let mut out = Vec::new();
    for kind in MetricKind::ALL {
        let Some(caps) = kind.pattern().captures(&text) else { continue };
        let Ok(value) = caps[1].replace(',', "").parse::<f64>() else { continue };
        out.push(MetricRow {
            facility_id: facility_id.to_string(),
            metric_type: kind.as_str().to_string(),
            value,
            display_text: caps[0].trim().to_string(),
            source_url: page_url.to_string(),
        });
    }
    out
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_cards() {
        let html = r#"
            <div class="testimonial">
                <p>My hair transplant exceeded every expectation, 5/5.
                   Reviewed on March 15, 2024.</p>
                <span class="author">James W.</span>
            </div>
        "#;
        let rows = extract(html, "fac-1", "https://clinic.example/reviews");
        assert_eq!(rows.len(), 1);
        let t = &rows[0];
        assert_eq!(t.patient_name.as_deref(), Some("James W."));
        assert_eq!(t.procedure.as_deref(), Some("hair transplant"));
        assert_eq!(t.rating, 5);
        assert_eq!(t.review_date.as_deref(), Some("2024-03-15"));
    }

    #[test]
    fn short_text_is_always_excluded() {
        let html = r#"
            <div class="review"><p>Great clinic!</p><span class="author">Ana</span></div>
        "#;
        assert!(extract(html, "fac-1", "https://x.example").is_empty());
    }

    #[test]
    fn rating_defaults_to_five() {
        let html = r#"
            <blockquote>The whole dental implant journey was smooth and painless.</blockquote>
        "#;
        let rows = extract(html, "fac-1", "https://x.example");
        assert_eq!(rows[0].rating, 5);
    }

    #[test]
    fn star_glyphs_set_the_rating() {
        let html = r#"
            <blockquote>★★★★ Friendly staff and a very clean facility overall.</blockquote>
        "#;
        let rows = extract(html, "fac-1", "https://x.example");
        assert_eq!(rows[0].rating, 4);
    }

    #[test]
    fn near_identical_reviews_collapse() {
        let html = r#"
            <div class="review"><p>Wonderful experience from start to finish, thank you all!</p></div>
            <blockquote>Wonderful experience from start to finish, thank you all!</blockquote>
        "#;
        let rows = extract(html, "fac-1", "https://x.example");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn trailing_signature_is_picked_up() {
        let html = r#"
            <blockquote>Veneers done in three visits, could not be happier. — Maria Lopez</blockquote>
        "#;
        let rows = extract(html, "fac-1", "https://x.example");
        assert_eq!(rows[0].patient_name.as_deref(), Some("Maria Lopez"));
    }

    #[test]
    fn microdata_reviews_as_fallback() {
        let html = r#"
            <div itemscope itemtype="https://schema.org/Review">
                <p itemprop="reviewBody">Recovery was quick and the aftercare was thorough.</p>
                <span itemprop="author">P. Novak</span>
            </div>
        "#;
        let rows = extract(html, "fac-1", "https://x.example");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].patient_name.as_deref(), Some("P. Novak"));
    }

    #[test]
    fn metrics_one_per_kind() {
        let html = r#"
            <body>
              <p>Over 12,000 successful surgeries and 15,000 patients treated.</p>
              <p>98% success rate. 25 doctors on staff. 21 years of experience.</p>
              <p>Also 9,000 successful surgeries claimed elsewhere.</p>
            </body>
        "#;
        let metrics = extract_metrics(html, "fac-1", "https://x.example");
        let kinds: Vec<&str> = metrics.iter().map(|m| m.metric_type.as_str()).collect();
        assert!(kinds.contains(&"successful_surgeries"));
        assert!(kinds.contains(&"patients_treated"));
        assert!(kinds.contains(&"success_rate"));
        assert!(kinds.contains(&"doctors_count"));
        assert!(kinds.contains(&"years_experience"));
        // First match wins; the later figure never replaces it.
        let surgeries = metrics.iter().find(|m| m.metric_type == "successful_surgeries").unwrap();
        assert_eq!(surgeries.value, 12000.0);
        assert_eq!(kinds.iter().filter(|k| **k == "successful_surgeries").count(), 1);
    }

    #[test]
    fn no_metrics_no_rows() {
        let html = "<body><p>Welcome to our clinic.</p></body>";
        assert!(extract_metrics(html, "fac-1", "https://x.example").is_empty());
    }
}
