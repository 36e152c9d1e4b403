use std::sync::LazyLock;

use rusqlite::Connection;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::{element_text, normalized_key, truncate_chars, StageOutcome};
use crate::db::{self, Facility, InsertOutcome, PackageRow};
use crate::fetch::PageFetcher;
use crate::locate::{self, Topic};
use crate::miners;

static CARD_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        ".package, .offer, .deal, .plan, [class*=\"package\"], [class*=\"offer\"]",
    )
    .unwrap()
});
static HEADING_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h2, h3, h4").unwrap());
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h2, h3, h4, .title, .package-name").unwrap());

const HEADING_KEYWORDS: &[&str] = &["package", "all inclusive", "all-inclusive", "bundle"];
const DEFAULT_NAME: &str = "Medical Package";

/// Run the packages stage for one facility, falling back to the home
/// page when no dedicated offers page exists.
pub async fn run(fetcher: &PageFetcher, conn: &Connection, facility: &Facility) -> StageOutcome {
    match enrich(fetcher, conn, facility).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("packages stage failed for {}: {:#}", facility.name, e);
            StageOutcome::failed()
        }
    }
}

async fn enrich(
    fetcher: &PageFetcher,
    conn: &Connection,
    facility: &Facility,
) -> anyhow::Result<StageOutcome> {
    let base = Url::parse(&facility.website)?;
    let home = fetcher.fetch_page(base.as_str()).await?;

    let page = match locate::locate(fetcher, &base, &home.html, Topic::Packages).await {
        Some(url) if url != home.url => fetcher.fetch_page(&url).await?,
        _ => {
            debug!("mining home page for packages: {}", facility.name);
            home
        }
    };

    let records = extract(&page.html, &facility.id, &page.url);
    for r in &records {
        match db::insert_package(conn, r) {
            Ok(InsertOutcome::Inserted) | Ok(InsertOutcome::Skipped) => {}
            Err(e) => warn!("package insert failed ({}): {}", r.name, e),
        }
    }
    db::update_packages_count(conn, &facility.id)?;

    Ok(StageOutcome::ok(records.len()))
}

struct Candidate {
    name: Option<String>,
    text: String,
}

/// Mine package offers from one rendered page. A candidate without a
/// resolved price is discarded; a candidate without a name keeps a
/// generic label.
pub fn extract(html: &str, facility_id: &str, page_url: &str) -> Vec<PackageRow> {
    let doc = Html::parse_document(html);

    let candidates = {
        let found = from_cards(&doc);
        if found.is_empty() { from_headings(&doc) } else { found }
    };

    let mut rows: Vec<PackageRow> = Vec::new();
    for c in candidates {
        let Some(price) = miners::mine_price(&c.text) else { continue };
        let name = c
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_NAME.to_string());

        if rows.iter().any(|r| similar_names(&r.name, &name)) {
            continue;
        }

        rows.push(PackageRow {
            facility_id: facility_id.to_string(),
            description: Some(truncate_chars(&c.text, 400)),
            price_usd: price.usd,
            display_text: price.display,
            inclusions: miners::mine_inclusions(&c.text),
            duration_days: miners::mine_duration_days(&c.text),
            source_url: page_url.to_string(),
            name,
        });
    }
    rows
}

/// Strategy 1: offer/package card containers.
fn from_cards(doc: &Html) -> Vec<Candidate> {
    doc.select(&CARD_SEL)
        .map(|card| Candidate {
            name: card.select(&TITLE_SEL).next().map(element_text),
            text: element_text(card),
        })
        .collect()
}

/// Strategy 2: headings that announce a package, with the text that
/// follows them up to the next heading.
fn from_headings(doc: &Html) -> Vec<Candidate> {
    let mut out = Vec::new();
    for heading in doc.select(&HEADING_SEL) {
        let title = element_text(heading);
        let lower = title.to_lowercase();
        if !HEADING_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            continue;
        }
        let trailing = heading
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .take_while(|el| !matches!(el.value().name(), "h1" | "h2" | "h3" | "h4"))
            .take(4)
            .map(element_text)
            .collect::<Vec<_>>()
            .join(" ");
        out.push(Candidate {
            text: format!("{} {}", title, trailing),
            name: Some(title),
        });
    }
    out
}

/// Approximate name equality: normalized forms match exactly or one is a
/// prefix of the other.
fn similar_names(a: &str, b: &str) -> bool {
    let (ka, kb) = (normalized_key(a), normalized_key(b));
    if ka.is_empty() || kb.is_empty() {
        return ka == kb;
    }
    ka.starts_with(&kb) || kb.starts_with(&ka)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_with_price_duration_inclusions() {
        let html = r#"
            <div class="package">
                <h3>All-Inclusive Hair Package</h3>
                <p>3,500 USD. Duration: 4 days. Includes hotel accommodation,
                   airport transfers and free consultation.</p>
            </div>
        "#;
        let rows = extract(html, "fac-1", "https://clinic.example/packages");
        assert_eq!(rows.len(), 1);
        let p = &rows[0];
        assert_eq!(p.name, "All-Inclusive Hair Package");
        assert_eq!(p.price_usd, 3500.0);
        assert_eq!(p.duration_days, Some(4));
        assert!(p.inclusions.contains(&"accommodation".to_string()));
        assert!(p.inclusions.contains(&"transfer".to_string()));
        assert!(p.inclusions.contains(&"consultation".to_string()));
    }

    #[test]
    fn priceless_package_is_discarded() {
        let html = r#"
            <div class="package"><h3>Luxury Smile Package</h3><p>Call for details.</p></div>
        "#;
        assert!(extract(html, "fac-1", "https://x.example").is_empty());
    }

    #[test]
    fn missing_name_gets_generic_label() {
        let html = r#"<div class="offer"><p>Complete stay from $2,400, 7 nights.</p></div>"#;
        let rows = extract(html, "fac-1", "https://x.example");
        assert_eq!(rows[0].name, DEFAULT_NAME);
        assert_eq!(rows[0].duration_days, Some(7));
    }

    #[test]
    fn heading_fallback() {
        let html = r#"
            <h2>Dental Package Deal</h2>
            <p>Two weeks, full mouth restoration, $6,000 - $9,000.</p>
            <h2>Contact</h2>
            <p>Write to us.</p>
        "#;
        let rows = extract(html, "fac-1", "https://x.example");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Dental Package Deal");
        assert_eq!(rows[0].price_usd, 7500.0);
    }

    #[test]
    fn near_identical_names_collapse() {
        let html = r#"
            <div class="package"><h3>Hair Package</h3><p>$2,000</p></div>
            <div class="package"><h3>Hair Package </h3><p>$2,200</p></div>
        "#;
        let rows = extract(html, "fac-1", "https://x.example");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price_usd, 2000.0);
    }
}
