use std::collections::HashSet;
use std::sync::LazyLock;

use rusqlite::Connection;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::{char_window, element_text, StageOutcome};
use crate::db::{self, Facility, InsertOutcome, PricingRow};
use crate::fetch::PageFetcher;
use crate::locate::{self, Topic};
use crate::miners::{self, PROCEDURES};

static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table tr").unwrap());
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td, th").unwrap());
static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

// How much text around a procedure mention is searched for a price.
const WINDOW_BEFORE: usize = 40;
const WINDOW_AFTER: usize = 160;

/// Run the pricing stage for one facility. Falls back to mining the home
/// page itself when no dedicated pricing page exists.
pub async fn run(fetcher: &PageFetcher, conn: &Connection, facility: &Facility) -> StageOutcome {
    match enrich(fetcher, conn, facility).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("pricing stage failed for {}: {:#}", facility.name, e);
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

    let page = match locate::locate(fetcher, &base, &home.html, Topic::Pricing).await {
        Some(url) if url != home.url => fetcher.fetch_page(&url).await?,
        _ => {
            debug!("mining home page for pricing: {}", facility.name);
            home
        }
    };

    let records = extract(&page.html, &facility.id, &page.url);
    for r in &records {
        match db::insert_pricing(conn, r) {
            Ok(InsertOutcome::Inserted) | Ok(InsertOutcome::Skipped) => {}
            Err(e) => warn!("pricing insert failed ({}): {}", r.procedure, e),
        }
    }
    db::update_pricing_snapshot(conn, &facility.id, &records)?;

    Ok(StageOutcome::ok(records.len()))
}

/// Mine procedure-price pairs from one rendered page. Table rows are the
/// higher-precision family and win when they yield anything; otherwise
/// text windows around known procedure names are scanned.
pub fn extract(html: &str, facility_id: &str, page_url: &str) -> Vec<PricingRow> {
    let doc = Html::parse_document(html);

    let mut rows = from_table_rows(&doc, facility_id, page_url);
    if rows.is_empty() {
        rows = from_text_windows(&doc, facility_id, page_url);
    }

    let mut seen: HashSet<String> = HashSet::new();
    rows.retain(|r| seen.insert(r.procedure.to_lowercase()));
    rows
}

/// Strategy 1: literal table rows with a name cell and a price cell.
fn from_table_rows(doc: &Html, facility_id: &str, page_url: &str) -> Vec<PricingRow> {
    let mut out = Vec::new();
    for row in doc.select(&ROW_SEL) {
        let cells: Vec<String> = row.select(&CELL_SEL).map(element_text).collect();
        if cells.len() < 2 {
            continue;
        }

        let Some(price) = cells.iter().find_map(|c| miners::mine_price(c)) else { continue };
        let Some(name) = cells.iter().find(|c| {
            miners::mine_price(c).is_none()
                && c.chars().any(|ch| ch.is_alphabetic())
                && (3..120).contains(&c.chars().count())
        }) else {
            continue;
        };

        out.push(PricingRow {
            facility_id: facility_id.to_string(),
            procedure: name.clone(),
            price_usd: price.usd,
            display_text: price.display,
            price_min: price.min,
            price_max: price.max,
            source_url: page_url.to_string(),
        });
    }
    out
}

/// Strategy 2: whole-document text windows around known procedure names.
fn from_text_windows(doc: &Html, facility_id: &str, page_url: &str) -> Vec<PricingRow> {
    let text = match doc.select(&BODY_SEL).next() {
        Some(body) => element_text(body),
        None => return Vec::new(),
    };
    let lower = text.to_lowercase();

    let mut out = Vec::new();
    for procedure in PROCEDURES {
        let Some(pos) = lower.find(procedure) else { continue };
        let window = char_window(
            &text,
            pos.saturating_sub(WINDOW_BEFORE),
            pos + procedure.len() + WINDOW_AFTER,
        );
        let Some(price) = miners::mine_price(window) else { continue };
        out.push(PricingRow {
            facility_id: facility_id.to_string(),
            procedure: procedure.to_string(),
            price_usd: price.usd,
            display_text: price.display,
            price_min: price.min,
            price_max: price.max,
            source_url: page_url.to_string(),
        });
    }
    out
}

// ── Tests ──
