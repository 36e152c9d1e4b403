use std::collections::HashSet;
use std::sync::LazyLock;

use rusqlite::Connection;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::{element_text, truncate_chars, StageOutcome};
use crate::db::{self, DoctorRow, Facility, InsertOutcome};
use crate::fetch::PageFetcher;
use crate::locate::{self, Topic};
use crate::miners;

static CARD_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        ".doctor, .doctor-card, .team-member, .staff-member, .physician, \
         [class*=\"doctor-card\"], [class*=\"team-member\"], [class*=\"staff-card\"]",
    )
    .unwrap()
});
static HEADING_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h2, h3, h4").unwrap());
static NAME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h2, h3, h4, .name, .doctor-name").unwrap());
static IMG_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img[src]").unwrap());
static PERSON_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[itemtype*=\"Person\"]").unwrap());
static ITEMPROP_NAME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[itemprop=\"name\"]").unwrap());
static ITEMPROP_TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[itemprop=\"jobTitle\"]").unwrap());

const SPECIALTY_HINTS: &[&str] = &[
    "surgeon", "dentist", "doctor", "physician", "specialist", "consultant", "dermatolog",
    "cardiolog", "orthoped", "oncolog", "gynecolog", "urolog", "ophthalmolog", "anesthesi",
    "plastic", "implantolog", "orthodont", "endodont",
];

const NAME_NOISE: &[&str] = &[
    "our team", "our doctors", "meet the", "why choose", "contact", "services", "about",
    "welcome", "testimonials", "reviews", "prices",
];

/// A staff candidate before mining and viability filtering.
struct Candidate {
    name: String,
    specialty: Option<String>,
    bio: Option<String>,
    photo_url: Option<String>,
    text: String,
}

/// Run the staff stage for one facility. No dedicated staff page means
/// the stage fails outright; the home page is too noisy to mine for
/// people.
pub async fn run(fetcher: &PageFetcher, conn: &Connection, facility: &Facility) -> StageOutcome {
    match enrich(fetcher, conn, facility).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("staff stage failed for {}: {:#}", facility.name, e);
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

    let Some(page_url) = locate::locate(fetcher, &base, &home.html, Topic::Staff).await else {
        debug!("no staff page found for {}", facility.name);
        return Ok(StageOutcome::failed());
    };

    let page = if page_url == home.url {
        home
    } else {
        fetcher.fetch_page(&page_url).await?
    };

    let records = extract(&page.html, &facility.id, &page.url);
    for r in &records {
        match db::insert_doctor(conn, r) {
            Ok(InsertOutcome::Inserted) | Ok(InsertOutcome::Skipped) => {}
            Err(e) => warn!("doctor insert failed ({}): {}", r.name, e),
        }
    }
    db::update_doctors_count(conn, &facility.id)?;

    Ok(StageOutcome::ok(records.len()))
}

/// Mine staff records out of one rendered page. Pure; strategy families
/// are tried in order and the first that yields candidates wins.
pub fn extract(html: &str, facility_id: &str, page_url: &str) -> Vec<DoctorRow> {
    let doc = Html::parse_document(html);

    let candidates = [from_cards, from_headings, from_microdata]
        .iter()
        .map(|strategy| strategy(&doc))
        .find(|found| !found.is_empty())
        .unwrap_or_default();

    let mut seen: HashSet<String> = HashSet::new();
    let mut rows = Vec::new();
    for c in candidates {
        let name = c.name.trim().to_string();
        if name.chars().count() <= 2 || !seen.insert(name.clone()) {
            continue;
        }
        rows.push(DoctorRow {
            facility_id: facility_id.to_string(),
            name,
            specialty: c.specialty.filter(|s| !s.is_empty()),
            bio: c.bio.filter(|b| !b.is_empty()).map(|b| truncate_chars(&b, 600)),
            photo_url: c.photo_url,
            qualifications: miners::mine_qualifications(&c.text),
            languages: miners::mine_languages(&c.text),
            experience_years: miners::mine_experience_years(&c.text),
            email: miners::mine_email(&c.text),
            source_url: page_url.to_string(),
        });
    }
    rows
}

/// Strategy 1: dedicated card containers.
fn from_cards(doc: &Html) -> Vec<Candidate> {
    let mut out = Vec::new();
    for card in doc.select(&CARD_SEL) {
        let Some(name_el) = card.select(&NAME_SEL).next() else { continue };
        let name = element_text(name_el);
        if !looks_like_person(&name) {
            continue;
        }
        let text = element_text(card);
        let specialty = card
            .select(&HEADING_SEL)
            .nth(1)
            .map(element_text)
            .or_else(|| specialty_from_text(&text));
        let bio = text.strip_prefix(name.as_str()).map(|rest| rest.trim().to_string());
        out.push(Candidate {
            photo_url: card.select(&IMG_SEL).next().and_then(|i| i.value().attr("src")).map(String::from),
            name,
            specialty,
            bio,
            text,
        });
    }
    out
}

/// Strategy 2: heading-plus-subheading pairs.
fn from_headings(doc: &Html) -> Vec<Candidate> {
    let mut out = Vec::new();
    for heading in doc.select(&HEADING_SEL) {
        let name = element_text(heading);
        if !looks_like_person(&name) {
            continue;
        }
        let following = heading
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .take_while(|el| !matches!(el.value().name(), "h1" | "h2" | "h3" | "h4"))
            .take(3)
            .map(element_text)
            .collect::<Vec<_>>();
        let subheading = following.first().cloned().unwrap_or_default();

        // Without a title prefix the pair must prove itself: the line
        // under the heading has to read like a medical role.
        let titled = name.starts_with("Dr") || name.starts_with("Prof");
        if !titled && specialty_from_text(&subheading).is_none() {
            continue;
        }

        let text = format!("{} {}", name, following.join(" "));
        out.push(Candidate {
            name,
            specialty: if subheading.is_empty() { None } else { Some(subheading) },
            bio: following.get(1).cloned(),
            photo_url: None,
            text,
        });
    }
    out
}

/// Strategy 3: schema.org Person microdata.
fn from_microdata(doc: &Html) -> Vec<Candidate> {
    let mut out = Vec::new();
    for person in doc.select(&PERSON_SEL) {
        let Some(name) = person.select(&ITEMPROP_NAME_SEL).next().map(element_text) else {
            continue;
        };
        let text = element_text(person);
        out.push(Candidate {
            specialty: person.select(&ITEMPROP_TITLE_SEL).next().map(element_text),
            bio: None,
            photo_url: person
                .select(&IMG_SEL)
                .next()
                .and_then(|i| i.value().attr("src"))
                .map(String::from),
            name,
            text,
        });
    }
    out
}

fn looks_like_person(text: &str) -> bool {
    let t = text.trim();
    if t.len() < 3 || t.len() > 60 {
        return false;
    }
    let lower = t.to_lowercase();
    if NAME_NOISE.iter().any(|n| lower.contains(n)) {
        return false;
    }
    if t.starts_with("Dr") || t.starts_with("Prof") {
        return true;
    }
    let words: Vec<&str> = t.split_whitespace().collect();
    (2..=4).contains(&words.len())
        && words
            .iter()
            .all(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
}

/// First sentence-like segment that reads as a medical role.
fn specialty_from_text(text: &str) -> Option<String> {
    text.split(['.', ','])
        .map(str::trim)
        .find(|seg| {
            let lower = seg.to_lowercase();
            SPECIALTY_HINTS.iter().any(|hint| lower.contains(hint))
        })
        .filter(|s| !s.is_empty() && s.len() < 120)
        .map(String::from)
}

// ── Tests ──
