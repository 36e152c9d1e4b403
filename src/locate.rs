use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::fetch::PageFetcher;

static ANCHOR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// One category of structured data mined from a facility site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Staff,
    Pricing,
    Packages,
    Testimonials,
}

impl Topic {
    pub fn label(self) -> &'static str {
        match self {
            Topic::Staff => "staff",
            Topic::Pricing => "pricing",
            Topic::Packages => "packages",
            Topic::Testimonials => "testimonials",
        }
    }

    /// Whether mining may fall back to the home page when no dedicated
    /// sub-page exists. Staff pages are too noisy to mine from the root.
    pub fn falls_back_to_root(self) -> bool {
        !matches!(self, Topic::Staff)
    }

    fn path_fragments(self) -> &'static [&'static str] {
        match self {
            Topic::Staff => &[
                "/doctors", "/our-team", "/medical-staff", "/physicians", "/team",
                "/our-doctors", "/specialists", "/staff",
            ],
            Topic::Pricing => &["/prices", "/pricing", "/price-list", "/fees", "/costs", "/tariff"],
            Topic::Packages => &["/packages", "/offers", "/all-inclusive", "/deals", "/plans"],
            Topic::Testimonials => &[
                "/testimonials", "/reviews", "/patient-stories", "/success-stories", "/feedback",
            ],
        }
    }

    fn link_keywords(self) -> &'static [&'static str] {
        match self {
            Topic::Staff => &["doctor", "physician", "surgeon", "team", "specialist"],
            Topic::Pricing => &["price", "pricing", "cost", "fee", "tariff"],
            Topic::Packages => &["package", "all-inclusive", "all inclusive", "offer", "deal"],
            Topic::Testimonials => &["testimonial", "review", "patient stories", "success stories"],
        }
    }

    fn probe_paths(self) -> &'static [&'static str] {
        match self {
            Topic::Staff => &["/doctors", "/our-team", "/team", "/about/team"],
            Topic::Pricing => &["/prices", "/pricing", "/price-list"],
            Topic::Packages => &["/packages", "/offers"],
            Topic::Testimonials => &["/testimonials", "/reviews"],
        }
    }
}

/// A hyperlink with its destination resolved against the page base.
#[derive(Debug, Clone)]
pub struct PageLink {
    pub href: Url,
    pub text: String,
}

/// Collect same-host hyperlinks from a page. Off-site links never lead to
/// the facility's own topic pages.
pub fn collect_links(html: &str, base: &Url) -> Vec<PageLink> {
    let doc = Html::parse_document(html);
    let mut links = Vec::new();
    for el in doc.select(&ANCHOR_SEL) {
        let Some(href) = el.value().attr("href") else { continue };
        let Ok(resolved) = base.join(href) else { continue };
        if resolved.host_str() != base.host_str() {
            continue;
        }
        let text = el.text().collect::<Vec<_>>().join(" ").trim().to_string();
        links.push(PageLink { href: resolved, text });
    }
    links
}

/// Strategy 1: a link whose destination path contains a topic fragment.
fn by_path_fragment(links: &[PageLink], topic: Topic) -> Option<String> {
    for fragment in topic.path_fragments() {
        if let Some(link) = links
            .iter()
            .find(|l| l.href.path().to_lowercase().contains(fragment))
        {
            return Some(link.href.to_string());
        }
    }
    None
}

/// Strategy 2: a link whose visible text mentions a topic keyword.
fn by_link_text(links: &[PageLink], topic: Topic) -> Option<String> {
    for keyword in topic.link_keywords() {
        if let Some(link) = links
            .iter()
            .find(|l| !l.text.is_empty() && l.text.to_lowercase().contains(keyword))
        {
            return Some(link.href.to_string());
        }
    }
    None
}

/// Pure part of the cascade: scan the home page's links only. Separated
/// from probing so it can run against fixture HTML.
pub fn scan_links(home_html: &str, base: &Url, topic: Topic) -> Option<String> {
    let links = collect_links(home_html, base);
    let strategies: [fn(&[PageLink], Topic) -> Option<String>; 2] =
        [by_path_fragment, by_link_text];
    strategies.iter().find_map(|s| s(&links, topic))
}

/// Find the most likely sub-page for `topic`, or None. Ordered cascade,
/// first success wins; the network probe runs last because it costs extra
/// requests against the third-party site.
pub async fn locate(
    fetcher: &PageFetcher,
    base: &Url,
    home_html: &str,
    topic: Topic,
) -> Option<String> {
    if let Some(url) = scan_links(home_html, base, topic) {
        debug!("{}: located via home-page link: {}", topic.label(), url);
        return Some(url);
    }

    // Strategy 3: probe conventional paths directly.
    for path in topic.probe_paths() {
        let Ok(candidate) = base.join(path) else { continue };
        if fetcher.probe(candidate.as_str()).await {
            debug!("{}: located via path probe: {}", topic.label(), candidate);
            return Some(candidate.to_string());
        }
    }

    None
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://clinic.example/").unwrap()
    }

    #[test]
    fn path_fragment_wins_over_link_text() {
        let html = r#"
            <a href="/about">Meet our doctors</a>
            <a href="/medical-staff">About</a>
        "#;
        // "/medical-staff" is an explicit topic path; the keyword-text link
        // pointing elsewhere must not shadow it.
        let found = scan_links(html, &base(), Topic::Staff).unwrap();
        assert_eq!(found, "https://clinic.example/medical-staff");
    }

    #[test]
    fn link_text_is_second_choice() {
        let html = r#"<a href="/about-us">Our physicians and team</a>"#;
        let found = scan_links(html, &base(), Topic::Staff).unwrap();
        assert_eq!(found, "https://clinic.example/about-us");
    }

    #[test]
    fn relative_hrefs_resolve_against_base() {
        let html = r#"<a href="prices/">Price list</a>"#;
        let found = scan_links(html, &base(), Topic::Pricing).unwrap();
        assert_eq!(found, "https://clinic.example/prices/");
    }

    #[test]
    fn offsite_links_are_ignored() {
        let html = r#"<a href="https://reviews.example/clinic">Reviews</a>"#;
        assert!(scan_links(html, &base(), Topic::Testimonials).is_none());
    }

    #[test]
    fn no_match_yields_none() {
        let html = r#"<a href="/contact">Contact us</a>"#;
        assert!(scan_links(html, &base(), Topic::Packages).is_none());
    }

    #[test]
    fn staff_has_no_root_fallback() {
        assert!(!Topic::Staff.falls_back_to_root());
        assert!(Topic::Pricing.falls_back_to_root());
        assert!(Topic::Packages.falls_back_to_root());
        assert!(Topic::Testimonials.falls_back_to_root());
    }
}
