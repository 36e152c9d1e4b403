use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use futures::StreamExt;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::{self, AiExtractionRow, DoctorRow, Facility, PackageRow, PricingRow};
use crate::extract::StageOutcome;

const RENDER_WAIT: Duration = Duration::from_secs(2);
const VIEWPORT: (u32, u32) = (1366, 900);
const PREVIEW_LEN: usize = 160;
const METHOD_TAG: &str = "vision_model";

// Static placeholder until a dedicated scoring step exists.
const CONFIDENCE_PLACEHOLDER: f64 = 0.7;

/// Rough per-call cost surfaced to the operator before a batch starts.
pub const EST_COST_PER_CALL_USD: f64 = 0.01;

const EXTRACTION_PROMPT: &str = "\
This is a screenshot of a medical facility's website. Extract everything \
visible into ONE JSON object with exactly these keys:\n\
  doctors: [{name, specialty, qualifications: [..], languages: [..], experience_years, email}]\n\
  pricing: [{procedure, price, display}]  // price as a plain USD number\n\
  email: contact email or null\n\
  languages: [spoken languages offered]\n\
  procedures: [procedure names offered]\n\
  packages: [{name, price, description, duration_days, inclusions: [..]}]\n\
  metrics: [{metric_type, value}]  // e.g. successful_surgeries, success_rate\n\
  testimonials: [{name, text, rating}]\n\
Use null for unknown scalar fields and [] for unknown lists. \
Respond with the JSON object only, no commentary.";

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision response is not valid JSON (preview: {preview})")]
    Payload { preview: String },
}

/// The consolidated single-pass payload the model is asked to produce.
/// Every field is defaulted: a sparse answer is still a payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VisionPayload {
    #[serde(default)]
    pub doctors: Vec<VisionDoctor>,
    #[serde(default)]
    pub pricing: Vec<VisionPrice>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub procedures: Vec<String>,
    #[serde(default)]
    pub packages: Vec<VisionPackage>,
    #[serde(default)]
    pub metrics: serde_json::Value,
    #[serde(default)]
    pub testimonials: serde_json::Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VisionDoctor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub qualifications: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub experience_years: Option<u32>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VisionPrice {
    #[serde(default)]
    pub procedure: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub display: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VisionPackage {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub duration_days: Option<u32>,
    #[serde(default)]
    pub inclusions: Vec<String>,
}

/// Single-shot whole-site extractor. Constructed once per run; fails fast
/// when the vision credential is missing so a batch never starts blind.
pub struct VisionExtractor {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl VisionExtractor {
    pub fn new(cfg: &Config) -> Result<Self> {
        let api_key = cfg.vision_api_key()?.to_string();
        Ok(Self {
            client: reqwest::Client::new(),
            api_url: cfg.vision_api_url.clone(),
            api_key,
            model: cfg.vision_model.clone(),
        })
    }

    pub async fn run(&self, conn: &Connection, facility: &Facility) -> StageOutcome {
        match self.enrich(conn, facility).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("vision stage failed for {}: {:#}", facility.name, e);
                StageOutcome::failed()
            }
        }
    }

    async fn enrich(&self, conn: &Connection, facility: &Facility) -> Result<StageOutcome> {
        let png = capture_screenshot(&facility.website).await?;
        debug!("captured {} byte screenshot of {}", png.len(), facility.website);

        let raw = self.call_model(&png).await?;
        let (payload, clean_json) = match parse_payload(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("vision payload rejected for {}: {}", facility.name, e);
                return Ok(StageOutcome::failed());
            }
        };

        // First persistence path: the consolidated record, verbatim.
        db::insert_ai_extraction(
            conn,
            &AiExtractionRow {
                facility_id: facility.id.clone(),
                extraction_method: METHOD_TAG.to_string(),
                payload: clean_json.clone(),
                confidence: CONFIDENCE_PLACEHOLDER,
                verified: false,
            },
        )?;

        // Second, independent path: the same tables the heuristic
        // extractors populate, fed from the payload's nested arrays.
        let count = persist_nested(conn, facility, &payload)?;

        db::stamp_ai_extraction(conn, &facility.id, &clean_json, METHOD_TAG)?;

        Ok(StageOutcome::ok(count))
    }

    async fn call_model(&self, png: &[u8]) -> Result<String> {
        let image_url = format!("data:image/png;base64,{}", BASE64.encode(png));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": EXTRACTION_PROMPT },
                    { "type": "image_url", "image_url": { "url": image_url } }
                ]
            }],
            "max_tokens": 3000
        });

        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("vision service request failed")?;

        let status = resp.status();
        let val: serde_json::Value = resp.json().await.context("vision response decode failed")?;
        if !status.is_success() {
            anyhow::bail!("vision service returned {}: {}", status, preview(&val.to_string()));
        }

        val["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("vision response had no message content"))
    }
}

/// Re-run the plain insert logic over the payload's nested arrays so the
/// vision pass populates the same tables the heuristic extractors do.
/// Callable on its own against any stored payload.
pub fn persist_nested(conn: &Connection, facility: &Facility, payload: &VisionPayload) -> Result<usize> {
    let mut count = 0;

    let doctors = doctor_rows(payload, &facility.id, &facility.website);
    for d in &doctors {
        match db::insert_doctor(conn, d) {
            Ok(_) => count += 1,
            Err(e) => warn!("vision doctor insert failed ({}): {}", d.name, e),
        }
    }
    if !doctors.is_empty() {
        db::update_doctors_count(conn, &facility.id)?;
    }

    let pricing = pricing_rows(payload, &facility.id, &facility.website);
    for p in &pricing {
        match db::insert_pricing(conn, p) {
            Ok(_) => count += 1,
            Err(e) => warn!("vision pricing insert failed ({}): {}", p.procedure, e),
        }
    }
    if !pricing.is_empty() {
        db::update_pricing_snapshot(conn, &facility.id, &pricing)?;
    }

    let packages = package_rows(payload, &facility.id, &facility.website);
    for p in &packages {
        match db::insert_package(conn, p) {
            Ok(_) => count += 1,
            Err(e) => warn!("vision package insert failed ({}): {}", p.name, e),
        }
    }
    if !packages.is_empty() {
        db::update_packages_count(conn, &facility.id)?;
    }

    Ok(count)
}

fn doctor_rows(payload: &VisionPayload, facility_id: &str, source_url: &str) -> Vec<DoctorRow> {
    payload
        .doctors
        .iter()
        .filter(|d| d.name.trim().chars().count() > 2)
        .map(|d| DoctorRow {
            facility_id: facility_id.to_string(),
            name: d.name.trim().to_string(),
            specialty: d.specialty.clone(),
            bio: None,
            photo_url: None,
            qualifications: d.qualifications.clone(),
            languages: d.languages.clone(),
            experience_years: d.experience_years,
            email: d.email.clone(),
            source_url: source_url.to_string(),
        })
        .collect()
}

fn pricing_rows(payload: &VisionPayload, facility_id: &str, source_url: &str) -> Vec<PricingRow> {
    payload
        .pricing
        .iter()
        .filter_map(|p| {
            let price = p.price?;
            if !p.procedure.is_empty() && crate::miners::plausible_price(price) {
                Some(PricingRow {
                    facility_id: facility_id.to_string(),
                    procedure: p.procedure.clone(),
                    price_usd: price,
                    display_text: p.display.clone().unwrap_or_else(|| format!("${}", price)),
                    price_min: None,
                    price_max: None,
                    source_url: source_url.to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

fn package_rows(payload: &VisionPayload, facility_id: &str, source_url: &str) -> Vec<PackageRow> {
    payload
        .packages
        .iter()
        .filter_map(|p| {
            let price = p.price?;
            Some(PackageRow {
                facility_id: facility_id.to_string(),
                name: p
                    .name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| "Medical Package".to_string()),
                description: p.description.clone(),
                price_usd: price,
                display_text: format!("${}", price),
                inclusions: p.inclusions.clone(),
                duration_days: p.duration_days,
                source_url: source_url.to_string(),
            })
        })
        .collect()
}

/// Recover the JSON document from a model reply that may be wrapped in a
/// fenced code block or surrounding prose. Returns the typed payload and
/// the recovered JSON text.
pub fn parse_payload(raw: &str) -> Result<(VisionPayload, String), VisionError> {
    let candidate = strip_code_fence(raw);
    if let Ok(payload) = serde_json::from_str::<VisionPayload>(candidate) {
        return Ok((payload, candidate.to_string()));
    }

    // Last resort: the outermost brace-delimited slice.
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            let slice = &raw[start..=end];
            if let Ok(payload) = serde_json::from_str::<VisionPayload>(slice) {
                return Ok((payload, slice.to_string()));
            }
        }
    }

    Err(VisionError::Payload { preview: preview(raw) })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else { return trimmed };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

fn preview(raw: &str) -> String {
    let mut p: String = raw.chars().take(PREVIEW_LEN).collect();
    if raw.chars().count() > PREVIEW_LEN {
        p.push('…');
    }
    p
}

/// One viewport screenshot of the facility home page. The browser session
/// is scoped to this call and released on every exit path.
async fn capture_screenshot(url: &str) -> Result<Vec<u8>> {
    let config = BrowserConfig::builder()
        .no_sandbox()
        .window_size(VIEWPORT.0, VIEWPORT.1)
        .arg("--disable-gpu")
        .arg("--disable-dev-shm-usage")
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build browser config: {}", e))?;

    let (mut browser, mut handler) = Browser::launch(config)
        .await
        .context("failed to launch headless browser")?;
    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });

    let result = shoot(&browser, url).await;

    if let Err(e) = browser.close().await {
        warn!("failed to close browser: {}", e);
    }
    handler_task.abort();

    result
}

async fn shoot(browser: &Browser, url: &str) -> Result<Vec<u8>> {
    let page = browser.new_page(url).await.context("failed to open page")?;
    page.wait_for_navigation().await.context("navigation failed")?;
    tokio::time::sleep(RENDER_WAIT).await;

    let params = CaptureScreenshotParams {
        format: Some(CaptureScreenshotFormat::Png),
        capture_beyond_viewport: Some(false),
        ..Default::default()
    };
    let bytes = page.screenshot(params).await.context("screenshot capture failed")?;
    if let Err(e) = page.close().await {
        warn!("failed to close page: {}", e);
    }
    Ok(bytes)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "doctors": [{"name": "Dr. Ana Silva", "specialty": "Dentist"}],
        "pricing": [
            {"procedure": "dental implant", "price": 900.0},
            {"procedure": "checkup", "price": 40.0}
        ],
        "email": "info@clinic.example",
        "languages": ["English"],
        "procedures": ["dental implant"],
        "packages": [{"name": "Smile Week", "price": 2400.0}],
        "metrics": [],
        "testimonials": []
    }"#;

    #[test]
    fn plain_json_parses() {
        let (payload, clean) = parse_payload(SAMPLE).unwrap();
        assert_eq!(payload.doctors.len(), 1);
        assert_eq!(payload.email.as_deref(), Some("info@clinic.example"));
        assert!(clean.contains("Smile Week"));
    }

    #[test]
    fn fenced_json_parses() {
        let fenced = format!("```json\n{}\n```", SAMPLE);
        let (payload, _) = parse_payload(&fenced).unwrap();
        assert_eq!(payload.packages.len(), 1);
    }

    #[test]
    fn prose_wrapped_json_parses() {
        let wrapped = format!("Here is what I found:\n{}\nLet me know!", SAMPLE);
        let (payload, _) = parse_payload(&wrapped).unwrap();
        assert_eq!(payload.pricing.len(), 2);
    }

    #[test]
    fn garbage_fails_with_preview() {
        let err = parse_payload("I could not read the page, sorry.").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("preview"));
        assert!(msg.contains("could not read"));
    }

    #[test]
    fn sparse_payload_defaults() {
        let (payload, _) = parse_payload(r#"{"email": null}"#).unwrap();
        assert!(payload.doctors.is_empty());
        assert!(payload.pricing.is_empty());
        assert!(payload.email.is_none());
    }

    #[test]
    fn nested_pricing_respects_the_band() {
        let (payload, _) = parse_payload(SAMPLE).unwrap();
        let rows = pricing_rows(&payload, "fac-1", "https://clinic.example");
        // The $40 checkup is outside the plausible band.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].procedure, "dental implant");
    }

    #[test]
    fn nested_doctor_name_rule_applies() {
        let (payload, _) = parse_payload(
            r#"{"doctors": [{"name": "Dr"}, {"name": "Dr. Omar Haddad"}]}"#,
        )
        .unwrap();
        let rows = doctor_rows(&payload, "fac-1", "https://clinic.example");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Dr. Omar Haddad");
    }

    #[test]
    fn package_without_price_is_dropped() {
        let (payload, _) = parse_payload(
            r#"{"packages": [{"name": "Mystery"}, {"price": 1500.0}]}"#,
        )
        .unwrap();
        let rows = package_rows(&payload, "fac-1", "https://clinic.example");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Medical Package");
    }
}
