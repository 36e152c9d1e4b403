use anyhow::Result;
use rusqlite::Connection;

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = std::path::Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS facilities (
            id                   TEXT PRIMARY KEY,
            name                 TEXT NOT NULL,
            website              TEXT,
            city                 TEXT,
            country              TEXT,
            doctors_count        INTEGER NOT NULL DEFAULT 0,
            pricing_count        INTEGER NOT NULL DEFAULT 0,
            has_verified_pricing BOOLEAN NOT NULL DEFAULT 0,
            actual_pricing       TEXT,
            packages_count       INTEGER NOT NULL DEFAULT 0,
            testimonials_count   INTEGER NOT NULL DEFAULT 0,
            success_metrics      TEXT,
            data_enriched        BOOLEAN NOT NULL DEFAULT 0,
            enriched_date        TEXT,
            ai_extracted_data    TEXT,
            extraction_method    TEXT,
            extraction_date      TEXT,
            created_at           TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_facilities_website ON facilities(website);

        CREATE TABLE IF NOT EXISTS doctors (
            id               INTEGER PRIMARY KEY,
            facility_id      TEXT NOT NULL REFERENCES facilities(id),
            name             TEXT NOT NULL,
            specialty        TEXT,
            bio              TEXT,
            photo_url        TEXT,
            qualifications   TEXT,
            languages        TEXT,
            experience_years INTEGER,
            email            TEXT,
            source_url       TEXT,
            created_at       TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(facility_id, name)
        );
        CREATE INDEX IF NOT EXISTS idx_doctors_facility ON doctors(facility_id);

        CREATE TABLE IF NOT EXISTS procedure_pricing (
            id           INTEGER PRIMARY KEY,
            facility_id  TEXT NOT NULL REFERENCES facilities(id),
            procedure    TEXT NOT NULL,
            price_usd    REAL NOT NULL,
            display_text TEXT,
            price_min    REAL,
            price_max    REAL,
            source_url   TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(facility_id, procedure)
        );
        CREATE INDEX IF NOT EXISTS idx_pricing_facility ON procedure_pricing(facility_id);

        CREATE TABLE IF NOT EXISTS facility_packages (
            id            INTEGER PRIMARY KEY,
            facility_id   TEXT NOT NULL REFERENCES facilities(id),
            name          TEXT NOT NULL,
            description   TEXT,
            price_usd     REAL NOT NULL,
            display_text  TEXT,
            inclusions    TEXT,
            duration_days INTEGER,
            source_url    TEXT,
            created_at    TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(facility_id, name)
        );
        CREATE INDEX IF NOT EXISTS idx_packages_facility ON facility_packages(facility_id);

        CREATE TABLE IF NOT EXISTS testimonials (
            id           INTEGER PRIMARY KEY,
            facility_id  TEXT NOT NULL REFERENCES facilities(id),
            patient_name TEXT,
            procedure    TEXT,
            rating       INTEGER NOT NULL DEFAULT 5,
            text         TEXT NOT NULL,
            review_date  TEXT,
            source_url   TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(facility_id, text)
        );
        CREATE INDEX IF NOT EXISTS idx_testimonials_facility ON testimonials(facility_id);

        CREATE TABLE IF NOT EXISTS success_metrics (
            id           INTEGER PRIMARY KEY,
            facility_id  TEXT NOT NULL REFERENCES facilities(id),
            metric_type  TEXT NOT NULL,
            value        REAL NOT NULL,
            display_text TEXT,
            source_url   TEXT,
            updated_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(facility_id, metric_type)
        );

        CREATE TABLE IF NOT EXISTS ai_extracted_data (
            id                INTEGER PRIMARY KEY,
            facility_id       TEXT NOT NULL REFERENCES facilities(id),
            extraction_method TEXT NOT NULL,
            payload           TEXT NOT NULL,
            confidence        REAL,
            verified          BOOLEAN NOT NULL DEFAULT 0,
            extracted_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_ai_facility ON ai_extracted_data(facility_id);
        ",
    )?;
    Ok(())
}

/// Outcome of a duplicate-tolerant insert. A `Skipped` means the store's
/// uniqueness key already held an equivalent row; it is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Skipped,
}

fn outcome(changed: usize) -> InsertOutcome {
    if changed > 0 {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::Skipped
    }
}

// ── Facilities ──

/// Facility identity as owned by the surrounding product. Read-only here
/// apart from the aggregate columns the pipeline maintains.
#[derive(Debug, Clone)]
pub struct Facility {
    pub id: String,
    pub name: String,
    pub website: String,
    pub country: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
pub struct FacilitySeed {
    pub id: String,
    pub name: String,
    pub website: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

pub fn insert_facilities(conn: &Connection, seeds: &[FacilitySeed]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO facilities (id, name, website, city, country)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for s in seeds {
            count += stmt.execute(rusqlite::params![s.id, s.name, s.website, s.city, s.country])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Select facilities eligible for enrichment: website present, optionally
/// narrowed to one id, otherwise capped. Facilities without a website are
/// never part of a run.
pub fn select_facilities(
    conn: &Connection,
    facility_id: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<Facility>> {
    let mut sql = String::from(
        "SELECT id, name, website, country, city FROM facilities WHERE website IS NOT NULL",
    );
    if facility_id.is_some() {
        sql.push_str(" AND id = ?1");
    }
    sql.push_str(" ORDER BY id");
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }

    let mut stmt = conn.prepare(&sql)?;
    let map = |row: &rusqlite::Row| {
        Ok(Facility {
            id: row.get(0)?,
            name: row.get(1)?,
            website: row.get(2)?,
            country: row.get(3)?,
            city: row.get(4)?,
        })
    };
    let rows = match facility_id {
        Some(id) => stmt.query_map([id], map)?.collect::<Result<Vec<_>, _>>()?,
        None => stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

// ── Extracted records ──

#[derive(Debug, Clone)]
pub struct DoctorRow {
    pub facility_id: String,
    pub name: String,
    pub specialty: Option<String>,
    pub bio: Option<String>,
    pub photo_url: Option<String>,
    pub qualifications: Vec<String>,
    pub languages: Vec<String>,
    pub experience_years: Option<u32>,
    pub email: Option<String>,
    pub source_url: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PricingRow {
    pub facility_id: String,
    pub procedure: String,
    pub price_usd: f64,
    pub display_text: String,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct PackageRow {
    pub facility_id: String,
    pub name: String,
    pub description: Option<String>,
    pub price_usd: f64,
    pub display_text: String,
    pub inclusions: Vec<String>,
    pub duration_days: Option<u32>,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct TestimonialRow {
    pub facility_id: String,
    pub patient_name: Option<String>,
    pub procedure: Option<String>,
    pub rating: u8,
    pub text: String,
    pub review_date: Option<String>,
    pub source_url: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricRow {
    pub facility_id: String,
    pub metric_type: String,
    pub value: f64,
    pub display_text: String,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct AiExtractionRow {
    pub facility_id: String,
    pub extraction_method: String,
    pub payload: String,
    pub confidence: f64,
    pub verified: bool,
}

fn to_json(list: &[String]) -> Option<String> {
    if list.is_empty() {
        None
    } else {
        serde_json::to_string(list).ok()
    }
}

pub fn insert_doctor(conn: &Connection, d: &DoctorRow) -> Result<InsertOutcome> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO doctors
         (facility_id, name, specialty, bio, photo_url, qualifications, languages,
          experience_years, email, source_url)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            d.facility_id,
            d.name,
            d.specialty,
            d.bio,
            d.photo_url,
            to_json(&d.qualifications),
            to_json(&d.languages),
            d.experience_years,
            d.email,
            d.source_url,
        ],
    )?;
    Ok(outcome(changed))
}

pub fn insert_pricing(conn: &Connection, p: &PricingRow) -> Result<InsertOutcome> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO procedure_pricing
         (facility_id, procedure, price_usd, display_text, price_min, price_max, source_url)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            p.facility_id,
            p.procedure,
            p.price_usd,
            p.display_text,
            p.price_min,
            p.price_max,
            p.source_url,
        ],
    )?;
    Ok(outcome(changed))
}

pub fn insert_package(conn: &Connection, p: &PackageRow) -> Result<InsertOutcome> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO facility_packages
         (facility_id, name, description, price_usd, display_text, inclusions,
          duration_days, source_url)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            p.facility_id,
            p.name,
            p.description,
            p.price_usd,
            p.display_text,
            to_json(&p.inclusions),
            p.duration_days,
            p.source_url,
        ],
    )?;
    Ok(outcome(changed))
}

pub fn insert_testimonial(conn: &Connection, t: &TestimonialRow) -> Result<InsertOutcome> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO testimonials
         (facility_id, patient_name, procedure, rating, text, review_date, source_url)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            t.facility_id,
            t.patient_name,
            t.procedure,
            t.rating,
            t.text,
            t.review_date,
            t.source_url,
        ],
    )?;
    Ok(outcome(changed))
}

/// Metrics are the one entity with true upsert semantics: one row per
/// (facility, metric type), latest value wins.
pub fn upsert_metric(conn: &Connection, m: &MetricRow) -> Result<()> {
    conn.execute(
        "INSERT INTO success_metrics (facility_id, metric_type, value, display_text, source_url)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(facility_id, metric_type) DO UPDATE SET
             value = excluded.value,
             display_text = excluded.display_text,
             source_url = excluded.source_url,
             updated_at = datetime('now')",
        rusqlite::params![m.facility_id, m.metric_type, m.value, m.display_text, m.source_url],
    )?;
    Ok(())
}

pub fn insert_ai_extraction(conn: &Connection, a: &AiExtractionRow) -> Result<()> {
    conn.execute(
        "INSERT INTO ai_extracted_data (facility_id, extraction_method, payload, confidence, verified)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![a.facility_id, a.extraction_method, a.payload, a.confidence, a.verified],
    )?;
    Ok(())
}

// ── Facility aggregates ──

pub fn update_doctors_count(conn: &Connection, facility_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE facilities SET doctors_count =
             (SELECT COUNT(*) FROM doctors WHERE facility_id = ?1)
         WHERE id = ?1",
        [facility_id],
    )?;
    Ok(())
}

/// Pricing also snapshots the raw extracted list onto the facility row for
/// display, and flags the facility as carrying verified pricing.
pub fn update_pricing_snapshot(
    conn: &Connection,
    facility_id: &str,
    rows: &[PricingRow],
) -> Result<()> {
    let snapshot = serde_json::to_string(rows)?;
    conn.execute(
        "UPDATE facilities SET
             pricing_count = (SELECT COUNT(*) FROM procedure_pricing WHERE facility_id = ?1),
             has_verified_pricing = ?2,
             actual_pricing = ?3
         WHERE id = ?1",
        rusqlite::params![facility_id, !rows.is_empty(), snapshot],
    )?;
    Ok(())
}

pub fn update_packages_count(conn: &Connection, facility_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE facilities SET packages_count =
             (SELECT COUNT(*) FROM facility_packages WHERE facility_id = ?1)
         WHERE id = ?1",
        [facility_id],
    )?;
    Ok(())
}

pub fn update_testimonials_count(conn: &Connection, facility_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE facilities SET testimonials_count =
             (SELECT COUNT(*) FROM testimonials WHERE facility_id = ?1)
         WHERE id = ?1",
        [facility_id],
    )?;
    Ok(())
}

pub fn update_metrics_snapshot(
    conn: &Connection,
    facility_id: &str,
    metrics: &[MetricRow],
) -> Result<()> {
    let snapshot = serde_json::to_string(metrics)?;
    conn.execute(
        "UPDATE facilities SET success_metrics = ?2 WHERE id = ?1",
        rusqlite::params![facility_id, snapshot],
    )?;
    Ok(())
}

pub fn mark_enriched(conn: &Connection, facility_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE facilities SET data_enriched = 1, enriched_date = datetime('now')
         WHERE id = ?1",
        [facility_id],
    )?;
    Ok(())
}

/// Stamp the raw vision payload and extraction marker on the facility row.
pub fn stamp_ai_extraction(
    conn: &Connection,
    facility_id: &str,
    payload: &str,
    method: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE facilities SET
             ai_extracted_data = ?2,
             extraction_method = ?3,
             extraction_date = datetime('now')
         WHERE id = ?1",
        rusqlite::params![facility_id, payload, method],
    )?;
    Ok(())
}

// ── Overview ──

pub struct OverviewRow {
    pub id: String,
    pub name: String,
    pub country: String,
    pub doctors: i64,
    pub pricing: i64,
    pub packages: i64,
    pub testimonials: i64,
    pub enriched: bool,
}

pub fn fetch_overview(
    conn: &Connection,
    enriched_only: bool,
    limit: usize,
) -> Result<Vec<OverviewRow>> {
    let sql = format!(
        "SELECT id, name, COALESCE(country,''), doctors_count, pricing_count,
                packages_count, testimonials_count, data_enriched
         FROM facilities{}
         ORDER BY name
         LIMIT {}",
        if enriched_only { " WHERE data_enriched = 1" } else { "" },
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(OverviewRow {
                id: row.get(0)?,
                name: row.get(1)?,
                country: row.get(2)?,
                doctors: row.get(3)?,
                pricing: row.get(4)?,
                packages: row.get(5)?,
                testimonials: row.get(6)?,
                enriched: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub facilities: usize,
    pub with_website: usize,
    pub enriched: usize,
    pub doctors: usize,
    pub pricing: usize,
    pub packages: usize,
    pub testimonials: usize,
    pub metrics: usize,
    pub ai_extractions: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> {
        Ok(conn.query_row(sql, [], |r| r.get(0))?)
    };
    Ok(Stats {
        facilities: count("SELECT COUNT(*) FROM facilities")?,
        with_website: count("SELECT COUNT(*) FROM facilities WHERE website IS NOT NULL")?,
        enriched: count("SELECT COUNT(*) FROM facilities WHERE data_enriched = 1")?,
        doctors: count("SELECT COUNT(*) FROM doctors")?,
        pricing: count("SELECT COUNT(*) FROM procedure_pricing")?,
        packages: count("SELECT COUNT(*) FROM facility_packages")?,
        testimonials: count("SELECT COUNT(*) FROM testimonials")?,
        metrics: count("SELECT COUNT(*) FROM success_metrics")?,
        ai_extractions: count("SELECT COUNT(*) FROM ai_extracted_data")?,
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        insert_facilities(
            &conn,
            &[
                FacilitySeed {
                    id: "fac-1".into(),
                    name: "Smile Clinic".into(),
                    website: Some("https://smile.example".into()),
                    city: Some("Istanbul".into()),
                    country: Some("Turkey".into()),
                },
                FacilitySeed {
                    id: "fac-2".into(),
                    name: "No Website Clinic".into(),
                    website: None,
                    city: None,
                    country: None,
                },
            ],
        )
        .unwrap();
        conn
    }

    fn doctor(name: &str) -> DoctorRow {
        DoctorRow {
            facility_id: "fac-1".into(),
            name: name.into(),
            specialty: Some("Dentistry".into()),
            bio: None,
            photo_url: None,
            qualifications: vec!["MD".into()],
            languages: vec!["English".into()],
            experience_years: Some(12),
            email: None,
            source_url: "https://smile.example/doctors".into(),
        }
    }

    #[test]
    fn selection_skips_missing_website() {
        let conn = test_conn();
        let rows = select_facilities(&conn, None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "fac-1");
    }

    #[test]
    fn selection_by_id_and_limit() {
        let conn = test_conn();
        let rows = select_facilities(&conn, Some("fac-1"), None).unwrap();
        assert_eq!(rows.len(), 1);
        let rows = select_facilities(&conn, None, Some(0)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn duplicate_doctor_is_a_soft_skip() {
        let conn = test_conn();
        assert_eq!(
            insert_doctor(&conn, &doctor("Dr. Ayşe Demir")).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            insert_doctor(&conn, &doctor("Dr. Ayşe Demir")).unwrap(),
            InsertOutcome::Skipped
        );
        update_doctors_count(&conn, "fac-1").unwrap();
        let count: i64 = conn
            .query_row("SELECT doctors_count FROM facilities WHERE id = 'fac-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn metric_upsert_keeps_one_row() {
        let conn = test_conn();
        let mut m = MetricRow {
            facility_id: "fac-1".into(),
            metric_type: "success_rate".into(),
            value: 97.0,
            display_text: "97% success rate".into(),
            source_url: "https://smile.example".into(),
        };
        upsert_metric(&conn, &m).unwrap();
        m.value = 98.5;
        upsert_metric(&conn, &m).unwrap();
        let (n, v): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(value) FROM success_metrics
                 WHERE facility_id = 'fac-1' AND metric_type = 'success_rate'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(v, 98.5);
    }

    #[test]
    fn pricing_snapshot_lands_on_facility() {
        let conn = test_conn();
        let p = PricingRow {
            facility_id: "fac-1".into(),
            procedure: "dental implant".into(),
            price_usd: 900.0,
            display_text: "$900".into(),
            price_min: None,
            price_max: None,
            source_url: "https://smile.example/prices".into(),
        };
        insert_pricing(&conn, &p).unwrap();
        update_pricing_snapshot(&conn, "fac-1", &[p]).unwrap();
        let (count, verified, snapshot): (i64, bool, String) = conn
            .query_row(
                "SELECT pricing_count, has_verified_pricing, actual_pricing
                 FROM facilities WHERE id = 'fac-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(verified);
        assert!(snapshot.contains("dental implant"));
    }

    #[test]
    fn seed_is_idempotent() {
        let conn = test_conn();
        let inserted = insert_facilities(
            &conn,
            &[FacilitySeed {
                id: "fac-1".into(),
                name: "Smile Clinic".into(),
                website: Some("https://smile.example".into()),
                city: None,
                country: None,
            }],
        )
        .unwrap();
        assert_eq!(inserted, 0);
    }

    #[test]
    fn mark_enriched_sets_flag_and_date() {
        let conn = test_conn();
        mark_enriched(&conn, "fac-1").unwrap();
        let (flag, date): (bool, Option<String>) = conn
            .query_row(
                "SELECT data_enriched, enriched_date FROM facilities WHERE id = 'fac-1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!(flag);
        assert!(date.is_some());
    }
}
