use std::time::{Duration, Instant};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tracing::info;

use crate::config::Config;
use crate::db::{self, Facility};
use crate::extract::{packages, pricing, staff, testimonials, StageOutcome};
use crate::fetch::PageFetcher;
use crate::vision::VisionExtractor;

/// Which stages a run attempts. Stages are opt-out except vision, which
/// is opt-in via its own extractor instance.
#[derive(Debug, Clone, Copy)]
pub struct StageToggles {
    pub staff: bool,
    pub pricing: bool,
    pub packages: bool,
    pub testimonials: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self { staff: true, pricing: true, packages: true, testimonials: true }
    }
}

/// Outcome of enriching one facility in one pass.
#[derive(Debug, Default)]
pub struct RunResult {
    pub facility_id: String,
    pub facility_name: String,
    pub staff: StageOutcome,
    pub pricing: StageOutcome,
    pub packages: StageOutcome,
    pub testimonials: StageOutcome,
    pub vision: StageOutcome,
    pub metrics: usize,
}

impl RunResult {
    fn new(facility: &Facility) -> Self {
        Self {
            facility_id: facility.id.clone(),
            facility_name: facility.name.clone(),
            ..Default::default()
        }
    }

    /// A facility run counts as successful iff at least one stage succeeded.
    pub fn success(&self) -> bool {
        [self.staff, self.pricing, self.packages, self.testimonials, self.vision]
            .iter()
            .any(|s| s.success)
    }
}

/// Aggregate summary over one batch.
pub struct RunReport {
    pub facilities: usize,
    pub succeeded: usize,
    pub doctors: usize,
    pub pricing: usize,
    pub packages: usize,
    pub testimonials: usize,
    pub metrics: usize,
    pub ai_records: usize,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn print(&self) {
        let rate = if self.facilities > 0 {
            self.succeeded as f64 / self.facilities as f64 * 100.0
        } else {
            0.0
        };
        println!("\n── Enrichment report ──");
        println!("Facilities processed: {}", self.facilities);
        println!("Succeeded:            {} ({:.0}%)", self.succeeded, rate);
        println!("Doctors:              {}", self.doctors);
        println!("Prices:               {}", self.pricing);
        println!("Packages:             {}", self.packages);
        println!("Testimonials:         {}", self.testimonials);
        println!("Success metrics:      {}", self.metrics);
        println!("AI extractions:       {}", self.ai_records);
        println!("Elapsed:              {:.1}s", self.elapsed.as_secs_f64());
    }
}

fn aggregate(results: &[RunResult], elapsed: Duration) -> RunReport {
    RunReport {
        facilities: results.len(),
        succeeded: results.iter().filter(|r| r.success()).count(),
        doctors: results.iter().map(|r| r.staff.count).sum(),
        pricing: results.iter().map(|r| r.pricing.count).sum(),
        packages: results.iter().map(|r| r.packages.count).sum(),
        testimonials: results.iter().map(|r| r.testimonials.count).sum(),
        metrics: results.iter().map(|r| r.metrics).sum(),
        ai_records: results.iter().filter(|r| r.vision.success).count(),
        elapsed,
    }
}

fn stage_line(name: &str, outcome: &StageOutcome) -> String {
    if !outcome.attempted {
        format!("  {:<13} skipped", name)
    } else if outcome.success {
        format!("  {:<13} ok ({} records)", name, outcome.count)
    } else {
        format!("  {:<13} failed", name)
    }
}

/// Enrich a batch of facilities, strictly one at a time, stages in fixed
/// order with fixed pauses. A stage's failure never blocks later stages
/// or later facilities.
pub async fn enrich_batch(
    conn: &Connection,
    cfg: &Config,
    facilities: &[Facility],
    toggles: StageToggles,
    vision: Option<&VisionExtractor>,
) -> Result<RunReport> {
    let fetcher = PageFetcher::new()?;
    let t0 = Instant::now();

    let pb = ProgressBar::new(facilities.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} facilities")?
            .progress_chars("=> "),
    );

    let mut results = Vec::with_capacity(facilities.len());
    for (i, facility) in facilities.iter().enumerate() {
        let mut run = RunResult::new(facility);
        pb.println(format!("{} ({})", run.facility_name, facility.website));
        let mut ran_before = false;

        if toggles.staff {
            run.staff = staff::run(&fetcher, conn, facility).await;
            pb.println(stage_line("staff", &run.staff));
            ran_before = true;
        }
        if toggles.pricing {
            pause_between_stages(cfg, &mut ran_before).await;
            run.pricing = pricing::run(&fetcher, conn, facility).await;
            pb.println(stage_line("pricing", &run.pricing));
        }
        if toggles.packages {
            pause_between_stages(cfg, &mut ran_before).await;
            run.packages = packages::run(&fetcher, conn, facility).await;
            pb.println(stage_line("packages", &run.packages));
        }
        if toggles.testimonials {
            pause_between_stages(cfg, &mut ran_before).await;
            let outcome = testimonials::run(&fetcher, conn, facility).await;
            run.testimonials = outcome.stage;
            run.metrics = outcome.metrics;
            pb.println(stage_line("testimonials", &run.testimonials));
        }
        if let Some(extractor) = vision {
            pause_between_stages(cfg, &mut ran_before).await;
            run.vision = extractor.run(conn, facility).await;
            pb.println(stage_line("vision", &run.vision));
        }

        if run.success() {
            db::mark_enriched(conn, &facility.id)?;
        }
        info!(
            facility = %run.facility_id,
            success = run.success(),
            "facility pass complete"
        );
        results.push(run);
        pb.inc(1);

        if i + 1 < facilities.len() {
            tokio::time::sleep(cfg.facility_delay).await;
        }
    }

    pb.finish_and_clear();
    Ok(aggregate(&results, t0.elapsed()))
}

/// Fixed, non-adaptive pause between stages of one facility. Deliberately
/// never shortened on success: the point is to stay under anti-automation
/// thresholds on third-party sites.
async fn pause_between_stages(cfg: &Config, ran_before: &mut bool) {
    if *ran_before {
        tokio::time::sleep(cfg.stage_delay).await;
    }
    *ran_before = true;
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(staff: StageOutcome, pricing: StageOutcome) -> RunResult {
        RunResult {
            facility_id: "fac-1".into(),
            facility_name: "Clinic".into(),
            staff,
            pricing,
            ..Default::default()
        }
    }

    #[test]
    fn one_successful_stage_makes_the_run_successful() {
        let r = result_with(StageOutcome::failed(), StageOutcome::ok(3));
        assert!(r.success());
    }

    #[test]
    fn all_failed_stages_fail_the_run() {
        let r = result_with(StageOutcome::failed(), StageOutcome::failed());
        assert!(!r.success());
    }

    #[test]
    fn skipped_stages_do_not_count_as_success() {
        let r = RunResult::default();
        assert!(!r.success());
    }

    #[test]
    fn empty_but_successful_stage_still_succeeds() {
        // A heuristic miss is a success with zero count.
        let r = result_with(StageOutcome::ok(0), StageOutcome::failed());
        assert!(r.success());
    }

    #[test]
    fn aggregation_totals() {
        let mut a = result_with(StageOutcome::ok(2), StageOutcome::ok(5));
        a.metrics = 3;
        let b = result_with(StageOutcome::failed(), StageOutcome::failed());
        let report = aggregate(&[a, b], Duration::from_secs(10));
        assert_eq!(report.facilities, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.doctors, 2);
        assert_eq!(report.pricing, 5);
        assert_eq!(report.metrics, 3);
        assert_eq!(report.ai_records, 0);
    }
}
