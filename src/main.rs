mod config;
mod db;
mod extract;
mod fetch;
mod locate;
mod miners;
mod pipeline;
mod vision;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};

use config::Config;
use pipeline::StageToggles;
use vision::VisionExtractor;

#[derive(Parser)]
#[command(name = "facility_enricher", about = "Medical facility directory enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the facilities table from a JSON export of the directory
    Init {
        /// JSON file: [{id, name, website, city, country}, ...]
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Run the heuristic enrichment pipeline over a batch of facilities
    Enrich {
        /// Process exactly one facility
        #[arg(long)]
        facility_id: Option<String>,
        /// Max facilities to process
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
        /// Ignore the limit and process every eligible facility
        #[arg(long)]
        all: bool,
        /// Skip the staff stage
        #[arg(long)]
        skip_doctors: bool,
        /// Skip the pricing stage
        #[arg(long)]
        skip_pricing: bool,
        /// Skip the packages stage
        #[arg(long)]
        skip_packages: bool,
        /// Skip the testimonials stage
        #[arg(long)]
        skip_testimonials: bool,
        /// Also run the vision-model fallback per facility (billed per call)
        #[arg(long)]
        use_ai: bool,
    },
    /// Vision-model-only extraction pass (one screenshot + call per facility)
    Vision {
        /// Process exactly one facility
        #[arg(long)]
        facility_id: Option<String>,
        /// Max facilities to process (kept low: every facility is a paid call)
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
        /// Ignore the limit and process every eligible facility
        #[arg(long)]
        all: bool,
    },
    /// Show store statistics
    Stats,
    /// Facilities overview table
    Overview {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        /// Only facilities that have been enriched
        #[arg(long)]
        enriched_only: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let cfg = Config::from_env();

    let result = match cli.command {
        Commands::Init { file } => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            let raw = std::fs::read_to_string(&file)?;
            let seeds: Vec<db::FacilitySeed> = serde_json::from_str(&raw)?;
            let inserted = db::insert_facilities(&conn, &seeds)?;
            println!("Inserted {} new facilities ({} in file)", inserted, seeds.len());
            Ok(())
        }
        Commands::Enrich {
            facility_id,
            limit,
            all,
            skip_doctors,
            skip_pricing,
            skip_packages,
            skip_testimonials,
            use_ai,
        } => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            let facilities = db::select_facilities(
                &conn,
                facility_id.as_deref(),
                batch_limit(limit, all, facility_id.is_some()),
            )?;
            if facilities.is_empty() {
                println!("No facilities with a website match the selection.");
                return Ok(());
            }

            // The vision credential is checked here, before any network
            // work, so a misconfigured run dies instead of half-running.
            let vision_extractor = if use_ai {
                let extractor = VisionExtractor::new(&cfg)?;
                println!(
                    "Vision stage enabled: {} calls, estimated ${:.2}",
                    facilities.len(),
                    facilities.len() as f64 * vision::EST_COST_PER_CALL_USD
                );
                Some(extractor)
            } else {
                None
            };

            let toggles = StageToggles {
                staff: !skip_doctors,
                pricing: !skip_pricing,
                packages: !skip_packages,
                testimonials: !skip_testimonials,
            };

            println!("Enriching {} facilities...", facilities.len());
            let report =
                pipeline::enrich_batch(&conn, &cfg, &facilities, toggles, vision_extractor.as_ref())
                    .await?;
            report.print();
            Ok(())
        }
        Commands::Vision { facility_id, limit, all } => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            let facilities = db::select_facilities(
                &conn,
                facility_id.as_deref(),
                batch_limit(limit, all, facility_id.is_some()),
            )?;
            if facilities.is_empty() {
                println!("No facilities with a website match the selection.");
                return Ok(());
            }

            let extractor = VisionExtractor::new(&cfg)?;
            println!(
                "Vision pass over {} facilities, estimated ${:.2}",
                facilities.len(),
                facilities.len() as f64 * vision::EST_COST_PER_CALL_USD
            );

            let toggles = StageToggles {
                staff: false,
                pricing: false,
                packages: false,
                testimonials: false,
            };
            let report =
                pipeline::enrich_batch(&conn, &cfg, &facilities, toggles, Some(&extractor)).await?;
            report.print();
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Facilities:     {}", s.facilities);
            println!("  with website: {}", s.with_website);
            println!("  enriched:     {}", s.enriched);
            println!("Doctors:        {}", s.doctors);
            println!("Prices:         {}", s.pricing);
            println!("Packages:       {}", s.packages);
            println!("Testimonials:   {}", s.testimonials);
            println!("Metrics:        {}", s.metrics);
            println!("AI extractions: {}", s.ai_extractions);
            Ok(())
        }
        Commands::Overview { limit, enriched_only } => {
            let conn = db::connect(&cfg.db_path)?;
            db::init_schema(&conn)?;
            let rows = db::fetch_overview(&conn, enriched_only, limit)?;
            if rows.is_empty() {
                println!("No facilities found.");
                return Ok(());
            }

            println!(
                "{:<14} | {:<24} | {:<14} | {:>7} | {:>6} | {:>8} | {:>12} | {:<8}",
                "Id", "Facility", "Country", "Doctors", "Prices", "Packages", "Testimonials",
                "Enriched"
            );
            println!("{}", "-".repeat(110));
            for r in &rows {
                println!(
                    "{:<14} | {:<24} | {:<14} | {:>7} | {:>6} | {:>8} | {:>12} | {:<8}",
                    truncate(&r.id, 14),
                    truncate(&r.name, 24),
                    truncate(&r.country, 14),
                    r.doctors,
                    r.pricing,
                    r.packages,
                    r.testimonials,
                    if r.enriched { "yes" } else { "no" },
                );
            }
            println!("\n{} facilities", rows.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// `--all` and `--facility-id` both disable the batch cap.
fn batch_limit(limit: usize, all: bool, single: bool) -> Option<usize> {
    if all || single {
        None
    } else {
        Some(limit)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
