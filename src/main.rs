use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use trial_matcher::config::Settings;
use trial_matcher::document::parse_row_file;
use trial_matcher::fetch::HttpFetcher;
use trial_matcher::matcher::{load_structured_trials, Classification, EligibilityRule};
use trial_matcher::patient::load_patients;
use trial_matcher::pipeline;

#[derive(Parser)]
#[command(name = "trial_matcher", about = "Clinical trial scraper and patient eligibility matcher")]
struct Cli {
    /// Settings file (default: ./trial_matcher.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch trials for a cancer type, rank them and replace the stored bucket
    Scrape {
        #[arg(short = 't', long)]
        cancer_type: String,
        /// Defaults to the configured default country
        #[arg(short, long)]
        country: Option<String>,
    },
    /// Show the stored trials of a bucket
    Trials {
        #[arg(short = 't', long)]
        cancer_type: String,
        #[arg(short, long)]
        country: Option<String>,
    },
    /// Parse one row file and print it as JSON
    Parse {
        file: PathBuf,
    },
    /// Classify a patient against every stored trial of a bucket
    Classify {
        /// Patient JSON file (first patient is used)
        #[arg(short, long)]
        patient: PathBuf,
        #[arg(short = 't', long)]
        cancer_type: String,
        #[arg(short, long)]
        country: Option<String>,
        /// Refresh the bucket before classifying
        #[arg(long)]
        scrape: bool,
    },
    /// Check every patient against a set of structured trials
    Screen {
        /// Patients as JSON (object or array) or CSV with a header row
        #[arg(long)]
        patients: PathBuf,
        /// Structured trials as a JSON array
        #[arg(long)]
        trials: PathBuf,
    },
    /// List open trials for each patient's cancer type
    OpenTrials {
        #[arg(long)]
        patients: PathBuf,
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
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Scrape { cancer_type, country } => {
            let country = country.unwrap_or_else(|| settings.default_country.clone());
            let fetcher = HttpFetcher::new(&settings)?;
            let report =
                pipeline::scrape_and_persist(&fetcher, &settings, &cancer_type, &country, true).await?;
            if report.trials.is_empty() {
                println!("No trials found for {} in {}.", cancer_type, country);
                return Ok(());
            }

            println!("{:>4} | {:>10} | {:<60}", "Rank", "Exclusions", "Trial");
            println!("{}", "-".repeat(80));
            for t in &report.trials {
                let name = t.record.display_name().unwrap_or(&t.record.storage_key);
                println!("{:>4} | {:>10} | {:<60}", t.rank, t.exclusions.to_string(), truncate(name, 60));
            }
            println!("\nSaved {} trial files.", report.files.len());
            Ok(())
        }
        Commands::Trials { cancer_type, country } => {
            let country = country.unwrap_or_else(|| settings.default_country.clone());
            let summaries = pipeline::summarize(&settings, &country, &cancer_type)?;
            if summaries.is_empty() {
                println!("No stored trials for {} in {}. Run 'scrape' first.", cancer_type, country);
                return Ok(());
            }
            for (i, s) in summaries.iter().enumerate() {
                println!("{:>3}. {}", i + 1, s.name);
                println!("     Link: {}", s.link);
                println!("     Eligibility: {}", truncate(&s.eligibility.replace('\n', " "), 200));
            }
            Ok(())
        }
        Commands::Parse { file } => {
            let doc = parse_row_file(&file)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        }
        Commands::Classify { patient, cancer_type, country, scrape } => {
            let country = country.unwrap_or_else(|| settings.default_country.clone());
            let Some(profile) = load_patients(&patient)?.into_iter().next() else {
                bail!("No patient found in {}", patient.display());
            };
            if scrape {
                let fetcher = HttpFetcher::new(&settings)?;
                pipeline::scrape_and_persist(&fetcher, &settings, &cancer_type, &country, true).await?;
            }
            let c = pipeline::classify_against_bucket(&settings, &profile, &country, &cancer_type)?;
            print_classification(&profile.label(0), &c);
            Ok(())
        }
        Commands::Screen { patients, trials } => {
            let profiles = load_patients(&patients)?;
            let rules = load_rules(&trials)?;
            println!("Screening {} patients against {} trials...", profiles.len(), rules.len());
            let results = pipeline::screen(&profiles, &rules);
            for (i, (profile, c)) in profiles.iter().zip(&results).enumerate() {
                print_classification(&profile.label(i), c);
            }
            Ok(())
        }
        Commands::OpenTrials { patients } => {
            let profiles = load_patients(&patients)?;
            for (i, profile) in profiles.iter().enumerate() {
                let open = pipeline::open_trials_for(&settings, profile)?;
                println!("{}: {}", profile.label(i), open);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// A JSON array of structured trials, or a bucket directory of row files.
fn load_rules(path: &Path) -> anyhow::Result<Vec<EligibilityRule>> {
    if path.is_dir() {
        let files = trial_matcher::store::list_row_files(path)?;
        return files
            .iter()
            .map(|f| {
                parse_row_file(f)
                    .map(|doc| EligibilityRule::from_document(&doc))
                    .with_context(|| format!("Failed to parse {}", f.display()))
            })
            .collect();
    }
    Ok(load_structured_trials(path)?
        .into_iter()
        .map(EligibilityRule::from)
        .collect())
}

fn print_classification(patient: &str, c: &Classification) {
    println!("\nPatient {}: {} ({}/{} trials)", patient, c.label, c.eligible, c.evaluated);
    for v in &c.verdicts {
        println!("  {:<14} {}", v.verdict.to_string(), truncate(&v.trial, 60));
        for reason in &v.reasons {
            println!("    - {}", truncate(reason, 120));
        }
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
