use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use medreport_lib::config::{Settings, APP_NAME, APP_VERSION};
use medreport_lib::pipeline::discovery::DocumentKind;
use medreport_lib::pipeline::extraction::build_extractor;
use medreport_lib::pipeline::processor::build_analyzer;
use medreport_lib::{analyze_file_only, build_processor, render_report_pdf, review_document};

#[derive(Parser)]
#[command(name = "medreport")]
#[command(about = "Structured clinical reports from patient records and their documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the full report for a patient and print it as JSON
    Report {
        user_id: String,
        /// Also write the report as a PDF to this path
        #[arg(long)]
        pdf: Option<PathBuf>,
    },
    /// Extract text from a local PDF or image
    Extract {
        file: PathBuf,
        /// Override kind detection (pdf, image)
        #[arg(long)]
        kind: Option<DocumentKind>,
    },
    /// Extract and review a single local document
    Review {
        file: PathBuf,
        #[arg(long)]
        kind: Option<DocumentKind>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    medreport_lib::init_tracing();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("invalid configuration")?;
    tracing::info!(app = APP_NAME, version = APP_VERSION, "Starting");

    match cli.command {
        Commands::Report { user_id, pdf } => {
            let processor = build_processor(&settings)?;
            let report = processor
                .generate_report(&user_id)
                .await
                .with_context(|| format!("report generation failed for {user_id}"))?;

            if let Some(path) = pdf {
                let bytes = render_report_pdf(&report)?;
                tokio::fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("cannot write {}", path.display()))?;
                tracing::info!(path = %path.display(), "Report PDF written");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Extract { file, kind } => {
            let outcome = analyze_file_only(Arc::new(build_extractor()), &file, kind).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Review { file, kind } => {
            let analyzer = build_analyzer(&settings)?;
            let extractor = Arc::new(build_extractor());
            let review = review_document(extractor, &analyzer, &file, kind).await?;
            println!("{}", serde_json::to_string_pretty(&review)?);
        }
    }

    Ok(())
}
