pub mod config;
pub mod export;
pub mod patient;
pub mod pipeline;

#[cfg(test)]
mod test_support;

use tracing_subscriber::EnvFilter;

pub use export::{render_report_pdf, ExportError};
pub use pipeline::processor::{
    analyze_file_only, build_processor, review_document, FailedStage, MedicalReport,
    ReportError, ReportProcessor,
};

/// Install the global `tracing` subscriber. Logs go to stderr so stdout
/// stays clean for JSON output.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();
}
