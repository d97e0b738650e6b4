mod config;
mod errors;
mod geocode;
mod ingestion;
mod merge;
mod output;
mod pipeline;
mod scheduler;
mod telemetry;

use std::path::Path;

use once_cell::sync::OnceCell;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{AppConfig, BackoffKind, PublicAppConfig};
pub use errors::{AppError, AppResult};
pub use geocode::{
    AddressRecord, Coordinate, GeocodeClient, GeocodeLookup, GeocodeOutcome, LookupReply,
    NominatimClient, OutcomeStatus, RateLimiter, RetryPolicy,
};
pub use ingestion::{
    clean_contacts, is_valid_row, normalize_postcode, parse_contacts, parse_workbook, read_contacts,
    strip_non_ascii, Address, AddressKind, CleaningReport, ContactRow, RawContact,
    REQUIRED_COLUMNS,
};
pub use merge::{merge_outcomes, pair_outcomes, OutcomeTally, RowCoordinates};
pub use output::{
    format_coordinate, write_enriched, write_enriched_to, EnrichedRow, COL_POSTAL_COORDINATES,
    COL_RESIDENTIAL_COORDINATES,
};
pub use pipeline::{KindStats, Pipeline, PipelineReport};
pub use scheduler::{partition, Batch, BatchScheduler};
pub use telemetry::{query_hash, DiagnosticEvent, DiagnosticsSink};

/// Everything a run needs, built once from configuration.
pub struct AppState {
    diagnostics: DiagnosticsSink,
    pipeline: Pipeline,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let diagnostics = if config.diagnostics_enabled {
            DiagnosticsSink::new(&config.diagnostics_dir, &config)?
        } else {
            DiagnosticsSink::disabled()
        };
        let pipeline = Pipeline::from_config(&config, diagnostics.clone())?;

        diagnostics.emit(
            "run_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config": config.public_profile(),
            }),
        );

        Ok(Self {
            diagnostics,
            pipeline,
        })
    }

    pub async fn run(&self, input: &Path, output: &Path) -> AppResult<PipelineReport> {
        let result = self.pipeline.run_file(input, output).await;
        if let Err(err) = &result {
            self.diagnostics
                .emit("run_aborted", json!({ "error": err.to_string() }));
        }
        if let Err(err) = self.diagnostics.flush().await {
            warn!(?err, "failed to flush diagnostics buffer");
        }
        result
    }
}

pub fn init_tracing(verbose: bool) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let default = if verbose {
            "debug,contact_geocoder=trace"
        } else {
            "info,contact_geocoder=debug"
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
