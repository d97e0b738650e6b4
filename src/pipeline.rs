use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocode::{AddressRecord, GeocodeClient, GeocodeOutcome};
use crate::ingestion::{clean_contacts, read_contacts, AddressKind, CleaningReport, ContactRow};
use crate::merge::{merge_outcomes, pair_outcomes, OutcomeTally};
use crate::output::{write_enriched, EnrichedRow};
use crate::scheduler::BatchScheduler;
use crate::telemetry::DiagnosticsSink;

#[derive(Debug, Clone, Serialize)]
pub struct KindStats {
    pub kind: AddressKind,
    pub batches: usize,
    #[serde(flatten)]
    pub tally: OutcomeTally,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub cleaning: Option<CleaningReport>,
    pub residential: KindStats,
    pub postal: KindStats,
    pub survivors: usize,
    pub excluded: usize,
    /// Rows went in but none came out.
    pub degraded: bool,
    /// Every single lookup failed, which points at the service rather than the data.
    pub service_unavailable: bool,
    pub output_path: Option<PathBuf>,
}

/// Drives validated rows through geocoding for both address kinds.
pub struct Pipeline {
    client: GeocodeClient,
    batch_size: usize,
    pool: Arc<Semaphore>,
    diagnostics: DiagnosticsSink,
}

impl Pipeline {
    pub fn new(
        client: GeocodeClient,
        diagnostics: DiagnosticsSink,
        batch_size: usize,
        pool_size: usize,
    ) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            diagnostics,
        }
    }

    pub fn from_config(config: &AppConfig, diagnostics: DiagnosticsSink) -> AppResult<Self> {
        let client = GeocodeClient::from_config(config, diagnostics.clone())?;
        Ok(Self::new(
            client,
            diagnostics,
            config.batch_size,
            config.worker_pool_size,
        ))
    }

    /// Reads, cleans, geocodes and writes a contact file.
    ///
    /// The output file is written even when no row survives.
    pub async fn run_file(&self, input: &Path, output: &Path) -> AppResult<PipelineReport> {
        let raw = read_contacts(input)?;
        let (rows, cleaning) = clean_contacts(&raw);
        let (enriched, mut report) = self.enrich(rows).await?;

        let written = write_enriched(output, &enriched)?;
        info!(rows = written, path = %output.display(), "cleaned data saved");

        report.cleaning = Some(cleaning);
        report.output_path = Some(output.to_path_buf());
        Ok(report)
    }

    /// Geocodes both addresses of every row, keeping rows where both resolved.
    pub async fn enrich(&self, rows: Vec<ContactRow>) -> AppResult<(Vec<EnrichedRow>, PipelineReport)> {
        let total = rows.len();
        let residential_records = address_records(&rows, AddressKind::Residential);
        let postal_records = address_records(&rows, AddressKind::Postal);

        let scheduler =
            BatchScheduler::with_pool(self.client.clone(), self.batch_size, Arc::clone(&self.pool));
        let (residential, postal) = tokio::join!(
            scheduler.run(AddressKind::Residential, residential_records),
            scheduler.run(AddressKind::Postal, postal_records),
        );

        let residential = merge_outcomes(total, residential)?;
        let postal = merge_outcomes(total, postal)?;
        let residential_stats = self.kind_stats(AddressKind::Residential, total, &residential);
        let postal_stats = self.kind_stats(AddressKind::Postal, total, &postal);

        let enriched = rows
            .into_iter()
            .zip(pair_outcomes(residential, postal)?)
            .filter_map(|(contact, coordinates)| {
                coordinates
                    .survivor()
                    .map(|(residential, postal)| EnrichedRow {
                        contact,
                        residential,
                        postal,
                    })
            })
            .collect::<Vec<_>>();

        let survivors = enriched.len();
        let service_unavailable =
            residential_stats.tally.all_failed() && postal_stats.tally.all_failed();
        let report = PipelineReport {
            cleaning: None,
            residential: residential_stats,
            postal: postal_stats,
            survivors,
            excluded: total - survivors,
            degraded: total > 0 && survivors == 0,
            service_unavailable,
            output_path: None,
        };
        self.finish(&report).await;
        Ok((enriched, report))
    }

    fn kind_stats(
        &self,
        kind: AddressKind,
        total: usize,
        outcomes: &[GeocodeOutcome],
    ) -> KindStats {
        KindStats {
            kind,
            batches: total.div_ceil(self.batch_size),
            tally: OutcomeTally::from_outcomes(outcomes),
        }
    }

    async fn finish(&self, report: &PipelineReport) {
        if report.service_unavailable {
            warn!(
                rows = report.excluded,
                "every geocode lookup failed; the geocoding service looks unavailable and no rows survived"
            );
        } else if report.degraded {
            warn!(
                rows = report.excluded,
                "no rows survived geocoding; output will contain only the header"
            );
        }
        info!(
            survivors = report.survivors,
            excluded = report.excluded,
            residential_resolved = report.residential.tally.resolved,
            postal_resolved = report.postal.tally.resolved,
            "geocoding run finished"
        );

        if report.degraded {
            self.diagnostics.emit(
                "run_degraded",
                json!({
                    "rows": report.excluded,
                    "service_unavailable": report.service_unavailable,
                }),
            );
        }
        self.diagnostics.emit(
            "run_summary",
            json!({
                "survivors": report.survivors,
                "excluded": report.excluded,
                "residential": report.residential,
                "postal": report.postal,
            }),
        );
        if let Err(err) = self.diagnostics.flush().await {
            warn!(?err, "failed to flush diagnostics buffer");
        }
    }
}

fn address_records(rows: &[ContactRow], kind: AddressKind) -> Vec<AddressRecord> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| AddressRecord::new(index, kind, row.address(kind).query()))
        .collect()
}
