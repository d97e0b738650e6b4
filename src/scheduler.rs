use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info};

use crate::errors::AppError;
use crate::geocode::{AddressRecord, GeocodeClient, GeocodeOutcome};
use crate::ingestion::AddressKind;

/// A contiguous run of address records handled by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub number: usize,
    pub records: Vec<AddressRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Splits records into consecutive batches of at most `batch_size`.
pub fn partition(records: Vec<AddressRecord>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(batch_size));
    let mut records = records.into_iter().peekable();
    while records.peek().is_some() {
        batches.push(Batch {
            number: batches.len(),
            records: records.by_ref().take(batch_size).collect(),
        });
    }
    batches
}

/// Fans batches out over a bounded worker pool and collects every outcome.
///
/// Schedulers built from the same semaphore share one pool, so the number of
/// batches in flight never exceeds its permit count.
#[derive(Clone)]
pub struct BatchScheduler {
    client: GeocodeClient,
    batch_size: usize,
    pool: Arc<Semaphore>,
}

impl BatchScheduler {
    pub fn new(client: GeocodeClient, batch_size: usize, pool_size: usize) -> Self {
        Self::with_pool(client, batch_size, Arc::new(Semaphore::new(pool_size.max(1))))
    }

    pub fn with_pool(client: GeocodeClient, batch_size: usize, pool: Arc<Semaphore>) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            pool,
        }
    }

    /// Geocodes every record and returns once all batches have finished.
    ///
    /// Outcomes arrive in completion order; exactly one is returned per
    /// record. A batch whose worker dies reports its unfinished records as
    /// failed instead of dropping them.
    pub async fn run(&self, kind: AddressKind, records: Vec<AddressRecord>) -> Vec<GeocodeOutcome> {
        let total = records.len();
        let batches = partition(records, self.batch_size);
        if batches.is_empty() {
            debug!(kind = kind.as_tag(), "no addresses to geocode");
            return Vec::new();
        }
        info!(
            kind = kind.as_tag(),
            total,
            batches = batches.len(),
            batch_size = self.batch_size,
            "dispatching geocode batches"
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<GeocodeOutcome>();
        let mut batch_indices = Vec::with_capacity(batches.len());
        let mut handles = Vec::with_capacity(batches.len());
        for batch in batches {
            batch_indices.push(batch.records.iter().map(|r| r.index).collect::<Vec<_>>());
            let client = self.client.clone();
            let pool = Arc::clone(&self.pool);
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|_| AppError::Config("geocode worker pool closed".into()))?;
                debug!(kind = kind.as_tag(), batch = batch.number, size = batch.len(), "batch started");
                for record in &batch.records {
                    let outcome = client.geocode(record).await;
                    if tx.send(outcome).is_err() {
                        break;
                    }
                }
                debug!(kind = kind.as_tag(), batch = batch.number, "batch finished");
                Ok::<_, AppError>(())
            }));
        }
        drop(tx);

        let mut aborted = Vec::new();
        for (indices, joined) in batch_indices.into_iter().zip(join_all(handles).await) {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join_err) => AppError::from(join_err),
            };
            error!(?err, kind = kind.as_tag(), "geocode batch aborted");
            aborted.push(indices);
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        if !aborted.is_empty() {
            let reported = outcomes.iter().map(|o| o.index).collect::<HashSet<_>>();
            outcomes.extend(
                aborted
                    .into_iter()
                    .flatten()
                    .filter(|index| !reported.contains(index))
                    .map(|index| GeocodeOutcome::failed(index, 0)),
            );
        }

        outcomes
    }
}
