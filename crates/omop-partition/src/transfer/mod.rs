//! Bulk transfer engine.
//!
//! Each [`TransferJob`] runs `COPY (<selection>) TO STDOUT (FORMAT binary)` on
//! its own source connection and `COPY <table> FROM STDIN (FORMAT binary)` in
//! a transaction on its own partition connection. Chunks are coalesced into
//! bounded writes and the framing is checked before the transaction commits.
//! Jobs are scheduled in dependency waves on a bounded worker pool.

mod copy_frame;

pub use copy_frame::{CopyFrameCounter, PG_COPY_SIGNATURE};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TargetMode;
use crate::core::{ByteStream, ImportWriter, PartitionSink, SourceDatabase, TableRef};
use crate::error::{PartitionError, Result};
use crate::plan::TransferJob;

/// Size of the coalescing buffer between source and partition.
pub const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Statistics from one completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub table: TableRef,
    pub partition: usize,
    pub rows: u64,
    pub bytes: u64,
    pub duration_ms: u64,
}

/// A job that failed, with its error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub table: TableRef,
    pub partition: usize,
    pub error: String,
}

/// A job that never started because the run was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    pub table: TableRef,
    pub partition: usize,
}

/// Outcome of scheduling a set of job waves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSummary {
    pub completed: Vec<TransferStats>,
    pub failed: Vec<FailedJob>,
    pub not_started: Vec<PendingJob>,
    pub cancelled: bool,
}

impl TransferSummary {
    pub fn rows(&self) -> u64 {
        self.completed.iter().map(|s| s.rows).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.completed.iter().map(|s| s.bytes).sum()
    }

    pub fn total_jobs(&self) -> usize {
        self.completed.len() + self.failed.len() + self.not_started.len()
    }
}

/// Executes transfer jobs against one source and a fixed set of partitions.
pub struct TransferEngine {
    source: Arc<dyn SourceDatabase>,
    partitions: Vec<Arc<dyn PartitionSink>>,
    target_mode: TargetMode,
    chunk_bytes: usize,
    in_flight: Mutex<HashSet<(TableRef, usize)>>,
}

impl TransferEngine {
    pub fn new(
        source: Arc<dyn SourceDatabase>,
        partitions: Vec<Arc<dyn PartitionSink>>,
        target_mode: TargetMode,
    ) -> Self {
        Self {
            source,
            partitions,
            target_mode,
            chunk_bytes: COPY_CHUNK_BYTES,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Override the coalescing buffer size.
    pub fn with_chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes.max(1);
        self
    }

    /// Empty `tables` on every partition when the target mode is truncate.
    ///
    /// Runs once before any job; a job only appends to its table.
    pub async fn prepare(&self, tables: &[TableRef]) -> Result<()> {
        if self.target_mode != TargetMode::Truncate || tables.is_empty() {
            return Ok(());
        }
        for partition in &self.partitions {
            partition.clear_tables(tables).await.map_err(|e| {
                PartitionError::transfer(
                    format!("{} tables", tables.len()),
                    partition.index(),
                    format!("truncate before load: {}", e),
                )
            })?;
        }
        info!(
            "Emptied {} tables on {} partitions",
            tables.len(),
            self.partitions.len()
        );
        Ok(())
    }

    /// Run one job to completion. Nothing is retried.
    pub async fn execute(&self, job: &TransferJob) -> Result<TransferStats> {
        let _guard = self.claim(job)?;
        let started = Instant::now();

        let partition = self.partitions.get(job.partition_index).ok_or_else(|| {
            PartitionError::transfer(
                &job.table,
                job.partition_index,
                format!("no such partition (have {})", self.partitions.len()),
            )
        })?;

        debug!(
            "{} -> partition {}: {}",
            job.table, job.partition_index, job.selection
        );

        let (rows, bytes) = self
            .pipe(job, partition.as_ref())
            .await
            .map_err(|e| match e {
                PartitionError::Transfer { .. } => e,
                other => {
                    PartitionError::transfer(&job.table, job.partition_index, other.to_string())
                }
            })?;

        let stats = TransferStats {
            table: job.table.clone(),
            partition: job.partition_index,
            rows,
            bytes,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "{} -> partition {}: {} rows ({} bytes) in {:.2}s",
            stats.table,
            stats.partition,
            stats.rows,
            stats.bytes,
            stats.duration_ms as f64 / 1000.0
        );
        Ok(stats)
    }

    async fn pipe(&self, job: &TransferJob, partition: &dyn PartitionSink) -> Result<(u64, u64)> {
        let stream = self.source.export(&job.table, &job.selection).await?;
        let mut writer = partition.begin_import(&job.table).await?;
        let mut counter = CopyFrameCounter::new();

        match self.forward(stream, writer.as_mut(), &mut counter).await {
            Ok(()) => {
                let written = writer.commit().await?;
                if written != counter.rows() {
                    warn!(
                        "{} -> partition {}: partition reported {} rows, stream carried {}",
                        job.table,
                        job.partition_index,
                        written,
                        counter.rows()
                    );
                }
                Ok((counter.rows(), counter.bytes()))
            }
            Err(e) => {
                writer.abort().await;
                Err(e)
            }
        }
    }

    /// Copy the export stream into the import, coalescing small chunks.
    async fn forward(
        &self,
        mut stream: ByteStream,
        writer: &mut dyn ImportWriter,
        counter: &mut CopyFrameCounter,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(self.chunk_bytes);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            counter.feed(&chunk)?;
            buf.extend_from_slice(&chunk);
            if buf.len() >= self.chunk_bytes {
                writer.write(buf.split().freeze()).await?;
            }
        }
        if !buf.is_empty() {
            writer.write(buf.split().freeze()).await?;
        }

        counter.finish()?;
        Ok(())
    }

    fn claim(&self, job: &TransferJob) -> Result<InFlightGuard<'_>> {
        let key = (job.table.clone(), job.partition_index);
        let mut running = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !running.insert(key.clone()) {
            return Err(PartitionError::transfer(
                &job.table,
                job.partition_index,
                "a job for this table and partition is already running",
            ));
        }
        Ok(InFlightGuard {
            registry: &self.in_flight,
            key,
        })
    }

    /// Run job waves in order. Jobs of one wave run concurrently, at most
    /// `workers` at a time; the next wave starts once the previous finished.
    /// After cancellation no new job starts and in-flight jobs finish.
    pub async fn run_waves(
        self: &Arc<Self>,
        waves: Vec<Vec<TransferJob>>,
        workers: usize,
        cancel: CancellationToken,
    ) -> TransferSummary {
        let mut summary = TransferSummary::default();
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));

        for (wave_no, wave) in waves.into_iter().enumerate() {
            if cancel.is_cancelled() {
                summary.not_started.extend(wave.iter().map(pending));
                continue;
            }
            info!("Wave {}: {} jobs", wave_no + 1, wave.len());

            let mut handles = Vec::new();
            for job in wave {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    summary.not_started.push(pending(&job));
                    continue;
                };

                let engine = Arc::clone(self);
                let id = pending(&job);
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    engine.execute(&job).await
                });
                handles.push((id, handle));
            }

            for (id, handle) in handles {
                let error = match handle.await {
                    Ok(Ok(stats)) => {
                        summary.completed.push(stats);
                        continue;
                    }
                    Ok(Err(e)) => {
                        error!("{}", e);
                        e.to_string()
                    }
                    Err(e) => {
                        error!(
                            "Transfer task for {} -> partition {} failed: {}",
                            id.table, id.partition, e
                        );
                        format!("task failed: {}", e)
                    }
                };
                summary.failed.push(FailedJob {
                    table: id.table,
                    partition: id.partition,
                    error,
                });
            }
        }

        summary.cancelled = cancel.is_cancelled();
        if summary.cancelled {
            warn!(
                "Run cancelled: {} jobs not started",
                summary.not_started.len()
            );
        }
        summary
    }
}

fn pending(job: &TransferJob) -> PendingJob {
    PendingJob {
        table: job.table.clone(),
        partition: job.partition_index,
    }
}

/// Removes a job from the in-flight registry when it finishes.
struct InFlightGuard<'a> {
    registry: &'a Mutex<HashSet<(TableRef, usize)>>,
    key: (TableRef, usize),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut running = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        running.remove(&self.key);
    }
}
