//! Pipeline driver: one sequential pass over an archive.
//!
//! ```text
//!   Archive ──> members ──> MemberFilter ──> lines ──> LineDecoder
//!                                                         │
//!                                 Deliver <── Batcher <───┘
//! ```
//!
//! Every batch the [`Batcher`] emits is delivered before the next line is
//! read, so batches reach the endpoint in accumulation order, member after
//! member in archive order. The first delivery that cannot be completed
//! aborts the run.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, info_span, trace, Instrument};

use crate::archive::{Archive, ArchiveError, Member};
use crate::batch::{Batch, BatchScope, Batcher, BatcherStats, FlushPolicy};
use crate::client::{ClientError, Deliver, RetryPolicy};
use crate::config::Config;
use crate::decoder::LineDecoder;
use crate::filter::MemberFilter;

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The archive could not be opened or read
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A batch could not be delivered
    #[error("failed to deliver batch from member '{member}': {source}")]
    Delivery {
        member: String,
        #[source]
        source: ClientError,
    },
}

/// Stages of a pipeline run, traced as the run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Opened,
    Enumerating,
    Filtering,
    Decoding,
    Batching,
    Delivering,
    Closed,
    Aborted,
}

/// Settings the driver needs, resolved from [`Config`].
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub filter: MemberFilter,
    pub decoder: LineDecoder,
    pub flush_policy: FlushPolicy,
    pub batch_scope: BatchScope,
    pub retry: RetryPolicy,
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            filter: config.member_filter(),
            decoder: LineDecoder::new(config.require_timestamp),
            flush_policy: config.flush_policy,
            batch_scope: config.batch_scope,
            retry: RetryPolicy::new(config.max_retries),
        }
    }
}

/// Outcome of shipping one eligible member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberReport {
    pub name: String,

    /// Lines that decoded into a payload
    pub decoded_lines: u64,

    /// Batches delivered while this member was being read
    pub batches: u64,
}

/// Outcome of a completed run over one archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub archive: PathBuf,
    pub members_seen: u64,
    pub members: Vec<MemberReport>,
    pub decoded_lines: u64,
    pub batches_delivered: u64,
    pub bytes_delivered: u64,

    /// How the batcher cut the run's payloads into batches
    pub batching: BatcherStats,
}

impl RunReport {
    /// Number of members that passed the filter.
    pub fn members_shipped(&self) -> usize {
        self.members.len()
    }
}

/// Mutable state of a single run.
struct Run {
    state: PipelineState,
    report: RunReport,
    batcher: Batcher,
}

impl Run {
    fn enter(&mut self, next: PipelineState) {
        trace!(from = ?self.state, to = ?next, "Pipeline state change");
        self.state = next;
    }
}

/// Drives archives through filter, decode, batch and delivery.
///
/// # Example
///
/// ```no_run
/// use archive_shipper::client::HttpDelivery;
/// use archive_shipper::config::Config;
/// use archive_shipper::pipeline::{Pipeline, PipelineConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::from_env().expect("Failed to load config");
///     let client = HttpDelivery::new(&config).expect("Failed to create client");
///     let pipeline = Pipeline::new(PipelineConfig::from(&config), client);
///
///     let report = pipeline.run("end2end-logs.tar.gz").await.expect("Run failed");
///     println!("shipped {} lines", report.decoded_lines);
/// }
/// ```
pub struct Pipeline<D> {
    config: PipelineConfig,
    client: D,
}

impl<D: Deliver> Pipeline<D> {
    pub fn new(config: PipelineConfig, client: D) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn client(&self) -> &D {
        &self.client
    }

    /// Ship every eligible member of the archive at `path`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Archive` if the archive cannot be opened or a
    /// member cannot be read, and `PipelineError::Delivery` for the first
    /// batch that could not be delivered. No further members are read after
    /// an error.
    pub async fn run(&self, path: impl AsRef<Path>) -> Result<RunReport, PipelineError> {
        let path = path.as_ref();
        let span = info_span!("pipeline", archive = %path.display());
        self.run_archive(path).instrument(span).await
    }

    /// Ship several archives in order, stopping at the first failure.
    pub async fn run_all<P: AsRef<Path>>(
        &self,
        paths: &[P],
    ) -> Result<Vec<RunReport>, PipelineError> {
        let mut reports = Vec::with_capacity(paths.len());
        for path in paths {
            reports.push(self.run(path).await?);
        }
        Ok(reports)
    }

    async fn run_archive(&self, path: &Path) -> Result<RunReport, PipelineError> {
        let archive = Archive::open(path)?;

        let mut run = Run {
            state: PipelineState::Opened,
            report: RunReport {
                archive: path.to_path_buf(),
                ..RunReport::default()
            },
            batcher: Batcher::new(self.config.flush_policy),
        };

        debug!(
            components = ?self.config.filter.components(),
            extension = %self.config.filter.extension(),
            policy = ?run.batcher.policy(),
            scope = ?self.config.batch_scope,
            "Starting run"
        );

        match self.ship_archive(&archive, &mut run).await {
            Ok(()) => {
                run.enter(PipelineState::Closed);
                run.report.batching = run.batcher.stats().clone();
                let stats = &run.report.batching;
                info!(
                    members_seen = run.report.members_seen,
                    members_shipped = run.report.members_shipped(),
                    decoded_lines = run.report.decoded_lines,
                    batches = run.report.batches_delivered,
                    bytes = run.report.bytes_delivered,
                    size_flushes = stats.size_flushes,
                    line_flushes = stats.line_flushes,
                    final_flushes = stats.final_flushes,
                    oversized_payloads = stats.oversized_payloads,
                    "Archive shipped"
                );
                Ok(run.report)
            }
            Err(e) => {
                let failed_in = run.state;
                run.enter(PipelineState::Aborted);
                error!(error = %e, state = ?failed_in, "Aborting run");
                Err(e)
            }
        }
    }

    async fn ship_archive(&self, archive: &Archive, run: &mut Run) -> Result<(), PipelineError> {
        run.enter(PipelineState::Enumerating);
        let names: Vec<String> = archive
            .list_members()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut cursor = archive.cursor();
        let mut last_member = None;
        for (index, name) in names.into_iter().enumerate() {
            run.report.members_seen += 1;
            run.enter(PipelineState::Filtering);
            if !self.config.filter.is_eligible(&name) {
                debug!(member = %name, "Skipping member");
                continue;
            }

            let member = cursor.open_at(index)?;
            let report = self.ship_member(member, run).await?;
            info!(
                member = %report.name,
                decoded_lines = report.decoded_lines,
                batches = report.batches,
                "Member shipped"
            );
            run.report.decoded_lines += report.decoded_lines;
            run.report.members.push(report);
            last_member = Some(name);
        }

        if self.config.batch_scope == BatchScope::PerRun {
            if let Some(batch) = run.batcher.flush() {
                let member = last_member.unwrap_or_default();
                self.send(&member, &batch, run).await?;
            }
        }

        Ok(())
    }

    async fn ship_member(&self, member: Member<'_>, run: &mut Run) -> Result<MemberReport, PipelineError> {
        let mut report = MemberReport {
            name: member.name().to_string(),
            ..MemberReport::default()
        };

        run.enter(PipelineState::Decoding);
        for line in member.lines() {
            let line = line?;
            let Some(payload) = self.config.decoder.decode_bytes(&line) else {
                continue;
            };
            report.decoded_lines += 1;

            run.enter(PipelineState::Batching);
            if let Some(batch) = run.batcher.append(payload.as_bytes()) {
                self.send(&report.name, &batch, run).await?;
                report.batches += 1;
            }
            run.enter(PipelineState::Decoding);
        }

        if self.config.batch_scope == BatchScope::PerMember {
            if let Some(batch) = run.batcher.flush() {
                self.send(&report.name, &batch, run).await?;
                report.batches += 1;
            }
        }

        Ok(report)
    }

    async fn send(&self, member: &str, batch: &Batch, run: &mut Run) -> Result<(), PipelineError> {
        run.enter(PipelineState::Delivering);
        debug!(member = %member, batch_bytes = batch.len(), "Delivering batch");

        self.config
            .retry
            .deliver(&self.client, batch)
            .await
            .map_err(|source| PipelineError::Delivery {
                member: member.to_string(),
                source,
            })?;

        run.report.batches_delivered += 1;
        run.report.bytes_delivered += batch.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeliveryOutcome;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::fs::File;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every batch; fails the call numbers listed in `fail_on`.
    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<u8>>>,
        fail_on: Vec<usize>,
        calls: Mutex<usize>,
    }

    impl Recorder {
        fn failing_on(fail_on: Vec<usize>) -> Self {
            Self {
                fail_on,
                ..Self::default()
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .map(|b| String::from_utf8(b.clone()).unwrap())
                .collect()
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Deliver for Recorder {
        async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if self.fail_on.contains(&call) {
                return DeliveryOutcome::Fatal(ClientError::Status {
                    code: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "rejected".to_string(),
                });
            }
            self.batches.lock().unwrap().push(batch.bytes().to_vec());
            DeliveryOutcome::Delivered
        }
    }

    fn write_tar(dir: &TempDir, members: &[(&str, &str)]) -> PathBuf {
        let path = dir.path().join("run.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap();
        path
    }

    fn config(policy: FlushPolicy, scope: BatchScope) -> PipelineConfig {
        PipelineConfig {
            flush_policy: policy,
            batch_scope: scope,
            ..PipelineConfig::default()
        }
    }

    const SAMPLE: &str = "{\"log\":\"a\"}\nnot json\n{\"log\":\"b\",\"@t\":\"2024-01-01\"}\n";

    #[tokio::test]
    async fn test_single_member_single_batch() {
        let dir = TempDir::new().unwrap();
        let path = write_tar(&dir, &[("compute-plane-1.log", SAMPLE)]);

        let pipeline = Pipeline::new(
            config(FlushPolicy::Bytes(1000), BatchScope::PerMember),
            Recorder::default(),
        );
        let report = pipeline.run(&path).await.unwrap();

        assert_eq!(pipeline.client().delivered(), vec!["ab"]);
        assert_eq!(report.decoded_lines, 2);
        assert_eq!(report.members[0].decoded_lines, 2);
        assert_eq!(report.batches_delivered, 1);
        assert_eq!(report.bytes_delivered, 2);
    }

    #[tokio::test]
    async fn test_require_timestamp_drops_unmarked_lines() {
        let dir = TempDir::new().unwrap();
        let path = write_tar(&dir, &[("compute-plane-1.log", SAMPLE)]);

        let pipeline = Pipeline::new(
            PipelineConfig {
                decoder: LineDecoder::new(true),
                ..PipelineConfig::default()
            },
            Recorder::default(),
        );
        let report = pipeline.run(&path).await.unwrap();

        assert_eq!(pipeline.client().delivered(), vec!["b"]);
        assert_eq!(report.decoded_lines, 1);
    }

    #[tokio::test]
    async fn test_ineligible_members_are_never_read() {
        let dir = TempDir::new().unwrap();
        let path = write_tar(
            &dir,
            &[
                ("unrelated-service.log", "{\"log\":\"x\"}\n"),
                ("compute.txt", "{\"log\":\"y\"}\n"),
            ],
        );

        let pipeline = Pipeline::new(PipelineConfig::default(), Recorder::default());
        let report = pipeline.run(&path).await.unwrap();

        assert_eq!(report.members_seen, 2);
        assert_eq!(report.members_shipped(), 0);
        assert_eq!(report.decoded_lines, 0);
        assert_eq!(pipeline.client().calls(), 0);
    }

    #[tokio::test]
    async fn test_per_member_scope_cuts_at_member_boundary() {
        let dir = TempDir::new().unwrap();
        let path = write_tar(
            &dir,
            &[
                ("control-0.log", "{\"log\":\"a\"}\n{\"log\":\"b\"}\n"),
                ("compute-0.log", "{\"log\":\"c\"}\n"),
            ],
        );

        let pipeline = Pipeline::new(
            config(FlushPolicy::Bytes(1000), BatchScope::PerMember),
            Recorder::default(),
        );
        pipeline.run(&path).await.unwrap();

        assert_eq!(pipeline.client().delivered(), vec!["ab", "c"]);
    }

    #[tokio::test]
    async fn test_per_run_scope_spans_members() {
        let dir = TempDir::new().unwrap();
        let path = write_tar(
            &dir,
            &[
                ("control-0.log", "{\"log\":\"a\"}\n{\"log\":\"b\"}\n"),
                ("skipped.log", "{\"log\":\"z\"}\n"),
                ("compute-0.log", "{\"log\":\"c\"}\n"),
            ],
        );

        let pipeline = Pipeline::new(
            config(FlushPolicy::Bytes(1000), BatchScope::PerRun),
            Recorder::default(),
        );
        let report = pipeline.run(&path).await.unwrap();

        assert_eq!(pipeline.client().delivered(), vec!["abc"]);
        assert_eq!(report.batches_delivered, 1);
        assert_eq!(report.members_shipped(), 2);
    }

    #[tokio::test]
    async fn test_line_policy() {
        let dir = TempDir::new().unwrap();
        let lines: String = (0..5).map(|i| format!("{{\"log\":\"{}\"}}\n", i)).collect();
        let path = write_tar(&dir, &[("compute.log", &lines)]);

        let pipeline = Pipeline::new(
            config(FlushPolicy::Lines(2), BatchScope::PerMember),
            Recorder::default(),
        );
        let report = pipeline.run(&path).await.unwrap();

        assert_eq!(pipeline.client().delivered(), vec!["01", "23", "4"]);
        assert_eq!(report.members[0].batches, 3);
    }

    #[tokio::test]
    async fn test_fatal_delivery_stops_the_run() {
        let dir = TempDir::new().unwrap();
        let path = write_tar(
            &dir,
            &[
                ("compute-0.log", "{\"log\":\"a\"}\n{\"log\":\"b\"}\n"),
                ("control-0.log", "{\"log\":\"c\"}\n"),
            ],
        );

        let pipeline = Pipeline::new(
            config(FlushPolicy::Bytes(1), BatchScope::PerMember),
            Recorder::failing_on(vec![1]),
        );
        let err = pipeline.run(&path).await.unwrap_err();

        match err {
            PipelineError::Delivery { member, source } => {
                assert_eq!(member, "compute-0.log");
                assert!(matches!(source, ClientError::Status { .. }));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(pipeline.client().calls(), 1);
        assert!(pipeline.client().delivered().is_empty());
    }

    #[tokio::test]
    async fn test_empty_payloads_are_never_posted() {
        let dir = TempDir::new().unwrap();
        let path = write_tar(
            &dir,
            &[
                ("compute-0.log", "{\"log\":\"\"}\n{\"log\":\"\"}\n"),
                ("control-0.log", "{\"log\":\"\"}\n{\"log\":\"c\"}\n"),
            ],
        );

        let pipeline = Pipeline::new(
            config(FlushPolicy::Bytes(1000), BatchScope::PerMember),
            Recorder::default(),
        );
        let report = pipeline.run(&path).await.unwrap();

        assert_eq!(pipeline.client().delivered(), vec!["c"]);
        assert_eq!(pipeline.client().calls(), 1);
        assert_eq!(report.members[0].decoded_lines, 2);
        assert_eq!(report.members[0].batches, 0);
        assert_eq!(report.batches_delivered, 1);
    }

    #[tokio::test]
    async fn test_gzip_archive_ships_members_in_order() {
        use flate2::write::GzEncoder;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.tar.gz");
        let encoder = GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in [
            ("compute-0.log", "{\"log\":\"a\"}\n"),
            ("unrelated.log", "{\"log\":\"x\"}\n"),
            ("control-0.log", "{\"log\":\"b\"}\n"),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let pipeline = Pipeline::new(PipelineConfig::default(), Recorder::default());
        let report = pipeline.run(&path).await.unwrap();

        assert_eq!(pipeline.client().delivered(), vec!["a", "b"]);
        assert_eq!(report.members_seen, 3);
        assert_eq!(report.members_shipped(), 2);
    }

    #[tokio::test]
    async fn test_report_carries_batching_stats() {
        let dir = TempDir::new().unwrap();
        let path = write_tar(
            &dir,
            &[("compute-0.log", "{\"log\":\"aa\"}\n{\"log\":\"bb\"}\n{\"log\":\"0123456789\"}\n")],
        );

        let pipeline = Pipeline::new(
            config(FlushPolicy::Bytes(4), BatchScope::PerMember),
            Recorder::default(),
        );
        let report = pipeline.run(&path).await.unwrap();

        assert_eq!(pipeline.client().delivered(), vec!["aabb", "0123456789"]);
        assert_eq!(report.batching.payloads_received, 3);
        assert_eq!(report.batching.size_flushes, 1);
        assert_eq!(report.batching.final_flushes, 1);
        assert_eq!(report.batching.oversized_payloads, 1);
        assert_eq!(report.batching.batches_emitted, report.batches_delivered);
    }

    #[tokio::test]
    async fn test_run_all_stops_at_first_failing_archive() {
        let dir = TempDir::new().unwrap();
        let good = write_tar(&dir, &[("compute.log", "{\"log\":\"a\"}\n")]);
        let missing = dir.path().join("missing.tar");

        let pipeline = Pipeline::new(PipelineConfig::default(), Recorder::default());
        let err = pipeline
            .run_all(&[good.clone(), missing, good])
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Archive(ArchiveError::NotFound(_))));
        assert_eq!(pipeline.client().delivered(), vec!["a"]);
    }

    #[test]
    fn test_pipeline_config_from_config() {
        let config = Config {
            flush_policy: FlushPolicy::Lines(10),
            batch_scope: BatchScope::PerRun,
            require_timestamp: true,
            max_retries: 4,
            ..Config::default()
        };

        let pipeline_config = PipelineConfig::from(&config);
        assert_eq!(pipeline_config.flush_policy, FlushPolicy::Lines(10));
        assert_eq!(pipeline_config.batch_scope, BatchScope::PerRun);
        assert!(pipeline_config.decoder.require_timestamp());
        assert_eq!(pipeline_config.retry.max_retries, 4);
        assert!(pipeline_config.filter.is_eligible("compute.log"));
    }
}
