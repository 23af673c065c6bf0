//! Orchestrates a full provisioning run over a bounded worker pool.
//!
//! Fetching and extraction are pipelined per package, a package's payloads
//! all fetch before its extraction starts because MSI media tables may
//! reference sibling cabinets. Splatting is a cross package operation and
//! only begins once every package extracted. The first fatal error raises
//! the shared cancellation flag, sibling tasks drain at their next
//! checkpoint and their [`Error::Cancelled`] noise never masks the real
//! failure.

use crate::{
    catalog::{self, PackageRecord, PayloadRecord, Request},
    fetch::{self, FetchSource, Fetched},
    splat::{self, ExtractedPackage, ExtractedPayload, SplatConfig, SplatSummary},
    unpack::{self, ArchiveFormat, SiblingPayloads},
    Arch, Ctx, Error, PackageKind, Path, Variant,
};
use anyhow::Context as _;
use rayon::prelude::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;

/// Marker dropped in the output root while a splat is in flight. Presence
/// on startup means a previous run died mid write and the tree cannot be
/// trusted until rebuilt.
pub const SENTINEL: &str = ".winsplat-incomplete";

/// Cooperative cancellation flag shared by every task of a run.
///
/// Raised by the first failing task, or externally from eg a ctrl-c
/// handler. Tasks observe it between read chunks, retry sleeps, extracted
/// entries and splatted files.
#[derive(Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Checkpoint, fails with [`Error::Cancelled`] once the flag is raised
    #[inline]
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Coarse pipeline stage. Fetching and extraction overlap across packages,
/// each stage is reported once on first entry and never regresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    Resolving,
    Fetching,
    Extracting,
    Splatting,
    Done,
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::Extracting => "extracting",
            Self::Splatting => "splatting",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// How far the pipeline runs
pub enum Ops {
    /// Stop once every payload is verified and cached
    Fetch,
    /// Additionally decode every payload, proving the archives sound
    /// without writing an output tree
    Extract,
    /// The full pipeline, ending in a splatted output tree
    Splat(SplatConfig),
}

/// One run's worth of configuration
pub struct ExecConfig {
    pub request: Request,
    pub ops: Ops,
}

/// Progress collaborator, the pipeline never formats user facing text.
///
/// Bar styling and layout belong to the caller, the pipeline only drives
/// byte positions and signals stage entry.
pub trait Progress: Send + Sync {
    /// A bar tracking one payload, preset to the payload's size in bytes
    fn register(&self, payload: &PayloadRecord) -> indicatif::ProgressBar;

    /// Entry into a pipeline stage
    fn stage(&self, _state: State) {}

    /// A bar tracking splat writes, sized by the splat engine
    fn splat_progress(&self) -> indicatif::ProgressBar {
        indicatif::ProgressBar::hidden()
    }
}

/// Renders nothing, for tests and library embedders
pub struct NullProgress;

impl Progress for NullProgress {
    fn register(&self, _payload: &PayloadRecord) -> indicatif::ProgressBar {
        indicatif::ProgressBar::hidden()
    }
}

#[derive(Debug, serde::Serialize)]
pub struct PayloadSummary {
    pub file_name: String,
    pub bytes: u64,
    pub source: FetchSource,
    /// Network attempts, zero for a cache hit
    pub attempts: u32,
    /// Decoded entry count, absent for fetch only runs and for cabinets
    /// consumed through a sibling MSI's media table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<usize>,
}

#[derive(Debug, serde::Serialize)]
pub struct PackageSummary {
    pub id: String,
    pub version: String,
    pub kind: PackageKind,
    pub payloads: Vec<PayloadSummary>,
}

/// Wall clock per stage. Acquisition covers fetch and extraction, which
/// overlap across packages and cannot be timed apart honestly.
#[derive(Debug, Default, serde::Serialize)]
pub struct Timings {
    pub resolve_ms: u64,
    pub acquire_ms: u64,
    pub splat_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, serde::Serialize)]
pub struct RunSummary {
    pub arch: Arch,
    pub variant: Variant,
    pub packages: Vec<PackageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub splat: Option<SplatSummary>,
    pub timings: Timings,
}

struct PackageOutcome {
    summary: PackageSummary,
    extracted: Option<ExtractedPackage>,
}

/// Collapses parallel task results, preferring the first real failure over
/// the `Cancelled` noise of siblings that drained after the flag was raised
fn settle<T>(results: Vec<Result<T, Error>>) -> Result<Vec<T>, Error> {
    let mut cancelled = None;
    let mut settled = Vec::with_capacity(results.len());

    for result in results {
        match result {
            Ok(value) => settled.push(value),
            Err(err) if err.is_cancelled() => cancelled = Some(err),
            Err(err) => return Err(err),
        }
    }

    match cancelled {
        Some(err) => Err(err),
        None => Ok(settled),
    }
}

fn with_sentinel<T>(output: &Path, f: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("unable to create output directory {output}"))?;

    let marker = output.join(SENTINEL);
    if marker.exists() {
        tracing::warn!(output = %output, "previous splat did not complete, rebuilding");
    }
    std::fs::write(&marker, []).with_context(|| format!("unable to write {marker}"))?;

    let result = f();

    if result.is_ok() {
        std::fs::remove_file(&marker).with_context(|| format!("unable to remove {marker}"))?;
    }

    result
}

fn process_package(
    ctx: &Ctx,
    pkg: &PackageRecord,
    ops: &Ops,
    cancel: &Cancel,
    progress: &dyn Progress,
    extracting: &AtomicBool,
) -> Result<PackageOutcome, Error> {
    // Every payload fetches before any decode starts, MSI media tables may
    // reference sibling cabinets
    let outcomes: Vec<Result<(&PayloadRecord, Fetched), Error>> = pkg
        .payloads
        .par_iter()
        .map(|payload| {
            let bar = progress.register(payload);
            let fetched = fetch::fetch_payload(ctx, payload, cancel, &bar);

            match &fetched {
                Ok(f) => bar.finish_with_message(match f.source {
                    FetchSource::Cache => "cached",
                    FetchSource::Network => "fetched",
                }),
                Err(_) => bar.abandon_with_message("failed"),
            }

            fetched.map(|f| (payload, f))
        })
        .collect();
    let fetched = settle(outcomes)?;

    let summary = |payloads| PackageSummary {
        id: pkg.id.clone(),
        version: pkg.version.clone(),
        kind: pkg.kind,
        payloads,
    };

    if matches!(ops, Ops::Fetch) {
        let payloads = fetched
            .into_iter()
            .map(|(payload, f)| PayloadSummary {
                file_name: payload.file_name.clone(),
                bytes: f.contents.len() as u64,
                source: f.source,
                attempts: f.attempts,
                entries: None,
            })
            .collect();

        return Ok(PackageOutcome {
            summary: summary(payloads),
            extracted: None,
        });
    }

    if !extracting.swap(true, Ordering::Relaxed) {
        progress.stage(State::Extracting);
    }

    let mut siblings = SiblingPayloads::new();
    for (payload, f) in &fetched {
        siblings.insert(&payload.file_name, f.contents.clone());
    }

    let has_msi = fetched
        .iter()
        .any(|(payload, _)| payload.format == ArchiveFormat::Msi);

    let keep_entries = matches!(ops, Ops::Splat(_));
    let mut payload_summaries = Vec::with_capacity(fetched.len());
    let mut extracted_payloads = Vec::new();

    for (payload, f) in fetched {
        cancel.check()?;
        let bytes = f.contents.len() as u64;

        // Cabinets traveling with an MSI are its media, their members are
        // emitted by the MSI's own extraction under File table names
        if has_msi && payload.format == ArchiveFormat::Cab {
            payload_summaries.push(PayloadSummary {
                file_name: payload.file_name.clone(),
                bytes,
                source: f.source,
                attempts: f.attempts,
                entries: None,
            });
            continue;
        }

        let mut entries = Vec::new();
        for entry in unpack::extract(&payload.file_name, payload.format, f.contents, &siblings)? {
            cancel.check()?;
            entries.push(entry?);
        }

        tracing::debug!(
            package = %pkg.id,
            payload = %payload.file_name,
            entries = entries.len(),
            "decoded payload",
        );

        payload_summaries.push(PayloadSummary {
            file_name: payload.file_name.clone(),
            bytes,
            source: f.source,
            attempts: f.attempts,
            entries: Some(entries.len()),
        });

        if keep_entries {
            extracted_payloads.push(ExtractedPayload {
                record: payload.clone(),
                entries,
            });
        }
    }

    let extracted = keep_entries.then(|| ExtractedPackage {
        id: pkg.id.clone(),
        kind: pkg.kind,
        payloads: extracted_payloads,
    });

    Ok(PackageOutcome {
        summary: summary(payload_summaries),
        extracted,
    })
}

fn run(
    ctx: &Ctx,
    records: &[PackageRecord],
    config: &ExecConfig,
    cancel: &Cancel,
    progress: &dyn Progress,
) -> Result<RunSummary, Error> {
    let started = Instant::now();
    let mut timings = Timings::default();

    progress.stage(State::Resolving);
    let resolution = catalog::resolve(records, &config.request)?;
    timings.resolve_ms = started.elapsed().as_millis() as u64;

    progress.stage(State::Fetching);
    let acquire_started = Instant::now();
    let extracting = AtomicBool::new(false);

    let outcomes: Vec<Result<PackageOutcome, Error>> = resolution
        .packages()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|pkg| {
            let outcome =
                process_package(ctx, pkg, &config.ops, cancel, progress, &extracting);
            if outcome.is_err() {
                // First failure wins, siblings drain at their checkpoints
                cancel.cancel();
            }
            outcome
        })
        .collect();
    let mut packages = settle(outcomes)?;
    timings.acquire_ms = acquire_started.elapsed().as_millis() as u64;

    packages.sort_by(|a, b| {
        (a.summary.kind, &a.summary.id).cmp(&(b.summary.kind, &b.summary.id))
    });

    let splat_summary = if let Ops::Splat(splat_config) = &config.ops {
        progress.stage(State::Splatting);
        let splat_started = Instant::now();

        let extracted: Vec<ExtractedPackage> = packages
            .iter_mut()
            .filter_map(|outcome| outcome.extracted.take())
            .collect();

        let summary = with_sentinel(&splat_config.output, || {
            splat::splat(
                splat_config,
                config.request.arch,
                &resolution.sdk.version,
                extracted,
                cancel,
                &progress.splat_progress(),
            )
        })?;
        timings.splat_ms = splat_started.elapsed().as_millis() as u64;

        Some(summary)
    } else {
        None
    };

    timings.total_ms = started.elapsed().as_millis() as u64;

    Ok(RunSummary {
        arch: config.request.arch,
        variant: config.request.variant,
        packages: packages.into_iter().map(|outcome| outcome.summary).collect(),
        splat: splat_summary,
        timings,
    })
}

/// Runs the pipeline to the depth [`ExecConfig::ops`] asks for.
///
/// All parallel work happens on a dedicated pool sized by
/// [`Ctx::concurrency`], zero meaning one worker per core. The first fatal
/// error is returned with package identity attached, verified cache entries
/// survive a failed run and a failed splat leaves [`SENTINEL`] behind in
/// the output root.
pub fn execute(
    ctx: &Ctx,
    records: &[PackageRecord],
    config: &ExecConfig,
    cancel: &Cancel,
    progress: &dyn Progress,
) -> Result<RunSummary, Error> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.concurrency)
        .thread_name(|index| format!("winsplat-{index}"))
        .build()
        .map_err(|e| Error::Other(anyhow::Error::new(e)))?;

    let result = pool.install(|| run(ctx, records, config, cancel, progress));

    match &result {
        Ok(summary) => {
            tracing::info!(
                packages = summary.packages.len(),
                total_ms = summary.timings.total_ms,
                "run complete",
            );
            progress.stage(State::Done);
        }
        Err(err) => {
            tracing::error!(error = %err, "run failed");
            progress.stage(State::Failed);
        }
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancel_flag_is_shared() {
        let cancel = Cancel::new();
        let clone = cancel.clone();

        assert!(cancel.check().is_ok());
        clone.cancel();
        assert!(cancel.is_cancelled());
        assert!(matches!(cancel.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn settle_prefers_real_errors() {
        let results: Vec<Result<u32, Error>> = vec![
            Ok(1),
            Err(Error::Cancelled),
            Err(Error::FatalFetchError {
                payload: "pl.cab".to_owned(),
                status: 404,
            }),
        ];

        match settle(results) {
            Err(Error::FatalFetchError { status, .. }) => assert_eq!(status, 404),
            other => panic!("expected FatalFetchError, got ok={:?}", other.is_ok()),
        }
    }

    #[test]
    fn settle_reports_pure_cancellation() {
        let results: Vec<Result<u32, Error>> = vec![Ok(1), Err(Error::Cancelled)];

        assert!(matches!(settle(results), Err(Error::Cancelled)));
    }

    #[test]
    fn sentinel_marks_incomplete_splats() {
        let td = tempfile::tempdir().unwrap();
        let output = crate::PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        let marker = output.join(SENTINEL);

        let failed: Result<(), Error> = with_sentinel(&output, || {
            assert!(marker.exists());
            Err(Error::Cancelled)
        });
        assert!(failed.is_err());
        assert!(marker.exists(), "failed runs leave the sentinel");

        let ok: Result<(), Error> = with_sentinel(&output, || Ok(()));
        assert!(ok.is_ok());
        assert!(!marker.exists(), "successful runs clear it");
    }
}
