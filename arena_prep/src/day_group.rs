// THEORY:
// A day group is the set of recordings of one experiment across days:
// `exp.day1.mp4`, `exp.day2.mp4`, ..., `exp.day10.mp4`. Their names share a
// prefix and a suffix and differ only in the day number. Siblings are found by
// parsing names, never by content, and ordered by the numeric day so day 10
// sorts after day 2.
//
// Propagation replays a calibrated source video's settings onto its siblings.
// Each target goes through the same fixed sequence of steps:
//
//   Timing -> Background -> ArenaRegions -> Finalize
//
// The background step recomputes the target's background from the target's own
// footage with the shared window and parameters. Pixels are never copied from
// the source. Arena and regions are copied verbatim.
//
// Targets are isolated from each other: a target whose step fails is recorded as
// failed at that step and the batch moves on. Each step can be retried in place
// (`step_attempts`) and re-run on its own (`run_step`). Targets run one after
// another by default, or concurrently in `parallel` mode; the steps within one
// target are always sequential.

use crate::core_modules::background::{BackgroundParams, TimingWindow};
use crate::core_modules::geometry::ArenaBox;
use crate::core_modules::regions::RegionStore;
use crate::core_modules::sidecar::VideoState;
use crate::core_modules::state_store::PerVideoStateStore;
use crate::error::{PrepError, Result};
use crate::pipeline::PrepPipeline;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn day_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^(.+)\.day(\d+)(.*)$").ok())
        .as_ref()
}

/// The parts of a `<prefix>.day<N><suffix>` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayName {
    pub prefix: String,
    pub day: u32,
    pub suffix: String,
}

impl DayName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let captures = day_pattern()?.captures(file_name)?;
        Some(Self {
            prefix: captures[1].to_string(),
            day: captures[2].parse().ok()?,
            suffix: captures[3].to_string(),
        })
    }

    fn of(video: &Path) -> Result<Self> {
        video
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::parse)
            .ok_or_else(|| PrepError::GroupPatternMismatch(video.display().to_string()))
    }

    fn is_sibling_of(&self, other: &DayName) -> bool {
        self.prefix == other.prefix && self.suffix == other.suffix
    }
}

/// Picks the siblings of `video` out of `candidates`, ordered by day.
pub fn group_members<I, P>(video: &Path, candidates: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let own = DayName::of(video)?;
    let mut members: Vec<(u32, PathBuf)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let candidate = candidate.as_ref();
            let name = DayName::of(candidate).ok()?;
            name.is_sibling_of(&own).then(|| (name.day, candidate.to_path_buf()))
        })
        .collect();
    if !members.iter().any(|(_, path)| path == video) {
        members.push((own.day, video.to_path_buf()));
    }
    members.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(members.into_iter().map(|(_, path)| path).collect())
}

/// The day group of `video`, read from its directory.
pub fn find_group(video: &Path) -> Result<Vec<PathBuf>> {
    DayName::of(video)?;
    let dir = match video.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            candidates.push(video.with_file_name(entry.file_name()));
        }
    }
    group_members(video, candidates)
}

/// One member of a day group and what has already been computed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub video: PathBuf,
    pub day: u32,
    pub has_state: bool,
    pub has_export: bool,
    pub has_background: bool,
}

pub fn list_group(video: &Path, store: &PerVideoStateStore) -> Result<Vec<GroupMember>> {
    find_group(video)?
        .into_iter()
        .map(|member| {
            let day = DayName::of(&member)?.day;
            let (has_state, has_export, has_background) = store.presence(&member);
            Ok(GroupMember {
                video: member,
                day,
                has_state,
                has_export,
                has_background,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropagationStep {
    Timing,
    Background,
    ArenaRegions,
    Finalize,
}

impl PropagationStep {
    pub const SEQUENCE: [PropagationStep; 4] = [
        PropagationStep::Timing,
        PropagationStep::Background,
        PropagationStep::ArenaRegions,
        PropagationStep::Finalize,
    ];
}

impl fmt::Display for PropagationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropagationStep::Timing => "timing",
            PropagationStep::Background => "background",
            PropagationStep::ArenaRegions => "arena/regions",
            PropagationStep::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// What gets replayed onto each target.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationSettings {
    pub arena: ArenaBox,
    pub regions: RegionStore,
    pub timing: TimingWindow,
    pub bg_params: BackgroundParams,
}

impl PropagationSettings {
    /// Settings taken from a calibrated source video.
    pub fn from_state(state: &VideoState) -> Result<Self> {
        let arena = state
            .arena
            .clone()
            .filter(ArenaBox::is_valid)
            .ok_or_else(|| PrepError::InvalidParameter("source video has no valid arena".into()))?;
        let timing = state
            .timing
            .ok_or_else(|| PrepError::InvalidParameter("source video has no timing window".into()))?;
        Ok(Self {
            arena,
            regions: state.regions.clone(),
            timing,
            bg_params: state.bg_params,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Run targets concurrently instead of one after another.
    pub parallel: bool,
    /// Attempts per step before the target is reported failed.
    pub step_attempts: u32,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            step_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started { target: PathBuf },
    StepDone { target: PathBuf, step: PropagationStep, ok: bool },
    Finished { target: PathBuf, ok: bool },
}

#[derive(Debug)]
pub enum TargetOutcome {
    Completed,
    Failed { step: PropagationStep, error: PrepError },
}

#[derive(Debug)]
pub struct TargetReport {
    pub target: PathBuf,
    pub outcome: TargetOutcome,
}

impl TargetReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TargetOutcome::Completed)
    }
}

#[derive(Debug, Default)]
pub struct PropagationReport {
    pub targets: Vec<TargetReport>,
}

impl PropagationReport {
    pub fn completed(&self) -> impl Iterator<Item = &Path> {
        self.targets.iter().filter(|t| t.is_completed()).map(|t| t.target.as_path())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| !t.is_completed())
    }

    pub fn all_completed(&self) -> bool {
        self.targets.iter().all(TargetReport::is_completed)
    }
}

/// Replays a source video's settings onto its day-group siblings.
pub struct DayGroupPropagator {
    pipeline: Arc<PrepPipeline>,
    config: PropagationConfig,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl DayGroupPropagator {
    pub fn new(pipeline: Arc<PrepPipeline>) -> Self {
        let config = pipeline.config().propagation.clone();
        Self {
            pipeline,
            config,
            progress: None,
        }
    }

    pub fn with_config(mut self, config: PropagationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }

    /// Runs one step against one target.
    pub async fn run_step(
        &self,
        target: &Path,
        step: PropagationStep,
        settings: &PropagationSettings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PrepError::Cancelled);
        }
        match step {
            PropagationStep::Timing => {
                self.pipeline.set_timing(target, settings.timing).await?;
            }
            PropagationStep::Background => {
                self.pipeline
                    .estimate_background(target, Some(settings.timing), Some(settings.bg_params), cancel)
                    .await?;
            }
            PropagationStep::ArenaRegions => {
                self.pipeline
                    .apply_layout(target, settings.arena.clone(), settings.regions.clone())
                    .await?;
            }
            PropagationStep::Finalize => {
                self.pipeline.finalize(target).await?;
            }
        }
        Ok(())
    }

    async fn run_step_with_retries(
        &self,
        target: &Path,
        step: PropagationStep,
        settings: &PropagationSettings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let attempts = self.config.step_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run_step(target, step, settings, cancel).await {
                Ok(()) => return Ok(()),
                Err(PrepError::Cancelled) => return Err(PrepError::Cancelled),
                Err(e) if attempt < attempts => {
                    tracing::warn!(video = %target.display(), %step, attempt, error = %e, "Propagation step failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn propagate_target(
        &self,
        target: &Path,
        settings: &PropagationSettings,
        cancel: &CancellationToken,
    ) -> TargetReport {
        self.report(ProgressEvent::Started {
            target: target.to_path_buf(),
        });
        for step in PropagationStep::SEQUENCE {
            let result = self.run_step_with_retries(target, step, settings, cancel).await;
            self.report(ProgressEvent::StepDone {
                target: target.to_path_buf(),
                step,
                ok: result.is_ok(),
            });
            if let Err(error) = result {
                tracing::warn!(video = %target.display(), %step, error = %error, "Propagation failed for target");
                self.report(ProgressEvent::Finished {
                    target: target.to_path_buf(),
                    ok: false,
                });
                return TargetReport {
                    target: target.to_path_buf(),
                    outcome: TargetOutcome::Failed { step, error },
                };
            }
            tracing::info!(video = %target.display(), %step, "Propagation step done");
        }
        self.report(ProgressEvent::Finished {
            target: target.to_path_buf(),
            ok: true,
        });
        TargetReport {
            target: target.to_path_buf(),
            outcome: TargetOutcome::Completed,
        }
    }

    /// Replays `settings` onto every target except `source`. Failures are
    /// collected per target; the batch always runs to the end.
    pub async fn propagate(
        &self,
        source: &Path,
        targets: &[PathBuf],
        settings: &PropagationSettings,
        cancel: &CancellationToken,
    ) -> Result<PropagationReport> {
        settings.arena.validate()?;
        settings.timing.validate()?;
        settings.bg_params.validate()?;

        let targets: Vec<&PathBuf> = targets.iter().filter(|t| t.as_path() != source).collect();
        tracing::info!(
            source = %source.display(),
            targets = targets.len(),
            parallel = self.config.parallel,
            "Propagating settings across day group"
        );

        let reports = if self.config.parallel {
            futures::future::join_all(
                targets
                    .iter()
                    .map(|target| self.propagate_target(target, settings, cancel)),
            )
            .await
        } else {
            let mut reports = Vec::with_capacity(targets.len());
            for target in targets {
                reports.push(self.propagate_target(target, settings, cancel).await);
            }
            reports
        };

        let report = PropagationReport { targets: reports };
        tracing::info!(
            completed = report.completed().count(),
            failed = report.failed().count(),
            "Propagation finished"
        );
        Ok(report)
    }
}
