use crate::app::config::ProfilerConfig;
use crate::core::correlation::labels::{LABEL_SPAN_ID, LABEL_TRACE_ID};
use crate::core::profiling::timeline;
use anyhow::{Context, Error, anyhow};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use pprof::{Frames, ProfilerGuard, ProfilerGuardBuilder, Report, flamegraph};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared handle to the running profiler, emptied on shutdown
pub type ProfilerSlot = Arc<ArcSwapOption<Profiler>>;

/// Restricts a report to samples taken while a given trace and/or span
/// was bound. An empty filter keeps everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelFilter {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl LabelFilter {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none() && self.span_id.is_none()
    }

    /// Checks the labels that [`attribute_labels`] appended to a sample
    /// thread name, e.g. `worker {span_id=..,trace_id=..,operation_name=..}`
    pub fn matches(&self, thread_name: &str) -> bool {
        if self.is_empty() {
            return true;
        }

        let Some(rendered) = rendered_labels(thread_name) else {
            return false;
        };

        let wanted = |key: &str, expected: &Option<String>| {
            expected.as_deref().is_none_or(|expected| {
                label_value(rendered, key).is_some_and(|v| v.eq_ignore_ascii_case(expected))
            })
        };

        wanted(LABEL_TRACE_ID, &self.trace_id) && wanted(LABEL_SPAN_ID, &self.span_id)
    }
}

fn rendered_labels(thread_name: &str) -> Option<&str> {
    let start = thread_name.rfind(" {")?;
    thread_name[start + 2..].strip_suffix('}')
}

fn label_value<'a>(rendered: &'a str, key: &str) -> Option<&'a str> {
    rendered
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Rewrites the sample thread name to carry the labels that were bound
/// on that thread when the bucket's first sample was taken, so reports
/// and flamegraphs split per span
fn attribute_labels(frames: &mut Frames) {
    if let Some(labels) = timeline::labels_at(frames.thread_id, frames.sample_timestamp) {
        frames.thread_name = format!("{} {{{}}}", frames.thread_name, labels);
    }
}

/// Static tags stamped on every profile this process writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileTags {
    pub service: String,
    pub env: String,
    pub version: String,
    pub host: String,
    pub process_id: u32,
    pub runtime_id: String,
}

impl ProfileTags {
    pub fn new(
        service: impl Into<String>,
        env: impl Into<String>,
        runtime_id: impl Into<String>,
    ) -> Self {
        ProfileTags {
            service: service.into(),
            env: env.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: hostname(),
            process_id: std::process::id(),
            runtime_id: runtime_id.into(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, String)> {
        [
            ("service", self.service.clone()),
            ("env", self.env.clone()),
            ("version", self.version.clone()),
            ("host", self.host.clone()),
            ("process_id", self.process_id.to_string()),
            ("runtime_id", self.runtime_id.clone()),
        ]
        .into_iter()
    }
}

impl fmt::Display for ProfileTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }

        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Attributed samples of consecutive slices, keyed with a common sample
/// timestamp so identical stacks under identical labels merge
struct Window {
    opened: Instant,
    report: Report,
}

impl Window {
    fn new(mut slice: Report) -> Self {
        let started = slice.timing.start_time;
        slice.data = normalize(slice.data, started);

        Window {
            opened: Instant::now(),
            report: slice,
        }
    }

    fn absorb(&mut self, slice: Report) {
        self.report.timing.duration += slice.timing.duration;

        let started = self.report.timing.start_time;
        for (mut frames, count) in slice.data {
            frames.sample_timestamp = started;
            *self.report.data.entry(frames).or_insert(0) += count;
        }
    }
}

fn normalize(data: HashMap<Frames, isize>, at: SystemTime) -> HashMap<Frames, isize> {
    let mut merged = HashMap::with_capacity(data.len());
    for (mut frames, count) in data {
        frames.sample_timestamp = at;
        *merged.entry(frames).or_insert(0) += count;
    }
    merged
}

/// Windows kept for reports when nobody rotates them out
const MAX_WINDOWS: usize = 2;

/// The pprof sampling profiler plus the label timeline it reports against.
///
/// pprof keeps one timestamp per (stack, thread) bucket, so labels are
/// only exact at the granularity the sampler is cut at. A slicer thread
/// restarts the sampler every `slice_interval` and attributes what it
/// collected right away, merging the result into a small ring of
/// windows that reports are built from
pub struct Profiler {
    tags: ProfileTags,
    window_length: Duration,
    builder: ProfilerGuardBuilder,
    guard: Mutex<Option<ProfilerGuard<'static>>>,
    windows: Mutex<VecDeque<Window>>,
}

impl Profiler {
    pub fn start(config: &ProfilerConfig, tags: ProfileTags) -> Result<Arc<Profiler>, Error> {
        let builder = ProfilerGuardBuilder::default()
            .frequency(config.frequency)
            .blocklist(&config.blocklist);
        let guard = builder
            .clone()
            .build()
            .context("failed to start pprof sampler")?;

        let profiler = Arc::new(Profiler {
            tags,
            window_length: config.report_interval,
            builder,
            guard: Mutex::new(Some(guard)),
            windows: Mutex::new(VecDeque::with_capacity(MAX_WINDOWS + 1)),
        });

        spawn_slicer(Arc::downgrade(&profiler), config.slice_interval)?;
        timeline::enable();

        info!(
            frequency = config.frequency,
            slice = ?config.slice_interval,
            tags = %profiler.tags,
            "pprof sampler started"
        );

        Ok(profiler)
    }

    pub fn is_running(&self) -> bool {
        self.guard.lock().is_some()
    }

    pub fn tags(&self) -> &ProfileTags {
        &self.tags
    }

    /// Attribute everything sampled since the last cut and restart the
    /// sampler so the next slice starts with fresh buckets
    pub fn cut_slice(&self) -> Result<(), Error> {
        let slice = {
            let mut slot = self.guard.lock();
            let Some(current) = slot.take() else {
                return Ok(());
            };

            let slice = build_slice(&current);

            // only one sampler may exist at a time
            drop(current);
            *slot = Some(
                self.builder
                    .clone()
                    .build()
                    .context("failed to restart pprof sampler")?,
            );

            slice?
        };

        self.absorb(slice);

        Ok(())
    }

    fn absorb(&self, slice: Report) {
        let mut windows = self.windows.lock();

        let roll = windows
            .back()
            .is_none_or(|w| w.opened.elapsed() >= self.window_length);

        if roll {
            windows.push_back(Window::new(slice));
            if windows.len() > MAX_WINDOWS {
                windows.pop_front();
                debug!("Dropped oldest unreported profile window");
            }
        } else if let Some(window) = windows.back_mut() {
            window.absorb(slice);
        }
    }

    /// Everything retained since start or the last ['rotate'], filtered
    pub fn report(&self, filter: &LabelFilter) -> Result<Report, Error> {
        if !self.is_running() {
            return Err(anyhow!("profiler is not running"));
        }

        self.cut_slice()?;

        let windows = self.windows.lock();
        merge_windows(windows.iter(), filter)
            .ok_or_else(|| anyhow!("no profile window recorded"))
    }

    /// Report everything retained and start over
    pub fn rotate(&self) -> Result<Report, Error> {
        if !self.is_running() {
            return Err(anyhow!("profiler is not running"));
        }

        self.cut_slice()?;

        let drained: Vec<Window> = self.windows.lock().drain(..).collect();
        merge_windows(drained.iter(), &LabelFilter::default())
            .ok_or_else(|| anyhow!("no profile window recorded"))
    }

    /// Stop sampling, returning everything not yet rotated out
    pub fn stop(&self) -> Option<Result<Report, Error>> {
        let guard = self.guard.lock().take()?;
        let slice = build_slice(&guard);

        drop(guard);
        timeline::disable();
        info!("pprof sampler stopped");

        match slice {
            Ok(slice) => self.absorb(slice),
            Err(e) => return Some(Err(e)),
        }

        let drained: Vec<Window> = self.windows.lock().drain(..).collect();
        merge_windows(drained.iter(), &LabelFilter::default()).map(Ok)
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if self.guard.get_mut().take().is_some() {
            timeline::disable();
        }
    }
}

fn spawn_slicer(profiler: Weak<Profiler>, every: Duration) -> Result<(), Error> {
    std::thread::Builder::new()
        .name("profile-slicer".to_string())
        .spawn(move || {
            loop {
                std::thread::sleep(every);

                let Some(profiler) = profiler.upgrade() else {
                    break;
                };
                if !profiler.is_running() {
                    break;
                }

                if let Err(e) = profiler.cut_slice() {
                    warn!("Failed cutting profile slice: {:#}", e);
                }
            }

            debug!("Profile slicer stopped");
        })
        .context("failed to spawn profile slicer")?;

    Ok(())
}

fn build_slice(guard: &ProfilerGuard<'static>) -> Result<Report, Error> {
    guard
        .report()
        .frames_post_processor(attribute_labels)
        .build()
        .context("failed to build pprof report")
}

/// Merge windows oldest first into one report, keeping only samples the
/// filter accepts. None without any window
fn merge_windows<'a>(
    windows: impl Iterator<Item = &'a Window>,
    filter: &LabelFilter,
) -> Option<Report> {
    let mut windows = windows.peekable();
    let first = windows.peek()?;

    let mut merged = Report {
        data: HashMap::new(),
        timing: first.report.timing.clone(),
    };
    merged.timing.duration = Duration::ZERO;

    for window in windows {
        merged.timing.duration += window.report.timing.duration;

        for (frames, count) in &window.report.data {
            if !filter.matches(&frames.thread_name) {
                continue;
            }

            let mut key = frames.clone();
            key.sample_timestamp = merged.timing.start_time;
            *merged.data.entry(key).or_insert(0) += count;
        }
    }

    Some(merged)
}

/// Render a report as flamegraph svg, stamped with the profile tags.
/// Fails on reports without samples
pub fn write_flamegraph<W: Write>(
    report: &Report,
    tags: &ProfileTags,
    writer: W,
) -> Result<(), Error> {
    if report.data.is_empty() {
        return Err(anyhow!("no samples recorded"));
    }

    let mut options = flamegraph::Options::default();
    options.title = format!("{} cpu", tags.service);
    options.subtitle = Some(tags.to_string());
    options.notes = tags.to_string();

    report
        .flamegraph_with_options(writer, &mut options)
        .context("failed to render flamegraph")
}

/// Write a non empty report to `output_dir` as a timestamped svg
pub fn write_report_file(
    report: &Report,
    tags: &ProfileTags,
    output_dir: &Path,
    label: &str,
) -> Result<Option<PathBuf>, Error> {
    if report.data.is_empty() {
        return Ok(None);
    }

    let path = output_dir.join(format!(
        "{}-{}-{}.svg",
        label,
        tags.process_id,
        chrono::Utc::now().format("%Y%m%dT%H%M%S")
    ));
    let file = std::fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    write_flamegraph(report, tags, file)?;

    Ok(Some(path))
}

fn write_window(profiler: &Profiler, output_dir: &Path) -> Result<Option<PathBuf>, Error> {
    let report = profiler.rotate()?;

    write_report_file(&report, profiler.tags(), output_dir, "profile")
}

/// Periodically rotates the sampling window and writes it out as a
/// flamegraph, until the slot is emptied
pub fn spawn_reporter(slot: ProfilerSlot, interval: Duration, output_dir: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let Some(profiler) = slot.load_full() else {
                debug!("Profiler gone, stopping profile reporter");
                break;
            };

            let dir = output_dir.clone();
            let written =
                tokio::task::spawn_blocking(move || write_window(&profiler, &dir)).await;

            match written {
                Ok(Ok(Some(path))) => info!(path = %path.display(), "Wrote profile window"),
                Ok(Ok(None)) => debug!("Profile window had no samples"),
                Ok(Err(e)) => warn!("Failed writing profile window: {:#}", e),
                Err(e) => warn!("Profile reporter task failed: {}", e),
            }
        }
    })
}
