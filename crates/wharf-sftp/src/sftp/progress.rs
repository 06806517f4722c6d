// ── Progress coordinator ─────────────────────────────────────────────────────
//
// N concurrently-streaming files feed byte counters into one tracker,
// which emits at most one throttled, EMA-smoothed event per reporting
// interval. The displayed file name is sticky for a short window so it
// does not flicker while a dozen small files race each other.

use crate::sftp::types::{
    format_eta, format_speed, EventSink, ProgressEvent, ProgressSettings,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

struct FileUnit {
    name: String,
    total_bytes: u64,
    transferred_bytes: u64,
    completed: bool,
    last_active: Instant,
}

struct ProgressInner {
    files: HashMap<u64, FileUnit>,
    total_bytes: u64,
    transferred_bytes: u64,
    speed: f64,
    last_report: Option<Instant>,
    last_sample: Option<(Instant, u64)>,
    /// Displayed file and the moment it was chosen.
    display: Option<(u64, Instant)>,
    finalized: bool,
}

pub struct ProgressTracker {
    sink: Arc<dyn EventSink>,
    transfer_key: String,
    settings: ProgressSettings,
    inner: StdMutex<ProgressInner>,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn EventSink>, transfer_key: &str, settings: ProgressSettings) -> Self {
        Self {
            sink,
            transfer_key: transfer_key.to_string(),
            settings,
            inner: StdMutex::new(ProgressInner {
                files: HashMap::new(),
                total_bytes: 0,
                transferred_bytes: 0,
                speed: 0.0,
                last_report: None,
                last_sample: None,
                display: None,
                finalized: false,
            }),
        }
    }

    pub fn register_file(&self, id: u64, name: &str, total_bytes: u64) {
        let mut inner = self.inner.lock().expect("progress lock");
        inner.total_bytes += total_bytes;
        inner.files.insert(
            id,
            FileUnit {
                name: name.to_string(),
                total_bytes,
                transferred_bytes: 0,
                completed: false,
                last_active: Instant::now(),
            },
        );
    }

    /// Byte counter callback from a streaming loop. `transferred` is the
    /// file's cumulative count; decreases are ignored so the aggregate
    /// stays monotonic.
    pub fn update_file(&self, id: u64, transferred: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("progress lock");
        let Some(unit) = inner.files.get_mut(&id) else {
            return;
        };
        if transferred <= unit.transferred_bytes {
            return;
        }
        let delta = transferred - unit.transferred_bytes;
        unit.transferred_bytes = transferred;
        unit.last_active = now;
        inner.transferred_bytes += delta;
        self.maybe_emit(&mut inner, now, false);
    }

    /// Credit any shortfall between the counter and the declared size so
    /// the aggregate reaches exactly the declared total on completion.
    pub fn complete_file(&self, id: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("progress lock");
        let Some(unit) = inner.files.get_mut(&id) else {
            return;
        };
        if unit.completed {
            return;
        }
        let shortfall = unit.total_bytes.saturating_sub(unit.transferred_bytes);
        unit.transferred_bytes = unit.total_bytes;
        unit.completed = true;
        inner.transferred_bytes += shortfall;
        // A completed file releases the display lock immediately.
        if matches!(inner.display, Some((display_id, _)) if display_id == id) {
            inner.display = None;
        }
        self.maybe_emit(&mut inner, now, false);
    }

    /// Force the aggregate to the declared total and emit one final
    /// 100 % event, regardless of throttling or rounding.
    pub fn finalize(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("progress lock");
        if inner.finalized {
            return;
        }
        inner.finalized = true;
        inner.transferred_bytes = inner.total_bytes;
        for unit in inner.files.values_mut() {
            unit.transferred_bytes = unit.total_bytes;
            unit.completed = true;
        }
        self.maybe_emit(&mut inner, now, true);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        let inner = self.inner.lock().expect("progress lock");
        (inner.transferred_bytes, inner.total_bytes)
    }

    fn maybe_emit(&self, inner: &mut ProgressInner, now: Instant, force: bool) {
        if !force {
            if inner.finalized {
                return;
            }
            if let Some(last) = inner.last_report {
                if now.duration_since(last) < self.settings.report_interval {
                    return;
                }
            }
        }

        // Throughput: EMA over instantaneous samples, recomputed at most
        // once per report.
        if let Some((sample_at, sample_bytes)) = inner.last_sample {
            let elapsed = now.duration_since(sample_at).as_secs_f64();
            if elapsed > 0.0 {
                let instant = (inner.transferred_bytes.saturating_sub(sample_bytes)) as f64
                    / elapsed;
                inner.speed = if inner.last_report.is_none() {
                    instant
                } else {
                    self.settings.smoothing * instant
                        + (1.0 - self.settings.smoothing) * inner.speed
                };
            }
        }
        inner.last_sample = Some((now, inner.transferred_bytes));
        inner.last_report = Some(now);

        let progress = if inner.total_bytes > 0 {
            ((inner.transferred_bytes as f64 / inner.total_bytes as f64) * 100.0).min(100.0)
        } else if inner.finalized {
            100.0
        } else {
            0.0
        };
        let progress = (progress * 100.0).round() / 100.0;

        let remaining_bytes = inner.total_bytes.saturating_sub(inner.transferred_bytes);
        let remaining_time = if inner.speed > 0.0 {
            remaining_bytes as f64 / inner.speed
        } else {
            0.0
        };

        let file_name = self.pick_display(inner, now);
        let speed = inner.speed;

        self.sink.emit_progress(ProgressEvent {
            transfer_key: self.transfer_key.clone(),
            progress,
            file_name,
            transferred_bytes: inner.transferred_bytes,
            total_bytes: inner.total_bytes,
            transfer_speed: speed,
            transfer_speed_text: format_speed(speed),
            remaining_time,
            remaining_time_text: format_eta(remaining_time),
        });
    }

    /// Most recently active non-completed unit, locked for a short
    /// window once chosen.
    fn pick_display(&self, inner: &mut ProgressInner, now: Instant) -> String {
        if let Some((id, chosen_at)) = inner.display {
            if now.duration_since(chosen_at) < self.settings.display_lock {
                if let Some(unit) = inner.files.get(&id) {
                    if !unit.completed {
                        return unit.name.clone();
                    }
                }
            }
        }

        let pick = inner
            .files
            .iter()
            .filter(|(_, u)| !u.completed)
            .max_by_key(|(_, u)| u.last_active)
            .map(|(id, u)| (*id, u.name.clone()));

        match pick {
            Some((id, name)) => {
                inner.display = Some((id, now));
                name
            }
            None => {
                inner.display = None;
                inner
                    .files
                    .values()
                    .next()
                    .map(|u| u.name.clone())
                    .unwrap_or_default()
            }
        }
    }
}
