// SerialCollect - app/session.rs
//
// Recording session: the Idle <-> Recording state machine, the recorded
// sample sequence with its running statistics, and the auto-stop timer.
//
// Architecture:
//   - `RecordingSession` is owned by the collector and only mutated on the
//     collector thread, so it needs no locking.
//   - The auto-stop timer is a short-lived background thread that sleeps in
//     `CANCEL_CHECK_INTERVAL_MS` slices and, if not cancelled, sends
//     `CollectorEvent::AutoStop { generation }` into the collector channel.
//   - Every start bumps the generation. An expiry whose generation is not
//     the current one is stale (the session was stopped or restarted since)
//     and is ignored, so a timer can never stop a later recording or fire
//     twice.

use crate::core::model::{
    now_millis, CollectionStats, CollectorEvent, ParsedData, RecordedSample, RecordingConfig,
};
use crate::util::constants::CANCEL_CHECK_INTERVAL_MS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

// =============================================================================
// Auto-stop timer
// =============================================================================

/// A one-shot, cancelable timer thread. Dropping it cancels it.
#[derive(Debug)]
struct AutoStopTimer {
    cancel: Arc<AtomicBool>,
}

impl AutoStopTimer {
    fn start(delay: Duration, generation: u64, tx: mpsc::Sender<CollectorEvent>) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        std::thread::spawn(move || {
            let deadline = Instant::now() + delay;
            let slice = Duration::from_millis(CANCEL_CHECK_INTERVAL_MS);
            loop {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep(slice.min(deadline - now));
            }
            if !flag.load(Ordering::SeqCst) {
                // The collector may already be gone; nothing to do then.
                let _ = tx.send(CollectorEvent::AutoStop { generation });
            }
        });

        Self { cancel }
    }

    fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl Drop for AutoStopTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// RecordingSession
// =============================================================================

/// Recording state, samples and statistics.
#[derive(Debug)]
pub struct RecordingSession {
    settings: RecordingConfig,
    recording: bool,
    current_class: Option<String>,
    samples: Vec<RecordedSample>,
    stats: CollectionStats,
    /// Incremented on every start; identifies the live timer.
    generation: u64,
    timer: Option<AutoStopTimer>,
    events: mpsc::Sender<CollectorEvent>,
}

impl RecordingSession {
    /// `events` is where auto-stop expiries are delivered.
    pub fn new(settings: RecordingConfig, events: mpsc::Sender<CollectorEvent>) -> Self {
        Self {
            settings,
            recording: false,
            current_class: None,
            samples: Vec::new(),
            stats: CollectionStats::default(),
            generation: 0,
            timer: None,
            events,
        }
    }

    /// Apply new recording settings. A pending auto-stop is cancelled; the
    /// new duration applies from the next start.
    pub fn configure(&mut self, settings: RecordingConfig) {
        if self.timer.take().is_some() {
            tracing::info!("Recording settings changed; pending auto-stop cancelled");
        }
        self.settings = settings;
    }

    pub fn settings(&self) -> RecordingConfig {
        self.settings
    }

    /// Start (or restart) recording.
    ///
    /// With labeling enabled a class is required; without one the call is
    /// rejected with a warning and nothing changes. Returns whether
    /// recording started.
    pub fn start_recording(&mut self, class_id: Option<&str>) -> bool {
        let class_id = class_id.map(str::trim).filter(|c| !c.is_empty());
        if self.settings.enable_labeling && class_id.is_none() {
            tracing::warn!("Cannot start recording: labeling is enabled but no class was selected");
            return false;
        }

        self.timer = None;
        self.generation += 1;
        self.recording = true;
        self.current_class = class_id.map(str::to_string);
        if self.stats.start_time.is_none() {
            self.stats.start_time = Some(now_millis());
        }

        if self.settings.auto_stop_seconds > 0 {
            self.timer = Some(AutoStopTimer::start(
                Duration::from_secs(self.settings.auto_stop_seconds),
                self.generation,
                self.events.clone(),
            ));
        }

        tracing::info!(
            class = self.current_class.as_deref().unwrap_or("-"),
            auto_stop_seconds = self.settings.auto_stop_seconds,
            "Recording started"
        );
        true
    }

    /// Stop recording and cancel any pending auto-stop. Idempotent.
    pub fn stop_recording(&mut self) {
        self.timer = None;
        if !self.recording {
            tracing::debug!("Stop requested while not recording");
            return;
        }
        self.recording = false;
        self.current_class = None;
        tracing::info!(total_samples = self.stats.total_samples, "Recording stopped");
    }

    /// Handle an auto-stop expiry. Returns true if it stopped the recording;
    /// stale expiries (from an earlier start) are ignored.
    pub fn handle_auto_stop(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.recording || self.timer.is_none() {
            tracing::debug!(generation, current = self.generation, "Ignoring stale auto-stop");
            return false;
        }
        tracing::info!(
            seconds = self.settings.auto_stop_seconds,
            "Auto-stop timer expired"
        );
        self.stop_recording();
        true
    }

    /// Store a sample if recording. The rule label takes precedence over the
    /// active class. Returns the stored sample.
    pub fn record(&mut self, data: ParsedData, rule_label: Option<String>) -> Option<&RecordedSample> {
        if !self.recording {
            return None;
        }
        let sample = RecordedSample {
            data,
            recorded_at: now_millis(),
            label: rule_label.or_else(|| self.current_class.clone()),
        };

        self.stats.total_samples += 1;
        *self
            .stats
            .class_counts
            .entry(sample.count_label().to_string())
            .or_insert(0) += 1;
        self.stats.last_sample_time = Some(sample.recorded_at);

        self.samples.push(sample);
        self.samples.last()
    }

    /// Drop every sample and reset all statistics, timestamps included.
    pub fn clear(&mut self) {
        let dropped = self.samples.len();
        self.samples.clear();
        self.stats = CollectionStats::default();
        tracing::info!(dropped, "Recorded samples cleared");
    }

    /// Stop and release the timer. The session stays usable.
    pub fn dispose(&mut self) {
        self.stop_recording();
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn current_class(&self) -> Option<&str> {
        self.current_class.as_deref()
    }

    pub fn samples(&self) -> &[RecordedSample] {
        &self.samples
    }

    pub fn stats(&self) -> &CollectionStats {
        &self.stats
    }

    /// True while an auto-stop timer is armed.
    pub fn auto_stop_pending(&self) -> bool {
        self.timer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{FieldMap, FieldValue};

    fn settings(labeling: bool, auto_stop: u64) -> RecordingConfig {
        RecordingConfig {
            auto_stop_seconds: auto_stop,
            enable_labeling: labeling,
        }
    }

    fn data(v: i64) -> ParsedData {
        let mut fields = FieldMap::new();
        fields.insert("v".to_string(), FieldValue::Int(v));
        ParsedData {
            timestamp: now_millis(),
            raw: v.to_string(),
            fields,
        }
    }

    fn session(labeling: bool, auto_stop: u64) -> (RecordingSession, mpsc::Receiver<CollectorEvent>) {
        let (tx, rx) = mpsc::channel();
        (RecordingSession::new(settings(labeling, auto_stop), tx), rx)
    }

    #[test]
    fn test_labeling_requires_a_class() {
        let (mut s, _rx) = session(true, 0);
        assert!(!s.start_recording(None));
        assert!(!s.start_recording(Some("  ")));
        assert!(!s.is_recording());
        assert!(s.stats().start_time.is_none());
    }

    #[test]
    fn test_labeled_sample_counts() {
        let (mut s, _rx) = session(true, 0);
        assert!(s.start_recording(Some("classA")));
        let stored = s.record(data(1), None).unwrap();
        assert_eq!(stored.label.as_deref(), Some("classA"));

        assert_eq!(s.samples().len(), 1);
        assert_eq!(s.stats().total_samples, 1);
        assert_eq!(s.stats().class_counts.len(), 1);
        assert_eq!(s.stats().class_counts["classA"], 1);
        assert!(s.stats().last_sample_time.is_some());
    }

    #[test]
    fn test_rule_label_wins_and_unlabeled_bucket() {
        let (mut s, _rx) = session(false, 0);
        assert!(s.start_recording(None));
        s.record(data(1), None);
        s.record(data(2), Some("hot".to_string()));
        assert_eq!(s.stats().class_counts["unlabeled"], 1);
        assert_eq!(s.stats().class_counts["hot"], 1);
        let sum: usize = s.stats().class_counts.values().sum();
        assert_eq!(sum, s.stats().total_samples);
        assert_eq!(s.samples().len(), s.stats().total_samples);
    }

    #[test]
    fn test_not_recording_stores_nothing() {
        let (mut s, _rx) = session(false, 0);
        assert!(s.record(data(1), None).is_none());
        assert_eq!(s.stats().total_samples, 0);
    }

    #[test]
    fn test_start_time_is_set_once() {
        let (mut s, _rx) = session(false, 0);
        s.start_recording(None);
        let first = s.stats().start_time;
        s.stop_recording();
        std::thread::sleep(Duration::from_millis(5));
        s.start_recording(None);
        assert_eq!(s.stats().start_time, first);
    }

    #[test]
    fn test_stop_is_idempotent_and_clears_class() {
        let (mut s, _rx) = session(true, 0);
        s.start_recording(Some("c1"));
        s.stop_recording();
        s.stop_recording();
        assert!(!s.is_recording());
        assert!(s.current_class().is_none());
    }

    #[test]
    fn test_clear_twice() {
        let (mut s, _rx) = session(false, 0);
        s.start_recording(None);
        s.record(data(1), None);
        s.record(data(2), None);
        s.clear();
        assert_eq!(s.stats().total_samples, 0);
        assert!(s.samples().is_empty());
        s.clear();
        assert_eq!(s.stats(), &CollectionStats::default());
        assert!(s.samples().is_empty());
    }

    #[test]
    fn test_auto_stop_fires_once() {
        let (mut s, rx) = session(true, 1);
        assert!(s.start_recording(Some("classA")));
        assert!(s.auto_stop_pending());

        let event = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("auto-stop should fire");
        let CollectorEvent::AutoStop { generation } = event else {
            panic!("unexpected event {event:?}");
        };
        assert!(s.handle_auto_stop(generation));
        assert!(!s.is_recording());

        // Delivered again (or duplicated), it is a no-op.
        assert!(!s.handle_auto_stop(generation));
        // And the timer is not re-armed.
        assert!(rx.recv_timeout(Duration::from_millis(1500)).is_err());
    }

    #[test]
    fn test_manual_stop_cancels_timer() {
        let (mut s, rx) = session(false, 1);
        s.start_recording(None);
        s.stop_recording();
        assert!(!s.auto_stop_pending());
        assert!(rx.recv_timeout(Duration::from_millis(1500)).is_err());
    }

    #[test]
    fn test_stale_expiry_does_not_stop_a_restart() {
        let (mut s, _rx) = session(false, 0);
        s.settings.auto_stop_seconds = 60;
        s.start_recording(None);
        let old_generation = s.generation;
        s.start_recording(None);
        assert!(!s.handle_auto_stop(old_generation));
        assert!(s.is_recording());
        s.dispose();
        assert!(!s.is_recording());
    }

    #[test]
    fn test_configure_cancels_pending_timer() {
        let (mut s, _rx) = session(false, 60);
        s.start_recording(None);
        assert!(s.auto_stop_pending());
        s.configure(settings(false, 5));
        assert!(!s.auto_stop_pending());
        assert!(s.is_recording());
        let generation = s.generation;
        assert!(!s.handle_auto_stop(generation));
    }
}
