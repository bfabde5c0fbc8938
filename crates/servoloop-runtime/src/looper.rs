//! [`Looper`] – fixed-period scheduler running [`Loop`] participants on a
//! dedicated thread.
//!
//! Each tick measures the real elapsed time since the previous tick and hands
//! it to every participant as `dt`, so jitter and overruns are visible to the
//! control code.  Ticks are best-effort fixed rate: when a tick runs long the
//! next one starts as soon as the current one finishes instead of being
//! skipped.
//!
//! A participant error halts the periodic pass.  The error is logged, wrapped
//! as [`ServoError::ParticipantFault`], and kept until the owner collects it
//! with [`Looper::take_fault`].  Participants are never silently dropped.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//! use servoloop_runtime::looper::{Loop, Looper};
//! use servoloop_types::ServoError;
//!
//! #[derive(Default)]
//! struct Counter(AtomicU32);
//!
//! impl Loop for Counter {
//!     fn name(&self) -> &str { "counter" }
//!     fn on_start(&self, _t: f64) -> Result<(), ServoError> { Ok(()) }
//!     fn on_loop(&self, _t: f64, _dt: f64) -> Result<(), ServoError> {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     }
//!     fn on_stop(&self, _t: f64) -> Result<(), ServoError> { Ok(()) }
//! }
//!
//! let counter = Arc::new(Counter::default());
//! let mut looper = Looper::new("enabled", Duration::from_millis(5));
//! looper.register(counter.clone()).unwrap();
//!
//! looper.start().unwrap();
//! std::thread::sleep(Duration::from_millis(50));
//! looper.stop().unwrap();
//!
//! assert!(counter.0.load(Ordering::SeqCst) > 0);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use servoloop_mechanism::TelemetrySupplier;
use servoloop_types::{ServoError, TelemetryValue};
use tracing::{debug, error, info};

/// Nominal scheduler period in seconds (50 Hz).
pub const LOOPER_DT: f64 = 0.02;

/// Seconds elapsed since the first call in this process.  Every looper
/// timestamps its callbacks from the same epoch.
pub fn timestamp() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// A participant driven by a [`Looper`].
///
/// Callbacks run on the scheduler thread and must not block indefinitely:
/// every participant of a looper shares the same tick.
pub trait Loop: Send + Sync {
    fn name(&self) -> &str;

    fn on_start(&self, timestamp: f64) -> Result<(), ServoError>;

    /// `dt` is the measured time since the previous tick, not the nominal
    /// period.
    fn on_loop(&self, timestamp: f64, dt: f64) -> Result<(), ServoError>;

    fn on_stop(&self, timestamp: f64) -> Result<(), ServoError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Looper
// ─────────────────────────────────────────────────────────────────────────────

/// State shared between the owning handle and the scheduler thread.
struct Shared {
    running: AtomicBool,
    dt_bits: AtomicU64,
    fault: Mutex<Option<ServoError>>,
}

impl Shared {
    fn dt(&self) -> f64 {
        f64::from_bits(self.dt_bits.load(Ordering::Relaxed))
    }

    fn fault(&self) -> MutexGuard<'_, Option<ServoError>> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Looper {
    name: String,
    period: Duration,
    loops: Vec<Arc<dyn Loop>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    started_once: bool,
}

impl Looper {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            loops: Vec::new(),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                dt_bits: AtomicU64::new(0.0_f64.to_bits()),
                fault: Mutex::new(None),
            }),
            worker: None,
            started_once: false,
        }
    }

    /// Looper with the nominal [`LOOPER_DT`] period.
    pub fn with_default_period(name: impl Into<String>) -> Self {
        Self::new(name, Duration::from_secs_f64(LOOPER_DT))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Append `participant` to the run order.
    ///
    /// # Errors
    ///
    /// [`ServoError::RegistrationClosed`] once the looper has been started.
    pub fn register(&mut self, participant: Arc<dyn Loop>) -> Result<(), ServoError> {
        if self.started_once {
            return Err(ServoError::RegistrationClosed {
                looper: self.name.clone(),
            });
        }
        debug!(looper = %self.name, participant = %participant.name(), "loop registered");
        self.loops.push(participant);
        Ok(())
    }

    pub fn participant_count(&self) -> usize {
        self.loops.len()
    }

    /// `true` between a successful [`start`](Self::start) and the matching
    /// [`stop`](Self::stop), even if the periodic pass halted on a fault.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Last observed tick interval in seconds (0 before the first tick).
    pub fn dt(&self) -> f64 {
        self.shared.dt()
    }

    /// Telemetry supplier reporting [`dt`](Self::dt).
    pub fn dt_supplier(&self) -> TelemetrySupplier {
        let shared = Arc::clone(&self.shared);
        Box::new(move || TelemetryValue::Number(shared.dt()))
    }

    /// The fault that halted the periodic pass, if any.
    pub fn fault(&self) -> Option<ServoError> {
        self.shared.fault().clone()
    }

    pub fn take_fault(&self) -> Option<ServoError> {
        self.shared.fault().take()
    }

    /// Run every participant's `on_start` in registration order, then begin
    /// ticking.  No-op while already running.
    ///
    /// # Errors
    ///
    /// A failing `on_start` aborts the start: participants that already
    /// started get `on_stop`, the looper stays stopped, and the error is
    /// returned as [`ServoError::ParticipantFault`].
    pub fn start(&mut self) -> Result<(), ServoError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.started_once = true;
        self.shared.fault().take();
        self.shared.dt_bits.store(0.0_f64.to_bits(), Ordering::Relaxed);

        let now = timestamp();
        for (started, participant) in self.loops.iter().enumerate() {
            if let Err(e) = participant.on_start(now) {
                let fault = self.report(participant.name(), e);
                self.roll_back(&self.loops[..started]);
                return Err(fault);
            }
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let tick = Ticker {
            name: self.name.clone(),
            period: self.period,
            loops: self.loops.clone(),
            shared: Arc::clone(&self.shared),
        };
        let handle = thread::Builder::new()
            .name(format!("looper-{}", self.name))
            .spawn(move || tick.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                self.report("scheduler", ServoError::Config(format!("thread spawn failed: {e}")))
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(fault) => {
                self.roll_back(&self.loops);
                return Err(fault);
            }
        };
        self.worker = Some(handle);
        info!(looper = %self.name, participants = self.loops.len(), "looper started");
        Ok(())
    }

    /// Stop ticking, wait for the in-flight tick, then run every
    /// participant's `on_stop` in registration order.  No-op while stopped.
    ///
    /// # Errors
    ///
    /// Every `on_stop` runs even if an earlier one fails; the first failure
    /// is returned.
    pub fn stop(&mut self) -> Result<(), ServoError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        self.shared.running.store(false, Ordering::SeqCst);
        if handle.join().is_err() {
            let fault = self.report(
                "scheduler",
                ServoError::Config("scheduler thread panicked".to_string()),
            );
            let mut slot = self.shared.fault();
            if slot.is_none() {
                *slot = Some(fault);
            }
        }

        let now = timestamp();
        let mut first_error = None;
        for participant in &self.loops {
            if let Err(e) = participant.on_stop(now) {
                let fault = self.report(participant.name(), e);
                if first_error.is_none() {
                    first_error = Some(fault);
                }
            }
        }
        info!(looper = %self.name, "looper stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Stop the participants whose `on_start` already ran during an aborted
    /// start.  Failures are logged; the start error is what gets returned.
    fn roll_back(&self, started: &[Arc<dyn Loop>]) {
        let now = timestamp();
        for participant in started {
            if let Err(e) = participant.on_stop(now) {
                self.report(participant.name(), e);
            }
        }
    }

    fn report(&self, participant: &str, err: ServoError) -> ServoError {
        let fault = participant_fault(&self.name, participant, err);
        error!(looper = %self.name, %participant, error = %fault, "loop participant failed");
        fault
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        // stop() has already logged any failure.
        let _ = self.stop();
    }
}

fn participant_fault(looper: &str, participant: &str, err: ServoError) -> ServoError {
    ServoError::ParticipantFault {
        looper: looper.to_string(),
        participant: participant.to_string(),
        details: err.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler thread
// ─────────────────────────────────────────────────────────────────────────────

struct Ticker {
    name: String,
    period: Duration,
    loops: Vec<Arc<dyn Loop>>,
    shared: Arc<Shared>,
}

impl Ticker {
    fn run(self) {
        let mut last = Instant::now();
        let mut next_wake = last + self.period;

        loop {
            if let Some(remaining) = next_wake.checked_duration_since(Instant::now()) {
                thread::sleep(remaining);
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }

            let tick_start = Instant::now();
            let dt = tick_start.duration_since(last).as_secs_f64();
            last = tick_start;
            self.shared.dt_bits.store(dt.to_bits(), Ordering::Relaxed);

            let now = timestamp();
            for participant in &self.loops {
                if let Err(e) = participant.on_loop(now, dt) {
                    let fault = participant_fault(&self.name, participant.name(), e);
                    error!(
                        looper = %self.name,
                        participant = %participant.name(),
                        error = %fault,
                        "loop participant failed; halting periodic pass"
                    );
                    *self.shared.fault() = Some(fault);
                    self.shared.running.store(false, Ordering::SeqCst);
                    return;
                }
            }

            next_wake += self.period;
            let finished = Instant::now();
            if next_wake < finished {
                // Overrun: start the next tick right away.
                next_wake = finished;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Participant appending "<name>:<event>" to a shared journal.
    struct Recorder {
        name: String,
        journal: Journal,
        loops: AtomicU32,
        fail_on_loop: Option<u32>,
        work: Duration,
    }

    impl Recorder {
        fn new(name: &str, journal: &Journal) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                journal: Arc::clone(journal),
                loops: AtomicU32::new(0),
                fail_on_loop: None,
                work: Duration::ZERO,
            })
        }

        fn failing(name: &str, journal: &Journal, on_loop: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_on_loop: Some(on_loop),
                ..Arc::into_inner(Self::new(name, journal)).unwrap()
            })
        }

        fn slow(name: &str, journal: &Journal, work: Duration) -> Arc<Self> {
            Arc::new(Self {
                work,
                ..Arc::into_inner(Self::new(name, journal)).unwrap()
            })
        }

        fn note(&self, event: &str) {
            self.journal.lock().unwrap().push(format!("{}:{event}", self.name));
        }

        fn loop_count(&self) -> u32 {
            self.loops.load(Ordering::SeqCst)
        }
    }

    impl Loop for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_start(&self, _timestamp: f64) -> Result<(), ServoError> {
            self.note("start");
            Ok(())
        }

        fn on_loop(&self, _timestamp: f64, _dt: f64) -> Result<(), ServoError> {
            let n = self.loops.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.work.is_zero() {
                thread::sleep(self.work);
            }
            if self.fail_on_loop == Some(n) {
                return Err(ServoError::HardwareFault {
                    component: self.name.clone(),
                    details: "bus timeout".to_string(),
                });
            }
            self.note("loop");
            Ok(())
        }

        fn on_stop(&self, _timestamp: f64) -> Result<(), ServoError> {
            self.note("stop");
            Ok(())
        }
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn fast_looper() -> Looper {
        Looper::new("test", Duration::from_millis(5))
    }

    #[test]
    fn participants_run_in_registration_order() {
        let journal = journal();
        let mut looper = fast_looper();
        for name in ["a", "b", "c"] {
            looper.register(Recorder::new(name, &journal)).unwrap();
        }

        looper.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        looper.stop().unwrap();

        let events = journal.lock().unwrap().clone();
        assert_eq!(&events[..3], &["a:start", "b:start", "c:start"]);
        assert_eq!(&events[events.len() - 3..], &["a:stop", "b:stop", "c:stop"]);

        let loops = &events[3..events.len() - 3];
        assert!(!loops.is_empty());
        assert_eq!(loops.len() % 3, 0);
        for tick in loops.chunks(3) {
            assert_eq!(tick, &["a:loop", "b:loop", "c:loop"]);
        }
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let journal = journal();
        let mut looper = fast_looper();
        looper.register(Recorder::new("a", &journal)).unwrap();

        looper.stop().unwrap();
        assert!(journal.lock().unwrap().is_empty());

        looper.start().unwrap();
        looper.start().unwrap();
        assert!(looper.is_running());
        looper.stop().unwrap();
        looper.stop().unwrap();
        assert!(!looper.is_running());

        let events = journal.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| *e == "a:start").count(), 1);
        assert_eq!(events.iter().filter(|e| *e == "a:stop").count(), 1);
    }

    #[test]
    fn stop_returns_after_every_on_stop() {
        let journal = journal();
        let mut looper = fast_looper();
        for name in ["a", "b", "c"] {
            looper.register(Recorder::new(name, &journal)).unwrap();
        }
        looper.start().unwrap();
        looper.stop().unwrap();

        let events = journal.lock().unwrap().clone();
        let stops: Vec<_> = events.iter().filter(|e| e.ends_with(":stop")).collect();
        assert_eq!(stops, vec!["a:stop", "b:stop", "c:stop"]);
        assert_eq!(events.last().map(String::as_str), Some("c:stop"));
    }

    #[test]
    fn registration_closes_after_first_start() {
        let journal = journal();
        let mut looper = fast_looper();
        looper.start().unwrap();
        let err = looper.register(Recorder::new("late", &journal)).unwrap_err();
        assert_eq!(
            err,
            ServoError::RegistrationClosed {
                looper: "test".to_string()
            }
        );

        looper.stop().unwrap();
        assert!(looper.register(Recorder::new("later", &journal)).is_err());
        assert_eq!(looper.participant_count(), 0);
    }

    #[test]
    fn looper_restarts_after_stop() {
        let journal = journal();
        let mut looper = fast_looper();
        looper.register(Recorder::new("a", &journal)).unwrap();
        looper.start().unwrap();
        looper.stop().unwrap();
        looper.start().unwrap();
        looper.stop().unwrap();

        let events = journal.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| *e == "a:start").count(), 2);
    }

    #[test]
    fn participant_fault_halts_the_pass() {
        let journal = journal();
        let first = Recorder::new("first", &journal);
        let broken = Recorder::failing("broken", &journal, 2);
        let last = Recorder::new("last", &journal);

        let mut looper = fast_looper();
        looper.register(first.clone()).unwrap();
        looper.register(broken.clone()).unwrap();
        looper.register(last.clone()).unwrap();

        looper.start().unwrap();
        thread::sleep(Duration::from_millis(80));

        assert_eq!(broken.loop_count(), 2);
        assert_eq!(first.loop_count(), 2);
        // The failing tick never reached the participant after it.
        assert_eq!(last.loop_count(), 1);

        match looper.fault() {
            Some(ServoError::ParticipantFault {
                looper: name,
                participant,
                details,
            }) => {
                assert_eq!(name, "test");
                assert_eq!(participant, "broken");
                assert!(details.contains("bus timeout"));
            }
            other => panic!("unexpected fault {other:?}"),
        }

        // stop() still brings every participant to a safe state.
        looper.stop().unwrap();
        let events = journal.lock().unwrap().clone();
        assert!(events.ends_with(&[
            "first:stop".to_string(),
            "broken:stop".to_string(),
            "last:stop".to_string(),
        ]));
        assert!(looper.take_fault().is_some());
        assert!(looper.fault().is_none());
    }

    #[test]
    fn failing_on_start_stops_participants_already_started() {
        struct Refuses;
        impl Loop for Refuses {
            fn name(&self) -> &str {
                "refuses"
            }
            fn on_start(&self, _t: f64) -> Result<(), ServoError> {
                Err(ServoError::Config("not ready".to_string()))
            }
            fn on_loop(&self, _t: f64, _dt: f64) -> Result<(), ServoError> {
                Ok(())
            }
            fn on_stop(&self, _t: f64) -> Result<(), ServoError> {
                Ok(())
            }
        }

        let journal = journal();
        let mut looper = fast_looper();
        looper.register(Recorder::new("a", &journal)).unwrap();
        looper.register(Recorder::new("b", &journal)).unwrap();
        looper.register(Arc::new(Refuses)).unwrap();
        looper.register(Recorder::new("c", &journal)).unwrap();

        let err = looper.start().unwrap_err();
        assert!(matches!(
            err,
            ServoError::ParticipantFault { ref participant, .. } if participant == "refuses"
        ));
        assert!(!looper.is_running());

        // Only the participants that started are stopped again.
        let events = journal.lock().unwrap().clone();
        assert_eq!(events, vec!["a:start", "b:start", "a:stop", "b:stop"]);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(journal.lock().unwrap().len(), 4);
        looper.stop().unwrap();
        assert_eq!(journal.lock().unwrap().len(), 4);
    }

    #[test]
    fn dt_reports_measured_interval() {
        let journal = journal();
        let mut looper = Looper::new("test", Duration::from_millis(10));
        looper.register(Recorder::new("a", &journal)).unwrap();
        assert_eq!(looper.dt(), 0.0);

        looper.start().unwrap();
        thread::sleep(Duration::from_millis(80));
        let dt = looper.dt();
        looper.stop().unwrap();

        assert!(dt > 0.005, "dt = {dt}");
        assert!(dt < 0.5, "dt = {dt}");
    }

    #[test]
    fn overrun_shows_in_next_dt() {
        let journal = journal();
        let mut looper = Looper::new("test", Duration::from_millis(5));
        looper
            .register(Recorder::slow("slow", &journal, Duration::from_millis(25)))
            .unwrap();

        looper.start().unwrap();
        thread::sleep(Duration::from_millis(120));
        let dt = looper.dt();
        looper.stop().unwrap();

        assert!(dt >= 0.025, "dt = {dt}");
    }

    #[test]
    fn dt_supplier_reads_live_value() {
        let looper = fast_looper();
        let supplier = looper.dt_supplier();
        assert_eq!(supplier(), TelemetryValue::Number(0.0));
    }

    #[test]
    fn timestamps_are_monotonic() {
        let a = timestamp();
        thread::sleep(Duration::from_millis(2));
        assert!(timestamp() > a);
    }
}
