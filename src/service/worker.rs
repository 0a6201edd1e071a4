//! Supervised workers
//!
//! A `ServiceWorker` drives one `WorkerUnit` in its own tokio task. The loop
//! checks the stop flag, honours the pause checkpoint, then runs one step.
//! A step that fails or panics ends the loop and is reported on the fatal
//! channel; the worker is not restarted here.

use crate::service::{FatalError, FatalKind};
use crate::FlowError;
use async_trait::async_trait;
use kanal::AsyncSender;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Outcome of one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Something was processed; run the next step right away
    Worked,
    /// Nothing to do; sleep one poll interval
    Idle,
    /// The unit is done for good
    Finished,
}

/// The work a worker repeats
#[async_trait]
pub trait WorkerUnit: Send {
    async fn step(&mut self) -> Result<Step, FlowError>;
}

/// Builds a fresh unit each time a worker (re)starts
pub type UnitFactory = Arc<dyn Fn() -> Box<dyn WorkerUnit> + Send + Sync>;

/// State published by the worker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Paused,
    Stopped,
}

struct Control {
    stop: AtomicBool,
    pause: AtomicBool,
    busy: AtomicBool,
    alive: AtomicBool,
    started: AtomicBool,
    state: watch::Sender<WorkerState>,
    resume: Notify,
}

/// Clears the busy flag when a step ends, even by unwinding
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One supervised unit of concurrent execution
pub struct ServiceWorker {
    name: String,
    factory: UnitFactory,
    control: Arc<Control>,
    fatal_tx: AsyncSender<FatalError>,
    idle_poll: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceWorker {
    pub fn new(
        name: impl Into<String>,
        factory: UnitFactory,
        fatal_tx: AsyncSender<FatalError>,
        idle_poll: Duration,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            name: name.into(),
            factory,
            control: Arc::new(Control {
                stop: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                alive: AtomicBool::new(false),
                started: AtomicBool::new(false),
                state,
                resume: Notify::new(),
            }),
            fatal_tx,
            idle_poll,
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the worker loop. Does nothing while the worker is alive.
    pub fn start(&self) {
        if self.control.alive.swap(true, Ordering::SeqCst) {
            return;
        }
        self.control.stop.store(false, Ordering::SeqCst);
        self.control.started.store(true, Ordering::SeqCst);
        self.control.state.send_replace(WorkerState::Running);
        self.spawn();
    }

    /// Restarts a worker that exited on its own; stopped workers stay down
    pub fn revive(&self) -> bool {
        if self.control.stop.load(Ordering::SeqCst) || !self.control.started.load(Ordering::SeqCst) {
            return false;
        }
        if self.control.alive.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Restarting worker {}", self.name);
        self.control.state.send_replace(WorkerState::Running);
        self.spawn();
        true
    }

    fn spawn(&self) {
        let control = self.control.clone();
        let fatal_tx = self.fatal_tx.clone();
        let name = self.name.clone();
        let unit = (self.factory)();
        let idle_poll = self.idle_poll;

        let handle = tokio::spawn(async move {
            let inner = tokio::spawn(run_loop(control.clone(), unit, idle_poll));
            let outcome = inner.await;

            // Publish Stopped before clearing alive: a revive may follow at once
            control.busy.store(false, Ordering::SeqCst);
            control.state.send_replace(WorkerState::Stopped);
            control.alive.store(false, Ordering::SeqCst);

            let fatal = match outcome {
                Ok(Ok(())) => {
                    tracing::debug!("Worker {} exited", name);
                    None
                }
                Ok(Err(e)) => Some(FatalError::new(FatalKind::WorkerError, e.to_string(), &name)),
                Err(e) if e.is_panic() => Some(FatalError::new(
                    FatalKind::Panic,
                    panic_message(e.into_panic()),
                    &name,
                )),
                Err(_) => None,
            };

            if let Some(fatal) = fatal {
                tracing::error!("Worker {} died: {}", name, fatal);
                if fatal_tx.send(fatal).await.is_err() {
                    tracing::error!("Fatal channel closed, error from {} lost", name);
                }
            }
        });

        let mut slot = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(handle);
    }

    /// Asks the loop to exit after the current step
    pub fn stop(&self) {
        self.control.stop.store(true, Ordering::SeqCst);
        self.control.resume.notify_waiters();
    }

    /// Returns once the worker sits at its pause checkpoint, has died, or
    /// was resumed before reaching the checkpoint
    pub async fn pause(&self) {
        self.control.pause.store(true, Ordering::SeqCst);
        let mut state = self.control.state.subscribe();

        loop {
            // Registered before the flags are read so a resume in between still wakes us
            let resumed = self.control.resume.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();

            if !self.control.alive.load(Ordering::SeqCst)
                || !self.control.pause.load(Ordering::SeqCst)
                || *state.borrow_and_update() != WorkerState::Running
            {
                return;
            }

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = &mut resumed => {}
            }
        }
    }

    pub fn resume(&self) {
        self.control.pause.store(false, Ordering::SeqCst);
        self.control.resume.notify_waiters();
    }

    /// Waits for the loop to exit
    pub async fn join(&self) {
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.control.busy.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.control.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WorkerState {
        *self.control.state.borrow()
    }

    /// Started at some point and no longer running
    pub fn has_exited(&self) -> bool {
        self.control.started.load(Ordering::SeqCst) && !self.is_alive()
    }
}

async fn run_loop(
    control: Arc<Control>,
    mut unit: Box<dyn WorkerUnit>,
    idle_poll: Duration,
) -> Result<(), FlowError> {
    loop {
        if control.stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        if control.pause.load(Ordering::SeqCst) {
            control.state.send_replace(WorkerState::Paused);
            while control.pause.load(Ordering::SeqCst) && !control.stop.load(Ordering::SeqCst) {
                let _ = tokio::time::timeout(idle_poll, control.resume.notified()).await;
            }
            control.state.send_replace(WorkerState::Running);
            continue;
        }

        let step = {
            let _busy = BusyGuard::new(&control.busy);
            unit.step().await?
        };

        match step {
            Step::Worked => tokio::task::yield_now().await,
            Step::Idle => tokio::time::sleep(idle_poll).await,
            Step::Finished => return Ok(()),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// A fixed-size group of workers running the same unit
pub struct WorkerPool {
    name: String,
    workers: Vec<ServiceWorker>,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        size: usize,
        factory: UnitFactory,
        fatal_tx: AsyncSender<FatalError>,
        idle_poll: Duration,
    ) -> Self {
        let name = name.into();
        let workers = (0..size)
            .map(|i| {
                ServiceWorker::new(
                    format!("{}-{}", name, i),
                    factory.clone(),
                    fatal_tx.clone(),
                    idle_poll,
                )
            })
            .collect();
        Self { name, workers }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> &[ServiceWorker] {
        &self.workers
    }

    pub fn start(&self) {
        tracing::info!("Starting {} ({} workers)", self.name, self.workers.len());
        self.workers.iter().for_each(ServiceWorker::start);
    }

    pub fn stop(&self) {
        self.workers.iter().for_each(ServiceWorker::stop);
    }

    pub async fn pause(&self) {
        for worker in &self.workers {
            worker.pause().await;
        }
    }

    pub fn resume(&self) {
        self.workers.iter().for_each(ServiceWorker::resume);
    }

    pub async fn join(&self) {
        for worker in &self.workers {
            worker.join().await;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.workers.iter().any(ServiceWorker::is_busy)
    }

    pub fn is_alive(&self) -> bool {
        self.workers.iter().any(ServiceWorker::is_alive)
    }

    pub fn alive_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    /// True once every worker has started and exited
    pub fn has_exited(&self) -> bool {
        self.workers.iter().all(ServiceWorker::has_exited)
    }

    /// Restarts workers that exited without being stopped
    pub fn revive_dead(&self) -> usize {
        self.workers.iter().filter(|w| w.revive()).count()
    }
}
