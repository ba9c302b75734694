//! A single worker thread: owns a single-slot ingress channel, executes one
//! command at a time, and publishes the load estimate the dispatcher reads.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use super::CommandRequest;

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runner state shared with the dispatcher. The dispatcher reads the capacity
/// score concurrently with the runner thread mutating these fields.
pub(crate) struct RunnerState {
    pub(crate) id: usize,
    /// Commands queued on or executing in this runner.
    queued: AtomicUsize,
    running: AtomicBool,
    started_at: Mutex<Option<SystemTime>>,
    commands_run: AtomicU64,
}

impl RunnerState {
    fn new(id: usize) -> Self {
        Self {
            id,
            queued: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            commands_run: AtomicU64::new(0),
        }
    }

    pub(crate) fn commands_run(&self) -> u64 {
        self.commands_run.load(Ordering::SeqCst)
    }

    pub(crate) fn note_dispatched(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn undo_dispatch(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    fn begin_command(&self) {
        self.running.store(true, Ordering::SeqCst);
        *self.started_at.lock().unwrap() = Some(SystemTime::now());
        self.commands_run.fetch_add(1, Ordering::SeqCst);
    }

    fn finish_command(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    /// Cheap proxy for "how long until this runner is free":
    /// `queued * elapsed_ns + queued`. An idle runner contributes no elapsed
    /// term, so idle runners win on the bare queue length.
    pub(crate) fn capacity_score(&self) -> u64 {
        let queued = self.queued.load(Ordering::SeqCst) as u64;
        let mut elapsed_ns: u64 = 0;
        if self.running.load(Ordering::SeqCst) {
            if let Some(started_at) = *self.started_at.lock().unwrap() {
                match SystemTime::now().duration_since(started_at) {
                    Ok(elapsed) => elapsed_ns = elapsed.as_nanos() as u64,
                    Err(_) => {
                        warn!(
                            "current command on worker thread {} appears to have started in the future, assuming the system clock changed",
                            self.id
                        );
                    }
                }
            }
        }
        queued.saturating_mul(elapsed_ns).saturating_add(queued)
    }

    #[cfg(test)]
    fn set_started_at(&self, started_at: SystemTime) {
        *self.started_at.lock().unwrap() = Some(started_at);
    }
}

/// Dispatcher-side handle to a runner: shared state, the single-slot command
/// channel, and the kill channel.
pub(crate) struct RunnerHandle {
    pub(crate) state: Arc<RunnerState>,
    ingress: SyncSender<CommandRequest>,
    kill: Sender<()>,
}

impl RunnerHandle {
    /// Hands a command to the runner, blocking while its slot is full.
    pub(crate) fn dispatch(&self, request: CommandRequest) {
        self.state.note_dispatched();
        if self.ingress.send(request).is_err() {
            self.state.undo_dispatch();
            debug!(
                "worker thread {} is gone, dropping command",
                self.state.id
            );
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.kill.send(());
    }
}

pub(crate) struct Runner {
    pub(crate) state: Arc<RunnerState>,
    ingress: SyncSender<CommandRequest>,
    kill: Sender<()>,
    receivers: Option<(Receiver<CommandRequest>, Receiver<()>)>,
}

impl Runner {
    pub(crate) fn new(id: usize) -> Self {
        let (ingress, commands) = mpsc::sync_channel(1);
        let (kill, kill_rx) = mpsc::channel();
        Self {
            state: Arc::new(RunnerState::new(id)),
            ingress,
            kill,
            receivers: Some((commands, kill_rx)),
        }
    }

    pub(crate) fn handle_for_dispatcher(&self) -> RunnerHandle {
        RunnerHandle {
            state: Arc::clone(&self.state),
            ingress: self.ingress.clone(),
            kill: self.kill.clone(),
        }
    }

    /// Spawns the runner thread, detached: it exits on a kill token or when
    /// its channels disconnect.
    pub(crate) fn start(&mut self) {
        let Some((commands, kill)) = self.receivers.take() else {
            return;
        };
        debug!("start() called on worker thread {}", self.state.id);
        let state = Arc::clone(&self.state);
        thread::spawn(move || runner_loop(state, commands, kill));
    }
}

/// The kill channel is checked with non-blocking priority over new work; a
/// command already received runs to completion before the next check.
fn runner_loop(state: Arc<RunnerState>, commands: Receiver<CommandRequest>, kill: Receiver<()>) {
    loop {
        match kill.try_recv() {
            Ok(()) => {
                info!("stopping execution of worker thread {}", state.id);
                break;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(request) => {
                state.begin_command();
                request.run();
                state.finish_command();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
