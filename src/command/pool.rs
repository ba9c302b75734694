//! Bounded worker pool: a dispatcher thread hands submitted commands to the
//! runner with the lowest capacity score.

use log::{debug, info};
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use super::runner::{POLL_INTERVAL, Runner, RunnerHandle};
use super::{CommandError, CommandRequest, CommandResult, CommandState};

const STATS_INTERVAL: Duration = Duration::from_secs(300);

pub struct Pool {
    ingress: SyncSender<CommandRequest>,
    kill: Sender<()>,
    runners: Vec<Runner>,
    dispatcher_channels: Option<(Receiver<CommandRequest>, Receiver<()>)>,
}

impl Pool {
    /// Builds a pool of `thread_count` runners; zero resolves to the host CPU
    /// count. Runners and the dispatcher do not run until [`Pool::start`].
    pub fn new(thread_count: usize) -> Self {
        let count = resolve_thread_count(thread_count);
        let runners = (0..count).map(Runner::new).collect();
        let (ingress, commands) = mpsc::sync_channel(0);
        let (kill, kill_rx) = mpsc::channel();
        Self {
            ingress,
            kill,
            runners,
            dispatcher_channels: Some((commands, kill_rx)),
        }
    }

    pub fn runner_count(&self) -> usize {
        self.runners.len()
    }

    /// Lifetime command count per runner, indexed by runner id.
    pub fn command_counts(&self) -> Vec<u64> {
        self.runners
            .iter()
            .map(|runner| runner.state.commands_run())
            .collect()
    }

    pub fn start(&mut self) {
        debug!("start() called on worker pool");
        let Some((commands, kill)) = self.dispatcher_channels.take() else {
            return;
        };
        for runner in &mut self.runners {
            runner.start();
        }
        let handles: Vec<RunnerHandle> = self
            .runners
            .iter()
            .map(Runner::handle_for_dispatcher)
            .collect();
        thread::spawn(move || dispatch_loop(handles, commands, kill));
    }

    /// Enqueues a command; blocks only for the handoff to the dispatcher. A
    /// command submitted to a stopped pool is dropped, which the continuation
    /// observes as never firing (or [`CommandError::Dropped`] through
    /// [`Pool::run_blocking`]).
    pub fn submit(&self, request: CommandRequest) {
        if let Err(err) = self.ingress.send(request) {
            debug!("dropping command submitted to a stopped pool: {:?}", err.0);
        }
    }

    /// Submits `template` and blocks on a one-shot completion barrier until
    /// the continuation fires.
    pub fn run_blocking(&self, template: &str, state: &CommandState) -> CommandResult {
        let (tx, rx) = mpsc::channel();
        self.submit(CommandRequest::new(
            template.to_string(),
            state.clone(),
            move |result| {
                let _ = tx.send(result);
            },
        ));
        rx.recv().unwrap_or(Err(CommandError::Dropped))
    }

    /// Signals the dispatcher to exit and kill all runners. Commands already
    /// dispatched complete; queued-but-undispatched commands are dropped.
    /// In-flight shell processes are not cancelled.
    pub fn stop(&self) {
        debug!("stop() called on worker pool");
        for (id, count) in self.command_counts().into_iter().enumerate() {
            debug!("worker thread {} executed {} commands in total", id, count);
        }
        let _ = self.kill.send(());
    }
}

fn resolve_thread_count(thread_count: usize) -> usize {
    if thread_count > 0 {
        return thread_count;
    }
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn dispatch_loop(
    runners: Vec<RunnerHandle>,
    commands: Receiver<CommandRequest>,
    kill: Receiver<()>,
) {
    let mut last_stats = Instant::now();
    loop {
        match kill.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                info!("killing all worker threads");
                for runner in &runners {
                    runner.stop();
                }
                break;
            }
            Err(TryRecvError::Empty) => {}
        }
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(request) => {
                let mut best = 0;
                let mut best_score = runners[0].state.capacity_score();
                for (index, runner) in runners.iter().enumerate().skip(1) {
                    let score = runner.state.capacity_score();
                    debug!(
                        "worker thread {} (capacity: {}), best so far {} (capacity: {})",
                        index, score, best, best_score
                    );
                    if score < best_score {
                        best = index;
                        best_score = score;
                    }
                }
                debug!("sending command to worker thread {}", best);
                runners[best].dispatch(request);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                for runner in &runners {
                    runner.stop();
                }
                break;
            }
        }
        if last_stats.elapsed() >= STATS_INTERVAL {
            for runner in &runners {
                info!(
                    "worker thread {} has executed {} commands so far",
                    runner.state.id,
                    runner.state.commands_run()
                );
            }
            last_stats = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_pool(thread_count: usize) -> Pool {
        let mut pool = Pool::new(thread_count);
        pool.start();
        pool
    }

    #[test]
    fn zero_thread_count_resolves_to_host_cpus() {
        let expected = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        assert_eq!(Pool::new(0).runner_count(), expected);
    }

    #[test]
    fn explicit_thread_count_is_respected() {
        assert_eq!(Pool::new(3).runner_count(), 3);
    }

    #[test]
    fn continuation_fires_exactly_once_per_command() {
        let pool = started_pool(2);
        let (tx, rx) = mpsc::channel();
        for i in 0..6 {
            let tx = tx.clone();
            pool.submit(CommandRequest::new(
                format!("printf '{}'", i),
                CommandState::default(),
                move |result| {
                    tx.send(result).unwrap();
                },
            ));
        }
        drop(tx);
        let mut completions = 0;
        while let Ok(result) = rx.recv_timeout(Duration::from_secs(5)) {
            assert!(result.is_ok());
            completions += 1;
        }
        assert_eq!(completions, 6);
        pool.stop();
    }

    #[test]
    fn run_blocking_returns_command_output() {
        let pool = started_pool(1);
        let output = pool
            .run_blocking("printf 'abc'", &CommandState::default())
            .unwrap();
        assert_eq!(&output[..], b"abc");
        pool.stop();
    }

    #[test]
    fn run_blocking_surfaces_command_failure() {
        let pool = started_pool(1);
        match pool.run_blocking("exit 7", &CommandState::default()) {
            Err(CommandError::Exit { code, .. }) => assert_eq!(code, Some(7)),
            other => panic!("expected exit error, got {:?}", other),
        }
        pool.stop();
    }

    #[test]
    fn dispatch_prefers_the_less_loaded_runner() {
        let pool = started_pool(2);
        let (slow_tx, slow_rx) = mpsc::channel();
        pool.submit(CommandRequest::new(
            "sleep 1".to_string(),
            CommandState::default(),
            move |result| {
                slow_tx.send(result).unwrap();
            },
        ));
        // Let the slow command land on runner 0 before submitting quick ones.
        thread::sleep(Duration::from_millis(200));

        for _ in 0..2 {
            let result = pool.run_blocking("printf 'quick'", &CommandState::default());
            assert_eq!(&result.unwrap()[..], b"quick");
        }

        let counts = pool.command_counts();
        assert_eq!(counts, vec![1, 2]);

        assert!(slow_rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
        pool.stop();
    }

    #[test]
    fn submit_after_stop_drops_the_command() {
        let pool = started_pool(1);
        pool.stop();
        thread::sleep(Duration::from_millis(300));
        match pool.run_blocking("printf 'never'", &CommandState::default()) {
            Err(CommandError::Dropped) => {}
            other => panic!("expected dropped command, got {:?}", other),
        }
    }
}
