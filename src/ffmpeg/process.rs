//! Transcoder process supervisor
//!
//! Spawns and monitors one ffmpeg invocation. A process handle is never
//! reused: every invocation gets a fresh `FfmpegProcess`.
//!
//! Readiness is detected on the *error* stream, not stdout - not every
//! invocation uses stdout or stdin, but ffmpeg always writes to stderr, so
//! the first stderr byte is the earliest reliable "the process is up"
//! signal. Exit conditions are classified against `(code, signal,
//! killed_by_us)` plus an optional injected classifier that can recognize
//! known-benign failure signatures for a specific pipeline.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};

/// Maximum number of stderr lines retained for post-mortem diagnosis
const STDERR_BUFFER_SIZE: usize = 200;

/// One transcoder invocation's command line and behavior knobs
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Path to the transcoder binary
    pub binary: String,
    /// Argument vector, without the binary itself
    pub args: Vec<String>,
    /// Echo stderr lines live at debug level
    pub verbose: bool,
    /// Grace period between the terminate signal and the force kill
    pub kill_timeout: Duration,
}

impl ProcessOptions {
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
            verbose: false,
            kill_timeout: Duration::from_secs(5),
        }
    }

    /// Whether the caller picked its own transcoder log level
    pub fn has_custom_log_level(&self) -> bool {
        self.args.iter().any(|a| a == "-loglevel")
    }
}

/// How an exit condition should be treated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Clean exit
    Normal,
    /// We killed it, or it died the way a killed process does
    Expected,
    /// A failure signature this pipeline knows is harmless
    Benign(String),
    /// Abnormal termination worth escalating
    Error,
}

/// Raw exit condition handed to the classifier
#[derive(Debug, Clone)]
pub struct ExitStatusInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub killed_by_us: bool,
}

/// Pipeline-specific exit classification hook
///
/// Returning `None` falls back to the default classification.
pub type ExitClassifier =
    Arc<dyn Fn(&ExitStatusInfo, &[String]) -> Option<ExitDisposition> + Send + Sync>;

/// Callbacks wired into one invocation
#[derive(Default)]
pub struct ProcessCallbacks {
    /// Fired exactly once when the first stderr byte arrives
    pub on_ready: Option<Box<dyn FnOnce() + Send>>,
    /// Fired when the process terminates abnormally
    pub on_fatal: Option<Box<dyn Fn(String) + Send + Sync>>,
}

/// Supervised transcoder process
///
/// State machine: unprepared -> prepared -> running -> ended. Created for
/// one `start()`, destroyed on process exit.
pub struct FfmpegProcess {
    options: Mutex<Option<ProcessOptions>>,
    classifier: Mutex<Option<ExitClassifier>>,

    started: AtomicBool,
    ended: AtomicBool,
    has_error: AtomicBool,
    killed_by_us: AtomicBool,

    /// Rolling stderr line log, cleared once exit handling is done
    stderr_log: Arc<Mutex<VecDeque<String>>>,

    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,

    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    /// Resolves once the stderr collector has drained the pipe
    stderr_done: Mutex<Option<oneshot::Receiver<()>>>,
    exit_tx: watch::Sender<bool>,
}

impl FfmpegProcess {
    pub fn new() -> Arc<Self> {
        let (exit_tx, _) = watch::channel(false);
        Arc::new(Self {
            options: Mutex::new(None),
            classifier: Mutex::new(None),
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            has_error: AtomicBool::new(false),
            killed_by_us: AtomicBool::new(false),
            stderr_log: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_BUFFER_SIZE))),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stop_tx: Mutex::new(None),
            stderr_done: Mutex::new(None),
            exit_tx,
        })
    }

    /// Install a pipeline-specific exit classifier
    pub fn set_classifier(&self, classifier: ExitClassifier) {
        *self.classifier.lock() = Some(classifier);
    }

    /// Validate and record the command line for this invocation
    pub fn prepare(&self, options: ProcessOptions) -> Result<()> {
        if options.binary.trim().is_empty() || options.args.is_empty() {
            return Err(BridgeError::Config(
                "transcoder command line is empty".to_string(),
            ));
        }
        if options.has_custom_log_level() {
            debug!("Caller supplied its own -loglevel, leaving it in place");
        }
        *self.options.lock() = Some(options);
        Ok(())
    }

    /// Spawn the prepared command line
    pub fn start(self: &Arc<Self>, callbacks: ProcessCallbacks) -> Result<()> {
        let options = self
            .options
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::Config("transcoder was not prepared".to_string()))?;

        debug!("Spawning {} {}", options.binary, options.args.join(" "));

        let mut child = Command::new(&options.binary)
            .args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let msg = format!("failed to spawn {}: {}", options.binary, e);
                error!("{}", msg);
                if let Some(on_fatal) = &callbacks.on_fatal {
                    on_fatal(msg.clone());
                }
                BridgeError::Process(msg)
            })?;

        *self.stdin.lock() = child.stdin.take();
        *self.stdout.lock() = child.stdout.take();

        if let Some(stderr) = child.stderr.take() {
            let (done_tx, done_rx) = oneshot::channel();
            *self.stderr_done.lock() = Some(done_rx);
            let this = self.clone();
            let on_ready = callbacks.on_ready;
            let verbose = options.verbose;
            tokio::spawn(async move {
                this.collect_stderr(stderr, on_ready, verbose, done_tx).await;
            });
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        *self.stop_tx.lock() = Some(stop_tx);

        let this = self.clone();
        let on_fatal = callbacks.on_fatal;
        tokio::spawn(async move {
            this.monitor(child, stop_rx, options.kill_timeout, on_fatal)
                .await;
        });

        Ok(())
    }

    /// Take the stdout pipe; the recording pipeline hands it to the segmenter
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().take()
    }

    /// Take the stdin pipe; ownership moves to the caller's writer task
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.stdin.lock().take()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    /// Snapshot of the buffered stderr lines
    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr_log.lock().iter().cloned().collect()
    }

    /// Request termination
    ///
    /// Idempotent. Closes stdin (unless a writer task took it), sends the
    /// terminate signal, and arms the force-kill watchdog.
    pub fn stop(&self) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        self.killed_by_us.store(true, Ordering::SeqCst);

        // Close our end of stdin so the process sees EOF on its input
        self.stdin.lock().take();

        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.try_send(());
        }
    }

    /// Wait until the process has ended, bounded by `timeout`
    ///
    /// Returns `true` if the process ended within the window.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Read stderr: the first byte marks readiness, then lines are buffered
    ///
    /// `_done` drops on return, releasing anyone waiting for the drain.
    async fn collect_stderr(
        &self,
        stderr: tokio::process::ChildStderr,
        on_ready: Option<Box<dyn FnOnce() + Send>>,
        verbose: bool,
        _done: oneshot::Sender<()>,
    ) {
        let mut reader = BufReader::new(stderr);
        let mut on_ready = on_ready;

        // First stderr byte means the process is up
        match reader.fill_buf().await {
            Ok(buf) if !buf.is_empty() => {
                self.started.store(true, Ordering::SeqCst);
                if let Some(ready) = on_ready.take() {
                    ready();
                }
            }
            _ => return,
        }

        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if verbose {
                        debug!("ffmpeg: {}", line);
                    }
                    let mut log = self.stderr_log.lock();
                    if log.len() >= STDERR_BUFFER_SIZE {
                        log.pop_front();
                    }
                    log.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Error reading transcoder stderr: {}", e);
                    break;
                }
            }
        }
    }

    /// Own the child until it exits; handle stop requests and the watchdog
    async fn monitor(
        &self,
        mut child: Child,
        mut stop_rx: mpsc::Receiver<()>,
        kill_timeout: Duration,
        on_fatal: Option<Box<dyn Fn(String) + Send + Sync>>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = stop_rx.recv() => {
                Self::terminate(&mut child, kill_timeout).await
            }
        };

        // The pipe may still hold diagnostics the exit classifier needs;
        // wait for the collector to drain it
        let stderr_done = self.stderr_done.lock().take();
        if let Some(done) = stderr_done {
            let _ = tokio::time::timeout(Duration::from_secs(1), done).await;
        }

        let info = match status {
            Ok(status) => {
                use std::os::unix::process::ExitStatusExt;
                ExitStatusInfo {
                    code: status.code(),
                    signal: status.signal(),
                    killed_by_us: self.killed_by_us.load(Ordering::SeqCst),
                }
            }
            Err(e) => {
                warn!("Failed waiting on transcoder: {}", e);
                ExitStatusInfo {
                    code: None,
                    signal: None,
                    killed_by_us: self.killed_by_us.load(Ordering::SeqCst),
                }
            }
        };

        self.handle_exit(info, on_fatal);
    }

    /// Graceful terminate, force kill after the watchdog interval
    async fn terminate(child: &mut Child, kill_timeout: Duration) -> std::io::Result<std::process::ExitStatus> {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        match tokio::time::timeout(kill_timeout, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Transcoder ignored the terminate signal, force killing");
                let _ = child.kill().await;
                child.wait().await
            }
        }
    }

    /// Classify the exit condition and run the matching reaction exactly once
    fn handle_exit(&self, info: ExitStatusInfo, on_fatal: Option<Box<dyn Fn(String) + Send + Sync>>) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        let stderr_lines: Vec<String> = {
            let log = self.stderr_log.lock();
            log.iter().cloned().collect()
        };

        let disposition = self
            .classifier
            .lock()
            .as_ref()
            .and_then(|c| c(&info, &stderr_lines))
            .unwrap_or_else(|| Self::default_disposition(&info));

        match disposition {
            ExitDisposition::Normal => {
                debug!("Transcoder exited cleanly");
            }
            ExitDisposition::Expected => {
                debug!(
                    "Transcoder terminated as requested (code {:?}, signal {:?})",
                    info.code, info.signal
                );
            }
            ExitDisposition::Benign(reason) => {
                info!("Transcoder exited with a known-benign condition: {}", reason);
            }
            ExitDisposition::Error => {
                self.has_error.store(true, Ordering::SeqCst);
                error!(
                    "Transcoder terminated unexpectedly (code {:?}, signal {:?})",
                    info.code, info.signal
                );
                for line in &stderr_lines {
                    error!("ffmpeg: {}", line);
                }
                if let Some(on_fatal) = &on_fatal {
                    on_fatal(format!(
                        "transcoder exited with code {:?}, signal {:?}",
                        info.code, info.signal
                    ));
                }
            }
        }

        // Diagnostics have bounded lifetime: once exit handling is done,
        // the buffered lines are gone
        self.stderr_log.lock().clear();

        let _ = self.exit_tx.send(true);
    }

    fn default_disposition(info: &ExitStatusInfo) -> ExitDisposition {
        match (info.code, info.killed_by_us) {
            (Some(0), _) => ExitDisposition::Normal,
            (None, true) | (Some(255), true) => ExitDisposition::Expected,
            _ => ExitDisposition::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn options(args: &[&str]) -> ProcessOptions {
        ProcessOptions::new("sh", args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_prepare_rejects_empty_command_line() {
        let process = FfmpegProcess::new();
        assert!(matches!(
            process.prepare(ProcessOptions::new("", vec![])),
            Err(BridgeError::Config(_))
        ));
        assert!(matches!(
            process.prepare(ProcessOptions::new("ffmpeg", vec![])),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_custom_log_level_detection() {
        let with = ProcessOptions::new("ffmpeg", vec!["-loglevel".to_string(), "debug".to_string()]);
        let without = ProcessOptions::new("ffmpeg", vec!["-i".to_string(), "x".to_string()]);
        assert!(with.has_custom_log_level());
        assert!(!without.has_custom_log_level());
    }

    #[tokio::test]
    async fn test_normal_exit_is_not_an_error() {
        let process = FfmpegProcess::new();
        process
            .prepare(options(&["-c", "echo ready >&2; exit 0"]))
            .unwrap();
        process.start(ProcessCallbacks::default()).unwrap();
        assert!(process.wait_for_exit(Duration::from_secs(5)).await);
        assert!(process.is_ended());
        assert!(!process.has_error());
    }

    #[tokio::test]
    async fn test_readiness_fires_on_first_stderr_byte() {
        let process = FfmpegProcess::new();
        process
            .prepare(options(&["-c", "echo up >&2; sleep 0.2"]))
            .unwrap();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        process
            .start(ProcessCallbacks {
                on_ready: Some(Box::new(move || {
                    let _ = ready_tx.send(());
                })),
                on_fatal: None,
            })
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), ready_rx)
            .await
            .expect("readiness should fire")
            .unwrap();
        assert!(process.is_started());
    }

    #[tokio::test]
    async fn test_abnormal_exit_invokes_fatal_callback() {
        let process = FfmpegProcess::new();
        process
            .prepare(options(&["-c", "echo boom >&2; exit 3"]))
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        process
            .start(ProcessCallbacks {
                on_ready: None,
                on_fatal: Some(Box::new(move |_| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                })),
            })
            .unwrap();
        assert!(process.wait_for_exit(Duration::from_secs(5)).await);
        assert!(process.has_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_expected() {
        let process = FfmpegProcess::new();
        let mut opts = options(&["-c", "echo up >&2; sleep 30"]);
        opts.kill_timeout = Duration::from_millis(200);
        process.prepare(opts).unwrap();
        process.start(ProcessCallbacks::default()).unwrap();

        // Give the shell a moment to come up
        tokio::time::sleep(Duration::from_millis(100)).await;

        process.stop();
        process.stop();
        process.stop();

        assert!(process.wait_for_exit(Duration::from_secs(5)).await);
        assert!(process.is_ended());
        // Killed by us: expected termination, not an error
        assert!(!process.has_error());
    }

    #[tokio::test]
    async fn test_watchdog_force_kills_stubborn_process() {
        let process = FfmpegProcess::new();
        // Shell that ignores SIGTERM
        let mut opts = options(&["-c", "trap '' TERM; echo up >&2; sleep 30"]);
        opts.kill_timeout = Duration::from_millis(200);
        process.prepare(opts).unwrap();
        process.start(ProcessCallbacks::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        process.stop();

        // The watchdog must fire and the process must still end promptly
        assert!(process.wait_for_exit(Duration::from_secs(5)).await);
        assert!(process.is_ended());
    }

    #[tokio::test]
    async fn test_classifier_overrides_error() {
        let process = FfmpegProcess::new();
        process
            .prepare(options(&["-c", "echo 'Broken pipe' >&2; exit 1"]))
            .unwrap();
        process.set_classifier(Arc::new(|_info, lines| {
            lines
                .iter()
                .any(|l| l.contains("Broken pipe"))
                .then(|| ExitDisposition::Benign("input pipe closed".to_string()))
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        process
            .start(ProcessCallbacks {
                on_ready: None,
                on_fatal: Some(Box::new(move |_| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                })),
            })
            .unwrap();
        assert!(process.wait_for_exit(Duration::from_secs(5)).await);
        assert!(!process.has_error());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
