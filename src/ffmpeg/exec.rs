//! One-shot transcoder invocations
//!
//! Used by snapshot acquisition: run one bounded command, optionally feed it
//! bytes on stdin, and collect its stdout to completion. Failures resolve to
//! `None` so callers can fall through to their next source.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::process::{FfmpegProcess, ProcessCallbacks, ProcessOptions};

/// One-shot process runner
pub struct FfmpegExec;

impl FfmpegExec {
    /// Run a command to completion under a hard timeout
    ///
    /// Returns the collected stdout, or `None` on spawn failure, timeout,
    /// abnormal exit, or empty output.
    pub async fn run(
        options: ProcessOptions,
        stdin_data: Option<Bytes>,
        timeout: Duration,
    ) -> Option<Bytes> {
        let process = FfmpegProcess::new();
        if let Err(e) = process.prepare(options) {
            debug!("One-shot transcode rejected: {}", e);
            return None;
        }
        if let Err(e) = process.start(ProcessCallbacks::default()) {
            debug!("One-shot transcode failed to spawn: {}", e);
            return None;
        }

        match process.take_stdin() {
            Some(mut stdin) => {
                if let Some(data) = stdin_data {
                    tokio::spawn(async move {
                        let _ = stdin.write_all(&data).await;
                        let _ = stdin.shutdown().await;
                    });
                }
                // No data: stdin dropped immediately, process sees EOF
            }
            None => {}
        }

        let mut stdout = process.take_stdout()?;
        let mut out = Vec::new();
        match tokio::time::timeout(timeout, stdout.read_to_end(&mut out)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("One-shot transcode read failed: {}", e);
                process.stop();
                return None;
            }
            Err(_) => {
                debug!("One-shot transcode hit its {}s budget", timeout.as_secs());
                process.stop();
                return None;
            }
        }

        // stdout closed, the process is exiting; give classification a moment
        if !process.wait_for_exit(Duration::from_secs(2)).await {
            process.stop();
        }
        if process.has_error() || out.is_empty() {
            return None;
        }
        Some(Bytes::from(out))
    }
}
