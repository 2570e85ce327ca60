//! Recording transcode pipeline
//!
//! Couples a supervised transcoder with the segmenter: buffered timeshift
//! segments go in through an ordered stdin feed queue, re-fragmented
//! recording segments come out of stdout. The feed queue is drained by a
//! single writer task that awaits every write, so segments reach the
//! transcoder in strict arrival order and memory stays bounded by the
//! channel capacity plus whatever the pipe accepts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::Result;

use super::process::{
    ExitDisposition, ExitStatusInfo, FfmpegProcess, ProcessCallbacks, ProcessOptions,
};
use super::segmenter::spawn_segment_pump;

/// Feed queue capacity between the delegate and the writer task
const FEED_QUEUE_CAPACITY: usize = 64;

/// Output segment channel capacity
const SEGMENT_CHANNEL_CAPACITY: usize = 16;

/// Stderr signatures that mean the transcoder died because its input went
/// away, which is how every recording session we cancel looks from its side
const BENIGN_STDERR_SIGNATURES: &[&str] = &[
    "Immediate exit requested",
    "Broken pipe",
    "Error writing trailer",
];

/// Options for one recording transcode invocation
#[derive(Debug, Clone)]
pub struct RecordingProcessOptions {
    /// Path to the transcoder binary
    pub binary: String,
    /// Echo stderr live at debug level
    pub verbose: bool,
    /// Grace period before force kill on stop
    pub kill_timeout: Duration,
    /// Maximum silence on stdout while transmitting before the owner
    /// declares the pipeline stuck
    pub idle_timeout: Duration,
    /// Output video codec ("copy" passes the stream through)
    pub video_codec: String,
    /// Requested output fragment duration in milliseconds
    pub fragment_duration_ms: u64,
}

impl RecordingProcessOptions {
    /// Build the transcoder argument vector for fMP4-in, fMP4-out
    fn command_args(&self) -> Vec<String> {
        [
            "-hide_banner",
            "-nostats",
            "-f",
            "mp4",
            "-i",
            "pipe:0",
            "-map",
            "0",
            "-c:v",
            self.video_codec.as_str(),
            "-f",
            "mp4",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof+skip_sidx",
            "-min_frag_duration",
            &(self.fragment_duration_ms * 1000).to_string(),
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// A running recording transcode
pub struct FfmpegRecordingProcess {
    process: Arc<FfmpegProcess>,
    feed_tx: mpsc::Sender<Bytes>,
    segments: Mutex<Option<mpsc::Receiver<Bytes>>>,
    idle_timeout: Duration,
}

impl FfmpegRecordingProcess {
    /// Spawn the recording transcoder
    pub fn start(options: &RecordingProcessOptions) -> Result<Arc<Self>> {
        let mut process_options =
            ProcessOptions::new(options.binary.clone(), options.command_args());
        process_options.verbose = options.verbose;
        process_options.kill_timeout = options.kill_timeout;
        Self::start_with_command(process_options, options.idle_timeout)
    }

    /// Spawn with an explicit command line (tests substitute a fake here)
    pub fn start_with_command(
        options: ProcessOptions,
        idle_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let process = FfmpegProcess::new();
        process.set_classifier(Arc::new(classify_recording_exit));
        process.prepare(options)?;
        process.start(ProcessCallbacks {
            on_ready: None,
            on_fatal: Some(Box::new(|msg| {
                warn!("Recording transcoder failed: {}", msg);
            })),
        })?;

        let (seg_tx, seg_rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
        if let Some(stdout) = process.take_stdout() {
            spawn_segment_pump(stdout, seg_tx);
        }

        let (feed_tx, mut feed_rx) = mpsc::channel::<Bytes>(FEED_QUEUE_CAPACITY);
        if let Some(mut stdin) = process.take_stdin() {
            // Single writer preserves arrival order; each awaited write is
            // the backpressure point when the transcoder falls behind
            tokio::spawn(async move {
                while let Some(chunk) = feed_rx.recv().await {
                    if let Err(e) = stdin.write_all(&chunk).await {
                        debug!("Recording feed ended: {}", e);
                        break;
                    }
                    if let Err(e) = stdin.flush().await {
                        debug!("Recording feed flush failed: {}", e);
                        break;
                    }
                }
                // stdin drops here, signalling EOF to the transcoder
            });
        }

        Ok(Arc::new(Self {
            process,
            feed_tx,
            segments: Mutex::new(Some(seg_rx)),
            idle_timeout,
        }))
    }

    /// Queue one segment for the transcoder's input
    ///
    /// Returns `false` once the writer task is gone.
    pub async fn feed(&self, segment: Bytes) -> bool {
        self.feed_tx.send(segment).await.is_ok()
    }

    /// Take the output segment receiver (available once)
    pub async fn take_segments(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.segments.lock().await.take()
    }

    /// Maximum tolerated stdout silence while transmitting
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn has_error(&self) -> bool {
        self.process.has_error()
    }

    pub fn is_ended(&self) -> bool {
        self.process.is_ended()
    }

    /// Stop the transcoder (idempotent, watchdog-guarded)
    pub fn stop(&self) {
        self.process.stop();
    }
}

/// Recognize exits caused by us tearing down the input side
fn classify_recording_exit(info: &ExitStatusInfo, stderr: &[String]) -> Option<ExitDisposition> {
    if info.killed_by_us {
        return None;
    }
    for line in stderr {
        for signature in BENIGN_STDERR_SIGNATURES {
            if line.contains(signature) {
                return Some(ExitDisposition::Benign(format!(
                    "input pipe closed ({})",
                    signature
                )));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::segmenter::BOX_HEADER_SIZE;

    fn make_box(box_type: &[u8; 4], payload: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(BOX_HEADER_SIZE + payload.len());
        out.extend_from_slice(&((BOX_HEADER_SIZE + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        Bytes::from(out)
    }

    #[test]
    fn test_command_args_shape() {
        let options = RecordingProcessOptions {
            binary: "ffmpeg".to_string(),
            verbose: false,
            kill_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
            video_codec: "copy".to_string(),
            fragment_duration_ms: 4000,
        };
        let args = options.command_args();
        assert!(args.contains(&"pipe:0".to_string()));
        assert!(args.contains(&"pipe:1".to_string()));
        assert!(args.contains(&"4000000".to_string()));
    }

    #[test]
    fn test_benign_classification() {
        let info = ExitStatusInfo {
            code: Some(1),
            signal: None,
            killed_by_us: false,
        };
        let lines = vec!["av_interleaved_write_frame(): Broken pipe".to_string()];
        assert!(matches!(
            classify_recording_exit(&info, &lines),
            Some(ExitDisposition::Benign(_))
        ));
        assert!(classify_recording_exit(&info, &[]).is_none());
    }

    #[tokio::test]
    async fn test_feed_order_preserved_through_pipeline() {
        // `cat` stands in for the transcoder: bytes pass through untouched,
        // so the segmenter re-frames exactly what we fed in order
        let options = ProcessOptions::new(
            "sh",
            vec!["-c".to_string(), "cat".to_string()],
        );
        let pipeline =
            FfmpegRecordingProcess::start_with_command(options, Duration::from_secs(5)).unwrap();
        let mut segments = pipeline.take_segments().await.unwrap();

        let ftyp = make_box(b"ftyp", b"isom");
        let moov = make_box(b"moov", &[1u8; 32]);
        let moof = make_box(b"moof", &[2u8; 16]);
        let mdat = make_box(b"mdat", &[3u8; 48]);

        assert!(pipeline.feed(ftyp.clone()).await);
        assert!(pipeline.feed(moov.clone()).await);
        assert!(pipeline.feed(moof.clone()).await);
        assert!(pipeline.feed(mdat.clone()).await);

        let init = tokio::time::timeout(Duration::from_secs(5), segments.recv())
            .await
            .unwrap()
            .unwrap();
        let mut expected_init = ftyp.to_vec();
        expected_init.extend_from_slice(&moov);
        assert_eq!(&init[..], &expected_init[..]);

        let media = tokio::time::timeout(Duration::from_secs(5), segments.recv())
            .await
            .unwrap()
            .unwrap();
        let mut expected_media = moof.to_vec();
        expected_media.extend_from_slice(&mdat);
        assert_eq!(&media[..], &expected_media[..]);

        pipeline.stop();
    }

    #[tokio::test]
    async fn test_segment_channel_closes_when_process_ends() {
        let options = ProcessOptions::new("sh", vec!["-c".to_string(), "exit 0".to_string()]);
        let pipeline =
            FfmpegRecordingProcess::start_with_command(options, Duration::from_secs(5)).unwrap();
        let mut segments = pipeline.take_segments().await.unwrap();
        // No output: the channel must close rather than leave us hanging
        let got = tokio::time::timeout(Duration::from_secs(5), segments.recv())
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
