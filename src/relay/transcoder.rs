//! # Audio Transcoding Pipeline
//!
//! Wraps an external decoder process (ffmpeg by default) that turns browser
//! container audio (webm/opus, ogg, mp4, ...) into raw little-endian PCM at the
//! provider's sample rate and channel count.
//!
//! ## Process Layout:
//! ```text
//!  write() ──► unbounded queue ──► [writer task] ──► decoder stdin
//!  decoder stdout ──► [reader task] ──► bounded queue ──► next_output()
//! ```
//!
//! ## Ordering and Backpressure:
//! - One writer task and one reader task, so bytes keep their order both ways
//! - `write()` never blocks the session; the writer task absorbs slow stdin
//! - The reader task drains stdout continuously so the decoder never stalls on a
//!   full pipe. Output is re-chunked to whole sample frames; a trailing partial
//!   frame waits for the next read instead of being dropped
//!
//! ## Shutdown:
//! `stop()` closes stdin, waits up to the grace period for the decoder to flush
//! and exit, then kills it. Calling it again does nothing.

use crate::error::{RelayError, RelayResult};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered PCM buffers between the reader task and the session.
const OUTPUT_QUEUE: usize = 32;

/// Read size for decoder stdout.
const READ_CHUNK: usize = 8 * 1024;

/// Audio format the browser declared for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFormat {
    /// Already 16-bit little-endian PCM at the provider's rate
    Pcm,
    /// Compressed or containerized audio that needs the decoder
    Encoded(String),
}

impl InputFormat {
    pub fn needs_transcoding(&self) -> bool {
        matches!(self, InputFormat::Encoded(_))
    }
}

impl FromStr for InputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "pcm" | "pcm_s16le" | "raw" => Ok(InputFormat::Pcm),
            "webm" | "ogg" | "opus" | "wav" | "mp3" | "mp4" | "m4a" | "aac" | "flac" => {
                Ok(InputFormat::Encoded(normalized))
            }
            _ => Err(format!("unsupported audio format '{}'", value)),
        }
    }
}

/// Decoder invocation, resolved from configuration for one session.
#[derive(Debug, Clone)]
pub struct DecoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DecoderCommand {
    /// Default ffmpeg arguments: read stdin, write raw s16le PCM to stdout.
    pub fn ffmpeg(program: &str, sample_rate: u32, channels: u16) -> Self {
        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-f",
            "s16le",
            "-acodec",
            "pcm_s16le",
            "-ar",
            &sample_rate.to_string(),
            "-ac",
            &channels.to_string(),
            "pipe:1",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();

        Self {
            program: program.to_string(),
            args,
        }
    }
}

/// Handle to a running decoder process.
pub struct Transcoder {
    child: Option<Child>,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    output: mpsc::Receiver<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Transcoder {
    /// Spawn the decoder.
    ///
    /// `frame_bytes` is the size of one PCM sample frame; every buffer handed
    /// out by [`Transcoder::next_output`] is a whole multiple of it.
    pub fn start(command: &DecoderCommand, frame_bytes: usize) -> RelayResult<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::PipelineStart(format!("{}: {}", command.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::PipelineStart("decoder stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::PipelineStart("decoder stdout unavailable".to_string()))?;

        info!(program = %command.program, pid = ?child.id(), "transcoder started");

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);

        let tasks = vec![
            tokio::spawn(feed_stdin(stdin, input_rx)),
            tokio::spawn(drain_stdout(stdout, output_tx, frame_bytes.max(1))),
        ];

        Ok(Self {
            child: Some(child),
            input: Some(input_tx),
            output: output_rx,
            tasks,
        })
    }

    /// Queue compressed audio for the decoder.
    pub fn write(&self, bytes: Vec<u8>) -> RelayResult<()> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| RelayError::Pipeline("transcoder input is closed".to_string()))?;

        input
            .send(bytes)
            .map_err(|_| RelayError::Pipeline("transcoder stopped accepting input".to_string()))
    }

    /// Next PCM buffer in decode order. `None` once the decoder has exited.
    pub async fn next_output(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    /// Close decoder stdin once everything queued so far has been written.
    /// The decoder then flushes and exits, which ends [`Transcoder::next_output`].
    pub fn finish_input(&mut self) {
        self.input.take();
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Close input, let the decoder flush for up to `grace`, then kill it.
    pub async fn stop(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            debug!("transcoder already stopped");
            return;
        };

        // Dropping the sender ends the writer task, which closes stdin.
        self.input.take();
        // Flushed output is not forwarded anymore; the reader keeps draining.
        self.output.close();

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "transcoder exited"),
            Ok(Err(err)) => warn!(error = %err, "failed to wait for transcoder"),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "transcoder did not exit in time, killing");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill transcoder");
                }
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn feed_stdin(
    mut stdin: tokio::process::ChildStdin,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = input.recv().await {
        if let Err(err) = stdin.write_all(&bytes).await {
            warn!(error = %err, "transcoder stdin closed");
            return;
        }
    }

    if let Err(err) = stdin.shutdown().await {
        debug!(error = %err, "transcoder stdin shutdown");
    }
}

async fn drain_stdout(
    mut stdout: tokio::process::ChildStdout,
    output: mpsc::Sender<Vec<u8>>,
    frame_bytes: usize,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let read = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "failed to read transcoder output");
                break;
            }
        };

        pending.extend_from_slice(&buf[..read]);
        let aligned = pending.len() - pending.len() % frame_bytes;
        if aligned == 0 {
            continue;
        }

        let remainder = pending.split_off(aligned);
        let ready = std::mem::replace(&mut pending, remainder);

        // Once the session stops listening, keep reading so the decoder can exit.
        if !output.is_closed() && output.send(ready).await.is_err() {
            debug!("transcoder output receiver closed");
        }
    }

    if !pending.is_empty() {
        debug!(bytes = pending.len(), "discarding trailing partial sample frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat() -> DecoderCommand {
        DecoderCommand {
            program: "cat".to_string(),
            args: Vec::new(),
        }
    }

    async fn collect(transcoder: &mut Transcoder, expected: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < expected {
            let next = tokio::time::timeout(Duration::from_secs(5), transcoder.next_output())
                .await
                .expect("transcoder output timed out")
                .expect("transcoder exited early");
            out.extend(next);
        }
        out
    }

    #[test]
    fn test_input_format_parsing() {
        assert_eq!("pcm".parse::<InputFormat>(), Ok(InputFormat::Pcm));
        assert_eq!("RAW".parse::<InputFormat>(), Ok(InputFormat::Pcm));
        assert_eq!(
            "WebM".parse::<InputFormat>(),
            Ok(InputFormat::Encoded("webm".to_string()))
        );
        assert!("midi".parse::<InputFormat>().is_err());
        assert!(!InputFormat::Pcm.needs_transcoding());
        assert!(InputFormat::Encoded("ogg".into()).needs_transcoding());
    }

    #[test]
    fn test_ffmpeg_arguments() {
        let command = DecoderCommand::ffmpeg("ffmpeg", 16_000, 1);
        assert_eq!(command.program, "ffmpeg");
        let joined = command.args.join(" ");
        assert!(joined.contains("-i pipe:0"));
        assert!(joined.contains("-f s16le"));
        assert!(joined.contains("-ar 16000"));
        assert!(joined.contains("-ac 1"));
        assert!(joined.ends_with("pipe:1"));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let command = DecoderCommand {
            program: "transcript-relay-no-such-decoder".to_string(),
            args: Vec::new(),
        };
        let result = Transcoder::start(&command, 2);
        assert!(matches!(result, Err(RelayError::PipelineStart(_))));
    }

    #[tokio::test]
    async fn test_output_preserves_order() {
        let mut transcoder = Transcoder::start(&cat(), 2).unwrap();

        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![i; 64];
            expected.extend_from_slice(&chunk);
            transcoder.write(chunk).unwrap();
        }

        let out = collect(&mut transcoder, expected.len()).await;
        assert_eq!(out, expected);

        transcoder.stop(Duration::from_secs(2)).await;
        assert!(!transcoder.is_running());
    }

    #[tokio::test]
    async fn test_partial_frames_are_carried_over() {
        let mut transcoder = Transcoder::start(&cat(), 4).unwrap();

        transcoder.write(vec![1, 2, 3]).unwrap();
        transcoder.write(vec![4, 5]).unwrap();
        transcoder.write(vec![6, 7, 8]).unwrap();

        let out = collect(&mut transcoder, 8).await;
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        transcoder.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_input() {
        let mut transcoder = Transcoder::start(&cat(), 2).unwrap();
        transcoder.stop(Duration::from_secs(2)).await;
        transcoder.stop(Duration::from_secs(2)).await;

        assert!(matches!(transcoder.write(vec![0, 0]), Err(RelayError::Pipeline(_))));
        assert_eq!(transcoder.next_output().await, None);
    }

    #[tokio::test]
    async fn test_stop_kills_decoder_that_ignores_eof() {
        let command = DecoderCommand {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
        };
        let mut transcoder = Transcoder::start(&command, 2).unwrap();

        let started = std::time::Instant::now();
        transcoder.stop(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!transcoder.is_running());
    }

    #[tokio::test]
    async fn test_exit_ends_output() {
        let command = DecoderCommand {
            program: "true".to_string(),
            args: Vec::new(),
        };
        let mut transcoder = Transcoder::start(&command, 2).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), transcoder.next_output())
            .await
            .expect("decoder exit was not observed");
        assert_eq!(next, None);
        transcoder.stop(Duration::from_secs(1)).await;
    }
}
