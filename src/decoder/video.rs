use super::{
    ppm::{self, PpmError},
    DecodeError,
};
use crate::{config::DecoderConfig, frame::Frame};
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::{
    cmp::Ordering, collections::VecDeque, io::Write, process::ExitStatus, process::Stdio,
    sync::Arc, time::Duration,
};
use tempfile::NamedTempFile;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};

const STDERR_TAIL_LINES: usize = 8;
const TIMESTAMP_WAIT: Duration = Duration::from_millis(500);
const EXIT_WAIT: Duration = Duration::from_secs(2);
const STDOUT_BUFFER: usize = 64 * 1024;

pub(super) fn frames(
    config: DecoderConfig,
    payload: Bytes,
    max_frames: Option<usize>,
) -> impl Stream<Item = Result<Frame, DecodeError>> + Send {
    try_stream! {
        if let Ok(format) = image::guess_format(&payload) {
            Err::<(), _>(DecodeError::NotAVideo(format))?;
        }

        let mut process = FfmpegProcess::spawn(&config, payload).await?;
        let mut produced = 0;
        loop {
            if max_frames.is_some_and(|limit| produced >= limit) {
                process.stop().await;
                break;
            }
            match process.next_frame(produced).await? {
                Some(frame) => {
                    produced += 1;
                    yield frame;
                }
                None => {
                    process.finish(produced).await?;
                    break;
                }
            }
        }
    }
}

fn parse_pts_time(line: &str) -> Option<f64> {
    line.split_whitespace()
        .find_map(|token| token.strip_prefix("pts_time:"))
        .and_then(|value| value.parse().ok())
}

/// Frame number of a `showinfo` line. ffmpeg pads it, so the value may be a
/// separate token (`n:   2`).
fn parse_frame_number(line: &str) -> Option<usize> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if let Some(rest) = token.strip_prefix("n:") {
            let value = if rest.is_empty() { tokens.next()? } else { rest };
            return value.parse().ok();
        }
    }
    None
}

type ShowInfo = (usize, Option<f64>);

async fn read_stderr(
    stderr: ChildStderr,
    timestamps: mpsc::UnboundedSender<ShowInfo>,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains("Parsed_showinfo") {
            if let Some(n) = parse_frame_number(&line) {
                let _ = timestamps.send((n, parse_pts_time(&line)));
            }
            continue;
        }
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// `showinfo` reports keyed by frame number. A report that shows up after its
/// frame gave up waiting is discarded instead of shifting later frames.
struct Timestamps {
    receiver: mpsc::UnboundedReceiver<ShowInfo>,
    ahead: Option<ShowInfo>,
}

impl Timestamps {
    fn new(receiver: mpsc::UnboundedReceiver<ShowInfo>) -> Self {
        Self {
            receiver,
            ahead: None,
        }
    }

    async fn take(&mut self, index: usize, wait: Duration) -> Option<f64> {
        loop {
            let (n, pts) = match self.ahead.take() {
                Some(report) => report,
                None => match timeout(wait, self.receiver.recv()).await {
                    Ok(Some(report)) => report,
                    _ => return None,
                },
            };
            match n.cmp(&index) {
                Ordering::Less => continue,
                Ordering::Equal => return pts,
                Ordering::Greater => {
                    self.ahead = Some((n, pts));
                    return None;
                }
            }
        }
    }
}

/// An ffmpeg child decoding one spooled payload into a PPM stream on stdout.
/// The child is killed when this value is dropped.
pub struct FfmpegProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
    timestamps: Timestamps,
    tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
    sample_fps: Option<f64>,
    max_pixels: u64,
    _input: NamedTempFile,
}

impl FfmpegProcess {
    pub async fn spawn(config: &DecoderConfig, payload: Bytes) -> Result<Self, DecodeError> {
        // Containers such as mp4 may need to seek, so the payload goes to a file
        // rather than a pipe.
        let input = tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
            let mut file = NamedTempFile::new()?;
            file.write_all(&payload)?;
            file.flush()?;
            Ok(file)
        })
        .await?
        .map_err(DecodeError::Spool)?;

        let filter = match config.sample_fps {
            Some(fps) => format!("fps={},showinfo", fps),
            None => "showinfo".to_string(),
        };

        let mut cmd = Command::new(&config.ffmpeg_path);
        cmd.arg("-hide_banner")
            .arg("-nostdin")
            .arg("-nostats")
            .arg("-loglevel")
            .arg("info")
            .arg("-i")
            .arg(input.path())
            .arg("-map")
            .arg("0:v:0")
            .arg("-vf")
            .arg(&filter)
            .arg("-vsync")
            .arg("passthrough")
            .arg("-f")
            .arg("image2pipe")
            .arg("-c:v")
            .arg("ppm")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("pipe:1");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(DecodeError::Spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DecodeError::Stream("failed to capture ffmpeg stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DecodeError::Stream("failed to capture ffmpeg stderr".into()))?;

        let (timestamps_tx, timestamps) = mpsc::unbounded_channel();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = tokio::spawn(read_stderr(stderr, timestamps_tx, tail.clone()));

        tracing::debug!(pid = child.id(), "Spawned ffmpeg");

        Ok(Self {
            child,
            stdout: BufReader::with_capacity(STDOUT_BUFFER, stdout),
            timestamps: Timestamps::new(timestamps),
            tail,
            stderr_task: Some(stderr_task),
            sample_fps: config.sample_fps,
            max_pixels: config.max_pixels,
            _input: input,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Reads the next frame, or `None` once ffmpeg closed its output.
    pub async fn next_frame(&mut self, index: usize) -> Result<Option<Frame>, DecodeError> {
        let raw = match ppm::read_frame(&mut self.stdout, self.max_pixels).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(PpmError::TooLarge {
                width,
                height,
                max_pixels,
            }) => {
                return Err(DecodeError::TooLarge {
                    width,
                    height,
                    max_pixels,
                })
            }
            Err(err) => return Err(self.explain(err).await),
        };

        let timestamp = match self.timestamps.take(index, TIMESTAMP_WAIT).await {
            Some(pts) => pts,
            None => self
                .sample_fps
                .map(|fps| index as f64 / fps)
                .unwrap_or(0.0),
        };

        Frame::rgb8(index, raw.width, raw.height, raw.pixels, timestamp)
            .map(Some)
            .ok_or_else(|| DecodeError::Stream("frame buffer does not match its header".into()))
    }

    /// Waits for ffmpeg to exit after its output was fully consumed.
    pub async fn finish(&mut self, produced: usize) -> Result<(), DecodeError> {
        let status = self.child.wait().await.map_err(DecodeError::Spawn)?;
        if !status.success() {
            return Err(self.subprocess_error(status).await);
        }
        if produced == 0 {
            return Err(DecodeError::Empty);
        }
        tracing::debug!(frames = produced, "ffmpeg finished");
        Ok(())
    }

    /// Kills ffmpeg before it reached the end of its input.
    pub async fn stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("ffmpeg already exited: {}", e);
        }
        let _ = self.child.wait().await;
        tracing::debug!("Stopped ffmpeg at frame cap");
    }

    async fn explain(&mut self, err: PpmError) -> DecodeError {
        match timeout(EXIT_WAIT, self.child.wait()).await {
            Ok(Ok(status)) if !status.success() => self.subprocess_error(status).await,
            _ => DecodeError::Stream(err.to_string()),
        }
    }

    async fn subprocess_error(&mut self, status: ExitStatus) -> DecodeError {
        if let Some(task) = self.stderr_task.take() {
            let _ = timeout(EXIT_WAIT, task).await;
        }
        let stderr = self
            .tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ");
        tracing::warn!(%status, stderr = %stderr, "ffmpeg failed");
        DecodeError::Subprocess { status, stderr }
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}
