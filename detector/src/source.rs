use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use figwatch_common::config::InputConfig;
use figwatch_common::frame::{Frame, FrameError};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How much of the decoder's stderr is kept for error reports.
const STDERR_TAIL_BYTES: usize = 4096;

/// Stream properties known before decoding starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// 0 when the container does not say.
    pub total_frames: u64,
    pub frame_rate: Option<f64>,
}

/// Ordered supply of decoded frames.
///
/// Frames come out with consecutive indices starting at 0. `Ok(None)` marks
/// the end of the stream.
pub trait FrameSource {
    fn info(&self) -> StreamInfo;

    fn next_frame(&mut self) -> impl Future<Output = Result<Option<Frame>, SourceError>> + Send;
}

/// Decodes a video file by piping `ffmpeg` raw `rgb24` output.
pub struct FfmpegSource {
    path: PathBuf,
    info: StreamInfo,
    child: Child,
    stdout: BufReader<ChildStdout>,
    /// Drains stderr while decoding so a chatty decoder never stalls on a
    /// full pipe. Resolves to the tail of what was written.
    stderr_tail: Option<JoinHandle<String>>,
    frame_len: usize,
    next_index: u64,
    finished: bool,
}

impl FfmpegSource {
    /// Probe `path` and start the decoder. Every failure here happens before
    /// the first frame, so callers can report it as a startup error.
    pub async fn open(input: &InputConfig) -> Result<Self, SourceError> {
        let path = input.path.as_path();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }

        let info = probe(&input.ffprobe, path).await?;
        if info.width == 0 || info.height == 0 {
            return Err(SourceError::NoVideoStream(path.to_path_buf()));
        }

        let mut child = Command::new(&input.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Spawn("ffmpeg", e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Spawn("ffmpeg", std::io::Error::other("no stdout handle")))?;
        let stderr_tail = child.stderr.take().map(|pipe| tokio::spawn(drain_tail(pipe)));

        info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            total_frames = info.total_frames,
            frame_rate = info.frame_rate,
            "video opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            info,
            child,
            stdout: BufReader::with_capacity(1 << 20, stdout),
            stderr_tail,
            frame_len: info.width as usize * info.height as usize * 3,
            next_index: 0,
            finished: false,
        })
    }

    async fn finish(&mut self) -> Result<(), SourceError> {
        self.finished = true;
        let status = self.child.wait().await.map_err(SourceError::Read)?;
        if status.success() {
            debug!(frames = self.next_index, "decoder finished");
            return Ok(());
        }

        let stderr = match self.stderr_tail.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if self.next_index == 0 {
            return Err(SourceError::Decode {
                path: self.path.clone(),
                message: stderr,
            });
        }
        warn!(
            status = %status,
            frames = self.next_index,
            stderr = %stderr,
            "decoder exited with an error, treating as end of stream"
        );
        Ok(())
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> StreamInfo {
        self.info
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.frame_len];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .stdout
                .read(&mut buf[filled..])
                .await
                .map_err(SourceError::Read)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < buf.len() {
            if filled > 0 {
                warn!(bytes = filled, expected = buf.len(), "discarding truncated trailing frame");
            }
            self.finish().await?;
            return Ok(None);
        }

        let frame = Frame::from_rgb24(self.next_index, self.info.width, self.info.height, buf)?;
        self.next_index += 1;
        Ok(Some(frame))
    }
}

/// Read `pipe` to the end, keeping only the last few KiB.
async fn drain_tail<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut tail = Vec::with_capacity(STDERR_TAIL_BYTES);
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
            Err(e) => {
                debug!(error = %e, "stopped reading decoder stderr");
                break;
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}

async fn probe(ffprobe: &Path, path: &Path) -> Result<StreamInfo, SourceError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_frames:format=duration",
            "-of",
            "default=noprint_wrappers=1",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| SourceError::Spawn("ffprobe", e))?;

    if !output.status.success() {
        return Err(SourceError::Probe {
            path: path.to_path_buf(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&text).ok_or_else(|| SourceError::NoVideoStream(path.to_path_buf()))
}

/// Parse `key=value` lines from ffprobe. Returns `None` when no video stream
/// dimensions are present.
pub fn parse_probe_output(text: &str) -> Option<StreamInfo> {
    let fields: HashMap<&str, &str> = text
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let width = fields.get("width")?.parse().ok()?;
    let height = fields.get("height")?.parse().ok()?;
    let frame_rate = fields.get("r_frame_rate").and_then(|r| parse_frame_rate(r));

    let total_frames = fields
        .get("nb_frames")
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| {
            let duration: f64 = fields.get("duration")?.parse().ok()?;
            let fps = frame_rate?;
            (duration.is_finite() && duration > 0.0).then(|| (duration * fps).round() as u64)
        })
        .unwrap_or(0);

    Some(StreamInfo {
        width,
        height,
        total_frames,
        frame_rate,
    })
}

/// Parse ffprobe rates such as `30000/1001` or `25`. Zero or malformed rates
/// are unavailable.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("video file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to spawn {0}: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("ffprobe could not read {}: {message}", path.display())]
    Probe { path: PathBuf, message: String },
    #[error("no decodable video stream in {}", .0.display())]
    NoVideoStream(PathBuf),
    #[error("ffmpeg failed to decode {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },
    #[error("failed to read decoded frames: {0}")]
    Read(std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_with_frame_count() {
        let text = "width=1920\nheight=1080\nr_frame_rate=30000/1001\nnb_frames=1800\nduration=60.060000\n";
        let info = parse_probe_output(text).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert_eq!(info.total_frames, 1800);
        let fps = info.frame_rate.unwrap();
        assert!((fps - 29.97).abs() < 0.001);
    }

    #[test]
    fn probe_output_falls_back_to_duration() {
        let text = "width=640\nheight=360\nr_frame_rate=25/1\nnb_frames=N/A\nduration=4.000000\n";
        let info = parse_probe_output(text).unwrap();
        assert_eq!(info.total_frames, 100);
        assert_eq!(info.frame_rate, Some(25.0));
    }

    #[test]
    fn probe_output_without_counts_is_degenerate() {
        let text = "width=640\nheight=360\nr_frame_rate=0/0\nnb_frames=N/A\nduration=N/A\n";
        let info = parse_probe_output(text).unwrap();
        assert_eq!(info.total_frames, 0);
        assert_eq!(info.frame_rate, None);
    }

    #[test]
    fn probe_output_without_video_stream() {
        assert!(parse_probe_output("duration=12.5\n").is_none());
        assert!(parse_probe_output("").is_none());
    }

    #[test]
    fn frame_rates() {
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("10/1"), Some(10.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[tokio::test]
    async fn missing_file_is_reported_before_probing() {
        let input = InputConfig {
            path: PathBuf::from("/no/such/video.mp4"),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        };
        let result = FfmpegSource::open(&input).await;
        assert!(matches!(result, Err(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn stderr_tail_keeps_the_end() {
        let mut noise = vec![b'a'; 10_000];
        noise.extend_from_slice(b"  last words\n");
        let tail = drain_tail(noise.as_slice()).await;
        assert!(tail.ends_with("last words"));
        assert!(tail.len() <= STDERR_TAIL_BYTES);
    }

    #[cfg(unix)]
    mod decoder {
        use crate::source::{FfmpegSource, FrameSource, SourceError};
        use crate::source::fake_decoder::{FakeDecoder, PROBE_4X2};
        use std::time::Duration;

        async fn drain(source: &mut FfmpegSource) -> Vec<u64> {
            let mut indices = Vec::new();
            while let Some(frame) = source.next_frame().await.unwrap() {
                assert_eq!((frame.width(), frame.height()), (4, 2));
                indices.push(frame.index);
            }
            indices
        }

        #[tokio::test]
        async fn reads_every_frame_from_the_pipe() {
            let fake = FakeDecoder::new(PROBE_4X2, "head -c 72 /dev/zero");
            let mut source = FfmpegSource::open(&fake.input()).await.unwrap();
            assert_eq!(source.info().total_frames, 3);
            assert_eq!(source.info().frame_rate, Some(10.0));

            assert_eq!(drain(&mut source).await, vec![0, 1, 2]);
            // stays at end of stream
            assert!(source.next_frame().await.unwrap().is_none());
        }

        #[tokio::test]
        async fn truncated_last_frame_is_dropped() {
            let fake = FakeDecoder::new(PROBE_4X2, "head -c 60 /dev/zero");
            let mut source = FfmpegSource::open(&fake.input()).await.unwrap();
            assert_eq!(drain(&mut source).await, vec![0, 1]);
        }

        #[tokio::test]
        async fn failure_before_first_frame_is_decode_error() {
            let fake = FakeDecoder::new(PROBE_4X2, "echo 'moov atom not found' >&2; exit 1");
            let mut source = FfmpegSource::open(&fake.input()).await.unwrap();
            match source.next_frame().await {
                Err(SourceError::Decode { message, .. }) => {
                    assert!(message.contains("moov atom not found"), "{message}")
                }
                other => panic!("expected decode error, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn failure_after_frames_ends_the_stream() {
            let fake = FakeDecoder::new(PROBE_4X2, "head -c 48 /dev/zero; echo 'corrupt packet' >&2; exit 1");
            let mut source = FfmpegSource::open(&fake.input()).await.unwrap();
            assert_eq!(drain(&mut source).await, vec![0, 1]);
        }

        #[tokio::test]
        async fn noisy_stderr_does_not_stall_decoding() {
            let fake = FakeDecoder::new(
                PROBE_4X2,
                "head -c 300000 /dev/zero | tr '\\000' 'x' >&2; head -c 24 /dev/zero",
            );
            let mut source = FfmpegSource::open(&fake.input()).await.unwrap();
            let first = tokio::time::timeout(Duration::from_secs(10), source.next_frame())
                .await
                .expect("decoder stalled on a full stderr pipe")
                .unwrap();
            assert_eq!(first.map(|f| f.index), Some(0));
        }

        #[tokio::test]
        async fn probe_failure_is_reported() {
            let fake = FakeDecoder::new("echo 'Invalid data found' >&2; exit 1", "true");
            let result = FfmpegSource::open(&fake.input()).await;
            assert!(matches!(result, Err(SourceError::Probe { .. })));
        }
    }
}
