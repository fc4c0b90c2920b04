//! Image-sequence clips played back at a fixed native frame rate.
//!
//! A clip is a directory of JPEG/PNG frames ordered by file name. A background
//! thread decodes ahead into a bounded channel; the capture tick only drains
//! completed frames from it and never waits for a decode.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::decoder;
use crate::capture::frame::{CaptureTick, FrameBuffer};
use crate::diagnostics::{Diagnostics, LogCategory, Severity};
use crate::error::{Result, VcamError};

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipEndPolicy {
    /// Restart from the first frame
    #[default]
    Loop,
    /// Keep showing the last frame
    Hold,
}

/// Time base that drives playback position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackClock {
    /// Wall-clock time since the first fetch
    #[default]
    Wall,
    /// Host capture timestamps since the first fetch
    Capture,
}

#[derive(Debug, Clone)]
pub struct ClipOptions {
    pub fps: f32,
    pub end_policy: ClipEndPolicy,
    pub clock: PlaybackClock,
    /// Decoded frames buffered ahead of playback
    pub read_ahead: usize,
    pub max_resolution: Option<(u32, u32)>,
}

impl Default for ClipOptions {
    fn default() -> Self {
        Self {
            fps: 30.0,
            end_policy: ClipEndPolicy::Loop,
            clock: PlaybackClock::Wall,
            read_ahead: 4,
            max_resolution: None,
        }
    }
}

struct Decoded {
    position: u64,
    frame: Result<Arc<FrameBuffer>>,
}

pub struct FileClipSource {
    path: PathBuf,
    options: ClipOptions,
    frame_count: usize,
    rx: Receiver<Decoded>,
    stop: Arc<AtomicBool>,
    epoch: Instant,
    started: Option<Duration>,
    current: Option<Arc<FrameBuffer>>,
    position: Option<u64>,
    diagnostics: Diagnostics,
}

impl FileClipSource {
    /// List the clip's frames and start the read-ahead decoder.
    #[instrument(skip(options, diagnostics), fields(path = %path.display()))]
    pub fn open(path: &Path, options: ClipOptions, diagnostics: Diagnostics) -> Result<Self> {
        if !(options.fps.is_finite() && options.fps > 0.0) {
            return Err(VcamError::Config(format!(
                "clip fps must be positive, got {}",
                options.fps
            )));
        }

        let files = list_frames(path)?;
        if files.is_empty() {
            return Err(VcamError::decode(path.display().to_string(), "clip contains no frames"));
        }
        let frame_count = files.len();

        let (tx, rx) = flume::bounded(options.read_ahead.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            files,
            end_policy: options.end_policy,
            max_resolution: options.max_resolution,
            tx,
            stop: stop.clone(),
        };
        std::thread::Builder::new()
            .name("vcam-clip-decoder".into())
            .spawn(move || worker.run())
            .map_err(|e| VcamError::io(path, e))?;

        info!(frame_count, fps = options.fps, policy = ?options.end_policy, "clip opened");
        Ok(Self {
            path: path.to_path_buf(),
            options,
            frame_count,
            rx,
            stop,
            epoch: Instant::now(),
            started: None,
            current: None,
            position: None,
            diagnostics,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Absolute playback position of the frame currently shown.
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    /// Advance playback to the position implied by elapsed time and return the
    /// frame for it. Drains only frames that are already decoded.
    pub fn fetch_latest(&mut self, tick: &CaptureTick) -> Option<Arc<FrameBuffer>> {
        let now = match self.options.clock {
            PlaybackClock::Wall => self.epoch.elapsed(),
            PlaybackClock::Capture => tick.timestamp,
        };
        let start = *self.started.get_or_insert(now);
        let elapsed = now.saturating_sub(start);

        let mut target = (elapsed.as_secs_f64() * self.options.fps as f64).floor() as u64;
        if self.options.end_policy == ClipEndPolicy::Hold {
            target = target.min(self.frame_count as u64 - 1);
        }

        while self.position.map_or(true, |p| p < target) {
            match self.rx.try_recv() {
                Ok(decoded) => {
                    match decoded.frame {
                        Ok(frame) => self.current = Some(frame),
                        Err(err) => {
                            warn!(
                                position = decoded.position,
                                %err,
                                "clip frame failed to decode, reusing previous"
                            );
                            self.diagnostics.issue(
                                LogCategory::Video,
                                Severity::Warning,
                                format!("clip frame {} failed to decode: {err}", decoded.position),
                            );
                        }
                    }
                    self.position = Some(decoded.position);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.current.clone()
    }
}

impl Drop for FileClipSource {
    fn drop(&mut self) {
        // The worker also exits on its own once the receiver is gone
        self.stop.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for FileClipSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileClipSource")
            .field("path", &self.path)
            .field("frame_count", &self.frame_count)
            .field("position", &self.position)
            .finish()
    }
}

struct Worker {
    files: Vec<PathBuf>,
    end_policy: ClipEndPolicy,
    max_resolution: Option<(u32, u32)>,
    tx: Sender<Decoded>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        let n = self.files.len() as u64;
        for position in 0u64.. {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self.end_policy == ClipEndPolicy::Hold && position >= n {
                break;
            }

            let path = &self.files[(position % n) as usize];
            let frame = decoder::decode_image_file(path)
                .and_then(|frame| match self.max_resolution {
                    Some(max) => decoder::fit_within(frame, max),
                    None => Ok(frame),
                })
                .map(Arc::new);

            if self.tx.send(Decoded { position, frame }).is_err() {
                break;
            }
        }
        debug!("clip decoder finished");
    }
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| VcamError::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| VcamError::io(dir, e))?.path();
        let is_frame = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_frame {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FormatDescriptor, PixelFormat};

    const COLORS: [[u8; 3]; 3] = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];

    fn clip_dir(corrupt_middle: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (i, color) in COLORS.iter().enumerate() {
            let path = dir.path().join(format!("frame_{i:03}.png"));
            if corrupt_middle && i == 1 {
                std::fs::write(&path, b"definitely not a png").unwrap();
            } else {
                image::RgbImage::from_pixel(8, 8, image::Rgb(*color)).save(&path).unwrap();
            }
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        dir
    }

    fn tick(ms: u64) -> CaptureTick {
        CaptureTick::new(
            FormatDescriptor::new(8, 8, PixelFormat::Rgb24),
            Duration::from_millis(ms),
        )
    }

    fn options(policy: ClipEndPolicy) -> ClipOptions {
        ClipOptions {
            fps: 10.0,
            end_policy: policy,
            clock: PlaybackClock::Capture,
            read_ahead: 2,
            max_resolution: None,
        }
    }

    /// Fetch until the decoder has caught up with the tick's position.
    fn settle(clip: &mut FileClipSource, at: CaptureTick, position: u64) -> Arc<FrameBuffer> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = clip.fetch_latest(&at) {
                if clip.position() == Some(position) {
                    return frame;
                }
            }
            assert!(Instant::now() < deadline, "clip never reached position {position}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn advances_with_capture_time_and_loops() {
        let dir = clip_dir(false);
        let options = options(ClipEndPolicy::Loop);
        let mut clip =
            FileClipSource::open(dir.path(), options, Diagnostics::tracing_only()).unwrap();
        assert_eq!(clip.frame_count(), 3);

        let schedule = [(0, 0, 0), (105, 1, 1), (250, 2, 2), (305, 3, 0), (415, 4, 1)];
        for (ms, position, color) in schedule {
            let frame = settle(&mut clip, tick(1_000 + ms), position);
            assert_eq!(&frame.data()[..3], &COLORS[color], "at {ms} ms");
        }
    }

    #[test]
    fn hold_policy_freezes_on_last_frame() {
        let dir = clip_dir(false);
        let options = options(ClipEndPolicy::Hold);
        let mut clip =
            FileClipSource::open(dir.path(), options, Diagnostics::tracing_only()).unwrap();
        settle(&mut clip, tick(0), 0);
        let frame = settle(&mut clip, tick(5_000), 2);
        assert_eq!(&frame.data()[..3], &COLORS[2]);
    }

    #[test]
    fn wall_clock_paces_frames_without_capture_time() {
        let dir = clip_dir(false);
        let options = ClipOptions {
            clock: PlaybackClock::Wall,
            ..options(ClipEndPolicy::Hold)
        };
        let started = Instant::now();
        let mut clip =
            FileClipSource::open(dir.path(), options, Diagnostics::tracing_only()).unwrap();

        // Capture time never moves, only the wall clock does
        let frame = settle(&mut clip, tick(0), 2);
        assert_eq!(&frame.data()[..3], &COLORS[2]);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn decode_failure_reuses_previous_frame() {
        let dir = clip_dir(true);
        let (diagnostics, events) = Diagnostics::channel(8);
        let options = options(ClipEndPolicy::Hold);
        let mut clip = FileClipSource::open(dir.path(), options, diagnostics).unwrap();
        settle(&mut clip, tick(0), 0);
        let frame = settle(&mut clip, tick(105), 1);
        assert_eq!(&frame.data()[..3], &COLORS[0]);
        assert_eq!(events.drain().count(), 1);
    }

    #[test]
    fn empty_directory_cannot_be_opened() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileClipSource::open(dir.path(), ClipOptions::default(), Diagnostics::tracing_only()),
            Err(VcamError::DecodeFailed { .. })
        ));
    }
}
