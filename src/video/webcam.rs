//! V4L2 webcam capture.
//!
//! Only V4L2 `VIDEO_CAPTURE` devices yielding JFIF JPEG or Motion JPEG frames are supported. On
//! other platforms, [`WebcamSource::acquire`] fails with [`Error::UnsupportedEnvironment`].

use std::{
    cmp::Reverse,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::JoinHandle,
};

use async_trait::async_trait;

use super::{CaptureConstraints, CaptureSource, Resolution, TimedFrame, VideoStream};
use crate::Error;

const ENV_VAR_WEBCAM_NAME: &str = "HANDSIGNAL_WEBCAM_NAME";

/// Opens V4L2 webcams.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebcamSource;

#[async_trait]
impl CaptureSource for WebcamSource {
    type Stream = WebcamStream;

    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<WebcamStream, Error> {
        check_environment()?;

        let shared = Arc::new(Shared::default());
        let (thread, ready) = spawn_capture(constraints.clone(), shared.clone())?;
        let stream = WebcamStream::new(shared, thread);

        // The stream is dropped (and the capture thread stopped and joined) on every error path
        // below.
        match ready.await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) if crate::error::is_permission_denied(&e) => {
                Err(Error::PermissionDenied(format!("{e:#}")))
            }
            Ok(Err(e)) => Err(Error::Capture(format!("{e:#}"))),
            Err(_) => Err(Error::Capture(
                "capture thread exited before delivering a frame".into(),
            )),
        }
    }
}

#[cfg(target_os = "linux")]
fn check_environment() -> Result<(), Error> {
    let has_device = std::fs::read_dir("/dev")
        .map(|entries| {
            entries.filter_map(Result::ok).any(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| name.starts_with("video"))
            })
        })
        .unwrap_or(false);
    if has_device {
        Ok(())
    } else {
        Err(Error::UnsupportedEnvironment(
            "no video capture devices found".into(),
        ))
    }
}

#[cfg(not(target_os = "linux"))]
fn check_environment() -> Result<(), Error> {
    Err(Error::UnsupportedEnvironment(
        "webcam capture is only implemented for V4L2 on Linux".into(),
    ))
}

#[derive(Default)]
struct Shared {
    latest: Mutex<Option<TimedFrame>>,
    /// Set by the capture thread when the device fails after delivering frames.
    failure: Mutex<Option<Error>>,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A running webcam capture.
///
/// Dropping the stream stops it.
pub struct WebcamStream {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WebcamStream {
    fn new(shared: Arc<Shared>, thread: JoinHandle<()>) -> Self {
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }
}

impl VideoStream for WebcamStream {
    fn current_frame(&self) -> Result<Option<TimedFrame>, Error> {
        if let Some(e) = &*lock(&self.shared.failure) {
            return Err(e.clone());
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(lock(&self.shared.latest).clone())
    }

    /// Stops capturing and waits for the capture thread to close the device.
    ///
    /// The capture thread checks for this between frames and while waiting for one, so this
    /// blocks for at most one frame decode.
    fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            log::debug!("stopping webcam capture");
        }
        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        match thread.join() {
            Ok(()) => log::debug!("webcam capture thread joined"),
            Err(_) => log::error!("webcam capture thread panicked"),
        }
    }
}

impl Drop for WebcamStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameFormat<I> {
    resolution: Resolution,
    frame_interval: I,
}

/// Picks the smallest resolution covering `wanted`, at the shortest frame interval available for
/// it. If nothing covers `wanted`, the largest resolution is used instead.
fn pick_format<I: Ord + Copy>(
    formats: &[FrameFormat<I>],
    wanted: Resolution,
) -> Option<FrameFormat<I>> {
    formats
        .iter()
        .filter(|fmt| fmt.resolution.covers(wanted))
        .min_by_key(|fmt| (fmt.resolution.num_pixels(), fmt.frame_interval))
        .or_else(|| {
            log::debug!("no format covers {wanted}, using the largest one");
            formats
                .iter()
                .max_by_key(|fmt| (fmt.resolution.num_pixels(), Reverse(fmt.frame_interval)))
        })
        .copied()
}

type Ready = tokio::sync::oneshot::Receiver<anyhow::Result<()>>;

#[cfg(target_os = "linux")]
fn spawn_capture(
    constraints: CaptureConstraints,
    shared: Arc<Shared>,
) -> Result<(JoinHandle<()>, Ready), Error> {
    let (ready, ready_rx) = tokio::sync::oneshot::channel();
    let thread = std::thread::Builder::new()
        .name("webcam".into())
        .spawn(move || v4l2::run(constraints, shared, ready))
        .map_err(|e| Error::Capture(format!("failed to spawn capture thread: {e}")))?;
    Ok((thread, ready_rx))
}

#[cfg(not(target_os = "linux"))]
fn spawn_capture(
    _constraints: CaptureConstraints,
    _shared: Arc<Shared>,
) -> Result<(JoinHandle<()>, Ready), Error> {
    Err(Error::UnsupportedEnvironment(
        "webcam capture is only implemented for V4L2 on Linux".into(),
    ))
}

#[cfg(target_os = "linux")]
mod v4l2 {
    use std::{
        env,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    use anyhow::{bail, Context};
    use linuxvideo::{
        format::{FrameIntervals, FrameSizes, PixFormat, PixelFormat},
        stream::ReadStream,
        BufType, CapabilityFlags, Device, Fract,
    };
    use tokio::sync::oneshot;

    use super::{lock, pick_format, FrameFormat, Shared, ENV_VAR_WEBCAM_NAME};
    use crate::{
        timer::{FpsCounter, Timer},
        video::{CaptureConstraints, Facing, Frame, Resolution, TimedFrame},
        Error,
    };

    /// How often to check for a stop request while waiting for the next frame.
    const POLL_INTERVAL: Duration = Duration::from_millis(5);

    /// Capture thread body. Opens the device, then publishes decoded frames into `shared` until
    /// the stream is stopped or the device fails. The device is closed when this returns.
    pub(super) fn run(
        constraints: CaptureConstraints,
        shared: Arc<Shared>,
        ready: oneshot::Sender<anyhow::Result<()>>,
    ) {
        let mut webcam = match Webcam::open(&constraints) {
            Ok(webcam) => webcam,
            Err(e) => {
                ready.send(Err(e)).ok();
                return;
            }
        };

        let mut ready = Some(ready);
        let mut fps = FpsCounter::new("webcam");
        let epoch = Instant::now();
        while !shared.stopped.load(Ordering::Acquire) {
            match webcam.read(&shared.stopped) {
                Ok(Some(frame)) => {
                    let timed = TimedFrame {
                        media_time: epoch.elapsed(),
                        frame: Arc::new(frame),
                    };
                    *lock(&shared.latest) = Some(timed);
                    if let Some(ready) = ready.take() {
                        log::debug!("first webcam frame decoded");
                        ready.send(Ok(())).ok();
                    }
                    fps.tick_with(webcam.timers());
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("webcam read failed: {e:#}");
                    match ready.take() {
                        Some(ready) => {
                            ready.send(Err(e)).ok();
                        }
                        None => *lock(&shared.failure) = Some(Error::Capture(format!("{e:#}"))),
                    }
                    break;
                }
            }
        }

        log::debug!("webcam capture thread exiting");
    }

    struct Webcam {
        stream: ReadStream,
        t_dequeue: Timer,
        t_decode: Timer,
    }

    impl Webcam {
        fn open(constraints: &CaptureConstraints) -> anyhow::Result<Self> {
            let name = env::var(ENV_VAR_WEBCAM_NAME)
                .ok()
                .or_else(|| constraints.device.clone());
            if let Some(name) = &name {
                log::debug!("looking for webcam '{name}'");
            }
            if constraints.facing != Facing::User {
                log::debug!("V4L2 has no facing mode, ignoring {:?}", constraints.facing);
            }

            let mut denied = None;
            for res in linuxvideo::list()? {
                let result = res
                    .map_err(anyhow::Error::from)
                    .and_then(|dev| Self::open_impl(dev, name.as_deref(), constraints.resolution));
                match result {
                    Ok(Some(webcam)) => return Ok(webcam),
                    Ok(None) => {}
                    Err(e) if crate::error::is_permission_denied(&e) => {
                        log::warn!("{e:#}");
                        denied = Some(e);
                    }
                    Err(e) => log::debug!("{e:#}"),
                }
            }

            if let Some(e) = denied {
                return Err(e.context("no accessible webcam device"));
            }
            bail!("no supported webcam device found")
        }

        fn open_impl(
            dev: Device,
            name: Option<&str>,
            resolution: Resolution,
        ) -> anyhow::Result<Option<Self>> {
            let path = dev.path()?;
            let caps = dev
                .capabilities()
                .with_context(|| format!("failed to query {}", path.display()))?;
            if let Some(name) = name {
                if caps.card() != name {
                    return Ok(None);
                }
            }

            let cap_flags = caps.device_capabilities();
            log::debug!(
                "device {} ({}) capabilities: {:?}",
                caps.card(),
                path.display(),
                cap_flags,
            );
            if !cap_flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
                return Ok(None);
            }

            let (pixfmt, fract) = negotiate_format(&dev, resolution)?;
            let capture = dev.video_capture(pixfmt)?;
            let format = capture.format();
            let (width, height) = (format.width(), format.height());
            let actual = capture.set_frame_interval(fract)?;

            log::info!(
                "opened {} ({}), {}x{} @ {:.1}Hz",
                caps.card(),
                path.display(),
                width,
                height,
                1.0 / actual.as_f32(),
            );

            Ok(Some(Self {
                stream: capture.into_stream()?,
                t_dequeue: Timer::new("dequeue"),
                t_decode: Timer::new("decode"),
            }))
        }

        /// Reads the next frame, waiting until one is available or `stopped` is set.
        ///
        /// Returns `Ok(None)` when stopped and for frames that fail to decode.
        fn read(&mut self, stopped: &AtomicBool) -> anyhow::Result<Option<Frame>> {
            let t_decode = &self.t_decode;
            let dequeue_guard = self.t_dequeue.start();
            while self.stream.will_block()? {
                if stopped.load(Ordering::Acquire) {
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
            self.stream
                .dequeue(|buf| {
                    drop(dequeue_guard);
                    let decoded = t_decode.time(|| {
                        image::load_from_memory_with_format(&buf, image::ImageFormat::Jpeg)
                    });
                    match decoded {
                        Ok(image) => Ok(Some(image.to_rgb8())),
                        Err(e) => {
                            // Webcams produce the occasional corrupted MJPG frame. Skip it rather
                            // than hand a blank image to inference.
                            log::warn!("webcam decode error: {e}");
                            Ok(None)
                        }
                    }
                })
                .map_err(Into::into)
        }

        fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
            [&self.t_dequeue, &self.t_decode].into_iter()
        }
    }

    fn negotiate_format(device: &Device, wanted: Resolution) -> anyhow::Result<(PixFormat, Fract)> {
        let mut pixel_format = None;
        for format in device.formats(BufType::VIDEO_CAPTURE) {
            let format = format?;
            let fourcc = format.pixel_format();
            if fourcc == PixelFormat::JPEG || fourcc == PixelFormat::MJPG {
                pixel_format = Some(fourcc);
                break;
            }
        }
        let Some(pixel_format) = pixel_format else {
            bail!("no supported pixel format found");
        };

        let mut formats = Vec::new();
        match device.frame_sizes(pixel_format)? {
            FrameSizes::Discrete(sizes) => {
                for size in sizes {
                    let intervals =
                        match device.frame_intervals(pixel_format, size.width(), size.height())? {
                            FrameIntervals::Discrete(intervals) => intervals,
                            FrameIntervals::Stepwise(_) | FrameIntervals::Continuous(_) => {
                                bail!("stepwise or continuous frame rates are not supported")
                            }
                        };
                    for rate in intervals {
                        formats.push(FrameFormat {
                            resolution: Resolution::new(size.width(), size.height()),
                            frame_interval: *rate.fract(),
                        });
                    }
                }
            }
            FrameSizes::Stepwise(_) | FrameSizes::Continuous(_) => {
                bail!("stepwise or continuous resolutions are not supported");
            }
        }

        let Some(fmt) = pick_format(&formats, wanted) else {
            bail!("device reports no frame sizes");
        };
        Ok((
            PixFormat::new(
                fmt.resolution.width(),
                fmt.resolution.height(),
                pixel_format,
            ),
            fmt.frame_interval,
        ))
    }
}
