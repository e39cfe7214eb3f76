//! The per-frame inference loop.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    hand::gesture::{GestureClassifier, GestureSignal},
    nn::HandLandmarker,
    timer::FpsCounter,
    video::{TimedFrame, VideoStream},
    Error,
};

/// What happened during one [`FrameLoop::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// The stream has no frame to offer.
    NoFrame,
    /// The current frame was already processed.
    Skipped,
    /// Inference failed on the current frame.
    Failed,
    Processed(GestureSignal),
    /// The camera failed for good. No further frames will arrive.
    StreamFailed(Error),
}

/// The body of the frame loop, without the scheduling.
pub struct FrameLoop<E, V> {
    engine: E,
    stream: V,
    classifier: GestureClassifier,
    last_media_time: Option<Duration>,
    epoch: Instant,
    fps: FpsCounter,
    stalled: bool,
}

impl<E: HandLandmarker, V: VideoStream> FrameLoop<E, V> {
    pub fn new(engine: E, stream: V, classifier: GestureClassifier) -> Self {
        Self {
            engine,
            stream,
            classifier,
            last_media_time: None,
            epoch: Instant::now(),
            fps: FpsCounter::new("frame loop"),
            stalled: false,
        }
    }

    /// Processes the stream's current frame if its media time differs from the last one seen.
    pub fn tick(&mut self) -> Tick {
        let current = match self.stream.current_frame() {
            Ok(current) => current,
            Err(e) => return Tick::StreamFailed(e),
        };
        let Some(TimedFrame { media_time, frame }) = current else {
            if !self.stalled && self.last_media_time.is_some() {
                log::warn!("camera stream stopped delivering frames");
            }
            self.stalled = true;
            return Tick::NoFrame;
        };
        self.stalled = false;
        if self.last_media_time == Some(media_time) {
            return Tick::Skipped;
        }
        self.last_media_time = Some(media_time);

        let timestamp = self.epoch.elapsed();
        match self.engine.detect_for_video(&frame, timestamp) {
            Ok(result) => {
                let signal = self.classifier.classify(&result);
                self.fps.tick_with(self.engine.timers());
                Tick::Processed(signal)
            }
            Err(e) => {
                log::warn!("hand landmark detection failed, skipping frame: {e:#}");
                Tick::Failed
            }
        }
    }
}

/// A stream that is stopped at most once, by whoever gets there first.
struct Owned<V> {
    stream: V,
    stopped: AtomicBool,
}

impl<V: VideoStream> VideoStream for Owned<V> {
    fn current_frame(&self) -> Result<Option<TimedFrame>, Error> {
        self.stream.current_frame()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stream.stop();
            log::debug!("camera stream stopped");
        }
    }
}

/// Runs a [`FrameLoop`] at a fixed cadence and owns the camera stream it reads from.
///
/// The stream is stopped exactly once: when it fails, by [`stop`](Self::stop), or when the
/// scheduler is dropped.
pub struct FrameScheduler<V: VideoStream> {
    task: Option<JoinHandle<()>>,
    stream: Option<Arc<Owned<V>>>,
}

impl<V: VideoStream> FrameScheduler<V> {
    /// Spawns the frame loop, calling `on_signal` with every processed frame's signal.
    ///
    /// If the stream fails, the loop stops the stream, hands the error to `on_failure` and exits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<E: HandLandmarker>(
        engine: E,
        stream: V,
        classifier: GestureClassifier,
        interval: Duration,
        mut on_signal: impl FnMut(GestureSignal) + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
    ) -> Self {
        let stream = Arc::new(Owned {
            stream,
            stopped: AtomicBool::new(false),
        });
        let mut frame_loop = FrameLoop::new(engine, stream.clone(), classifier);
        let task = tokio::spawn(async move {
            let mut ticks = time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                match frame_loop.tick() {
                    Tick::Processed(signal) => on_signal(signal),
                    Tick::StreamFailed(e) => {
                        log::error!("frame loop stopping: {e}");
                        frame_loop.stream.stop();
                        on_failure(e);
                        return;
                    }
                    Tick::NoFrame | Tick::Skipped | Tick::Failed => {}
                }
            }
        });
        log::debug!("frame loop started ({interval:?} interval)");

        Self {
            task: Some(task),
            stream: Some(stream),
        }
    }

    /// Whether the frame loop is still processing frames.
    ///
    /// Turns `false` after [`stop`](Self::stop) and after the stream failed.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Cancels the frame loop and then stops the camera stream.
    ///
    /// No frame is processed once this returns. Calling it again does nothing.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            match task.await {
                Err(e) if e.is_panic() => log::error!("frame loop panicked"),
                _ => log::debug!("frame loop stopped"),
            }
        }
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
    }
}

impl<V: VideoStream> Drop for FrameScheduler<V> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::{
        hand::{gesture::Gesture, landmark::HandFrameResult},
        test::spread_hand,
        video::Frame,
    };

    #[derive(Default)]
    struct FakeStream {
        media_time: Mutex<Option<Duration>>,
        failure: Mutex<Option<Error>>,
        stops: AtomicUsize,
    }

    impl FakeStream {
        fn show(&self, ms: u64) {
            *self.media_time.lock().unwrap() = Some(Duration::from_millis(ms));
        }

        fn break_down(&self) {
            *self.failure.lock().unwrap() = Some(Error::Capture("device unplugged".into()));
        }
    }

    impl VideoStream for FakeStream {
        fn current_frame(&self) -> Result<Option<TimedFrame>, Error> {
            if let Some(e) = self.failure.lock().unwrap().clone() {
                return Err(e);
            }
            let Some(media_time) = *self.media_time.lock().unwrap() else {
                return Ok(None);
            };
            Ok(Some(TimedFrame {
                media_time,
                frame: Arc::new(Frame::new(4, 4)),
            }))
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingEngine {
        calls: Arc<AtomicUsize>,
        timestamps: Vec<Duration>,
        fail: bool,
    }

    impl CountingEngine {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let engine = Self {
                calls: calls.clone(),
                timestamps: Vec::new(),
                fail: false,
            };
            (engine, calls)
        }
    }

    impl HandLandmarker for CountingEngine {
        fn detect_for_video(
            &mut self,
            _: &Frame,
            timestamp: Duration,
        ) -> anyhow::Result<HandFrameResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(&last) = self.timestamps.last() {
                assert!(timestamp >= last);
            }
            self.timestamps.push(timestamp);
            if self.fail {
                anyhow::bail!("inference failed");
            }
            Ok(spread_hand([0.5, 0.5, 0.0], 0.1))
        }
    }

    #[test]
    fn one_inference_per_media_time() {
        let stream = Arc::new(FakeStream::default());
        let (engine, calls) = CountingEngine::new();
        let mut frame_loop = FrameLoop::new(engine, stream.clone(), GestureClassifier::default());

        assert_eq!(frame_loop.tick(), Tick::NoFrame);

        stream.show(33);
        match frame_loop.tick() {
            Tick::Processed(signal) => {
                assert!(signal.is_present);
                assert_eq!(signal.gesture, Gesture::ClosedFist);
            }
            tick => panic!("unexpected {tick:?}"),
        }
        assert_eq!(frame_loop.tick(), Tick::Skipped);
        assert_eq!(frame_loop.tick(), Tick::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        stream.show(66);
        assert!(matches!(frame_loop.tick(), Tick::Processed(_)));
        assert_eq!(frame_loop.tick(), Tick::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn inference_errors_skip_the_frame() {
        let stream = Arc::new(FakeStream::default());
        let (mut engine, calls) = CountingEngine::new();
        engine.fail = true;
        let mut frame_loop = FrameLoop::new(engine, stream.clone(), GestureClassifier::default());

        stream.show(33);
        assert_eq!(frame_loop.tick(), Tick::Failed);
        assert_eq!(frame_loop.tick(), Tick::Skipped);
        stream.show(66);
        assert_eq!(frame_loop.tick(), Tick::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stream_failure_is_reported() {
        let stream = Arc::new(FakeStream::default());
        let (engine, calls) = CountingEngine::new();
        let mut frame_loop = FrameLoop::new(engine, stream.clone(), GestureClassifier::default());

        stream.show(33);
        assert!(matches!(frame_loop.tick(), Tick::Processed(_)));
        stream.show(66);
        stream.break_down();
        assert_eq!(
            frame_loop.tick(),
            Tick::StreamFailed(Error::Capture("device unplugged".into()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let stream = Arc::new(FakeStream::default());
        stream.show(33);
        let (engine, calls) = CountingEngine::new();
        let signals = Arc::new(AtomicUsize::new(0));

        let counter = signals.clone();
        let mut scheduler = FrameScheduler::start(
            engine,
            stream.clone(),
            GestureClassifier::default(),
            Duration::from_millis(16),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |e| panic!("unexpected stream failure: {e}"),
        );
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(signals.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        scheduler.stop().await;
        assert_eq!(stream.stops.load(Ordering::SeqCst), 1);

        stream.show(66);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(scheduler);
        assert_eq!(stream.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_the_stream() {
        let stream = Arc::new(FakeStream::default());
        let (engine, _) = CountingEngine::new();
        let scheduler = FrameScheduler::start(
            engine,
            stream.clone(),
            GestureClassifier::default(),
            Duration::from_millis(16),
            |_| {},
            |_| {},
        );
        drop(scheduler);
        assert_eq!(stream.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_failure_ends_the_loop() {
        let stream = Arc::new(FakeStream::default());
        stream.show(33);
        let (engine, calls) = CountingEngine::new();
        let failures = Arc::new(Mutex::new(Vec::new()));

        let sink = failures.clone();
        let mut scheduler = FrameScheduler::start(
            engine,
            stream.clone(),
            GestureClassifier::default(),
            Duration::from_millis(16),
            |_| {},
            move |e| sink.lock().unwrap().push(e),
        );
        time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.is_running());

        stream.show(66);
        stream.break_down();
        time::sleep(Duration::from_millis(50)).await;
        assert!(!scheduler.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stream.stops.load(Ordering::SeqCst), 1);
        assert_eq!(
            *failures.lock().unwrap(),
            [Error::Capture("device unplugged".into())]
        );

        scheduler.stop().await;
        drop(scheduler);
        assert_eq!(stream.stops.load(Ordering::SeqCst), 1);
    }
}
