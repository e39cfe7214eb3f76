//! Inference runtime and hand landmark engine interfaces.
//!
//! Loading happens in two steps. A [`RuntimeResolver`] turns a [`RuntimeLocation`] into a
//! [`VisionRuntime`], which is then asked to create a [`HandLandmarker`] engine from a
//! [`ModelSource`]. The built-in implementation is backed by `tract` (see [`tract`]); tests and
//! embedders can plug in their own.

mod backend;
pub mod tract;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

pub use backend::OnnxBackend;

use crate::{assets::AssetLocation, hand::landmark::HandFrameResult, timer::Timer, video::Frame};

/// Where to find the inference runtime.
///
/// This names the backend to load, e.g. `tract`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLocation(String);

impl RuntimeLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RuntimeLocation {
    fn default() -> Self {
        Self::new("tract")
    }
}

impl fmt::Display for RuntimeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The compute backend requested for inference.
///
/// This is a preference. Runtimes that cannot honor it fall back to whatever they support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delegate {
    #[default]
    Gpu,
    Cpu,
}

/// Model data handed to [`VisionRuntime::create_engine`].
#[derive(Clone)]
pub enum ModelSource {
    /// Fetch the model from a URL or path.
    Location(AssetLocation),
    /// Use model bytes supplied directly, e.g. a file picked by the user.
    Buffer(Arc<[u8]>),
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Location(location) => f.debug_tuple("Location").field(location).finish(),
            Self::Buffer(buf) => write!(f, "Buffer({} bytes)", buf.len()),
        }
    }
}

/// Resolves a [`RuntimeLocation`] to a loaded runtime.
#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    type Runtime: VisionRuntime;

    async fn resolve(&self, location: &RuntimeLocation) -> anyhow::Result<Self::Runtime>;
}

/// A loaded inference runtime that can create landmark engines.
#[async_trait]
pub trait VisionRuntime: Send + Sync + 'static {
    type Engine: HandLandmarker;

    /// Creates a hand landmark engine for video input, tracking at most one hand.
    ///
    /// This may take a long time when the model has to be fetched over the network.
    async fn create_engine(
        &self,
        model: ModelSource,
        delegate: Delegate,
    ) -> anyhow::Result<Self::Engine>;
}

/// A ready hand landmark engine.
pub trait HandLandmarker: Send + 'static {
    /// Detects hand landmarks in a video frame.
    ///
    /// `timestamp` is a monotonic clock reading taken right before the call. It must not decrease
    /// between calls.
    fn detect_for_video(
        &mut self,
        frame: &Frame,
        timestamp: Duration,
    ) -> anyhow::Result<HandFrameResult>;

    /// Returns profiling timers for the engine's work, for periodic logging.
    fn timers(&self) -> &[Timer] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::FpsCounter;

    struct Untimed;

    impl HandLandmarker for Untimed {
        fn detect_for_video(&mut self, _: &Frame, _: Duration) -> anyhow::Result<HandFrameResult> {
            Ok(HandFrameResult::absent())
        }
    }

    struct Timed {
        timers: [Timer; 2],
    }

    impl HandLandmarker for Timed {
        fn detect_for_video(&mut self, _: &Frame, _: Duration) -> anyhow::Result<HandFrameResult> {
            Ok(self.timers[0].time(HandFrameResult::absent))
        }

        fn timers(&self) -> &[Timer] {
            &self.timers
        }
    }

    #[test]
    fn timers_are_borrowed() {
        assert!(Untimed.timers().is_empty());

        let mut engine = Timed {
            timers: [Timer::new("infer"), Timer::new("resize")],
        };
        engine
            .detect_for_video(&Frame::new(1, 1), Duration::ZERO)
            .unwrap();
        FpsCounter::new("engine").tick_with(engine.timers());

        let logged = engine
            .timers()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        assert!(logged[0].starts_with("infer: 1x"));
        assert_eq!(logged[1], "resize: 0x0.0ms");
    }
}
