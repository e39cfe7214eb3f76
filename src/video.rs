//! Camera capture.
//!
//! A [`CaptureSource`] opens a camera and yields a [`VideoStream`], which always exposes the most
//! recent decoded frame together with its media timestamp.

pub mod webcam;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use image::RgbImage;

use crate::Error;

/// A decoded camera frame.
pub type Frame = RgbImage;

/// An image resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    pub const RES_VGA: Self = Self::new(640, 480);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn num_pixels(&self) -> u32 {
        self.width * self.height
    }

    /// Whether an image of this resolution fully covers `other`.
    pub fn covers(&self, other: Resolution) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which way the requested camera should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Facing {
    /// Towards the user, like a laptop's built-in camera.
    #[default]
    User,
    Environment,
}

/// What to ask for when acquiring a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub resolution: Resolution,
    pub facing: Facing,
    /// Name of the device to open. If `None`, the first compatible device is used.
    pub device: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            resolution: Resolution::RES_VGA,
            facing: Facing::User,
            device: None,
        }
    }
}

/// A decoded frame and the media time it was captured at.
#[derive(Clone)]
pub struct TimedFrame {
    pub media_time: Duration,
    pub frame: Arc<Frame>,
}

/// Something that can open a camera.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    type Stream: VideoStream;

    /// Opens a camera matching `constraints`.
    ///
    /// Resolves only once the stream has produced its first decoded frame.
    ///
    /// Fails with [`Error::UnsupportedEnvironment`] when camera capture is not possible at all,
    /// which is checked before any device is opened, and with [`Error::PermissionDenied`] when
    /// access to the camera is refused.
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<Self::Stream, Error>;
}

/// A live camera stream.
pub trait VideoStream: Send + Sync + 'static {
    /// Returns the most recent decoded frame, or `None` if there is none yet or the stream was
    /// stopped.
    ///
    /// The media time of successive frames increases monotonically. Calling this again before a
    /// new frame arrives returns the same frame with the same media time.
    ///
    /// Fails once the camera has failed for good, e.g. because it was unplugged. Every later call
    /// fails as well.
    fn current_frame(&self) -> Result<Option<TimedFrame>, Error>;

    /// Stops all tracks of the stream and releases the camera.
    ///
    /// Calling this more than once has no further effect.
    fn stop(&self);
}

impl<S: VideoStream + ?Sized> VideoStream for Arc<S> {
    fn current_frame(&self) -> Result<Option<TimedFrame>, Error> {
        (**self).current_frame()
    }

    fn stop(&self) {
        (**self).stop()
    }
}
