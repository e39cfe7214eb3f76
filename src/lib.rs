//! Camera-driven hand gesture signal.
//!
//! `handsignal` turns a live camera feed into a per-frame [`GestureSignal`]: a discrete gesture
//! (open palm, closed fist, or no hand) plus a 2D rotation proxy and a pinch distance. A
//! [`Session`] loads an inference runtime and a hand landmark model (with a manual-upload fallback
//! if the model is slow or fails to arrive), opens the camera, and runs the frame loop.
//!
//! # Coordinates
//!
//! Landmarks use normalized image coordinates: X points to the right and Y points *down*, both
//! roughly in `[0, 1]` across the camera frame. Z is relative depth with the same scale as X.
//!
//! # Environment Variables
//!
//! [`Config::from_env`] reads the following variables. Unset variables use the defaults listed in
//! [`Config`].
//!
//! * `HANDSIGNAL_RUNTIME`: the inference runtime to resolve. Only `tract` is built in.
//! * `HANDSIGNAL_MODEL`: URL (`http://`, `https://`) or local path of the hand landmark ONNX model.
//! * `HANDSIGNAL_DELEGATE`: preferred compute delegate, `gpu` or `cpu`.
//! * `HANDSIGNAL_MODEL_TIMEOUT_MS`: how long to wait for the model before offering manual upload.
//! * `HANDSIGNAL_REFRESH_HZ`: frame loop cadence.
//! * `HANDSIGNAL_PRESENCE_THRESHOLD`: minimum hand presence score reported by the model.
//! * `HANDSIGNAL_FIST_THRESHOLD`, `HANDSIGNAL_ROTATION_SCALE_X`, `HANDSIGNAL_ROTATION_SCALE_Y`:
//!   classifier calibration.
//!
//! The webcam additionally reads `HANDSIGNAL_WEBCAM_NAME`, which forces the capture device to use.
//! If unset, the first device that supports a compatible image format will be used.
//!
//! [`GestureSignal`]: hand::gesture::GestureSignal
//! [`Session`]: session::Session
//! [`Config`]: config::Config
//! [`Config::from_env`]: config::Config::from_env

use log::LevelFilter;

pub mod assets;
pub mod config;
pub mod error;
pub mod hand;
pub mod lifecycle;
pub mod loader;
pub mod nn;
pub mod scheduler;
pub mod session;
pub mod timer;
pub mod video;


pub use error::Error;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_CRATE_NAME")), log_level)
        .filter(Some("tract_onnx"), LevelFilter::Warn)
        .filter(Some("tract_core"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and `handsignal` will log at *trace*
/// level. Otherwise, they will log at *debug* level.
///
/// `tract` will always log at *warn* level. `RUST_LOG` is applied on top.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
