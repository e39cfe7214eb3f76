//! Session configuration.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};

use crate::{
    assets::AssetLocation,
    hand::gesture::ClassifierParams,
    nn::{Delegate, RuntimeLocation},
    video::CaptureConstraints,
};

/// Default model location, relative to the working directory.
pub const DEFAULT_MODEL_PATH: &str = "3rdparty/onnx/hand_landmark_full.onnx";

/// Everything a [`Session`] needs to know up front.
///
/// [`Session`]: crate::session::Session
#[derive(Debug, Clone)]
pub struct Config {
    /// The inference runtime to resolve. Default: `tract`.
    pub runtime: RuntimeLocation,
    /// The hand landmark model. Default: [`DEFAULT_MODEL_PATH`].
    pub model: AssetLocation,
    /// Default: [`Delegate::Gpu`].
    pub delegate: Delegate,
    /// How long the automatic model load may take before manual upload is offered. The load is not
    /// aborted when this expires. Default: 3 seconds.
    pub model_timeout: Duration,
    /// Default: 640x480, user-facing.
    pub capture: CaptureConstraints,
    /// Frame loop cadence in Hz. Default: 60.
    pub refresh_rate: u32,
    /// Minimum model presence score for a hand to be reported. Default: 0.5.
    pub presence_threshold: f32,
    pub classifier: ClassifierParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeLocation::default(),
            model: AssetLocation::Path(PathBuf::from(DEFAULT_MODEL_PATH)),
            delegate: Delegate::Gpu,
            model_timeout: Duration::from_millis(3000),
            capture: CaptureConstraints::default(),
            refresh_rate: 60,
            presence_threshold: 0.5,
            classifier: ClassifierParams::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from the `HANDSIGNAL_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup, starting from the defaults.
    ///
    /// Returns an error naming the variable if a value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(runtime) = lookup("HANDSIGNAL_RUNTIME") {
            config.runtime = RuntimeLocation::new(runtime);
        }
        if let Some(model) = lookup("HANDSIGNAL_MODEL") {
            config.model = model
                .parse()
                .context("invalid value set for `HANDSIGNAL_MODEL`")?;
        }
        if let Some(delegate) = lookup("HANDSIGNAL_DELEGATE") {
            config.delegate = match delegate.to_ascii_lowercase().as_str() {
                "gpu" => Delegate::Gpu,
                "cpu" => Delegate::Cpu,
                invalid => bail!("invalid value set for `HANDSIGNAL_DELEGATE`: '{invalid}'"),
            };
        }
        if let Some(ms) = parse(&lookup, "HANDSIGNAL_MODEL_TIMEOUT_MS")? {
            config.model_timeout = Duration::from_millis(ms);
        }
        if let Some(hz) = parse::<u32>(&lookup, "HANDSIGNAL_REFRESH_HZ")? {
            if hz == 0 {
                bail!("`HANDSIGNAL_REFRESH_HZ` must be greater than 0");
            }
            config.refresh_rate = hz;
        }
        if let Some(t) = parse(&lookup, "HANDSIGNAL_PRESENCE_THRESHOLD")? {
            config.presence_threshold = t;
        }
        if let Some(t) = parse(&lookup, "HANDSIGNAL_FIST_THRESHOLD")? {
            config.classifier.fist_threshold = t;
        }
        if let Some(s) = parse(&lookup, "HANDSIGNAL_ROTATION_SCALE_X")? {
            config.classifier.rotation_scale_x = s;
        }
        if let Some(s) = parse(&lookup, "HANDSIGNAL_ROTATION_SCALE_Y")? {
            config.classifier.rotation_scale_y = s;
        }

        Ok(config)
    }

    /// The interval between frame loop ticks.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(1) / self.refresh_rate.max(1)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("invalid value set for `{key}`: '{value}'"))
        })
        .transpose()
}
