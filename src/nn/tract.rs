//! The built-in runtime: ONNX hand landmark inference on the CPU using `tract`.
//!
//! The expected network is a MediaPipe-style hand landmark model with one image input (`NCHW` or
//! `NHWC`, RGB in `[0, 1]`) and at least two outputs: the 21 screen-space landmarks as 63 floats
//! in input pixel units, and a hand presence score.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tract_onnx::prelude::{
    tract_ndarray, tvec, Framework, Graph, InferenceModelExt, SimplePlan, Tensor, TypedFact,
    TypedOp,
};

use super::{
    Delegate, HandLandmarker, ModelSource, OnnxBackend, RuntimeLocation, RuntimeResolver,
    VisionRuntime,
};
use crate::{
    hand::landmark::{HandFrameResult, HandLandmarks, Landmark, NUM_LANDMARKS},
    timer::Timer,
    video::{Frame, Resolution},
};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Resolves runtime locations naming a built-in ONNX backend.
#[derive(Debug, Clone, Copy)]
pub struct TractResolver {
    presence_threshold: f32,
}

impl TractResolver {
    /// Creates a resolver whose engines report a hand only when the model's presence score is at
    /// least `presence_threshold`.
    pub fn new(presence_threshold: f32) -> Self {
        Self { presence_threshold }
    }
}

#[async_trait]
impl RuntimeResolver for TractResolver {
    type Runtime = TractRuntime;

    async fn resolve(&self, location: &RuntimeLocation) -> anyhow::Result<TractRuntime> {
        let backend = OnnxBackend::from_location(location)?;
        log::info!("using ONNX backend {backend:?}");
        Ok(TractRuntime {
            backend,
            presence_threshold: self.presence_threshold,
        })
    }
}

/// A resolved `tract` runtime.
#[derive(Debug)]
pub struct TractRuntime {
    backend: OnnxBackend,
    presence_threshold: f32,
}

#[async_trait]
impl VisionRuntime for TractRuntime {
    type Engine = TractHandLandmarker;

    async fn create_engine(
        &self,
        model: ModelSource,
        delegate: Delegate,
    ) -> anyhow::Result<TractHandLandmarker> {
        let delegate = self.backend.effective_delegate(delegate);
        let data: Arc<[u8]> = match model {
            ModelSource::Location(location) => location.fetch().await?.into(),
            ModelSource::Buffer(data) => data,
        };
        log::debug!(
            "creating hand landmarker from {} bytes of model data ({delegate:?})",
            data.len()
        );

        let threshold = self.presence_threshold;
        tokio::task::spawn_blocking(move || TractHandLandmarker::from_onnx(&data, threshold))
            .await
            .context("model loading task failed")?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputLayout {
    Nchw,
    Nhwc,
}

/// A hand landmark engine running an ONNX network through `tract`.
pub struct TractHandLandmarker {
    model: Model,
    layout: InputLayout,
    input_res: Resolution,
    presence_threshold: f32,
    last_timestamp: Option<Duration>,
    t_infer: Timer,
}

impl TractHandLandmarker {
    /// Parses and optimizes an in-memory ONNX network.
    ///
    /// Returns an error if the network data is malformed, uses unimplemented operations, or does
    /// not have the expected input and output shapes.
    pub fn from_onnx(data: &[u8], presence_threshold: f32) -> anyhow::Result<Self> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*data)
            .context("failed to parse ONNX model")?
            .into_optimized()
            .context("failed to optimize ONNX model")?;
        let model = SimplePlan::new(graph)?;

        let net = model.model();
        if net.inputs.len() != 1 {
            bail!(
                "hand landmark network has to take exactly 1 input, this one takes {}",
                net.inputs.len()
            );
        }
        if net.outputs.len() < 2 {
            bail!(
                "hand landmark network needs landmark and presence outputs, this one has {}",
                net.outputs.len()
            );
        }

        let fact = net.input_fact(0)?;
        let shape = fact
            .shape
            .as_concrete()
            .context("hand landmark network has a symbolic input shape")?;
        let (layout, h, w) = match shape {
            [1, 3, h, w] => (InputLayout::Nchw, *h, *w),
            [1, h, w, 3] => (InputLayout::Nhwc, *h, *w),
            _ => bail!("invalid hand landmark network input shape {shape:?}"),
        };
        let input_res = Resolution::new(w.try_into()?, h.try_into()?);
        log::debug!("hand landmark network input: {layout:?} {input_res}");

        Ok(Self {
            model,
            layout,
            input_res,
            presence_threshold,
            last_timestamp: None,
            t_infer: Timer::new("infer"),
        })
    }

    /// Samples `frame` into an input tensor, stretching it to the network's input size.
    fn to_tensor(&self, frame: &Frame) -> Tensor {
        let (h, w) = (
            self.input_res.height() as usize,
            self.input_res.width() as usize,
        );
        let sample = |x: usize, y: usize, c: usize| {
            let px = ((x as f32 + 0.5) / w as f32 * frame.width() as f32) as u32;
            let py = ((y as f32 + 0.5) / h as f32 * frame.height() as f32) as u32;
            let px = px.min(frame.width().saturating_sub(1));
            let py = py.min(frame.height().saturating_sub(1));
            frame.get_pixel(px, py).0[c] as f32 / 255.0
        };

        match self.layout {
            InputLayout::Nchw => {
                tract_ndarray::Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| sample(x, y, c))
                    .into()
            }
            InputLayout::Nhwc => {
                tract_ndarray::Array4::from_shape_fn((1, h, w, 3), |(_, y, x, c)| sample(x, y, c))
                    .into()
            }
        }
    }
}

impl HandLandmarker for TractHandLandmarker {
    fn detect_for_video(
        &mut self,
        frame: &Frame,
        timestamp: Duration,
    ) -> anyhow::Result<HandFrameResult> {
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                bail!("video timestamps must not decrease ({timestamp:?} < {last:?})");
            }
        }
        self.last_timestamp = Some(timestamp);

        if frame.width() == 0 || frame.height() == 0 {
            return Ok(HandFrameResult::absent());
        }

        let _guard = self.t_infer.start();
        let input = self.to_tensor(frame);
        let outputs = self.model.run(tvec!(input.into()))?;

        let screen = outputs[0].to_array_view::<f32>()?;
        let screen = screen
            .as_slice()
            .context("landmark output is not contiguous")?;
        let presence = *outputs[1]
            .to_array_view::<f32>()?
            .iter()
            .next()
            .context("empty presence output")?;

        extract(screen, presence, self.input_res, self.presence_threshold)
    }

    fn timers(&self) -> &[Timer] {
        std::slice::from_ref(&self.t_infer)
    }
}

/// Converts raw network outputs into a normalized single-hand result.
fn extract(
    screen_landmarks: &[f32],
    presence: f32,
    input_res: Resolution,
    presence_threshold: f32,
) -> anyhow::Result<HandFrameResult> {
    if screen_landmarks.len() != NUM_LANDMARKS * 3 {
        bail!(
            "expected {} landmark values, network produced {}",
            NUM_LANDMARKS * 3,
            screen_landmarks.len()
        );
    }
    if presence < presence_threshold {
        return Ok(HandFrameResult::absent());
    }

    let (w, h) = (input_res.width() as f32, input_res.height() as f32);
    let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
    for (out, xyz) in landmarks.iter_mut().zip(screen_landmarks.chunks_exact(3)) {
        // Z uses the same scale as X.
        *out = Landmark::new(xyz[0] / w, xyz[1] / h, xyz[2] / w);
    }

    Ok(HandFrameResult::with_hand(HandLandmarks::new(landmarks)))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::hand::landmark::LandmarkIdx;

    #[test]
    fn extract_normalizes() {
        let mut raw = vec![0.0; NUM_LANDMARKS * 3];
        raw[0..3].copy_from_slice(&[112.0, 56.0, -22.4]);
        raw[4 * 3..4 * 3 + 3].copy_from_slice(&[224.0, 224.0, 0.0]);

        let result = extract(&raw, 0.9, Resolution::new(224, 224), 0.5).unwrap();
        let hand = result.hand().unwrap();
        let wrist = hand.get(LandmarkIdx::Wrist);
        assert_relative_eq!(wrist.x(), 0.5);
        assert_relative_eq!(wrist.y(), 0.25);
        assert_relative_eq!(wrist.z(), -0.1, epsilon = 1e-6);
        assert_eq!(hand.get(LandmarkIdx::ThumbTip).position(), [1.0, 1.0, 0.0]);
    }

    #[test]
    fn extract_below_presence_threshold() {
        let raw = vec![100.0; NUM_LANDMARKS * 3];
        let result = extract(&raw, 0.2, Resolution::new(224, 224), 0.5).unwrap();
        assert!(!result.is_present());
    }

    #[test]
    fn extract_rejects_wrong_length() {
        let raw = vec![0.0; 60];
        assert!(extract(&raw, 1.0, Resolution::new(224, 224), 0.5).is_err());
    }

    #[test]
    fn garbage_model_is_an_error() {
        assert!(TractHandLandmarker::from_onnx(b"definitely not protobuf", 0.5).is_err());
    }

    #[tokio::test]
    async fn resolver_rejects_unknown_runtime() {
        let resolver = TractResolver::new(0.5);
        assert!(resolver
            .resolve(&RuntimeLocation::new("webgl"))
            .await
            .is_err());
        assert!(resolver.resolve(&RuntimeLocation::default()).await.is_ok());
    }
}
