//! Geometric gesture classification.
//!
//! [`GestureClassifier::classify`] maps one frame's landmarks to a [`GestureSignal`]. The mapping is
//! a fixed heuristic on normalized coordinates: the mean wrist-to-fingertip distance separates an
//! open palm from a closed fist, the thumb-to-index distance gives a pinch control, and the wrist
//! position is remapped into a rotation proxy. None of this is a learned boundary, so the constants
//! live in [`ClassifierParams`] to allow recalibration per camera and model.

use nalgebra::distance;

use super::landmark::{HandFrameResult, HandLandmarks, LandmarkIdx, FINGERTIPS};

/// The discrete gesture recognized in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gesture {
    /// No hand in view.
    #[default]
    None,
    OpenPalm,
    ClosedFist,
}

/// Rotation proxy derived from the wrist position. Not a true 3D rotation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rotation {
    pub x: f32,
    pub y: f32,
}

/// The per-frame output handed to the application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureSignal {
    pub gesture: Gesture,
    pub rotation: Rotation,
    pub pinch_distance: f32,
    pub is_present: bool,
}

impl GestureSignal {
    /// The fixed signal emitted for frames without a hand.
    pub const ABSENT: Self = Self {
        gesture: Gesture::None,
        rotation: Rotation { x: 0.0, y: 0.0 },
        pinch_distance: 1.0,
        is_present: false,
    };
}

/// Calibration constants of the classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierParams {
    /// Mean wrist-to-fingertip distance below which the hand counts as a fist.
    pub fist_threshold: f32,
    /// Wrist position that maps to zero rotation, on both axes.
    pub rotation_center: f32,
    pub rotation_scale_x: f32,
    pub rotation_scale_y: f32,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            fist_threshold: 0.25,
            rotation_center: 0.5,
            rotation_scale_x: 4.0,
            rotation_scale_y: 2.0,
        }
    }
}

/// Stateless landmark-to-signal classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct GestureClassifier {
    params: ClassifierParams,
}

impl GestureClassifier {
    pub fn new(params: ClassifierParams) -> Self {
        Self { params }
    }

    #[inline]
    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    /// Classifies one frame's landmarks.
    pub fn classify(&self, result: &HandFrameResult) -> GestureSignal {
        match result.hand() {
            Some(hand) => self.classify_hand(hand),
            None => GestureSignal::ABSENT,
        }
    }

    fn classify_hand(&self, hand: &HandLandmarks) -> GestureSignal {
        let p = &self.params;
        let wrist = hand.get(LandmarkIdx::Wrist);

        let avg_dist = FINGERTIPS
            .iter()
            .map(|&tip| distance(&wrist.point3(), &hand.get(tip).point3()))
            .sum::<f32>()
            / FINGERTIPS.len() as f32;

        let gesture = if avg_dist < p.fist_threshold {
            Gesture::ClosedFist
        } else {
            Gesture::OpenPalm
        };

        let pinch_distance = distance(
            &hand.get(LandmarkIdx::ThumbTip).point2(),
            &hand.get(LandmarkIdx::IndexFingerTip).point2(),
        );

        GestureSignal {
            gesture,
            rotation: Rotation {
                x: (wrist.x() - p.rotation_center) * p.rotation_scale_x,
                y: (wrist.y() - p.rotation_center) * p.rotation_scale_y,
            },
            pinch_distance,
            is_present: true,
        }
    }
}
