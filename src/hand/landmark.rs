//! Hand landmark data as produced by a landmark network.

use nalgebra::{Point2, Point3};

/// Number of landmarks in one hand's landmark set.
pub const NUM_LANDMARKS: usize = 21;

/// A single normalized hand landmark.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Landmark {
    pos: [f32; 3],
}

impl Landmark {
    #[inline]
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { pos: [x, y, z] }
    }

    #[inline]
    pub fn position(&self) -> [f32; 3] {
        self.pos
    }

    #[inline]
    pub fn x(&self) -> f32 {
        self.pos[0]
    }

    #[inline]
    pub fn y(&self) -> f32 {
        self.pos[1]
    }

    #[inline]
    pub fn z(&self) -> f32 {
        self.pos[2]
    }

    #[inline]
    pub(crate) fn point3(&self) -> Point3<f32> {
        Point3::from(self.pos)
    }

    #[inline]
    pub(crate) fn point2(&self) -> Point2<f32> {
        Point2::new(self.pos[0], self.pos[1])
    }
}

impl From<[f32; 3]> for Landmark {
    fn from(pos: [f32; 3]) -> Self {
        Self { pos }
    }
}

/// Names for the hand pose landmarks, in network output order.
///
/// # Terminology
///
/// - **CMC**: [Carpometacarpal joint], the lowest joint of the thumb, located near the wrist.
/// - **MCP**: [Metacarpophalangeal joint], the lower joint forming the knuckles near the palm of
///   the hand.
/// - **PIP**: Proximal Interphalangeal joint, the joint between the MCP and DIP.
/// - **DIP**: Distal Interphalangeal joint, the highest joint of a finger.
/// - **Tip**: This landmark is just placed on the tip of the finger, above the DIP.
///
/// [Carpometacarpal joint]: https://en.wikipedia.org/wiki/Carpometacarpal_joint
/// [Metacarpophalangeal joint]: https://en.wikipedia.org/wiki/Metacarpophalangeal_joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkIdx {
    Wrist,
    ThumbCmc,
    ThumbMcp,
    ThumbIp,
    ThumbTip,
    IndexFingerMcp,
    IndexFingerPip,
    IndexFingerDip,
    IndexFingerTip,
    MiddleFingerMcp,
    MiddleFingerPip,
    MiddleFingerDip,
    MiddleFingerTip,
    RingFingerMcp,
    RingFingerPip,
    RingFingerDip,
    RingFingerTip,
    PinkyMcp,
    PinkyPip,
    PinkyDip,
    PinkyTip,
}

impl LandmarkIdx {
    /// All landmarks, in network output order.
    pub const ALL: [Self; NUM_LANDMARKS] = {
        use LandmarkIdx::*;
        [
            Wrist,
            ThumbCmc,
            ThumbMcp,
            ThumbIp,
            ThumbTip,
            IndexFingerMcp,
            IndexFingerPip,
            IndexFingerDip,
            IndexFingerTip,
            MiddleFingerMcp,
            MiddleFingerPip,
            MiddleFingerDip,
            MiddleFingerTip,
            RingFingerMcp,
            RingFingerPip,
            RingFingerDip,
            RingFingerTip,
            PinkyMcp,
            PinkyPip,
            PinkyDip,
            PinkyTip,
        ]
    };
}

/// The four fingertips (thumb excluded).
pub const FINGERTIPS: [LandmarkIdx; 4] = [
    LandmarkIdx::IndexFingerTip,
    LandmarkIdx::MiddleFingerTip,
    LandmarkIdx::RingFingerTip,
    LandmarkIdx::PinkyTip,
];

/// The landmark set of one detected hand.
///
/// Always holds exactly [`NUM_LANDMARKS`] landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct HandLandmarks {
    landmarks: [Landmark; NUM_LANDMARKS],
}

impl HandLandmarks {
    pub fn new(landmarks: [Landmark; NUM_LANDMARKS]) -> Self {
        Self { landmarks }
    }

    #[inline]
    pub fn get(&self, idx: LandmarkIdx) -> Landmark {
        self.landmarks[idx as usize]
    }
}

impl TryFrom<&[Landmark]> for HandLandmarks {
    type Error = InvalidLandmarks;

    fn try_from(landmarks: &[Landmark]) -> Result<Self, Self::Error> {
        let landmarks = landmarks
            .try_into()
            .map_err(|_| InvalidLandmarks::WrongLength(landmarks.len()))?;
        Ok(Self { landmarks })
    }
}

/// The landmark detection result for one frame.
///
/// Only a single hand is tracked, so this holds zero or one landmark sets.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandFrameResult {
    hand: Option<HandLandmarks>,
}

impl HandFrameResult {
    /// A result with no hand in view.
    pub fn absent() -> Self {
        Self { hand: None }
    }

    pub fn with_hand(hand: HandLandmarks) -> Self {
        Self { hand: Some(hand) }
    }

    /// Builds a result from the raw per-hand landmark lists reported by a detector.
    ///
    /// Fails if more than one hand is reported or a hand does not have exactly
    /// [`NUM_LANDMARKS`] landmarks.
    pub fn from_sets<S: AsRef<[Landmark]>>(sets: &[S]) -> Result<Self, InvalidLandmarks> {
        match sets {
            [] => Ok(Self::absent()),
            [set] => Ok(Self::with_hand(HandLandmarks::try_from(set.as_ref())?)),
            _ => Err(InvalidLandmarks::TooManyHands(sets.len())),
        }
    }

    #[inline]
    pub fn hand(&self) -> Option<&HandLandmarks> {
        self.hand.as_ref()
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.hand.is_some()
    }
}

/// Raw landmark data that violates the single-hand, 21-landmark contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidLandmarks {
    #[error("hand landmark set has {0} landmarks, expected {NUM_LANDMARKS}")]
    WrongLength(usize),
    #[error("{0} hands reported, only one is supported")]
    TooManyHands(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_order() {
        assert_eq!(LandmarkIdx::Wrist as usize, 0);
        assert_eq!(LandmarkIdx::ThumbTip as usize, 4);
        assert_eq!(
            FINGERTIPS.map(|idx| idx as usize),
            [8, 12, 16, 20],
        );
        assert_eq!(LandmarkIdx::PinkyTip as usize, NUM_LANDMARKS - 1);
        for (i, idx) in LandmarkIdx::ALL.iter().enumerate() {
            assert_eq!(*idx as usize, i);
        }
    }

    #[test]
    fn from_sets() {
        let empty: &[Vec<Landmark>] = &[];
        assert_eq!(HandFrameResult::from_sets(empty), Ok(HandFrameResult::absent()));

        let hand = vec![Landmark::new(0.1, 0.2, 0.3); NUM_LANDMARKS];
        let result = HandFrameResult::from_sets(&[hand.clone()]).unwrap();
        assert!(result.is_present());
        assert_eq!(
            result.hand().unwrap().get(LandmarkIdx::PinkyTip).position(),
            [0.1, 0.2, 0.3],
        );

        assert_eq!(
            HandFrameResult::from_sets(&[hand.clone(), hand]),
            Err(InvalidLandmarks::TooManyHands(2)),
        );
        assert_eq!(
            HandFrameResult::from_sets(&[vec![Landmark::default(); 20]]),
            Err(InvalidLandmarks::WrongLength(20)),
        );
    }

    #[test]
    fn invalid_landmarks_messages() {
        assert_eq!(
            InvalidLandmarks::WrongLength(20).to_string(),
            "hand landmark set has 20 landmarks, expected 21"
        );
        assert_eq!(
            InvalidLandmarks::TooManyHands(2).to_string(),
            "2 hands reported, only one is supported"
        );
        let err: &dyn std::error::Error = &InvalidLandmarks::TooManyHands(3);
        assert!(err.source().is_none());
    }
}
