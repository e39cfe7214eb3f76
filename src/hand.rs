//! Hand landmarks and the gesture signal derived from them.

pub mod gesture;
pub mod landmark;
