//! Window coverings emulated on a relay pair

mod controller;
mod model;

pub use controller::MotionController;
pub use model::{
    blind_state, Covering, CoveringSnapshot, ObservedState, PositionState, Reaction, Transition,
};
