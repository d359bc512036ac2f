// src/lib.rs

pub mod decoder;
pub mod player;
pub mod probe;
pub mod test_utils;

pub use player::engine::PlaybackEngine;
pub use player::state::{PlayerState, PlayerStore};
pub use tempobot_common::Error;
