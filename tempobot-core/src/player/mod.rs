pub mod engine;
pub(crate) mod playback;
pub mod reconnect;
pub mod state;

pub use engine::{EngineConfig, PlaybackEngine};
pub use playback::PROGRESS_SEGMENTS;
pub use reconnect::run_transport_events;
pub use state::{PlayerState, PlayerStore};
