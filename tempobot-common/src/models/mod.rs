pub mod player;
pub mod track;

pub use player::{PlayerSnapshot, PlayerStatus, RepeatMode, TrackInfo};
pub use track::{ProviderKind, ResolvedMedia, Track};
