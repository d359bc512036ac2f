pub mod notify;
pub mod provider;
pub mod transport;

pub use notify::NotificationSink;
pub use provider::{SearchKind, StreamSource, TrackProvider};
pub use transport::{TransportEvent, VoiceConnection, VoiceTransport};
