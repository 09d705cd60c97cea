mod audio;
pub mod backend;
pub mod catalog;
pub mod clock;
pub mod config;
#[cfg(feature = "cpal")]
pub mod device;
pub mod error;
pub mod hwaccel;
pub mod media;
pub mod output;
#[cfg(feature = "cpal")]
pub mod playback;
pub mod queue;
pub mod resample;
mod router;
pub mod status;
mod sync;
pub mod transport;
pub mod video;

#[cfg(test)]
mod testutil;

pub use catalog::MediaInfo;
pub use config::EngineConfig;
pub use error::{OpenError, TransportError};
pub use output::{AudioOutput, EngineEvent, VideoOutput};
pub use status::PlaybackStatus;
pub use transport::{PlaybackState, TransportController};
