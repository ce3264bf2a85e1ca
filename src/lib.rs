// Rewind - sliding-window video capture buffer
// Main library entry point

pub mod config;
pub mod encoding;
pub mod muxing;
pub mod recording;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use encoding::{ContainerFormat, EncoderOutput, FrameFlags, TrackFormat, VideoCodec};
pub use muxing::{factory_for, MuxerFactory};
pub use recording::{FrameRing, SaveCallback, SharedRing, Task};
pub use session::{CaptureSession, SessionCallbacks, SessionError};

/// Set up logging from `RUST_LOG`, defaulting to info for this crate.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("rewind_lib=info"))
        .try_init();
}
