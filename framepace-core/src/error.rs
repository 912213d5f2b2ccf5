use thiserror::Error;

/// All errors produced by framepace-core.
///
/// Timing misses, ring overflow and ring underrun are not errors: they are
/// counted in [`crate::engine::driver::DriverDiagnostics`] and the loop keeps going.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid ring buffer capacity: {requested} bytes")]
    InvalidCapacity { requested: usize },

    #[error("invalid media format: {0}")]
    InvalidFormat(String),

    #[error("emulation step failed: {0}")]
    Emulation(String),

    #[error("failed to spawn frame driver thread: {0}")]
    DriverSpawn(#[source] std::io::Error),

    #[error("frame driver thread panicked")]
    DriverPanicked,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
