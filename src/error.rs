use thiserror::Error;

/// Misuse of the engine surface.
///
/// Kernel failures are never reported this way; they are recorded on the
/// owning [`Port`](crate::Port) and observed as termination events. A
/// `Violation` means the caller broke a protocol rule and no engine state
/// was modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("cycle must be completed before starting another")]
    CycleOpen,

    #[error("already terminated")]
    Terminated,

    #[error("resource already present")]
    ResourceHeld,

    #[error("channel is acquired by another junction")]
    ForeignChannel,

    #[error("cannot resize junction inside cycle")]
    Cycling,

    #[error("no such resource type")]
    UnknownResourceType,

    #[error("invalid allocation parameter")]
    InvalidParameter,
}
