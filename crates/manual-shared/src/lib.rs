//! Shared types for the manual question-answering daemon and its client.

pub mod api;
pub mod error;
pub mod policy;
pub mod progress;
pub mod session;

pub use error::QaError;
pub use policy::{
    tier_duration, DetectionMethod, RestrictionState, RestrictionStatus, ValidationVerdict,
    ViolationRecord, ViolationType,
};
pub use progress::{AnswerPayload, EventKind, Step, StreamEvent};
pub use session::{Message, MessageMeta, Role, Session, Source};

/// Crate version, reported by the health endpoint and the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header carrying the caller identity supplied by the identity provider.
pub const USER_HEADER: &str = "x-user-id";

/// Default daemon address
pub const DEFAULT_URL: &str = "http://127.0.0.1:7870";
