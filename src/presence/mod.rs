pub mod color;
pub mod registry;

pub use color::ColorAssigner;
pub use registry::{JoinOutcome, LeaveOutcome, PresenceEntry, PresenceRegistry};
