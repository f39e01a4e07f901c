pub mod health;
pub mod diagnostics;
pub mod room_end;

pub use health::*;
pub use diagnostics::*;
pub use room_end::*;
