pub mod diagnostics;
pub mod error;
pub mod events;
pub mod health;
pub mod messages;
pub mod presence;
pub mod ready;
pub mod room;
pub mod room_end;

pub use diagnostics::*;
pub use error::*;
pub use events::*;
pub use health::*;
pub use messages::*;
pub use presence::*;
pub use ready::*;
pub use room::*;
pub use room_end::*;
