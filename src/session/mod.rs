pub mod arbitration;
pub mod channel;
pub mod doc_channel;
pub mod room_session;
pub mod supervisor;
pub mod ws_connect;

pub use arbitration::{SaveArbitrator, SavePrompt, SyncReport};
pub use channel::{ChannelStatus, EventChannel, EventConnector, EventLink};
pub use doc_channel::{DocConnector, DocLink, DocumentChannel};
pub use room_session::{
    CloseReason, CursorCause, Notice, RoomSession, SessionContext, SessionDeps, SessionEvent,
};
pub use supervisor::DegradedCause;
pub use ws_connect::{WsDocConnector, WsEventConnector};
