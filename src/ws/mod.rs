pub mod docrelay;
pub mod docs_socket;
pub mod events_socket;
pub mod local;
pub mod roomhub;

pub use docrelay::{DocRelay, DocSubscription, RelayStats};
pub use docs_socket::docs_ws_handler;
pub use events_socket::events_ws_handler;
pub use local::{LocalDocConnector, LocalEventConnector};
pub use roomhub::{ConnId, HubStats, RoomHub};
