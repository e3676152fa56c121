pub mod room;
pub mod server;
pub mod signaling;

pub use room::{Departure, RoomRegistry};
pub use server::{ConnectionHandle, RelayServer, RoomSnapshot};
pub use signaling::SignalingHandler;
