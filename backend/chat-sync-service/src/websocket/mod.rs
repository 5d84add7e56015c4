pub mod dispatcher;
pub mod message_types;

pub use dispatcher::{ConnectionId, ConnectionPhase, Dispatcher, Subscription};
pub use message_types::{ChatCursor, WsInboundEvent, WsOutboundEvent};
