//! Backend wire protocol
//!
//! JSON text frames tagged on `type`. The client sends `subscribe`,
//! `unsubscribe` and `pong`; the backend answers with `subscribed`,
//! `unsubscribed`, `error`, and streams `change` messages and `ping`s.

mod messages;

pub use messages::{ClientMessage, ServerMessage, SubscribeQuery};
