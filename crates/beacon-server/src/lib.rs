pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod event_bridge;
pub mod router;
pub mod server;

pub use auth::Authenticator;
pub use connection::{Connection, ConnectionRegistry};
pub use dispatcher::{DispatchError, ToolDispatcher};
pub use router::TopicRouter;
pub use server::{start, ServerConfig, ServerHandle};
