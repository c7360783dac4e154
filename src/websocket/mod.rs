pub mod auth;
pub mod fanout;
pub mod handler;
pub mod registry;

pub use auth::{SessionTokens, TokenVerifier};
pub use fanout::forward_bus_to_clients;
pub use handler::ws_handler;
pub use registry::ConnectionRegistry;
