pub mod api;
pub mod client;
pub mod endpoints;
pub mod session;
pub mod transport;

pub use api::{ChatApi, HttpApi};
pub use client::{LinkState, SocketClient, SocketConfig, SocketHandle};
pub use endpoints::Endpoints;
pub use session::{Session, SessionTokens};
pub use transport::RealtimeTransport;
