//! VoxRelay gateway: the WebSocket server, admission control, the session
//! registry and the per-session pipeline tasks that connect client audio
//! to the inference stages.

pub mod admission;
pub mod auth;
pub mod connection;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;

pub use server::start_gateway;
pub use state::GatewayState;
