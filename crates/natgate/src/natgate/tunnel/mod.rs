//! Reverse NAT tunnel.
//!
//! An agent behind NAT dials a controller and authenticates with a token. The
//! controller opens public TCP and/or UDP listeners for it and relays every public
//! client over the agent's single control channel, framed by [`protocol`].

pub mod auth;
pub mod channel;
pub mod client;
pub mod flows;
pub mod pipe;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod udpmux;
