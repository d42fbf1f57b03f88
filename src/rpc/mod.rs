//! RpcServer (spec.md §4.9): the mutually-authenticated RPC surface
//! exposed to the gateway.

pub mod handlers;
pub mod server;
pub mod validate;
pub mod wire;

pub use handlers::RpcHandlers;
pub use server::{build_tls_config, router, serve, TlsPaths};
