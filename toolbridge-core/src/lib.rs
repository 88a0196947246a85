//! Toolbridge core: a JSON-RPC tool gateway.
//!
//! Cloud endpoints connect over WebSocket ([`frontend`]); local tool
//! servers are reached over a process pipe, SSH, or HTTP ([`backend`]).
//! The [`gateway`] ties them together, merging tool catalogs
//! ([`catalog`]), routing calls ([`router`]), remapping request ids
//! ([`remap`]) and keeping replies under the frontend size ceiling
//! ([`governor`]).

pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod frontend;
pub mod gateway;
pub mod governor;
pub mod jsonrpc;
pub mod remap;
pub mod router;

pub use gateway::{Gateway, GatewayState};
