//! # hubbub-core
//!
//! Foundation types for the hubbub realtime gateway.
//!
//! This crate provides the shared vocabulary the gateway, client and server
//! binary all depend on:
//!
//! - **Branded IDs**: [`ids::WorkspaceId`], [`ids::UserId`], [`ids::ChannelId`]
//!   as numeric newtypes, [`ids::ConnectionId`] as a UUIDv7 newtype
//! - **Wire events**: [`events::ClientEvent`] and [`events::ServerEvent`]
//!   tagged unions with the `{type, payload}` envelope, plus close codes
//! - **Messages**: [`message::CanonicalMessage`] as returned by the
//!   persistence collaborator and broadcast verbatim
//! - **Errors**: [`errors::GatewayError`] taxonomy via `thiserror`, with wire
//!   error codes, fatality and close-code mapping
//! - **Reconnect**: [`retry::ReconnectPolicy`] and backoff calculation
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other hubbub crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod retry;
