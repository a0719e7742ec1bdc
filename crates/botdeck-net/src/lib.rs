//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control plane server and remote clients."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Networking surfaces for botdeck.
//!
//! The server side ([`server`]) exposes the bot control endpoint, the deploy
//! endpoint, and the per-user record with its WebSocket push channel. The
//! client side ([`client`]) implements the controller's collaborator traits
//! over HTTP so a controller can run in a different process.

pub mod auth;
pub mod client;
pub mod deploy;
pub mod server;

pub use auth::{bearer_token, Principal, StaticTokenVerifier, TokenVerifier};
pub use client::{HttpControlPlane, HttpRecordStore};
pub use deploy::{DeployBackend, DeployError, DirectoryDeployBackend};
pub use server::{ControlPlaneServerBuilder, ControlPlaneServerHandle};
