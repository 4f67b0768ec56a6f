//! Master registry: session advertisement, server browser and invites

mod client;
mod error;
mod invite;
mod server;
mod session;
mod store;

pub use client::{ClientError, MasterClient};
pub use error::RegistryError;
pub use invite::{InviteCode, InviteRegistry, CODE_ALPHABET, DEFAULT_INVITE_TTL_MINUTES};
pub use server::{
    router, CreateInvite, InviteCreated, InviteValidation, MasterConfig, MasterServer, Registered,
    StatusReply, ValidateInvite, DEFAULT_MASTER_PORT,
};
pub use session::{Privacy, ServerFilter, SessionDescriptor, SessionUpdate};
pub use store::{Registry, RegistryStats, DEFAULT_STALE_AFTER_SECS};
