#![warn(missing_docs)]

//! smbengine client: connection dispatch, credit accounting, key derivation,
//! sessions, leases and break routing over the smbengine codec.

pub mod auth;
pub mod breaks;
pub mod client;
pub mod config;
pub mod connection;
pub mod credits;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod handle;
pub mod hooks;
pub mod lease;
pub mod pending;
pub mod request;
pub mod session;
pub mod tree;

pub use auth::{Anonymous, AuthProvider, AuthStep};
pub use breaks::{BreakDispatcher, BreakFuture, BreakKey, BreakNotification};
pub use client::{Client, ClientScope};
pub use config::ClientConfig;
pub use connection::{ChannelSecurity, Connection, ConnectionState, NegotiatedInfo};
pub use credits::{credit_charge, CreditWindow, MessageIds};
pub use error::{ClientError, Result};
pub use handle::{DurableGrant, Handle};
pub use hooks::{HookEvent, HookFn, HookPayload};
pub use lease::{Lease, LeaseRef, LeaseTable};
pub use pending::{Outcome, RequestFuture, Response};
pub use request::Request;
pub use session::{Channel, Session};
pub use tree::{Durability, LeaseRequest, OpenOptions, Tree};
