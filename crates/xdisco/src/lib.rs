//! `xdisco`: a service-discovery client.
//!
//! Servers of a given `kind` register themselves through a [`Broker`]
//! (etcd lease or Kubernetes pod annotations), a [`Service`] watches that
//! `kind` and keeps a health-filtered [`ServerList`] snapshot, and
//! [`ServerList::lookup`] resolves a routing key to one member via
//! rendezvous hashing.

pub mod broker;
pub mod error;
pub mod eventhandler;
pub mod health;
pub mod logs;
pub mod lookup;
pub mod server;
pub mod service;

pub use broker::{Broker, Hook, Shutdown};
pub use error::{Result, XdiscoError};
pub use eventhandler::EventHandler;
pub use health::Checker;
pub use lookup::Rendezvous;
pub use server::{new_server, Server, ServerList, State};
pub use service::Service;
