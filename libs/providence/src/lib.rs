//! # Providence - shared, reference-counted client state
//!
//! Gives independent consumers shared access to remotely backed entities
//! without each one owning a copy or fetching it again.
//!
//! - **Singles** track one value at an endpoint, with debounced per-attribute
//!   writes through [`Patcher`].
//! - **Lists** track ordered collections whose entries are themselves singles,
//!   shared with anyone else holding the same entry.
//! - **Forms** track input fields, validate them client-side through
//!   [`Fielder`] and submit them.
//!
//! Every module lives in a [`Registry`] under a [`Namespace`]. A module exists
//! while at least one listener holds it and is torn down when the last one
//! leaves, unless it is persistent.
//!
//! ```rust,ignore
//! use providence::{ListenerId, Namespace, Providence, SingleOptions};
//!
//! let root = Providence::builder().build()?;
//! let me = ListenerId::new();
//! let user = root
//!     .single(
//!         &Namespace::new(["user", "1"])?,
//!         Some(SingleOptions::new().endpoint("/api/users/1/")),
//!         &me,
//!     )?
//!     .controller;
//! user.get_once().await;
//! user.patcher("name").set(serde_json::json!("Fox"));
//! ```

pub mod client;
pub mod config;
pub mod contracts;
pub mod derivers;
pub mod error;
pub mod fetchable;
pub mod forms;
pub mod lists;
pub mod namespace;
pub mod paginator;
pub mod registry;
pub mod runtime;
pub mod singles;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use async_trait::async_trait;

pub use client::Client;
pub use config::ProvidenceConfig;
pub use contracts::{Controller, ModuleKind};
pub use derivers::{DefaultDerivers, Derivers, FormErrorSet};
pub use error::{Error, ModuleError, Result};
pub use fetchable::{ErrorTracking, QueryParams, LOCAL_ENDPOINT};
pub use forms::validators::{validator_fn, Validator, ValidatorArgs, ValidatorRegistry, ValidatorSpec};
pub use forms::{Field, FieldOptions, Fielder, FormController, FormOptions, FormState};
pub use lists::{ListController, ListOptions, ListState};
pub use namespace::{Namespace, NamespaceError};
pub use paginator::{DefaultPaginator, PageInfo, PaginationResult, Paginator};
pub use registry::{ListenerId, Registration, Registry, RegistryError};
pub use runtime::{Providence, ProvidenceBuilder, SingleScope};
pub use singles::{Patcher, SingleController, SingleOptions, SingleState, WritePhase};
pub use store::{MemoryStore, Store, StoreProxy};
pub use transport::{HttpTransport, NetRequest, NetResponse, Transport, TransportError};
