//! confcom: security policies for confidential containers.
//!
//! Compiles ARM templates and standalone spec files into container
//! allow-list policies, renders them as Rego, and signs, verifies,
//! publishes and imports policy fragments.
//!
//! Pipeline:
//! - [`template`] substitutes parameters and variables
//! - [`policy`] compiles container groups into [`policy::PolicySpec`]s
//! - [`trust`] signs and verifies fragment envelopes via `sign1util`
//! - [`registry`] discovers and moves fragments via `oras`
//! - [`import`] turns published fragments into trusted imports

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authoring;
pub mod config;
pub mod error;
pub mod executor;
pub mod import;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod template;
pub mod trust;

pub use error::{ConfcomError, Result, TrustError};
