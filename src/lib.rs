//! Tag-driven expiry of Azure resource groups.
//!
//! Each resource group carries an `ExpiresBy` tag. Groups without one get a
//! default expiry, groups with recent administrative activity get extended,
//! and groups past their expiry are deleted once cleanup is enabled.
//!
//! The crate is split the same way a sweep runs:
//!
//! - [`config`] loads the TOML configuration.
//! - [`cloud`] talks to Azure Resource Manager, or to an in-memory double.
//! - [`expiry`] decides what should happen to a single resource group.
//! - [`sweep`] fans that decision out over subscriptions and groups.

pub mod cloud;
pub mod config;
pub mod expiry;
#[cfg(feature = "cli")]
pub mod observability;
pub mod sweep;
