//! Tag-driven expiry of resource groups.

mod policy;
pub mod tags;

pub use policy::{Evaluation, ExpiryPolicy, ExpiryState};
