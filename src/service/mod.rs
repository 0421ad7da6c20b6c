//! Service layer
//!
//! Logic that sits on top of the repositories.

mod resolver;

pub use resolver::{ReferenceResolver, Resolution, SkipReason};
