//! Domain models for executant.
//!
//! - [`Manifest`]: a compose document as read from the control plane.
//! - [`LabelFilter`]: the retain-label set a service must intersect to be deployed.
//! - [`FilteredManifest`]: what is left of a manifest after filtering; an empty
//!   one converges like an absent manifest.

mod manifest;

pub use manifest::*;
