//! Keel operators: the concrete reconciliation policies.
//!
//! - [`HaScaler`] keeps opted-in Deployments at a minimum replica count.
//! - [`NginxReconciler`] manages a Deployment per [`Nginx`] custom resource.

#![forbid(unsafe_code)]

mod crd;
mod ha;
mod nginx;

#[cfg(test)]
mod fake;

pub use crd::{Nginx, NginxSpec, NginxStatus};
pub use ha::{HaConfig, HaScaler, DEFAULT_HA_ANNOTATION};
pub use nginx::{new_deployment, validate_spec, NginxReconciler};
