//! Control-plane library for the XDP ingress firewall.
//!
//! The daemon binary wires these modules together; the HTTP layer and
//! other external collaborators drive the same APIs.

pub mod aggregator;
pub mod config;
pub mod iptrie;
pub mod pool;
pub mod processor;
pub mod providers;
pub mod rules;
