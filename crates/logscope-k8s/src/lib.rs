//! Kubernetes client for logscope
//!
//! This crate provides kubeconfig handling, bearer-token client construction
//! and pod lookups.

mod client;

pub use client::KubeClient;

// Re-export types that are used in our public API
pub use logscope_types::{ContainerInfo, Credential, PodInfo};
