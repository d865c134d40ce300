//! Keeps the TLS certificate of a multi-service deployment valid.
//!
//! A certificate for one domain (plus its wildcard and extra names) is obtained from an ACME
//! certificate authority with a DNS-01 challenge, deployed atomically to every path the services
//! read it from, and handed to those services by restarting or reloading them.
//!
//! # Lifecycle
//!
//! Every cycle runs, strictly in order:
//!
//! 1. [`inspect()`] the deployed certificate (read-only);
//! 2. [`decide`] what to do about it (pure);
//! 3. issue a new certificate through an [`AcmeCapability`], or generate a self-signed
//!    [fallback](fallback::generate_fallback) when the authority rate limits us and the deployed
//!    certificate is missing or about to expire;
//! 4. [deploy](DeploymentManager) the new pair with write-temp-then-rename;
//! 5. [reload](ReloadCoordinator) the dependent services.
//!
//! Cycles that write never overlap. See [`Lifecycle`].
//!
//! # Rate Limits
//!
//! Let's Encrypt enforces [rate limits]. Hitting one is the only failure answered with a
//! self-signed certificate; every other failure leaves the deployed pair alone and needs an
//! operator. Use the staging environment while setting up.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

pub mod attempt;
pub mod cert;
pub mod config;
pub mod deploy;
mod error;
pub mod fallback;
pub mod inspect;
pub mod issue;
pub mod lifecycle;
pub mod policy;
pub mod reload;


pub use crate::{
    cert::{CertificateMaterial, MaterialOrigin},
    config::Config,
    deploy::DeploymentManager,
    error::ErrorKind,
    inspect::{inspect, CertificateRecord},
    issue::{AcmeCapability, IssuanceClient},
    lifecycle::Lifecycle,
    policy::{decide, Action, PolicyThresholds},
    reload::{ReloadCoordinator, ServiceTarget, Supervisor},
};
