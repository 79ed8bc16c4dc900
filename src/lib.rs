pub mod acme;
pub mod cert;
pub mod challenge;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod manager;
pub mod provider;
pub mod server;
pub mod store;
pub mod time;

pub use cert::{CertificateCallback, CertificateMaterial};
pub use manager::{CertificateLifecycleManager, ManagerState, RenewOutcome};

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
