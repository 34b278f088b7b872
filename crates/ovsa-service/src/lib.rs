//! License service daemon and runtime client glue for the OVSA
//! toolchain: the stateful half that stores customer licenses, runs the
//! online validation protocol over mutually authenticated TLS, and
//! releases the bundle key to an attested runtime.

pub mod client;
pub mod db;
pub mod proto;
pub mod server;
pub mod tls;

pub use client::{acquire_model, AcquireRequest, AcquiredFile, QuoteProvider};
pub use db::{LicenseDb, LicenseRow, LicenseStatus};
pub use server::{LicenseServer, ServiceConfig, DEFAULT_REQUEST_DEADLINE};
