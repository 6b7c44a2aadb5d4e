// Logging must come first so `tlog!` is visible to every module below
#[macro_use]
pub mod logging;

pub mod backend;
pub mod ble_common;
pub mod ble_transport;
pub mod error;
pub mod gatt;
pub mod identity;
pub mod scan;
pub mod session;
pub mod settings;
pub mod transport;

pub use backend::{BackendApi, LocationChoice, RestBackend};
pub use ble_transport::BtleplugTransport;
pub use error::{ErrorKind, ProvisionError};
pub use session::{
    NetworkCredentials, ProvisionRequest, ProvisioningSession, RetryPoint, SessionConfig,
    SessionState,
};
pub use settings::ProvisionSettings;
pub use transport::{BleTransport, CancelHandle};
