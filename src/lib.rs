pub mod browser;
pub mod chromium;
pub mod config;
pub mod error;
pub mod models;
pub mod shipment;

pub use error::LookupError;
pub use models::{LookupRequest, LookupResult, NormalizedShipment, RawShipmentPayload};
pub use shipment::ShipmentLookupService;
