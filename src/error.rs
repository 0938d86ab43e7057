use thiserror::Error;

/// Every way a shipment lookup can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// The tracking site rendered its own error message (e.g. "Shipment not found!")
    #[error("{0}")]
    RemoteReported(String),

    /// Navigation or an element wait ran past its bound
    #[error("{0}")]
    Timeout(String),

    #[error("The provided Bill of Ladens has no container registered")]
    NoContainersRegistered,

    #[error("Container not found in the provided Bill of Ladens")]
    ContainerNotFound,

    #[error("Shipment data is missing the {field} field")]
    IncompleteShipment { field: &'static str },

    /// Anything else surfaced by the browser layer
    #[error("Browser automation failed: {0}")]
    Automation(String),
}

impl LookupError {
    pub fn automation(err: impl std::fmt::Display) -> Self {
        LookupError::Automation(err.to_string())
    }
}
