use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::LookupError;

/// A single lookup: which shipment to open and which container to expect in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub reference_number: String,
    pub container_id: String,
}

impl LookupRequest {
    pub fn new(container_id: &str, reference_number: &str) -> Self {
        Self {
            reference_number: reference_number.to_string(),
            container_id: container_id.to_string(),
        }
    }

    /// Public tracking page for this reference number, e.g.
    /// `https://www.dbschenker.com/app/tracking-public/?refNumber=TWTPE0000355701`
    pub fn tracking_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("refNumber", &self.reference_number);
        url
    }
}

/// Shipment JSON intercepted from the tracking site's own API call.
///
/// The shape belongs to the carrier, so only `containerNumbers` is read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RawShipmentPayload(pub Value);

impl Default for RawShipmentPayload {
    fn default() -> Self {
        RawShipmentPayload(Value::Object(Default::default()))
    }
}

impl RawShipmentPayload {
    /// `None` when the field is absent or not a list. Non-string entries are skipped.
    pub fn container_numbers(&self) -> Option<Vec<&str>> {
        let numbers = self.0.get("containerNumbers")?.as_array()?;
        Some(numbers.iter().filter_map(Value::as_str).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedShipment {
    pub arrival_port: String,
    /// Read from the "deliver to" field of the tracking page
    pub arrival_date: String,
    /// First vessel only
    pub vessel_name: String,
}

impl NormalizedShipment {
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.arrival_port.is_empty() {
            Some("arrivalPort")
        } else if self.arrival_date.is_empty() {
            Some("arrivalDate")
        } else if self.vessel_name.is_empty() {
            Some("vesselName")
        } else {
            None
        }
    }
}

/// Outcome envelope of one lookup. Owned by that lookup alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LookupResult {
    pub normalized: NormalizedShipment,
    pub raw: RawShipmentPayload,
    #[serde(skip)]
    pub error: Option<LookupError>,
}
