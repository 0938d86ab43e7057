use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::browser::{BrowserDriver, BrowserSession, ResponseSubscription};
use crate::chromium::ChromiumDriver;
use crate::config::Config;
use crate::error::LookupError;
use crate::models::{LookupRequest, LookupResult, NormalizedShipment, RawShipmentPayload};

/// The tracking page's own call for the shipment JSON
static SHIPMENT_API: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/tracking-public/shipments/ocean/\d+$").expect("shipment API pattern is valid")
});

// The default viewport is too small for the vessels panel toggle to be clickable
const VIEWPORT_WIDTH: u32 = 1080;
const VIEWPORT_HEIGHT: u32 = 1024;

const REMOVE_COOKIE_FOOTER: &str =
    "document.querySelector('es-shell')?.shadowRoot?.querySelector('shell-footer')?.remove();";

const ERROR_MESSAGE: &str = ".error";
const VESSELS_TOGGLE: &str = r#"[data-test="vessels_label"]"#;
const ARRIVAL_PORT: &str = r#"[data-test="consignee_place_value"]"#;
const ARRIVAL_DATE: &str = r#"[data-test="deliver_to_value"]"#;
const VESSEL_NAME: &str = r#"[data-test="vessels_name_0_value"]"#;

pub struct ShipmentLookupService {
    config: Config,
    driver: Arc<dyn BrowserDriver>,
}

impl ShipmentLookupService {
    pub fn new(config: Config, driver: Arc<dyn BrowserDriver>) -> Self {
        Self { config, driver }
    }

    /// Service backed by a local Chrome/Chromium
    pub fn chromium(config: Config) -> Self {
        let driver = Arc::new(ChromiumDriver::new(&config));
        Self::new(config, driver)
    }

    /// Look up a shipment by master bill of ladens and check that `container_id` belongs to it.
    ///
    /// Opens a fresh browser session per call. On success all three
    /// normalized fields are non-empty.
    pub async fn lookup(
        &self,
        container_id: &str,
        reference_number: &str,
    ) -> Result<LookupResult, LookupError> {
        let request = LookupRequest::new(container_id, reference_number);

        let mut result = self.fetch_shipment_data(&request).await;

        if let Some(error) = result.error.take() {
            return Err(error);
        }

        validate_container(&request.container_id, &result)?;

        if let Some(field) = result.normalized.missing_field() {
            return Err(LookupError::IncompleteShipment { field });
        }

        Ok(result)
    }

    /// Never fails: problems end up in `LookupResult::error`.
    async fn fetch_shipment_data(&self, request: &LookupRequest) -> LookupResult {
        let mut result = LookupResult::default();

        let mut session = match self.driver.launch().await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    error = %e,
                    reference_number = %request.reference_number,
                    "Failed to launch browser"
                );
                result.error = Some(e);
                return result;
            }
        };

        let outcome = self.scrape(session.as_mut(), request, &mut result).await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close browser session");
        }

        if let Err(e) = outcome {
            error!(
                error = %e,
                reference_number = %request.reference_number,
                "Shipment lookup failed"
            );
            result.error = Some(e);
        }

        result
    }

    async fn scrape(
        &self,
        session: &mut dyn BrowserSession,
        request: &LookupRequest,
        result: &mut LookupResult,
    ) -> Result<(), LookupError> {
        session.set_viewport(VIEWPORT_WIDTH, VIEWPORT_HEIGHT).await?;

        let mut shipments = session.observe_responses(SHIPMENT_API.clone()).await?;

        let url = request.tracking_url(&self.config.tracking_url);
        session.navigate(url.as_str(), self.config.navigation_timeout).await?;

        // Cookie wall sits on top of the vessels toggle
        session.evaluate(REMOVE_COOKIE_FOOTER).await?;

        session.wait_for_network_idle().await?;
        if let Some(text) = session.query_text(ERROR_MESSAGE).await? {
            return Err(LookupError::RemoteReported(text.trim().to_string()));
        }

        // Vessel details are only rendered once the panel is opened
        session.wait_for_selector(VESSELS_TOGGLE).await?;
        session.click(VESSELS_TOGGLE).await?;

        result.normalized = NormalizedShipment {
            arrival_port: read_field(session, ARRIVAL_PORT).await?,
            arrival_date: read_field(session, ARRIVAL_DATE).await?,
            vessel_name: read_field(session, VESSEL_NAME).await?,
        };
        debug!(shipment = ?result.normalized, "Extracted shipment fields");

        capture_payload(&mut shipments, result);
        Ok(())
    }
}

async fn read_field(
    session: &mut dyn BrowserSession,
    selector: &str,
) -> Result<String, LookupError> {
    session.wait_for_selector(selector).await?;
    let text = session.query_text(selector).await?.unwrap_or_default();
    Ok(text.trim().to_string())
}

/// Last parseable shipment body wins
fn capture_payload(shipments: &mut ResponseSubscription, result: &mut LookupResult) {
    for response in shipments.drain() {
        if !SHIPMENT_API.is_match(&response.url) || response.body.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&response.body) {
            Ok(payload) => {
                debug!(url = %response.url, "Captured shipment payload");
                result.raw = RawShipmentPayload(payload);
            }
            Err(e) => warn!(
                error = %e,
                url = %response.url,
                "Ignoring unparseable shipment payload"
            ),
        }
    }
}

/// Check the requested container against the payload's `containerNumbers`,
/// ignoring case and punctuation.
pub fn validate_container(container_id: &str, result: &LookupResult) -> Result<(), LookupError> {
    let registered = match result.raw.container_numbers() {
        Some(numbers) if !numbers.is_empty() => numbers,
        _ => return Err(LookupError::NoContainersRegistered),
    };

    let registered: HashSet<String> = registered.into_iter().map(normalize_container_id).collect();

    if !registered.contains(&normalize_container_id(container_id)) {
        return Err(LookupError::ContainerNotFound);
    }

    Ok(())
}

/// `"abcd-123 4567"` -> `"ABCD1234567"`
pub fn normalize_container_id(text: &str) -> String {
    text.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
