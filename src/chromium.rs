//! Chrome-backed [`BrowserDriver`] built on chromiumoxide.

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    GetResponseBodyParams, RequestId,
};
use chromiumoxide::listeners::EventStream;
use futures::StreamExt;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::browser::{
    BrowserDriver, BrowserSession, CapturedResponse, IdlePolicy, ResponseSubscription,
};
use crate::config::Config;
use crate::error::LookupError;

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a closed (or killed) browser gets to exit before it is killed again
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ChromiumDriver {
    headless: bool,
    chrome_executable: Option<PathBuf>,
    navigation_timeout: Duration,
    wait_timeout: Duration,
}

impl ChromiumDriver {
    pub fn new(config: &Config) -> Self {
        Self {
            headless: config.headless,
            chrome_executable: config.chrome_executable.clone(),
            navigation_timeout: config.navigation_timeout,
            wait_timeout: config.wait_timeout,
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig, LookupError> {
        let mut builder = BrowserConfig::builder().request_timeout(self.navigation_timeout);

        if !self.headless {
            builder = builder.with_head();
        }

        if let Some(path) = &self.chrome_executable {
            builder = builder.chrome_executable(path);
        }

        builder.build().map_err(LookupError::Automation)
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, LookupError> {
        let (mut browser, mut handler) = Browser::launch(self.browser_config()?)
            .await
            .map_err(LookupError::automation)?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler event failed");
                }
            }
        });

        let (page, events) = match open_page(&browser).await {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(close_err) = shutdown(&mut browser, REAP_TIMEOUT).await {
                    warn!(error = %close_err, "Failed to close browser after setup error");
                }
                handler_task.abort();
                return Err(e);
            }
        };

        let (monitor, activity, subscribe_tx) = NetworkMonitor::start(page.clone(), events);

        debug!("Browser session launched");

        Ok(Box::new(ChromiumSession {
            browser,
            page,
            activity,
            subscribe_tx,
            wait_timeout: self.wait_timeout,
            handler_task,
            monitor_task: monitor,
        }))
    }
}

async fn open_page(browser: &Browser) -> Result<(Page, NetworkEvents), LookupError> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(LookupError::automation)?;

    let events = NetworkEvents::subscribe(&page).await?;
    Ok((page, events))
}

struct NetworkEvents {
    requests: EventStream<EventRequestWillBeSent>,
    responses: EventStream<EventResponseReceived>,
    finished: EventStream<EventLoadingFinished>,
    failed: EventStream<EventLoadingFailed>,
}

impl NetworkEvents {
    async fn subscribe(page: &Page) -> Result<Self, LookupError> {
        Ok(Self {
            requests: page.event_listener().await.map_err(LookupError::automation)?,
            responses: page.event_listener().await.map_err(LookupError::automation)?,
            finished: page.event_listener().await.map_err(LookupError::automation)?,
            failed: page.event_listener().await.map_err(LookupError::automation)?,
        })
    }
}

/// Snapshot of in-flight network requests for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NetworkActivity {
    pub inflight: usize,
    pub changed_at: Instant,
}

type Watcher = (Regex, mpsc::UnboundedSender<CapturedResponse>);

/// In-flight requests and pending matched responses for one page.
#[derive(Default)]
struct NetworkLedger {
    inflight: HashSet<String>,
    /// request id -> url, for responses some watcher wants
    matched: HashMap<String, String>,
    watchers: Vec<Watcher>,
}

impl NetworkLedger {
    fn add_watcher(&mut self, watcher: Watcher) {
        self.watchers.push(watcher);
    }

    fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// `true` when the in-flight count changed. Redirects reuse the request id.
    fn request_sent(&mut self, request_id: &str) -> bool {
        self.inflight.insert(request_id.to_string())
    }

    fn response_received(&mut self, request_id: &str, url: &str) {
        if self.watchers.iter().any(|(pattern, _)| pattern.is_match(url)) {
            self.matched.insert(request_id.to_string(), url.to_string());
        }
    }

    /// Whether the in-flight count changed, and the url to read the body of, if matched.
    fn loading_finished(&mut self, request_id: &str) -> (bool, Option<String>) {
        let changed = self.inflight.remove(request_id);
        (changed, self.matched.remove(request_id))
    }

    fn loading_failed(&mut self, request_id: &str) -> bool {
        self.matched.remove(request_id);
        self.inflight.remove(request_id)
    }

    /// Hand `body` to every live watcher of `url`, dropping watchers whose subscription is gone.
    fn deliver(&mut self, url: &str, body: &str) {
        self.watchers.retain(|(pattern, tx)| {
            if !pattern.is_match(url) {
                return !tx.is_closed();
            }
            tx.send(CapturedResponse {
                url: url.to_string(),
                body: body.to_string(),
            })
            .is_ok()
        });
    }
}

/// Background task feeding CDP network events into a [`NetworkLedger`].
struct NetworkMonitor {
    page: Page,
    ledger: NetworkLedger,
    activity: watch::Sender<NetworkActivity>,
}

impl NetworkMonitor {
    fn start(
        page: Page,
        events: NetworkEvents,
    ) -> (JoinHandle<()>, watch::Receiver<NetworkActivity>, mpsc::UnboundedSender<Watcher>) {
        let (activity_tx, activity_rx) = watch::channel(NetworkActivity {
            inflight: 0,
            changed_at: Instant::now(),
        });
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();

        let monitor = NetworkMonitor {
            page,
            ledger: NetworkLedger::default(),
            activity: activity_tx,
        };

        let task = tokio::spawn(monitor.run(events, subscribe_rx));
        (task, activity_rx, subscribe_tx)
    }

    async fn run(
        mut self,
        mut events: NetworkEvents,
        mut subscribe_rx: mpsc::UnboundedReceiver<Watcher>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(watcher) = subscribe_rx.recv() => {
                    self.ledger.add_watcher(watcher);
                }
                Some(event) = events.requests.next() => {
                    if self.ledger.request_sent(event.request_id.inner()) {
                        self.publish();
                    }
                }
                Some(event) = events.responses.next() => {
                    self.ledger.response_received(event.request_id.inner(), &event.response.url);
                }
                Some(event) = events.finished.next() => {
                    let id = event.request_id.inner().clone();
                    let (changed, matched) = self.ledger.loading_finished(&id);
                    if changed {
                        self.publish();
                    }
                    if let Some(url) = matched {
                        self.forward_body(id, url).await;
                    }
                }
                Some(event) = events.failed.next() => {
                    if self.ledger.loading_failed(event.request_id.inner()) {
                        self.publish();
                    }
                }
                else => break,
            }
        }
    }

    fn publish(&self) {
        self.activity.send_replace(NetworkActivity {
            inflight: self.ledger.inflight(),
            changed_at: Instant::now(),
        });
    }

    async fn forward_body(&mut self, request_id: String, url: String) {
        let params = GetResponseBodyParams::new(RequestId::new(request_id));
        let reply = match self.page.execute(params).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, url = %url, "Failed to read response body");
                return;
            }
        };

        let body = decode_body(&reply.result.body, reply.result.base64_encoded);
        self.ledger.deliver(&url, &body);
    }
}

fn decode_body(body: &str, base64_encoded: bool) -> String {
    if !base64_encoded {
        return body.to_string();
    }

    match base64::engine::general_purpose::STANDARD.decode(body) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "Response body is not valid base64");
            String::new()
        }
    }
}

/// Resolve once at most `policy.max_inflight` requests have been in flight
/// for `policy.idle_time`, counted from no earlier than the call itself.
pub(crate) async fn wait_for_idle(
    activity: &mut watch::Receiver<NetworkActivity>,
    policy: IdlePolicy,
    timeout: Duration,
) -> Result<(), LookupError> {
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        let current = *activity.borrow_and_update();
        let quiet_at = (current.inflight <= policy.max_inflight)
            .then(|| current.changed_at.max(started) + policy.idle_time);

        let now = Instant::now();
        if quiet_at.is_some_and(|at| now >= at) {
            return Ok(());
        }
        if now >= deadline {
            return Err(LookupError::Timeout(format!(
                "Waiting for network idle failed: timeout {}ms exceeded",
                timeout.as_millis()
            )));
        }

        let wake = quiet_at.map_or(deadline, |at| at.min(deadline));

        tokio::select! {
            changed = activity.changed() => {
                if changed.is_err() {
                    return Err(LookupError::Automation("network monitor stopped".to_string()));
                }
            }
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

/// Script returning the element's text content as JSON, `null` when absent.
fn text_query_script(selector: &str) -> String {
    let selector = serde_json::Value::String(selector.to_string());
    format!(
        concat!(
            "(() => {{ const el = document.querySelector({}); ",
            "return JSON.stringify(el === null ? null : (el.textContent ?? '')); }})()",
        ),
        selector
    )
}

/// The browser child process, as far as shutting it down is concerned.
#[async_trait]
trait BrowserProcess: Send {
    async fn request_close(&mut self) -> Result<(), LookupError>;
    async fn kill(&mut self) -> Option<std::io::Result<()>>;
    async fn wait(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl BrowserProcess for Browser {
    async fn request_close(&mut self) -> Result<(), LookupError> {
        Browser::close(self)
            .await
            .map(|_| ())
            .map_err(LookupError::automation)
    }

    async fn kill(&mut self) -> Option<std::io::Result<()>> {
        Browser::kill(self).await
    }

    async fn wait(&mut self) -> std::io::Result<()> {
        Browser::wait(self).await.map(|_| ())
    }
}

/// Close the browser and reap its process without ever waiting unbounded.
///
/// A browser that refuses to close is killed; one that has not exited
/// within `reap_timeout` is killed and left to the OS.
async fn shutdown(
    process: &mut impl BrowserProcess,
    reap_timeout: Duration,
) -> Result<(), LookupError> {
    let closed = process.request_close().await;

    if let Err(e) = &closed {
        warn!(error = %e, "Browser did not close, killing it");
        kill_logged(process).await;
    }

    let reaped = tokio::time::timeout(reap_timeout, process.wait()).await;
    match reaped {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to reap browser process"),
        Err(_) => {
            warn!(
                timeout_ms = reap_timeout.as_millis() as u64,
                "Browser process still running, killing it"
            );
            kill_logged(process).await;
        }
    }

    closed
}

async fn kill_logged(process: &mut impl BrowserProcess) {
    if let Some(Err(e)) = process.kill().await {
        warn!(error = %e, "Failed to kill browser process");
    }
}

struct ChromiumSession {
    browser: Browser,
    page: Page,
    activity: watch::Receiver<NetworkActivity>,
    subscribe_tx: mpsc::UnboundedSender<Watcher>,
    wait_timeout: Duration,
    handler_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.monitor_task.abort();
        self.handler_task.abort();
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn set_viewport(&mut self, width: u32, height: u32) -> Result<(), LookupError> {
        self.page
            .execute(SetDeviceMetricsOverrideParams::new(
                width as i64,
                height as i64,
                1.0,
                false,
            ))
            .await
            .map_err(LookupError::automation)?;
        Ok(())
    }

    async fn observe_responses(
        &mut self,
        url_pattern: Regex,
    ) -> Result<ResponseSubscription, LookupError> {
        let (tx, subscription) = ResponseSubscription::channel();
        self.subscribe_tx
            .send((url_pattern, tx))
            .map_err(|_| LookupError::Automation("network monitor stopped".to_string()))?;
        Ok(subscription)
    }

    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), LookupError> {
        debug!(url = %url, "Navigating");

        let page = &self.page;
        let activity = &mut self.activity;
        let load = async {
            page.goto(url).await.map_err(LookupError::automation)?;
            wait_for_idle(activity, IdlePolicy::default(), timeout).await
        };

        match tokio::time::timeout(timeout, load).await {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout(format!(
                "Navigation timeout of {} ms exceeded",
                timeout.as_millis()
            ))),
        }
    }

    async fn evaluate(&mut self, script: &str) -> Result<(), LookupError> {
        self.page
            .evaluate(script)
            .await
            .map_err(LookupError::automation)?;
        Ok(())
    }

    async fn wait_for_network_idle(&mut self) -> Result<(), LookupError> {
        wait_for_idle(&mut self.activity, IdlePolicy::default(), self.wait_timeout).await
    }

    async fn query_text(&mut self, selector: &str) -> Result<Option<String>, LookupError> {
        let script = text_query_script(selector);
        let encoded: String = self
            .page
            .evaluate(script.as_str())
            .await
            .map_err(LookupError::automation)?
            .into_value()
            .map_err(LookupError::automation)?;

        serde_json::from_str(&encoded).map_err(LookupError::automation)
    }

    async fn wait_for_selector(&mut self, selector: &str) -> Result<(), LookupError> {
        let deadline = Instant::now() + self.wait_timeout;

        loop {
            if self.query_text(selector).await?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LookupError::Timeout(format!(
                    "Waiting for selector `{}` failed: timeout {}ms exceeded",
                    selector,
                    self.wait_timeout.as_millis()
                )));
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn click(&mut self, selector: &str) -> Result<(), LookupError> {
        self.page
            .find_element(selector)
            .await
            .map_err(LookupError::automation)?
            .click()
            .await
            .map_err(LookupError::automation)?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), LookupError> {
        let closed = shutdown(&mut self.browser, REAP_TIMEOUT).await;
        debug!("Browser session closed");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn activity(inflight: usize) -> NetworkActivity {
        NetworkActivity {
            inflight,
            changed_at: Instant::now(),
        }
    }

    #[test]
    fn text_query_script_quotes_selector() {
        let script = text_query_script(r#"[data-test="deliver_to_value"]"#);
        assert!(
            script.contains(r#"document.querySelector("[data-test=\"deliver_to_value\"]")"#)
        );
    }

    #[test]
    fn plain_body_passes_through() {
        assert_eq!(decode_body(r#"{"a":1}"#, false), r#"{"a":1}"#);
    }

    #[test]
    fn base64_body_is_decoded() {
        assert_eq!(decode_body("eyJhIjoxfQ==", true), r#"{"a":1}"#);
        assert_eq!(decode_body("%%%", true), "");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_once_quiet_for_idle_time() {
        let (_tx, mut rx) = watch::channel(activity(0));
        let started = Instant::now();

        wait_for_idle(&mut rx, IdlePolicy::default(), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_waits_for_inflight_to_settle() {
        let (tx, mut rx) = watch::channel(activity(2));
        let started = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tx.send_replace(activity(0));
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(tx);
        });

        wait_for_idle(&mut rx, IdlePolicy::default(), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_times_out_when_never_quiet() {
        let (_tx, mut rx) = watch::channel(activity(1));

        let err = wait_for_idle(&mut rx, IdlePolicy::default(), Duration::from_secs(3))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LookupError::Timeout(
                "Waiting for network idle failed: timeout 3000ms exceeded".to_string()
            )
        );
    }

    const SHIPMENT_URL: &str =
        "https://www.dbschenker.com/nges-portal/api/public/tracking-public/shipments/ocean/42";

    fn shipment_watcher() -> (Watcher, ResponseSubscription) {
        let (tx, subscription) = ResponseSubscription::channel();
        let pattern = Regex::new(r"/shipments/ocean/\d+$").unwrap();
        ((pattern, tx), subscription)
    }

    #[test]
    fn ledger_counts_each_request_once() {
        let mut ledger = NetworkLedger::default();

        assert!(ledger.request_sent("1"));
        assert!(!ledger.request_sent("1"), "redirect keeps the request id");
        assert!(ledger.request_sent("2"));
        assert_eq!(ledger.inflight(), 2);

        assert!(ledger.loading_failed("2"));
        assert_eq!(ledger.loading_finished("1"), (true, None));
        assert_eq!(ledger.inflight(), 0);

        assert_eq!(ledger.loading_finished("1"), (false, None));
        assert!(!ledger.loading_failed("3"));
        assert_eq!(ledger.inflight(), 0);
    }

    #[test]
    fn ledger_forwards_matched_response_once_finished() {
        let mut ledger = NetworkLedger::default();
        let (watcher, mut subscription) = shipment_watcher();
        ledger.add_watcher(watcher);

        ledger.request_sent("7");
        ledger.request_sent("8");
        ledger.response_received("7", SHIPMENT_URL);
        ledger.response_received("8", "https://www.dbschenker.com/app/main.js");

        assert_eq!(ledger.loading_finished("8"), (true, None));
        let (changed, matched) = ledger.loading_finished("7");
        assert!(changed);
        assert_eq!(matched.as_deref(), Some(SHIPMENT_URL));

        ledger.deliver(SHIPMENT_URL, r#"{"containerNumbers":[]}"#);

        assert_eq!(
            subscription.drain(),
            vec![CapturedResponse {
                url: SHIPMENT_URL.to_string(),
                body: r#"{"containerNumbers":[]}"#.to_string(),
            }]
        );
    }

    #[test]
    fn ledger_ignores_responses_seen_before_subscribing() {
        let mut ledger = NetworkLedger::default();

        ledger.request_sent("7");
        ledger.response_received("7", SHIPMENT_URL);
        let (watcher, _subscription) = shipment_watcher();
        ledger.add_watcher(watcher);

        assert_eq!(ledger.loading_finished("7"), (true, None));
    }

    #[test]
    fn ledger_drops_failed_matched_request() {
        let mut ledger = NetworkLedger::default();
        let (watcher, _subscription) = shipment_watcher();
        ledger.add_watcher(watcher);

        ledger.request_sent("7");
        ledger.response_received("7", SHIPMENT_URL);

        assert!(ledger.loading_failed("7"));
        assert_eq!(ledger.loading_finished("7"), (false, None));
    }

    #[test]
    fn ledger_prunes_closed_subscriptions() {
        let mut ledger = NetworkLedger::default();
        let (kept, mut kept_subscription) = shipment_watcher();
        let (gone, gone_subscription) = shipment_watcher();
        ledger.add_watcher(kept);
        ledger.add_watcher(gone);
        drop(gone_subscription);

        ledger.deliver(SHIPMENT_URL, "{}");

        assert_eq!(ledger.watchers.len(), 1);
        assert_eq!(kept_subscription.drain().len(), 1);
    }

    /// Child process double: exits after a successful close unless `hangs`,
    /// and after a kill unless `ignores_kill`.
    #[derive(Default)]
    struct FakeProcess {
        close_fails: bool,
        hangs: bool,
        ignores_kill: bool,
        killed: bool,
        kills: usize,
    }

    #[async_trait]
    impl BrowserProcess for FakeProcess {
        async fn request_close(&mut self) -> Result<(), LookupError> {
            if self.close_fails {
                return Err(LookupError::Automation("Request timed out.".to_string()));
            }
            Ok(())
        }

        async fn kill(&mut self) -> Option<io::Result<()>> {
            self.kills += 1;
            self.killed = true;
            Some(Ok(()))
        }

        async fn wait(&mut self) -> io::Result<()> {
            let exits = if self.killed {
                !self.ignores_kill
            } else {
                !self.close_fails && !self.hangs
            };
            if !exits {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_without_killing() {
        let mut process = FakeProcess::default();
        let started = Instant::now();

        shutdown(&mut process, REAP_TIMEOUT).await.unwrap();

        assert_eq!(process.kills, 0);
        assert!(started.elapsed() < REAP_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_kills_browser_that_fails_to_close() {
        let mut process = FakeProcess {
            close_fails: true,
            ..Default::default()
        };
        let started = Instant::now();

        let err = shutdown(&mut process, REAP_TIMEOUT).await.unwrap_err();

        assert_eq!(err, LookupError::Automation("Request timed out.".to_string()));
        assert_eq!(process.kills, 1);
        assert!(started.elapsed() < REAP_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_on_unkillable_browser() {
        let mut process = FakeProcess {
            close_fails: true,
            ignores_kill: true,
            ..Default::default()
        };
        let started = Instant::now();

        assert!(shutdown(&mut process, REAP_TIMEOUT).await.is_err());

        assert_eq!(process.kills, 2);
        assert!(started.elapsed() >= REAP_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_kills_browser_that_never_exits() {
        let mut process = FakeProcess {
            hangs: true,
            ..Default::default()
        };
        let started = Instant::now();

        shutdown(&mut process, REAP_TIMEOUT).await.unwrap();

        assert_eq!(process.kills, 1);
        assert!(started.elapsed() >= REAP_TIMEOUT);
    }
}
