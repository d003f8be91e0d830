//! Performs one webhook attempt per due delivery.
//!
//! An attempt is: claim the delivery (PENDING -> IN_FLIGHT, attempts + 1),
//! POST the canonical body, then write the outcome back. The IN_FLIGHT step
//! is what keeps attempts of one `(event, subscription)` pair serial; a
//! delivery that is already IN_FLIGHT is skipped.
//!
//! Problems on our side (empty secret, unusable URL) close the delivery as
//! DEAD without a request: retrying cannot fix them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forgemes_observability::DispatcherMetrics;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url, redirect};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backoff::{RetryPolicy, parse_retry_after};
use crate::config::DispatcherConfig;
use crate::error::StoreError;
use crate::model::{AttemptRecord, EventType, OutboxEvent, Subscription, WebhookDelivery};
use crate::signing::sign;
use crate::store::{DeliveryStore, chrono_duration};
use crate::wire::{
    HEADER_DELIVERY_ID, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_EVENT_VERSION, HEADER_SIGNATURE, USER_AGENT,
    WebhookBody,
};

/// How a response (or its absence) is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Retryable,
    Permanent,
}

impl ResponseClass {
    pub fn of(status: StatusCode) -> Self {
        match status.as_u16() {
            200..=299 => ResponseClass::Success,
            408 | 425 | 429 => ResponseClass::Retryable,
            // any server-side failure may clear up, 501 and 505 included
            500..=599 => ResponseClass::Retryable,
            // redirects are not followed, so a 3xx never reaches the receiver
            _ => ResponseClass::Permanent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded { status: u16 },
    Retry { next_attempt_at: DateTime<Utc> },
    Dead { reason: String },
    /// No attempt was made: the delivery was not waiting or not due any more.
    Skipped,
}

/// HTTP client used for every webhook: no redirects, bounded idle pool
/// per host, connect and total timeouts from the config.
pub fn build_client(config: &DispatcherConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(redirect::Policy::none())
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_max_idle_per_host(config.http_concurrency)
        .build()
}

#[derive(Clone)]
pub struct DeliveryExecutor {
    client: Client,
    permits: Arc<Semaphore>,
    deliveries: Arc<dyn DeliveryStore>,
    policy: RetryPolicy,
    metrics: Arc<DispatcherMetrics>,
}

impl DeliveryExecutor {
    pub fn new(
        client: Client,
        http_concurrency: usize,
        deliveries: Arc<dyn DeliveryStore>,
        policy: RetryPolicy,
        metrics: Arc<DispatcherMetrics>,
    ) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(http_concurrency)),
            deliveries,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(
        &self,
        event: &OutboxEvent,
        event_type: &EventType,
        delivery: &WebhookDelivery,
        subscription: &Subscription,
    ) -> Result<AttemptOutcome, StoreError> {
        if self.policy.is_exhausted(delivery.attempts) {
            return self
                .close_without_request(delivery, format!("gave up after {} attempts", delivery.attempts))
                .await;
        }
        if subscription.secret.is_empty() {
            return self
                .close_without_request(delivery, "subscription has no signing secret".to_string())
                .await;
        }
        let url = match endpoint(&subscription.endpoint_url) {
            Ok(url) => url,
            Err(reason) => return self.close_without_request(delivery, reason).await,
        };

        let body = match WebhookBody::new(event, event_type).to_bytes() {
            Ok(body) => body,
            Err(e) => {
                return self
                    .close_without_request(delivery, format!("body could not be encoded: {e}"))
                    .await;
            }
        };
        let signature = match sign(subscription.secret.expose().as_bytes(), &body) {
            Ok(signature) => signature,
            Err(e) => return self.close_without_request(delivery, e.to_string()).await,
        };

        let Ok(_permit) = self.permits.acquire().await else {
            return Ok(AttemptOutcome::Skipped);
        };
        let Some(started) = self.deliveries.begin_attempt(delivery.id, Utc::now()).await? else {
            debug!(delivery_id = %delivery.id, "delivery no longer due, skipped");
            return Ok(AttemptOutcome::Skipped);
        };
        self.metrics.attempt_started();

        let response = {
            let _in_flight = self.metrics.http_request();
            self.client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .header(HEADER_EVENT_ID, event.id.to_string())
                .header(HEADER_EVENT_TYPE, event_type.name.as_str())
                .header(HEADER_EVENT_VERSION, event.event_version.to_string())
                .header(HEADER_DELIVERY_ID, started.id.to_string())
                .header(HEADER_SIGNATURE, signature)
                .body(body)
                .send()
                .await
        };

        let now = Utc::now();
        let (record, outcome) = match response {
            Ok(response) => {
                let status = response.status();
                let code = status.as_u16();
                match ResponseClass::of(status) {
                    ResponseClass::Success => (AttemptRecord::succeeded(code, now), AttemptOutcome::Succeeded { status: code }),
                    ResponseClass::Retryable => {
                        let retry_after = response
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| parse_retry_after(v, now));
                        self.retry_or_give_up(&started, Some(code), format!("HTTP {code}"), retry_after, now)
                    }
                    ResponseClass::Permanent => {
                        let reason = format!("HTTP {code} is not retryable");
                        (AttemptRecord::dead(Some(code), reason.clone()), AttemptOutcome::Dead { reason })
                    }
                }
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("request timed out: {e}")
                } else {
                    format!("request failed: {e}")
                };
                self.retry_or_give_up(&started, None, error, None, now)
            }
        };

        if !self.deliveries.record_attempt(started.id, &record, now).await? {
            warn!(delivery_id = %started.id, "delivery changed while the request was on the wire; outcome dropped");
            return Ok(AttemptOutcome::Skipped);
        }

        match &outcome {
            AttemptOutcome::Succeeded { status } => {
                self.metrics.delivery_succeeded();
                info!(
                    delivery_id = %started.id,
                    event_id = %event.id,
                    attempts = started.attempts,
                    status,
                    "webhook delivered"
                );
            }
            AttemptOutcome::Retry { next_attempt_at } => {
                self.metrics.delivery_retried();
                warn!(
                    delivery_id = %started.id,
                    event_id = %event.id,
                    attempts = started.attempts,
                    next_attempt_at = %next_attempt_at,
                    error = record.error.as_deref().unwrap_or_default(),
                    "webhook attempt failed, will retry"
                );
            }
            AttemptOutcome::Dead { reason } => {
                self.metrics.delivery_dead();
                warn!(
                    delivery_id = %started.id,
                    event_id = %event.id,
                    attempts = started.attempts,
                    reason = %reason,
                    "webhook delivery is dead"
                );
            }
            AttemptOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    fn retry_or_give_up(
        &self,
        started: &WebhookDelivery,
        code: Option<u16>,
        error: String,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> (AttemptRecord, AttemptOutcome) {
        if self.policy.is_exhausted(started.attempts) {
            let reason = format!("{error}; gave up after {} attempts", started.attempts);
            return (AttemptRecord::dead(code, reason.clone()), AttemptOutcome::Dead { reason });
        }
        let next_attempt_at = now + chrono_duration(self.policy.next_delay(started.attempts, retry_after));
        (
            AttemptRecord::retry(code, error, next_attempt_at),
            AttemptOutcome::Retry { next_attempt_at },
        )
    }

    async fn close_without_request(
        &self,
        delivery: &WebhookDelivery,
        reason: String,
    ) -> Result<AttemptOutcome, StoreError> {
        if !self.deliveries.mark_dead(delivery.id, &reason, Utc::now()).await? {
            return Ok(AttemptOutcome::Skipped);
        }
        self.metrics.delivery_dead();
        warn!(delivery_id = %delivery.id, reason = %reason, "webhook delivery is dead");
        Ok(AttemptOutcome::Dead { reason })
    }
}

fn endpoint(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("endpoint url {raw:?} is invalid: {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("endpoint url scheme {other:?} is not supported")),
    }
}
