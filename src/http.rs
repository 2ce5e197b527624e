//! Axum route for Stripe webhook deliveries.
//!
//! The route hands the raw body and the `Stripe-Signature` header to a
//! [`WebhookReceiver`] and translates the outcome into the status Stripe
//! expects: 2xx acknowledges, 4xx drops the event, 5xx asks for redelivery.

use crate::billing::{WebhookError, WebhookReceiver};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::json;
use std::sync::Arc;

/// Header Stripe signs deliveries with.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Default mount path of the webhook route.
pub const WEBHOOK_PATH: &str = "/stripe/webhook";

/// Router exposing `POST /stripe/webhook`.
///
/// ```rust,ignore
/// let dispatcher = WebhookDispatcher::new(client, gateway, store, secret, &config);
/// let app = Router::new().merge(webhook_router(Arc::new(dispatcher)));
/// ```
pub fn webhook_router(receiver: Arc<dyn WebhookReceiver>) -> Router {
    webhook_router_at(WEBHOOK_PATH, receiver)
}

/// Same as [`webhook_router`], mounted at `path`.
pub fn webhook_router_at(path: &str, receiver: Arc<dyn WebhookReceiver>) -> Router {
    Router::new().route(path, post(receive_webhook)).with_state(receiver)
}

async fn receive_webhook(
    State(receiver): State<Arc<dyn WebhookReceiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        tracing::warn!(target: "subsync::webhook", "Webhook delivery without signature header");
        return error_response(WebhookError::permanent("Missing Stripe-Signature header"));
    };

    match receiver.receive(&body, signature).await {
        Ok(outcome) => {
            (StatusCode::OK, Json(json!({ "outcome": outcome.as_str() }))).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn error_response(error: WebhookError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": error.message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::WebhookOutcome;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct FixedReceiver(std::result::Result<WebhookOutcome, WebhookError>);

    #[async_trait]
    impl WebhookReceiver for FixedReceiver {
        async fn receive(
            &self,
            _payload: &[u8],
            _signature: &str,
        ) -> std::result::Result<WebhookOutcome, WebhookError> {
            self.0.clone()
        }
    }

    async fn post(
        receiver: FixedReceiver,
        signature: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let app = webhook_router(Arc::new(receiver));
        let mut request = Request::builder().method("POST").uri(WEBHOOK_PATH);
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let response = app.oneshot(request.body(Body::from("{}")).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_missing_signature_is_rejected() {
        let (status, body) = post(FixedReceiver(Ok(WebhookOutcome::Processed)), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing Stripe-Signature header");
    }

    #[tokio::test]
    async fn test_outcome_is_acknowledged() {
        let (status, body) =
            post(FixedReceiver(Ok(WebhookOutcome::Processed)), Some("t=1,v1=00")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], WebhookOutcome::Processed.as_str());
    }

    #[tokio::test]
    async fn test_error_status_is_forwarded() {
        let (status, _) =
            post(FixedReceiver(Err(WebhookError::order_not_found("000000100"))), Some("t=1,v1=00"))
                .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) =
            post(FixedReceiver(Err(WebhookError::retry_later("boom"))), Some("t=1,v1=00")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "boom");
    }
}
