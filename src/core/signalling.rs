//! HTTP signalling: the browser posts its offer and receives the answer.

use crate::core::session::transport::SessionTransport;
use crate::core::session::{NegotiateError, SessionDescription, SessionManager};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiateError>;
}

#[async_trait]
impl<T: SessionTransport> Negotiator for SessionManager<T> {
    async fn negotiate(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiateError> {
        SessionManager::negotiate(self, offer).await
    }
}

/// Body of every `/api/offer` response.
#[derive(Debug, Serialize)]
pub struct OfferResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OfferResponse {
    fn failure(error: String) -> (StatusCode, Json<Self>) {
        (
            StatusCode::BAD_REQUEST,
            Json(Self {
                kind: String::new(),
                sdp: String::new(),
                error: Some(error),
            }),
        )
    }
}

async fn handle_offer(
    State(negotiator): State<Arc<dyn Negotiator>>,
    body: String,
) -> (StatusCode, Json<OfferResponse>) {
    let offer: SessionDescription = match serde_json::from_str(&body) {
        Ok(offer) => offer,
        Err(e) => {
            warn!(event = "offer_rejected", error = %e, "Invalid offer body");
            return OfferResponse::failure(format!("invalid request body: {e}"));
        }
    };

    match negotiator.negotiate(offer).await {
        Ok(answer) => (
            StatusCode::OK,
            Json(OfferResponse {
                kind: answer.kind,
                sdp: answer.sdp,
                error: None,
            }),
        ),
        Err(e) => {
            warn!(event = "offer_failed", error = %e, "Negotiation failed");
            OfferResponse::failure(e.to_string())
        }
    }
}

pub fn router(negotiator: Arc<dyn Negotiator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/offer", post(handle_offer))
        .layer(cors)
        .with_state(negotiator)
}

/// Serve signalling on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    negotiator: Arc<dyn Negotiator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind signalling endpoint on {addr}"))?;
    info!(event = "signalling_listening", addr = %addr, "POST http://{addr}/api/offer");

    axum::serve(listener, router(negotiator))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Signalling server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::transport::{SdpKind, TransportError};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    struct Scripted {
        fail: bool,
    }

    #[async_trait]
    impl Negotiator for Scripted {
        async fn negotiate(
            &self,
            offer: SessionDescription,
        ) -> Result<SessionDescription, NegotiateError> {
            if offer.sdp_kind() != Some(SdpKind::Offer) {
                return Err(NegotiateError::InvalidRole(offer.kind));
            }
            if self.fail {
                return Err(NegotiateError::SetRemoteDescription(TransportError::new(
                    "malformed sdp",
                )));
            }
            Ok(SessionDescription::new(SdpKind::Answer, format!("answer to {}", offer.sdp)))
        }
    }

    fn app(fail: bool) -> Router {
        router(Arc::new(Scripted { fail }))
    }

    async fn post_offer(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/offer")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn returns_answer_for_offer() {
        let (status, json) = post_offer(app(false), r#"{"type":"offer","sdp":"v=0"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "answer to v=0");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn invalid_json_is_bad_request() {
        let (status, json) = post_offer(app(false), "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["type"], "");
        assert_eq!(json["sdp"], "");
        assert!(json["error"].as_str().unwrap().starts_with("invalid request body"));
    }

    #[tokio::test]
    async fn negotiation_errors_are_reported() {
        let (status, json) = post_offer(app(false), r#"{"type":"answer","sdp":"v=0"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("expected offer"));

        let (status, json) = post_offer(app(true), r#"{"type":"offer","sdp":"v=0"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("malformed sdp"));
    }

    #[tokio::test]
    async fn preflight_allows_any_origin() {
        let response = app(false)
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/offer")
                    .header("origin", "http://robot.local")
                    .header("access-control-request-method", "POST")
                    .header("access-control-request-headers", "content-type")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn get_is_not_allowed() {
        let response = app(false)
            .oneshot(
                Request::builder()
                    .uri("/api/offer")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
