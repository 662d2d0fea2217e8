use axum::{routing::get, Router};

use crate::state::AppState;

pub mod agm;
pub mod audit_logs;
pub mod bills;
pub mod cron;
pub mod finance;
pub mod forms;
pub mod health;
pub mod notifications;
pub mod search;
pub mod settings;
pub mod units;
pub mod users;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(cron::router())
        .merge(bills::router())
        .merge(units::router())
        .merge(users::router())
        .merge(finance::router())
        .merge(settings::router())
        .merge(agm::router())
        .merge(notifications::router())
        .merge(search::router())
        .merge(audit_logs::router())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::v1_router;
    use crate::{config::AppConfig, state::AppState};

    fn app() -> Router {
        let mut config = AppConfig::from_env();
        config.database_url = None;
        config.cron_secret = Some("s3cret".to_string());
        config.dev_auth_overrides_enabled = false;
        let state = AppState::build(config).expect("state builds without a database");
        Router::new().nest("/api", v1_router()).with_state(state)
    }

    async fn send(request: Request<Body>) -> (StatusCode, Value) {
        let response = app().oneshot(request).await.expect("router responds");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body readable");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_degraded_without_database() {
        let (status, body) = send(
            Request::get("/api/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["db"], false);
    }

    #[tokio::test]
    async fn cron_requires_matching_bearer_token() {
        let (status, _) = send(
            Request::get("/api/cron/billing")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            Request::get("/api/cron/reminders")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Correct token gets past the guard; the missing database is an internal failure.
        let (status, _) = send(
            Request::get("/api/cron/billing")
                .header(header::AUTHORIZATION, "Bearer s3cret")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn bill_endpoints_require_a_session() {
        let (status, body) = send(
            Request::get("/api/v1/bills")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.is_object());
    }
}
