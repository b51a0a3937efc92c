use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Liveness and load report. Reads only atomics and startup configuration.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let sessions = state.metrics.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "provider": {
            "variant": config.provider.variant.as_str()
        },
        "sessions": {
            "active": sessions.active,
            "started": sessions.started,
            "completed": sessions.completed,
            "failed": sessions.failed,
            "max": config.session.max_concurrent_sessions
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::testing::FakeConnector;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_sessions() {
        let state = AppState::new(AppConfig::default(), FakeConnector::refusing());
        let _held = state.metrics.try_admit(8).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], "transcript-relay");
        assert_eq!(body["provider"]["variant"], "realtime");
        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["sessions"]["max"], 32);
    }
}
