use std::sync::{Arc, RwLock};

use actix_web::{web, App, HttpResponse, HttpServer};
use prometheus::{Encoder, TextEncoder};
use tracing::{info, warn};

/// Process lifecycle stages. Transitions only move forward:
/// Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Starting,
    Ready,
    Draining,
    Stopped,
}

/// Owned lifecycle state shared with the health endpoints.
#[derive(Clone)]
pub struct Lifecycle {
    stage: Arc<RwLock<Stage>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            stage: Arc::new(RwLock::new(Stage::Starting)),
        }
    }

    /// Advance to a later stage. Backward transitions are ignored.
    pub fn advance(&self, next: Stage) {
        let mut stage = self.stage.write().expect("lifecycle lock poisoned");
        if next > *stage {
            info!(from = ?*stage, to = ?next, "lifecycle transition");
            *stage = next;
        } else if next < *stage {
            warn!(from = ?*stage, to = ?next, "ignoring backward lifecycle transition");
        }
    }

    pub fn stage(&self) -> Stage {
        *self.stage.read().expect("lifecycle lock poisoned")
    }

    pub fn is_ready(&self) -> bool {
        self.stage() == Stage::Ready
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.stage(), Stage::Starting | Stage::Ready)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

async fn healthz(lifecycle: web::Data<Lifecycle>) -> HttpResponse {
    if lifecycle.is_healthy() {
        HttpResponse::Ok().body("ok")
    } else {
        HttpResponse::ServiceUnavailable().body("not healthy")
    }
}

async fn readyz(lifecycle: web::Data<Lifecycle>) -> HttpResponse {
    if lifecycle.is_ready() {
        HttpResponse::Ok().body("ok")
    } else {
        HttpResponse::ServiceUnavailable().body("not ready")
    }
}

async fn livez() -> HttpResponse {
    // Liveness only proves the server is still answering.
    HttpResponse::Ok().body("ok")
}

async fn metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return HttpResponse::InternalServerError().body(e.to_string());
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

/// Serve the probe and metrics endpoints for the lifetime of the process.
///
/// Signal handling stays with the orchestration loops; the server dies with
/// the process.
pub async fn run_server(port: u16, lifecycle: Lifecycle) -> std::io::Result<()> {
    info!(port, "starting health server");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(lifecycle.clone()))
            .route("/healthz", web::get().to(healthz))
            .route("/readyz", web::get().to(readyz))
            .route("/livez", web::get().to(livez))
            .route("/metrics", web::get().to(metrics))
    })
    .disable_signals()
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_advances_forward_only() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.stage(), Stage::Starting);
        assert!(lifecycle.is_healthy());
        assert!(!lifecycle.is_ready());

        lifecycle.advance(Stage::Ready);
        assert!(lifecycle.is_ready());
        assert!(lifecycle.is_healthy());

        lifecycle.advance(Stage::Draining);
        assert!(!lifecycle.is_ready());
        assert!(!lifecycle.is_healthy());

        // Backward transition is a no-op.
        lifecycle.advance(Stage::Ready);
        assert_eq!(lifecycle.stage(), Stage::Draining);

        lifecycle.advance(Stage::Stopped);
        assert_eq!(lifecycle.stage(), Stage::Stopped);
    }

    #[test]
    fn clones_share_state() {
        let lifecycle = Lifecycle::new();
        let observer = lifecycle.clone();
        lifecycle.advance(Stage::Ready);
        assert!(observer.is_ready());
    }
}
