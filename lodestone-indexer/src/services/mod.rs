//! Client-facing status service.
//!
//! A small HTTP surface over the controller's status snapshots. It is the
//! client listener collaborator of the sync core: constructed up front but
//! only started once the index has caught up with the daemon for the first
//! time.

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use anyhow::Context;
use async_trait::async_trait;
use lodestone_common::{dto::SyncStatus, traits::ClientListener};
use tokio::sync::watch;
use tracing::info;

pub struct StatusServer {
    ip: String,
    port: u16,
    status: watch::Receiver<SyncStatus>,
}

impl StatusServer {
    pub fn new(ip: &str, port: u16, status: watch::Receiver<SyncStatus>) -> Self {
        Self { ip: ip.to_string(), port, status }
    }
}

async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

async fn sync_status(status: web::Data<watch::Receiver<SyncStatus>>) -> impl Responder {
    HttpResponse::Ok().json(status.borrow().clone())
}

#[async_trait]
impl ClientListener for StatusServer {
    async fn start(&mut self) -> anyhow::Result<()> {
        let status = self.status.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(status.clone()))
                .route("/health", web::get().to(health))
                .route("/status", web::get().to(sync_status))
        })
        .bind((self.ip.as_str(), self.port))
        .with_context(|| format!("binding status server to {}:{}", self.ip, self.port))?
        .disable_signals()
        .run();

        info!(ip = %self.ip, port = self.port, "status server listening");
        tokio::spawn(server);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{test, App};
    use pretty_assertions::assert_eq;

    use super::*;

    #[actix_web::test]
    async fn health_endpoint_replies() {
        let app = test::init_service(App::new().route("/health", web::get().to(health))).await;
        let response = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(response.status().is_success());
    }

    #[actix_web::test]
    async fn status_endpoint_serves_the_latest_snapshot() {
        let (tx, rx) = watch::channel(SyncStatus::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(rx))
                .route("/status", web::get().to(sync_status)),
        )
        .await;

        tx.send_replace(SyncStatus {
            phase: "synchronizing".to_string(),
            local_height: Some(120),
            remote_height: Some(1000),
            headers_downloaded: 20,
            attempt: 1,
            ..SyncStatus::default()
        });

        let body: SyncStatus = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/status").to_request(),
        )
        .await;
        assert_eq!(body.phase, "synchronizing");
        assert_eq!(body.local_height, Some(120));
        assert_eq!(body.remote_height, Some(1000));
    }
}
