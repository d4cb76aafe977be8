//! Web layer: an axum router exposing exactly the dialect endpoints of
//! spec.md §6. Handlers are thin — they parse/validate just enough of the
//! body to build a fingerprint and delegate everything else to the
//! [`crate::dispatcher::Dispatcher`].

pub mod handlers;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dispatcher::Dispatcher;

/// A cached `/v1/models` response, keyed by a normalized query string
/// (spec.md §8 "ordering-independent cache keys" law).
pub struct CachedModelList {
    pub data: Value,
    pub fetched_at: tokio::time::Instant,
}

pub struct AppState {
    pub config: Config,
    pub dispatcher: Arc<Dispatcher>,
    pub model_cache: RwLock<HashMap<String, CachedModelList>>,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        let state = Arc::new(AppState {
            config,
            dispatcher,
            model_cache: RwLock::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/v1/messages", post(handlers::messages))
            .route("/v1/messages/count_tokens", post(handlers::count_tokens))
            .route("/v1/chat/completions", post(handlers::chat_completions))
            .route("/v1beta/models/:model_action", post(handlers::gemini_generate_compat))
            .route("/v1/models", get(handlers::list_models))
            .route("/v1/models/:model", get(handlers::get_model))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        Ok(Self { app, addr })
    }

    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
