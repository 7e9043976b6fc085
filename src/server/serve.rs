//! HTTP server
//!
//! Hosts the trigger, webhook and management API and, when configured, the
//! internal interval trigger.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::scheduler::{IntervalTrigger, TriggerConfig};

use super::api::create_router;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Wired components
    pub app: Arc<App>,

    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    pub fn new(app: Arc<App>) -> Self {
        Self {
            app,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// Castline Server
// ============================================================================

pub struct CastlineServer {
    state: AppState,
    trigger: Option<Arc<IntervalTrigger>>,
}

impl CastlineServer {
    pub fn new(app: Arc<App>) -> Result<Self, ServerError> {
        let trigger = match TriggerConfig::from_scheduler(&app.config.scheduler) {
            Some(config) => Some(Arc::new(
                IntervalTrigger::new(config, app.scheduler.clone(), &app.config.scheduler)
                    .map_err(|e| ServerError::InitError(e.to_string()))?,
            )),
            None => None,
        };

        Ok(Self {
            state: AppState::new(app),
            trigger,
        })
    }

    /// Get the application state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let server_config = &self.state.app.config.server;
        let mut router = create_router(self.state.clone());

        if server_config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if server_config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = self
            .state
            .app
            .config
            .bind_address()
            .map_err(|e| ServerError::ConfigError(format!("{e:#}")))?;

        tracing::info!("Starting castline server on {}", addr);

        let trigger_task = self.start_background_tasks();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()));

        if let Some(trigger) = &self.trigger {
            trigger.stop().await;
        }
        if let Some(task) = trigger_task {
            let _ = task.await;
        }

        served?;
        tracing::info!("castline server shutdown complete");
        Ok(())
    }

    fn start_background_tasks(&self) -> Option<JoinHandle<()>> {
        let trigger = self.trigger.clone()?;
        Some(tokio::spawn(async move {
            if let Err(e) = trigger.start().await {
                tracing::error!(error = %e, "Interval trigger exited");
            }
        }))
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Server errors
#[derive(Debug, Clone)]
pub enum ServerError {
    /// Configuration error
    ConfigError(String),

    /// Initialization error
    InitError(String),

    /// Failed to bind to address
    BindError(String),

    /// Server error
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
            Self::InitError(msg) => write!(f, "Initialization error: {msg}"),
            Self::BindError(msg) => write!(f, "Bind error: {msg}"),
            Self::ServeError(msg) => write!(f, "Server error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}
