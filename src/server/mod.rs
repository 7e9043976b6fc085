//! HTTP surface
//!
//! ```text
//! GET|POST /api/cron/publish          run the scheduler once
//! GET      /api/cron/runs             recent runs
//! POST     /api/webhooks/media        transcoding status callback
//! POST     /api/posts                 create an item
//! GET      /api/posts/{id}
//! DELETE   /api/posts/{id}
//! POST     /api/posts/{id}/reschedule
//! POST     /api/posts/{id}/publish    publish now (Idempotency-Key)
//! POST     /api/media                 register an upload
//! GET      /api/media/{id}
//! POST     /api/media/{id}/confirm    pull status from the provider
//! GET      /api/circuits              breaker states
//! GET      /api/health
//! GET      /metrics                   Prometheus text format
//! ```

pub mod api;
pub mod serve;

pub use api::{create_router, ApiResponse, ErrorResponse, CRON_SECRET_HEADER, REPLAYED_HEADER};
pub use serve::{AppState, CastlineServer, ServerError};
