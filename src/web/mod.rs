pub mod hls;

use crate::store::SegmentStore;
use axum::{http::Method, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Delivery server routes. Only the segment store is shared with handlers.
pub fn router(store: SegmentStore) -> Router {
    // Browser players live on another origin/port
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS]);

    Router::new()
        .route("/:source_dir/:file_name", get(hls::serve_segment_file))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}
