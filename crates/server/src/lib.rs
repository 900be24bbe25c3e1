use std::sync::Arc;

use axum::{middleware as axum_middleware, routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod geo;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod store;

use services::{
    geocoding::{GeocodingService, GoogleGeocoder},
    projects::ProjectService,
    storage::StorageService,
};
use store::ProjectStore;

#[derive(Clone)]
pub struct AppState {
    pub db: db::Database,
    pub config: config::Config,
    pub store: ProjectStore,
    pub projects: ProjectService,
    pub geocoding: GeocodingService,
    pub storage: StorageService,
}

impl AppState {
    pub fn new(db: db::Database, config: config::Config) -> Self {
        let store = ProjectStore::new(db.clone());
        let geocoding = match &config.google_maps_api_key {
            Some(key) => GeocodingService::new(
                Arc::new(GoogleGeocoder::new(key.clone())),
                config.geocode_min_interval,
            ),
            None => {
                tracing::warn!("GOOGLE_MAPS_API_KEY not set, geocoding disabled");
                GeocodingService::disabled()
            }
        };
        let storage = StorageService::new(&config.storage_path, &config.public_media_url);

        Self {
            projects: ProjectService::new(store.clone()),
            db,
            store,
            geocoding,
            storage,
            config,
        }
    }
}

pub fn app(state: AppState) -> Router {
    // Build protected routes (require authentication)
    let protected_routes = Router::new()
        .nest("/projects", routes::projects::router())
        .nest("/users", routes::users::router())
        .nest("/messages", routes::messages::router())
        .nest("/geocode", routes::geocode::router())
        .nest("/media", routes::media::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    let api_router = Router::new()
        .nest("/auth", routes::auth::router())
        .merge(protected_routes);

    let mount = media_mount(&state.config.public_media_url);
    let media_files = ServeDir::new(state.storage.base_path());

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/feed", get(handlers::ws::ws_handler))
        .nest("/api", api_router)
        .nest_service(&mount, media_files)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// Media is served locally when the public URL is a path on this server.
fn media_mount(public_url: &str) -> String {
    match public_url.trim_end_matches('/') {
        path if path.starts_with('/') && path.len() > 1 => path.to_string(),
        _ => "/media".to_string(),
    }
}

async fn health_check() -> &'static str {
    "OK"
}
