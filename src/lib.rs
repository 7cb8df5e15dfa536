mod config;
mod dataset;
mod errors;
mod model;
mod query;
mod reconciler;
mod resolver;
mod store;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::AppConfig;
pub use dataset::{
    join_map_points, read_demand, write_map_points_csv, write_map_points_json, DistrictDemand,
    MapPoint,
};
pub use errors::{AppError, AppResult};
pub use model::{Coordinate, CoordinateRecord, DistrictName, ResolutionSource, COORDINATE_TOLERANCE};
pub use query::{build_query, QueryQualifier};
pub use reconciler::{CacheReconciler, CancelSignal, ReconcileReport, ReconcileStats};
pub use resolver::{
    GeocodeLookup, LookupResult, NominatimClient, RateLimiter, ResolutionFailure, Resolver,
    MAX_DEFERRAL,
};
pub use store::CoordinateStore;

/// Builds a reconciler wired to the configured store and lookup service.
pub fn reconciler_from_config(config: &AppConfig) -> AppResult<CacheReconciler> {
    let store = CoordinateStore::new(config.store_path.clone(), config.store_lock_timeout());
    let resolver = Resolver::new(config)?;
    Ok(CacheReconciler::new(store, resolver, config.qualifier()))
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,district_geocache=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
