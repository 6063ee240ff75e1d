pub mod api;
pub mod config;
pub mod db;
pub mod hub;
pub mod notify;
pub mod session;
pub mod support;

pub use db::DbPool;

use config::Config;
use hub::Hub;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, hub: Arc<Hub>) -> Self {
        Self { config, db, hub }
    }
}
