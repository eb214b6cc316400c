pub mod interface;
pub mod liveness;
pub mod reconcile;
pub mod static_config;
pub mod supervisor;
pub mod wifi;
