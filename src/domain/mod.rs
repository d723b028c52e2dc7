pub mod billing;
pub mod models;
