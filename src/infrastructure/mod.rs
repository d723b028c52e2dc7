pub mod config;
pub mod db;
pub mod state;
pub mod xero;
