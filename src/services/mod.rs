pub mod contacts;
pub mod errors;
pub mod invoicing;
pub mod tokens;
