//! Machine-image lifecycle management.
//!
//! Periodically snapshots configured instances into tagged images and
//! reclaims images that have outlived their environment's retention window.
//! Only images carrying the configured owner marker are ever touched.

pub mod config;
pub mod gateway;
pub mod observability;
pub mod policy;
pub mod producer;
pub mod resolver;
pub mod retention;

#[cfg(test)]
mod tests;
