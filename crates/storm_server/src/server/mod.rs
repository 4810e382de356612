#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod health;
pub mod registry;
pub mod relay;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;
