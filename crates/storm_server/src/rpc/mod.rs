#![forbid(unsafe_code)]

//! Subject-addressed request/reply front for the conversation and message services.

pub mod dispatch;

pub use dispatch::{RpcConfig, RpcDispatcher, spawn_rpc_responders};

#[cfg(test)]
mod dispatch_tests;
