// ABOUTME: Library crate for hostpool exposing the pooling API, transport and config

#![allow(missing_docs)]

pub mod config;
pub mod pool;
pub mod transport;
