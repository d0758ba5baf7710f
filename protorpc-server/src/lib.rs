//! # protorpc-server
//!
//! RPC server for protorpc.
//!
//! This crate provides:
//! - A service registry trait and a builder for typed services
//! - A stateless dispatcher mapping raw requests to raw responses
//! - Two concurrency architectures behind one strategy trait
//! - YAML/env configuration and Prometheus metrics

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod server;
pub mod service;
pub mod strategy;

pub use config::{Config, ConfigError, MetricsConfig, ServerSection, StrategyKind};
pub use dispatcher::Dispatcher;
pub use error::{ServerError, ServiceError};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerStats};
pub use service::{BuiltService, Callback, MethodRequest, Service, ServiceBuilder};
pub use strategy::{BrokerStrategy, ExecutionStrategy, PooledStrategy, ServeContext};
