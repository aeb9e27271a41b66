// Session Gateway - authenticated API access and onboarding gate

pub mod auth;
pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod navigation;
pub mod onboarding;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::{SessionClient, SessionStores};
pub use error::{GatewayError, Result};
pub use runtime::Runtime;
