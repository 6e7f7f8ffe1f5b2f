// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! lg-capture Host Producer
//!
//! Host-side frame producer for a low-latency VM screen-sharing channel:
//! maps a shared-memory region, stamps the header protocol, and drives
//! the frame ring and cursor pipe against a pluggable capture backend.

pub mod capture;
pub mod config;
pub mod cursor_pipe;
pub mod error;
pub mod frame_ring;
pub mod layout;
pub mod protocol;
pub mod service;
pub mod session;
pub mod shm;

pub use config::ProducerConfig;
pub use error::ServiceError;
pub use service::{Service, ServiceState};
