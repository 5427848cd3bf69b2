// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod backends;
pub mod base;
pub mod buffer;
pub mod callbacks;
pub mod component;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod message;
pub mod params;
pub mod port;
pub mod registry;
pub mod state;
pub mod time_source;
pub mod worker;

pub use backends::*;
pub use base::ComponentBase;
pub use buffer::*;
pub use callbacks::*;
pub use component::*;
pub use config::PipelineConfig;
pub use error::*;
pub use event::*;
pub use logging::init_logging;
pub use message::*;
pub use params::*;
pub use port::*;
pub use registry::*;
pub use state::*;
pub use time_source::*;
pub use worker::{ComponentHost, ComponentLogic, Step};
