// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Thread-per-component media pipeline.
//!
//! Components (demuxer, decoders, renderers, reference clock, and on the
//! recording side encoder and muxer) are created by name through
//! [`Core::get_handle`], wired together with [`Core::setup_tunnel`], and
//! driven through the
//! Loaded/Idle/Executing/Pause/Invalid state machine with
//! [`Component::send_command`]. Every component runs its own worker thread and
//! moves buffers between an `empty`, a `ready` and a `processing` list.

#![allow(clippy::type_complexity)] // Factory closures are clear in context

pub use inventory;

pub mod components;
pub mod core;

pub use components::{
    AudioDecoder, AudioRender, Clock, Demuxer, Muxer, VideoDecoder, VideoEncoder, VideoRender,
    names,
};
pub use crate::core::*;
