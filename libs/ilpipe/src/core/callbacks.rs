// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::any::Any;
use std::sync::Arc;

use super::buffer::BufferHeader;
use super::error::Result;
use super::event::Event;

/// Opaque caller data handed back on every callback.
pub type AppData = Arc<dyn Any + Send + Sync>;

/// Callbacks owned by the application and invoked from component threads.
///
/// Implementations must not block for long and must not call back into the
/// component that raised the notification on the same thread while expecting
/// it to make progress.
pub trait ComponentCallbacks: Send + Sync {
    fn event_handler(&self, component: &str, event: Event, app_data: Option<&AppData>);

    /// An input buffer has been consumed and is returned to the application.
    fn empty_buffer_done(
        &self,
        _component: &str,
        _buffer: &BufferHeader,
        _app_data: Option<&AppData>,
    ) -> Result<()> {
        Ok(())
    }

    /// An output buffer has been filled and is lent to the application.
    fn fill_buffer_done(
        &self,
        _component: &str,
        _buffer: &BufferHeader,
        _app_data: Option<&AppData>,
    ) -> Result<()> {
        Ok(())
    }
}
