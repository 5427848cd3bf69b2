// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The operation table every component exposes, and the handle that owns it.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use super::buffer::{BufferCounts, BufferHeader};
use super::callbacks::{AppData, ComponentCallbacks};
use super::error::Result;
use super::message::Command;
use super::params::{Config, Parameter};
use super::port::{TunnelInfo, TunnelSetup};
use super::state::ComponentState;

/// Operations callable on a component from any thread.
///
/// `send_command` is asynchronous: it only enqueues, and completion is
/// reported through [`ComponentCallbacks::event_handler`]. Everything else is
/// synchronous and may briefly block on the component's list locks.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn send_command(&self, command: Command, payload: Option<Bytes>) -> Result<()>;

    fn get_parameter(&self, param: &mut Parameter) -> Result<()>;

    fn set_parameter(&self, param: &Parameter) -> Result<()>;

    fn get_config(&self, config: &mut Config) -> Result<()>;

    fn set_config(&self, config: &Config) -> Result<()>;

    fn get_state(&self) -> ComponentState;

    /// One side of the tunnel handshake. `peer == None` cancels the tunnel on
    /// `port`.
    fn component_tunnel_request(
        &self,
        port: u32,
        peer: Option<&ComponentHandle>,
        peer_port: u32,
        setup: &mut TunnelSetup,
    ) -> Result<()>;

    /// Hand a filled buffer to this component.
    fn empty_this_buffer(&self, buffer: &BufferHeader) -> Result<()>;

    /// Return a buffer this component lent out earlier.
    fn fill_this_buffer(&self, buffer: &BufferHeader) -> Result<()>;

    fn set_callbacks(
        &self,
        callbacks: Arc<dyn ComponentCallbacks>,
        app_data: Option<AppData>,
    ) -> Result<()>;

    /// Stop and join the worker thread and drop all tunnel records.
    fn deinit(&self) -> Result<()>;

    /// Tunnel record of `port`, if tunneled.
    fn tunnel_info(&self, port: u32) -> Result<Option<TunnelInfo>>;

    /// Sizes of a port's `empty`/`ready`/`processing` lists, for ports that
    /// carry buffers.
    fn buffer_counts(&self, _port: u32) -> Option<BufferCounts> {
        None
    }

    /// Diagnostic counters (received/sent/given-back, ok vs. failed).
    fn counters(&self) -> Vec<(&'static str, u64)> {
        Vec::new()
    }
}

/// Owning reference to a component, as returned by
/// [`Core::get_handle`](super::registry::Core::get_handle).
#[derive(Clone)]
pub struct ComponentHandle(Arc<dyn Component>);

impl ComponentHandle {
    pub fn new(component: Arc<dyn Component>) -> Self {
        Self(component)
    }

    pub fn downgrade(&self) -> WeakComponentHandle {
        WeakComponentHandle(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &ComponentHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl Deref for ComponentHandle {
    type Target = dyn Component;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("name", &self.0.name())
            .field("state", &self.0.get_state())
            .finish()
    }
}

/// Non-owning reference used by tunnel records.
#[derive(Clone)]
pub struct WeakComponentHandle(Weak<dyn Component>);

impl WeakComponentHandle {
    pub fn upgrade(&self) -> Option<ComponentHandle> {
        self.0.upgrade().map(ComponentHandle)
    }

    pub fn points_to(&self, handle: &ComponentHandle) -> bool {
        std::ptr::addr_eq(self.0.as_ptr(), Arc::as_ptr(&handle.0))
    }
}
