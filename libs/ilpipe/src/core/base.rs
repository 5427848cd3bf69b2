// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! State shared by every component: the state field and its lock, the message
//! queue, the port table with its tunnel records, and the registered
//! callbacks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::buffer::BufferHeader;
use super::callbacks::{AppData, ComponentCallbacks};
use super::component::ComponentHandle;
use super::config::PipelineConfig;
use super::error::{PipelineError, Result};
use super::event::{ErrorCode, Event};
use super::message::MessageQueue;
use super::params::Parameter;
use super::port::{
    BufferSupplier, Port, PortDefinition, PortDirection, PortDomain, PortTable, TunnelInfo,
    TunnelSetup,
};
use super::registry::ComponentContext;
use super::state::ComponentState;
use super::time_source::TimeSource;

#[derive(Clone)]
struct CallbackSlot {
    callbacks: Arc<dyn ComponentCallbacks>,
    app_data: Option<AppData>,
}

pub struct ComponentBase {
    name: String,
    state: Mutex<ComponentState>,
    queue: MessageQueue,
    ports: RwLock<PortTable>,
    callbacks: RwLock<Option<CallbackSlot>>,
    config: Arc<PipelineConfig>,
    time: Arc<dyn TimeSource>,
}

impl ComponentBase {
    pub fn new(context: &ComponentContext, ports: Vec<Port>) -> Self {
        Self {
            name: context.name.clone(),
            state: Mutex::new(ComponentState::Loaded),
            queue: MessageQueue::new(),
            ports: RwLock::new(PortTable::new(ports)),
            callbacks: RwLock::new(None),
            config: Arc::clone(&context.config),
            time: Arc::clone(&context.time),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    /// Only the worker thread writes the state.
    pub(crate) fn set_state(&self, state: ComponentState) {
        *self.state.lock() = state;
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn now_us(&self) -> i64 {
        self.time.now_us()
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    pub fn set_callbacks(&self, callbacks: Arc<dyn ComponentCallbacks>, app_data: Option<AppData>) {
        *self.callbacks.write() = Some(CallbackSlot {
            callbacks,
            app_data,
        });
    }

    fn callback_slot(&self) -> Option<CallbackSlot> {
        self.callbacks.read().clone()
    }

    pub fn notify(&self, event: Event) {
        tracing::trace!("[{}] Event {:?}", self.name, event);
        if let Some(slot) = self.callback_slot() {
            slot.callbacks
                .event_handler(&self.name, event, slot.app_data.as_ref());
        }
    }

    pub fn notify_error(&self, code: ErrorCode, data: u32) {
        self.notify(Event::error(code, data));
    }

    // =========================================================================
    // Ports
    // =========================================================================

    pub fn port(&self, index: u32) -> Result<Port> {
        self.ports.read().get(index).cloned()
    }

    pub fn with_port_mut<R>(&self, index: u32, f: impl FnOnce(&mut Port) -> R) -> Result<R> {
        let mut ports = self.ports.write();
        Ok(f(ports.get_mut(index)?))
    }

    pub fn is_tunneled(&self, port: u32) -> bool {
        self.ports
            .read()
            .get(port)
            .map(Port::is_tunneled)
            .unwrap_or(false)
    }

    pub fn supplier(&self, port: u32) -> BufferSupplier {
        self.ports
            .read()
            .get(port)
            .map(|p| p.supplier)
            .unwrap_or_default()
    }

    pub fn tunnel_info(&self, port: u32) -> Result<Option<TunnelInfo>> {
        Ok(self.ports.read().get(port)?.tunnel.clone())
    }

    /// Live peer of a tunneled port. `Ok(None)` when the port is not tunneled,
    /// an error when it is but the peer has been destroyed.
    pub fn tunnel_peer(&self, port: u32) -> Result<Option<(ComponentHandle, u32)>> {
        let Some(info) = self.tunnel_info(port)? else {
            return Ok(None);
        };
        match info.peer() {
            Some(peer) => Ok(Some((peer, info.peer_port))),
            None => Err(PipelineError::Undefined(format!(
                "tunnel peer of port {} no longer exists",
                port
            ))),
        }
    }

    pub fn clear_tunnels(&self) {
        self.ports.write().clear_tunnels();
    }

    /// One side of the tunnel handshake.
    pub fn tunnel_request(
        &self,
        port: u32,
        peer: Option<&ComponentHandle>,
        peer_port: u32,
        setup: &mut TunnelSetup,
    ) -> Result<()> {
        let state = self.state();
        if state != ComponentState::Loaded {
            return Err(PipelineError::InvalidState(format!(
                "{} is {}, tunnels can only change in Loaded",
                self.name, state
            )));
        }

        let (direction, domain, own_supplier) = {
            let ports = self.ports.read();
            let own = ports.get(port)?;
            (own.definition.direction, own.definition.domain, own.supplier)
        };

        let Some(peer) = peer else {
            self.with_port_mut(port, |p| p.tunnel = None)?;
            tracing::debug!("[{}] Tunnel on port {} cancelled", self.name, port);
            return Ok(());
        };

        if direction == PortDirection::Output {
            self.with_port_mut(port, |p| p.tunnel = Some(TunnelInfo::new(peer, peer_port)))?;
            setup.supplier = own_supplier;
            tracing::debug!(
                "[{}] Port {} tunneled to {}:{} (proposing supplier {:?})",
                self.name,
                port,
                peer.name(),
                peer_port,
                own_supplier
            );
            return Ok(());
        }

        self.check_tunnel_peer(domain, peer, peer_port, setup)?;

        self.with_port_mut(port, |p| {
            p.tunnel = Some(TunnelInfo::new(peer, peer_port));
            p.supplier = setup.supplier;
        })?;
        tracing::debug!(
            "[{}] Port {} accepted tunnel from {}:{} (supplier {:?})",
            self.name,
            port,
            peer.name(),
            peer_port,
            setup.supplier
        );
        Ok(())
    }

    fn check_tunnel_peer(
        &self,
        domain: PortDomain,
        peer: &ComponentHandle,
        peer_port: u32,
        setup: &TunnelSetup,
    ) -> Result<()> {
        if setup.supplier == BufferSupplier::Unspecified {
            return Err(PipelineError::PortsNotCompatible(
                "no buffer supplier proposed".into(),
            ));
        }

        let mut definition = Parameter::PortDefinition(PortDefinition {
            index: peer_port,
            direction: PortDirection::Input,
            domain: PortDomain::Other,
            enabled: false,
            populated: false,
        });
        peer.get_parameter(&mut definition).map_err(|e| {
            PipelineError::PortsNotCompatible(format!(
                "cannot read {}:{} definition: {}",
                peer.name(),
                peer_port,
                e
            ))
        })?;
        let Parameter::PortDefinition(definition) = definition else {
            return Err(PipelineError::PortsNotCompatible(
                "peer returned a different parameter".into(),
            ));
        };

        if definition.domain != domain {
            return Err(PipelineError::PortsNotCompatible(format!(
                "domain {:?} does not match {:?} on {}:{}",
                domain,
                definition.domain,
                peer.name(),
                peer_port
            )));
        }
        if definition.direction != PortDirection::Output {
            return Err(PipelineError::PortsNotCompatible(format!(
                "{}:{} is not an output port",
                peer.name(),
                peer_port
            )));
        }

        let mut supplier = Parameter::BufferSupplier {
            port: peer_port,
            supplier: BufferSupplier::Unspecified,
        };
        peer.get_parameter(&mut supplier).map_err(|e| {
            PipelineError::PortsNotCompatible(format!("cannot read peer supplier: {}", e))
        })?;
        match supplier {
            Parameter::BufferSupplier { supplier, .. } if supplier == setup.supplier => Ok(()),
            Parameter::BufferSupplier { supplier, .. } => {
                Err(PipelineError::PortsNotCompatible(format!(
                    "peer declares supplier {:?}, proposal was {:?}",
                    supplier, setup.supplier
                )))
            }
            _ => Err(PipelineError::PortsNotCompatible(
                "peer returned a different parameter".into(),
            )),
        }
    }

    /// Port definition, buffer supplier and port count queries.
    pub fn get_port_parameter(&self, param: &mut Parameter) -> Result<()> {
        let ports = self.ports.read();
        match param {
            Parameter::PortDefinition(definition) => {
                *definition = ports.get(definition.index)?.definition.clone();
                Ok(())
            }
            Parameter::BufferSupplier { port, supplier } => {
                *supplier = ports.get(*port)?.supplier;
                Ok(())
            }
            Parameter::PortParam { ports: count, start_port } => {
                *count = ports.len() as u32;
                *start_port = 0;
                Ok(())
            }
            other => Err(PipelineError::UnsupportedIndex(format!(
                "{} has no parameter {:?}",
                self.name, other
            ))),
        }
    }

    pub fn set_port_parameter(&self, param: &Parameter) -> Result<()> {
        let mut ports = self.ports.write();
        match param {
            Parameter::PortDefinition(definition) => {
                let port = ports.get_mut(definition.index)?;
                if port.definition.direction != definition.direction
                    || port.definition.domain != definition.domain
                {
                    return Err(PipelineError::BadParameter(format!(
                        "port {} direction and domain are fixed",
                        definition.index
                    )));
                }
                port.definition.enabled = definition.enabled;
                port.definition.populated = definition.populated;
                Ok(())
            }
            Parameter::BufferSupplier { port, supplier } => {
                ports.get_mut(*port)?.supplier = *supplier;
                Ok(())
            }
            other => Err(PipelineError::UnsupportedIndex(format!(
                "{} cannot set {:?}",
                self.name, other
            ))),
        }
    }

    // =========================================================================
    // Buffer hand-off
    // =========================================================================

    /// Send a filled buffer downstream from output `port`: to the tunnel
    /// peer's `empty_this_buffer`, or to the application's `fill_buffer_done`.
    pub fn deliver(&self, port: u32, mut buffer: BufferHeader) -> Result<()> {
        buffer.output_port = port;
        match self.tunnel_peer(port)? {
            Some((peer, peer_port)) => {
                buffer.input_port = peer_port;
                peer.empty_this_buffer(&buffer)
            }
            None => match self.callback_slot() {
                Some(slot) => {
                    slot.callbacks
                        .fill_buffer_done(&self.name, &buffer, slot.app_data.as_ref())
                }
                None => Ok(()),
            },
        }
    }

    /// Return a consumed buffer upstream through input `port`: to the tunnel
    /// peer's `fill_this_buffer`, or to the application's `empty_buffer_done`.
    pub fn give_back(&self, port: u32, mut buffer: BufferHeader) -> Result<()> {
        buffer.input_port = port;
        match self.tunnel_peer(port)? {
            Some((peer, peer_port)) => {
                buffer.output_port = peer_port;
                peer.fill_this_buffer(&buffer)
            }
            None => match self.callback_slot() {
                Some(slot) => {
                    slot.callbacks
                        .empty_buffer_done(&self.name, &buffer, slot.app_data.as_ref())
                }
                None => Ok(()),
            },
        }
    }

    /// [`give_back`](Self::give_back) that never gives up: used on the
    /// shutdown path, where a returned buffer must not be dropped.
    pub fn give_back_until_accepted(&self, port: u32, buffer: BufferHeader) {
        let mut last_error = None;
        self.wait_until(&format!("buffer {} to be accepted on port {}", buffer.id, port), || {
            match self.give_back(port, buffer.clone()) {
                Ok(()) => true,
                Err(e) => {
                    last_error = Some(e.to_string());
                    false
                }
            }
        });
        if let Some(e) = last_error {
            tracing::debug!("[{}] Buffer {} returned after retries ({})", self.name, buffer.id, e);
        }
    }

    /// Poll `done` until it returns `true`, sleeping
    /// `shutdown.give_back_retry_ms` between attempts and logging a warning
    /// every `shutdown.diagnostic_interval_ms`.
    pub fn wait_until(&self, what: &str, mut done: impl FnMut() -> bool) {
        let retry = Duration::from_millis(self.config.shutdown.give_back_retry_ms.max(1));
        let diagnostic = Duration::from_millis(self.config.shutdown.diagnostic_interval_ms);
        let started = Instant::now();
        let mut last_warning = started;

        while !done() {
            if last_warning.elapsed() >= diagnostic {
                tracing::warn!(
                    "[{}] Still waiting for {} after {:?}",
                    self.name,
                    what,
                    started.elapsed()
                );
                last_warning = Instant::now();
            }
            std::thread::sleep(retry);
        }
    }
}
