// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Component worker thread.
//!
//! Each component owns one OS thread running the same loop: take at most one
//! message off the queue and act on it, then either park on the queue (when
//! not Executing) or run one data-plane step of the component's
//! [`ComponentLogic`]. Commands are therefore handled strictly in FIFO order
//! and never concurrently with the data plane.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::base::ComponentBase;
use super::buffer::{BufferCounts, BufferHeader};
use super::callbacks::{AppData, ComponentCallbacks};
use super::component::{Component, ComponentHandle};
use super::error::{PipelineError, Result};
use super::event::{ErrorCode, Event};
use super::message::{Command, Message};
use super::params::{Config, Parameter};
use super::port::{TunnelInfo, TunnelSetup};
use super::state::ComponentState;

/// What the worker does after a data-plane step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run the loop again right away.
    Continue,
    /// Park on the message queue, optionally with a timeout.
    Wait(Option<Duration>),
}

/// Component-specific behaviour plugged into [`ComponentHost`].
///
/// Methods other than [`process`](Self::process),
/// [`on_transition`](Self::on_transition) and [`on_exit`](Self::on_exit) are
/// called from arbitrary threads.
pub trait ComponentLogic: Send + Sync + 'static {
    fn get_parameter(&self, base: &ComponentBase, param: &mut Parameter) -> Result<()> {
        base.get_port_parameter(param)
    }

    fn set_parameter(&self, base: &ComponentBase, param: &Parameter) -> Result<()> {
        base.set_port_parameter(param)
    }

    fn get_config(&self, base: &ComponentBase, config: &mut Config) -> Result<()> {
        Err(PipelineError::UnsupportedIndex(format!(
            "{} has no config {:?}",
            base.name(),
            config
        )))
    }

    fn set_config(&self, base: &ComponentBase, config: &Config) -> Result<()> {
        Err(PipelineError::UnsupportedIndex(format!(
            "{} cannot set config {:?}",
            base.name(),
            config
        )))
    }

    fn empty_this_buffer(&self, base: &ComponentBase, _buffer: &BufferHeader) -> Result<()> {
        Err(PipelineError::NotImplemented(format!(
            "{} does not accept buffers",
            base.name()
        )))
    }

    fn fill_this_buffer(&self, base: &ComponentBase, _buffer: &BufferHeader) -> Result<()> {
        Err(PipelineError::NotImplemented(format!(
            "{} does not lend buffers",
            base.name()
        )))
    }

    fn buffer_counts(&self, _port: u32) -> Option<BufferCounts> {
        None
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        Vec::new()
    }

    /// Side effects of a legal transition, run on the worker thread before the
    /// new state becomes visible. An error rejects the transition.
    fn on_transition(
        &self,
        _base: &ComponentBase,
        _from: ComponentState,
        _to: ComponentState,
    ) -> Result<()> {
        Ok(())
    }

    /// One data-plane iteration. Only called while Executing.
    fn process(&self, _base: &ComponentBase) -> Step {
        Step::Wait(None)
    }

    /// Called once when the worker leaves its loop.
    fn on_exit(&self, _base: &ComponentBase) {}
}

struct Shared<L> {
    base: ComponentBase,
    logic: L,
}

/// A [`Component`] made of a [`ComponentBase`], a [`ComponentLogic`] and the
/// worker thread driving them.
pub struct ComponentHost<L: ComponentLogic> {
    shared: Arc<Shared<L>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl<L: ComponentLogic> ComponentHost<L> {
    /// Start the worker thread. The component begins in Loaded.
    pub fn spawn(base: ComponentBase, logic: L) -> Result<Self> {
        let shared = Arc::new(Shared { base, logic });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("ilpipe-{}", shared.base.name()))
            .spawn(move || run_worker(&worker_shared.base, &worker_shared.logic))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            released: AtomicBool::new(false),
        })
    }

    /// Spawn and wrap in a [`ComponentHandle`].
    pub fn spawn_handle(base: ComponentBase, logic: L) -> Result<ComponentHandle> {
        Ok(ComponentHandle::new(Arc::new(Self::spawn(base, logic)?)))
    }

    pub fn base(&self) -> &ComponentBase {
        &self.shared.base
    }

    pub fn logic(&self) -> &L {
        &self.shared.logic
    }

    fn stop_worker(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        self.shared.base.queue().post(Command::Stop);
        if worker.thread().id() == std::thread::current().id() {
            return Ok(());
        }
        worker.join().map_err(|_| {
            PipelineError::Undefined(format!(
                "{} worker thread panicked",
                self.shared.base.name()
            ))
        })
    }
}

impl<L: ComponentLogic> Component for ComponentHost<L> {
    fn name(&self) -> &str {
        self.shared.base.name()
    }

    fn send_command(&self, command: Command, payload: Option<Bytes>) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(PipelineError::InvalidState(format!(
                "{} has been deinitialized",
                self.name()
            )));
        }
        let message = match payload {
            Some(payload) => Message::with_payload(command, payload),
            None => Message::new(command),
        };
        self.shared.base.queue().put(message);
        Ok(())
    }

    fn get_parameter(&self, param: &mut Parameter) -> Result<()> {
        self.shared.logic.get_parameter(&self.shared.base, param)
    }

    fn set_parameter(&self, param: &Parameter) -> Result<()> {
        self.shared.logic.set_parameter(&self.shared.base, param)
    }

    fn get_config(&self, config: &mut Config) -> Result<()> {
        self.shared.logic.get_config(&self.shared.base, config)
    }

    fn set_config(&self, config: &Config) -> Result<()> {
        self.shared.logic.set_config(&self.shared.base, config)
    }

    fn get_state(&self) -> ComponentState {
        self.shared.base.state()
    }

    fn component_tunnel_request(
        &self,
        port: u32,
        peer: Option<&ComponentHandle>,
        peer_port: u32,
        setup: &mut TunnelSetup,
    ) -> Result<()> {
        self.shared
            .base
            .tunnel_request(port, peer, peer_port, setup)
    }

    fn empty_this_buffer(&self, buffer: &BufferHeader) -> Result<()> {
        self.shared.logic.empty_this_buffer(&self.shared.base, buffer)
    }

    fn fill_this_buffer(&self, buffer: &BufferHeader) -> Result<()> {
        self.shared.logic.fill_this_buffer(&self.shared.base, buffer)
    }

    fn set_callbacks(
        &self,
        callbacks: Arc<dyn ComponentCallbacks>,
        app_data: Option<AppData>,
    ) -> Result<()> {
        self.shared.base.set_callbacks(callbacks, app_data);
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_worker()?;
        self.shared.base.clear_tunnels();
        tracing::debug!("[{}] Component deinitialized", self.name());
        Ok(())
    }

    fn tunnel_info(&self, port: u32) -> Result<Option<TunnelInfo>> {
        self.shared.base.tunnel_info(port)
    }

    fn buffer_counts(&self, port: u32) -> Option<BufferCounts> {
        self.shared.logic.buffer_counts(port)
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        self.shared.logic.counters()
    }
}

impl<L: ComponentLogic> Drop for ComponentHost<L> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_worker() {
            tracing::warn!("[{}] {}", self.shared.base.name(), e);
        }
    }
}

fn run_worker<L: ComponentLogic>(base: &ComponentBase, logic: &L) {
    tracing::info!("[{}] Worker thread started", base.name());

    loop {
        if let Some(message) = base.queue().get() {
            match message.command {
                Command::Stop => {
                    tracing::debug!("[{}] Stop received, leaving worker loop", base.name());
                    break;
                }
                Command::StateSet(target) => handle_state_set(base, logic, target),
                Command::Nop => {}
                command => handle_port_command(base, command),
            }
        }

        if base.state() != ComponentState::Executing {
            base.queue().wait(None);
            continue;
        }

        match logic.process(base) {
            Step::Continue => {}
            Step::Wait(timeout) => {
                base.queue().wait(timeout);
            }
        }
    }

    logic.on_exit(base);
    tracing::info!("[{}] Worker thread stopped", base.name());
}

fn handle_state_set<L: ComponentLogic>(base: &ComponentBase, logic: &L, target: ComponentState) {
    let current = base.state();

    if current == target {
        tracing::debug!("[{}] Already {}", base.name(), target);
        base.notify_error(ErrorCode::SameState, 0);
        return;
    }

    if target == ComponentState::Invalid {
        if let Err(e) = logic.on_transition(base, current, target) {
            tracing::warn!("[{}] Cleanup on entering Invalid failed: {}", base.name(), e);
        }
        base.set_state(ComponentState::Invalid);
        tracing::warn!("[{}] {} -> Invalid", base.name(), current);
        base.notify_error(ErrorCode::InvalidState, 0);
        base.notify(Event::CmdComplete(Command::StateSet(ComponentState::Invalid)));
        return;
    }

    let result = current
        .check_transition(target)
        .and_then(|()| logic.on_transition(base, current, target));

    match result {
        Ok(()) => {
            base.set_state(target);
            tracing::info!("[{}] {} -> {}", base.name(), current, target);
            base.notify(Event::CmdComplete(Command::StateSet(target)));
        }
        Err(e) => {
            tracing::warn!(
                "[{}] Transition {} -> {} rejected: {}",
                base.name(),
                current,
                target,
                e
            );
            base.notify_error(ErrorCode::IncorrectStateTransition, current.as_raw());
        }
    }
}

fn handle_port_command(base: &ComponentBase, command: Command) {
    let Some(port) = command.port() else {
        return;
    };

    let result = match command {
        Command::PortDisable(p) => base.with_port_mut(p, |port| port.definition.enabled = false),
        Command::PortEnable(p) => base.with_port_mut(p, |port| port.definition.enabled = true),
        _ => base.port(port).map(|_| ()),
    };

    match result {
        Ok(()) => base.notify(Event::CmdComplete(command)),
        Err(e) => {
            tracing::warn!("[{}] {:?} failed: {}", base.name(), command, e);
            base.notify_error(e.code(), port);
        }
    }
}
