// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Name -> constructor table and handle lifecycle.
//!
//! Components register themselves at compile time with
//! `inventory::submit!`; the table is read-only at run time.
//!
//! ```ignore
//! inventory::submit! {
//!     ComponentRegistration::new(names::CLOCK, Clock::create)
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::backends::Backends;
use super::callbacks::{AppData, ComponentCallbacks};
use super::component::ComponentHandle;
use super::config::PipelineConfig;
use super::error::{PipelineError, Result};
use super::port::TunnelSetup;
use super::state::ComponentState;
use super::time_source::{MonotonicTimeSource, TimeSource};

/// What a constructor gets to build a component with.
#[derive(Clone)]
pub struct ComponentContext {
    pub name: String,
    pub config: Arc<PipelineConfig>,
    pub backends: Arc<Backends>,
    pub time: Arc<dyn TimeSource>,
}

pub type ComponentConstructor = fn(&ComponentContext) -> Result<ComponentHandle>;

/// One entry of the static component table.
pub struct ComponentRegistration {
    pub name: &'static str,
    pub constructor: ComponentConstructor,
}

impl ComponentRegistration {
    pub const fn new(name: &'static str, constructor: ComponentConstructor) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(ComponentRegistration);

fn find_registration(name: &str) -> Option<&'static ComponentRegistration> {
    inventory::iter::<ComponentRegistration>
        .into_iter()
        .find(|registration| registration.name == name)
}

/// Process-level entry point: creates and destroys component handles and
/// connects their ports.
pub struct Core {
    config: Arc<PipelineConfig>,
    backends: Arc<Backends>,
    time: Arc<dyn TimeSource>,
    initialized: AtomicBool,
}

impl Core {
    pub fn new() -> Self {
        Self {
            config: Arc::new(PipelineConfig::default()),
            backends: Arc::new(Backends::default()),
            time: Arc::new(MonotonicTimeSource::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_backends(mut self, backends: Backends) -> Self {
        self.backends = Arc::new(backends);
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Names of every registered component, sorted.
    pub fn component_names() -> Vec<&'static str> {
        let mut names: Vec<_> = inventory::iter::<ComponentRegistration>
            .into_iter()
            .map(|registration| registration.name)
            .collect();
        names.sort_unstable();
        names
    }

    pub fn init(&self) -> Result<()> {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            tracing::info!(
                "Pipeline core initialized ({} component types, time source {})",
                Self::component_names().len(),
                self.time.description()
            );
        }
        Ok(())
    }

    pub fn deinit(&self) -> Result<()> {
        if self.initialized.swap(false, Ordering::AcqRel) {
            tracing::info!("Pipeline core deinitialized");
        }
        Ok(())
    }

    /// Instantiate the component registered as `name`. It starts in Loaded
    /// with `callbacks` installed.
    pub fn get_handle(
        &self,
        name: &str,
        callbacks: Arc<dyn ComponentCallbacks>,
        app_data: Option<AppData>,
    ) -> Result<ComponentHandle> {
        let registration = find_registration(name)
            .ok_or_else(|| PipelineError::ComponentNotFound(name.to_string()))?;

        let context = ComponentContext {
            name: name.to_string(),
            config: Arc::clone(&self.config),
            backends: Arc::clone(&self.backends),
            time: Arc::clone(&self.time),
        };

        let handle = (registration.constructor)(&context).map_err(|e| {
            tracing::warn!("Constructing component '{}' failed: {}", name, e);
            e
        })?;

        if let Err(e) = handle.set_callbacks(callbacks, app_data) {
            let _ = handle.deinit();
            return Err(e);
        }

        tracing::debug!("Created component '{}'", name);
        Ok(handle)
    }

    /// Destroy a component. It must be Loaded; otherwise the handle is left
    /// untouched and stays usable.
    pub fn free_handle(&self, handle: &ComponentHandle) -> Result<()> {
        let state = handle.get_state();
        if state != ComponentState::Loaded {
            tracing::warn!(
                "Refusing to free '{}' while {}",
                handle.name(),
                state
            );
            return Err(PipelineError::IncorrectStateOperation(state));
        }
        handle.deinit()?;
        tracing::debug!("Freed component '{}'", handle.name());
        Ok(())
    }

    /// Connect `out_port` of `output` to `in_port` of `input`.
    ///
    /// The output side records the peer and proposes its buffer supplier; the
    /// input side validates and accepts. If the input side refuses, the output
    /// side's record is rolled back. Passing `None` for one side tears down
    /// the tunnel on the other side only.
    pub fn setup_tunnel(
        &self,
        output: Option<&ComponentHandle>,
        out_port: u32,
        input: Option<&ComponentHandle>,
        in_port: u32,
    ) -> Result<()> {
        let mut setup = TunnelSetup::default();

        match (output, input) {
            (None, None) => Err(PipelineError::BadParameter(
                "setup_tunnel needs at least one component".into(),
            )),
            (Some(output), None) => {
                output.component_tunnel_request(out_port, None, 0, &mut setup)
            }
            (None, Some(input)) => input.component_tunnel_request(in_port, None, 0, &mut setup),
            (Some(output), Some(input)) => {
                output.component_tunnel_request(out_port, Some(input), in_port, &mut setup)?;

                if let Err(e) =
                    input.component_tunnel_request(in_port, Some(output), out_port, &mut setup)
                {
                    tracing::warn!(
                        "Tunnel {}:{} -> {}:{} refused: {}",
                        output.name(),
                        out_port,
                        input.name(),
                        in_port,
                        e
                    );
                    let mut cancel = TunnelSetup::default();
                    if let Err(rollback) =
                        output.component_tunnel_request(out_port, None, 0, &mut cancel)
                    {
                        tracing::warn!(
                            "Rolling back {}:{} failed: {}",
                            output.name(),
                            out_port,
                            rollback
                        );
                    }
                    return Err(e);
                }

                tracing::info!(
                    "Tunnel {}:{} -> {}:{} established (supplier {:?})",
                    output.name(),
                    out_port,
                    input.name(),
                    in_port,
                    setup.supplier
                );
                Ok(())
            }
        }
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}
