// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ilpipe::{
    AppData, BufferHeader, Command, ComponentCallbacks, ComponentHandle, ComponentState, Event,
    Result,
};
use parking_lot::{Condvar, Mutex};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Callbacks that record everything a component reports.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(String, Event)>>,
    emptied: Mutex<Vec<(String, BufferHeader)>>,
    filled: Mutex<Vec<(String, BufferHeader)>>,
    changed: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until `component` has raised an event matching `pred`.
    pub fn wait_for(&self, component: &str, pred: impl Fn(&Event) -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        let mut events = self.events.lock();
        loop {
            if events.iter().any(|(name, e)| name == component && pred(e)) {
                return true;
            }
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return events.iter().any(|(name, e)| name == component && pred(e));
            }
        }
    }

    pub fn count(&self, component: &str, pred: impl Fn(&Event) -> bool) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(name, e)| name == component && pred(e))
            .count()
    }

    pub fn events_for(&self, component: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name == component)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn emptied(&self, component: &str) -> Vec<BufferHeader> {
        self.emptied
            .lock()
            .iter()
            .filter(|(name, _)| name == component)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Block until `component` has handed back at least `n` input buffers.
    pub fn wait_for_emptied(&self, component: &str, n: usize) -> bool {
        wait_until(|| self.emptied(component).len() >= n)
    }

    pub fn filled(&self, component: &str) -> Vec<BufferHeader> {
        self.filled
            .lock()
            .iter()
            .filter(|(name, _)| name == component)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

impl ComponentCallbacks for Recorder {
    fn event_handler(&self, component: &str, event: Event, _app_data: Option<&AppData>) {
        self.events.lock().push((component.to_string(), event));
        self.changed.notify_all();
    }

    fn empty_buffer_done(
        &self,
        component: &str,
        buffer: &BufferHeader,
        _app_data: Option<&AppData>,
    ) -> Result<()> {
        self.emptied
            .lock()
            .push((component.to_string(), buffer.clone()));
        Ok(())
    }

    fn fill_buffer_done(
        &self,
        component: &str,
        buffer: &BufferHeader,
        _app_data: Option<&AppData>,
    ) -> Result<()> {
        self.filled
            .lock()
            .push((component.to_string(), buffer.clone()));
        Ok(())
    }
}

pub fn is_state_complete(state: ComponentState) -> impl Fn(&Event) -> bool {
    move |e| *e == Event::CmdComplete(Command::StateSet(state))
}

/// Request `state` and wait for the component to confirm it.
pub fn set_state(recorder: &Recorder, handle: &ComponentHandle, state: ComponentState) {
    let before = recorder.count(handle.name(), is_state_complete(state));
    handle
        .send_command(Command::StateSet(state), None)
        .unwrap();

    let deadline = Instant::now() + TIMEOUT;
    while recorder.count(handle.name(), is_state_complete(state)) == before {
        assert!(
            Instant::now() < deadline,
            "{} never reached {}",
            handle.name(),
            state
        );
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(handle.get_state(), state);
}

/// Poll `condition` until it holds or the test timeout passes.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Give the worker threads a moment to prove nothing else arrives.
pub fn settle() {
    std::thread::sleep(Duration::from_millis(100));
}
