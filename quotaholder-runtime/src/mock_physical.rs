use crate::physical::{CommissionSpec, Physical};
use anyhow::{anyhow, Context};
use quotaholder_core::id::Serial;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Target of a mock resource: a volume of some size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockDescription {
    pub size: i64,
}

/// Observed mock resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockState {
    /// Size built so far
    pub size: i64,

    /// False once the resource can no longer reach its target
    pub attainable: bool,
}

impl MockState {
    pub fn building(size: i64) -> Self {
        Self {
            size,
            attainable: true,
        }
    }

    pub fn broken(size: i64) -> Self {
        Self {
            size,
            attainable: false,
        }
    }
}

/// One recorded driver invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalCall {
    Derive,
    Initiate(Serial),
    GetState(Serial),
    Continue(Serial),
    End(Serial),
}

#[derive(Debug, Default)]
struct Script {
    states: VecDeque<Option<MockState>>,
    last: Option<MockState>,
    failing_ends: usize,
    calls: Vec<PhysicalCall>,
}

/// Scripted driver for testing the controller.
///
/// `get_current_state` answers with the scripted states in order and keeps
/// repeating the last one once the script runs out.
#[derive(Debug, Default)]
pub struct MockPhysical {
    script: Mutex<Script>,
}

impl MockPhysical {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver whose state polls answer `states` in order
    pub fn with_states(states: impl IntoIterator<Item = Option<MockState>>) -> Self {
        let mock = Self::new();
        mock.push_states(states);
        mock
    }

    pub fn push_states(&self, states: impl IntoIterator<Item = Option<MockState>>) {
        if let Ok(mut script) = self.script.lock() {
            script.states.extend(states);
        }
    }

    /// Make the next `count` calls to `end_commission` fail
    pub fn fail_next_ends(&self, count: usize) {
        if let Ok(mut script) = self.script.lock() {
            script.failing_ends = count;
        }
    }

    /// Every call recorded so far, in order
    pub fn calls(&self) -> Vec<PhysicalCall> {
        self.script
            .lock()
            .map(|script| script.calls.clone())
            .unwrap_or_default()
    }

    /// How many recorded calls satisfy `predicate`
    pub fn count(&self, predicate: impl Fn(&PhysicalCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(*call)).count()
    }

    fn record(&self, call: PhysicalCall) -> anyhow::Result<MutexGuard<'_, Script>> {
        let mut script = self
            .script
            .lock()
            .map_err(|e| anyhow!("mock script poisoned: {}", e))?;
        script.calls.push(call);
        Ok(script)
    }
}

impl Physical for MockPhysical {
    type Description = MockDescription;
    type State = MockState;

    fn derive_description(&self, spec: &CommissionSpec) -> anyhow::Result<MockDescription> {
        self.record(PhysicalCall::Derive)?;
        let size = spec
            .arguments
            .get("size")
            .and_then(serde_json::Value::as_i64)
            .with_context(|| format!("{}: missing integer argument size", spec.call))?;
        Ok(MockDescription { size })
    }

    fn initiate_commission(&self, serial: Serial, _: &MockDescription) -> anyhow::Result<()> {
        self.record(PhysicalCall::Initiate(serial))?;
        Ok(())
    }

    fn get_current_state(
        &self,
        serial: Serial,
        _: &MockDescription,
    ) -> anyhow::Result<Option<MockState>> {
        let mut script = self.record(PhysicalCall::GetState(serial))?;
        let state = match script.states.pop_front() {
            Some(state) => state,
            None => script.last,
        };
        script.last = state;
        Ok(state)
    }

    fn complies(&self, state: &MockState, description: &MockDescription) -> bool {
        state.attainable && state.size == description.size
    }

    fn attainable(&self, state: &MockState, description: &MockDescription) -> bool {
        state.attainable && state.size <= description.size
    }

    fn continue_commission(&self, serial: Serial, _: &MockDescription) -> anyhow::Result<()> {
        self.record(PhysicalCall::Continue(serial))?;
        Ok(())
    }

    fn end_commission(&self, serial: Serial, _: &MockDescription) -> anyhow::Result<()> {
        let mut script = self.record(PhysicalCall::End(serial))?;
        if script.failing_ends > 0 {
            script.failing_ends -= 1;
            return Err(anyhow!("mock failure ending {}", serial));
        }
        Ok(())
    }
}
