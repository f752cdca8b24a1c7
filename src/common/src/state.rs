// Copyright 2025 FusionFlow Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use parking_lot::Mutex;
use parse_display::Display;

use crate::error::{FlowError, FlowResult};

/// Lifecycle state shared by every hierarchical entity in a pipeline:
/// the pipeline itself, its nodes, their workers and ports.
///
/// The ordinary path is `Idle -> Configured -> Prepared -> Running ->
/// Depleting -> Stop`. Two extra edges exist: any state may be forced
/// directly into `Stop`, and `Stop -> Prepared` re-arms a finished
/// pipeline instance for reuse.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(style = "lowercase")]
pub enum State {
    Idle,
    Configured,
    Prepared,
    Running,
    Depleting,
    Stop,
}

impl State {
    /// Whether a controlled (non-forced) transition from `self` to `next`
    /// is allowed. A transition to the current state is a no-op and always
    /// allowed.
    pub fn can_transit_to(self, next: State) -> bool {
        use State::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Configured)
                | (Configured, Prepared)
                | (Prepared, Running)
                | (Running, Depleting)
                | (Depleting, Stop)
                | (Stop, Prepared)
        )
    }
}

/// A mutex-guarded [`State`] with transition checking.
///
/// This is the building block every stateful entity embeds. Controlled
/// transitions go through [`StateCell::transit_to`]; a forced stop is
/// always legal via [`StateCell::force_stop`].
#[derive(Debug)]
pub struct StateCell(Mutex<State>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Mutex::new(State::Idle))
    }
}

impl StateCell {
    pub fn new(state: State) -> Self {
        Self(Mutex::new(state))
    }

    pub fn get(&self) -> State {
        *self.0.lock()
    }

    pub fn is(&self, state: State) -> bool {
        self.get() == state
    }

    /// Perform a controlled transition, rejecting edges outside the
    /// lifecycle partial order.
    pub fn transit_to(&self, next: State) -> FlowResult<()> {
        let mut guard = self.0.lock();
        if !guard.can_transit_to(next) {
            return Err(FlowError::InvalidTransition {
                from: *guard,
                to: next,
            });
        }
        *guard = next;
        Ok(())
    }

    /// Force the entity into `Stop` regardless of its current state.
    pub fn force_stop(&self) {
        *self.0.lock() = State::Stop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_order() {
        use State::*;
        let chain = [Idle, Configured, Prepared, Running, Depleting, Stop];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transit_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        // Skipping forward is not a controlled transition.
        assert!(!Idle.can_transit_to(Running));
        assert!(!Configured.can_transit_to(Depleting));
        // Backward edges other than rearm are rejected.
        assert!(!Running.can_transit_to(Configured));
        assert!(Stop.can_transit_to(Prepared));
    }

    #[test]
    fn test_cell_checked_transitions() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), State::Idle);
        cell.transit_to(State::Configured).unwrap();
        assert!(cell.transit_to(State::Running).is_err());
        assert_eq!(cell.get(), State::Configured);

        cell.force_stop();
        assert_eq!(cell.get(), State::Stop);
        // Rearm path.
        cell.transit_to(State::Prepared).unwrap();
        cell.transit_to(State::Running).unwrap();
    }

    #[test]
    fn test_self_transition_is_noop() {
        let cell = StateCell::new(State::Configured);
        cell.transit_to(State::Configured).unwrap();
        assert_eq!(cell.get(), State::Configured);
    }
}
