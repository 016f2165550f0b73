// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A deterministic finite state machine shared by every job kind.
//!
//! A job kind declares its states, its events and a static [`TransitionTable`]. Every
//! non-terminal state has one action. The action runs, returns an event, and the event picks the
//! next state. Three things can happen after a transition:
//!
//! * the next state is the terminal state: the job is completed;
//! * the next state is the current state (a self loop): the action is waiting on children it has
//!   just spawned, so the job suspends. Once resumed, the machine re-runs the action of the
//!   *same* state, so actions must cope with being invoked again after their children progressed;
//! * otherwise the machine immediately runs the action of the next state.
//!
//! An event with no transition from the current state is a logic error in the job.

use std::collections::HashSet;
use std::fmt::{Debug, Display, Write};
use std::hash::Hash;

use itertools::Itertools;
use strum::IntoEnumIterator;

use crate::error::{Result, SearchError};

pub trait JobState:
    Copy + Eq + Hash + Debug + Display + IntoEnumIterator + Send + Sync + 'static
{
    const INITIAL: Self;
    const TERMINAL: Self;
}

pub trait JobEvent: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    pub from: S,
    pub event: E,
    pub to: S,
}

impl<S, E> Transition<S, E> {
    pub const fn new(from: S, event: E, to: S) -> Self {
        Self { from, event, to }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// The terminal state is reached.
    Completed,
    /// An action is waiting on children.
    Suspended,
}

/// The read-only transition table of a job kind, shared by all jobs of that kind.
#[derive(Debug)]
pub struct TransitionTable<S: 'static, E: 'static> {
    transitions: &'static [Transition<S, E>],
}

impl<S: JobState, E: JobEvent> TransitionTable<S, E> {
    pub const fn new(transitions: &'static [Transition<S, E>]) -> Self {
        Self { transitions }
    }

    pub fn transitions(&self) -> &'static [Transition<S, E>] {
        self.transitions
    }

    pub fn next(&self, from: S, event: E) -> Result<S> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
            .map(|t| t.to)
            .ok_or_else(|| SearchError::NoTransition {
                state: from.to_string(),
                event: event.to_string(),
            })
    }

    /// Checks that the table is deterministic and that nothing leaves the terminal state.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for t in self.transitions {
            if !seen.insert((t.from, t.event)) {
                return Err(format!("duplicate transition from {} on {}", t.from, t.event));
            }
            if t.from == S::TERMINAL {
                return Err(format!("transition {} leaves the terminal state", t.event));
            }
        }
        Ok(())
    }

    /// States that cannot be reached from the initial state.
    pub fn unreachable_states(&self) -> Vec<S> {
        let mut reached = HashSet::from([S::INITIAL]);
        let mut frontier = vec![S::INITIAL];
        while let Some(state) = frontier.pop() {
            for t in self.transitions.iter().filter(|t| t.from == state) {
                if reached.insert(t.to) {
                    frontier.push(t.to);
                }
            }
        }
        S::iter().filter(|s| !reached.contains(s)).collect_vec()
    }

    /// Dump the state diagram in graphviz format.
    pub fn to_graphviz(&self, title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{title}\" {{");
        for state in S::iter() {
            let shape = if state == S::TERMINAL {
                "doublecircle"
            } else {
                "circle"
            };
            let _ = writeln!(out, "  \"{state}\" [shape={shape}];");
        }
        for t in self.transitions {
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [label=\"{}\"];",
                t.from, t.to, t.event
            );
        }
        out.push_str("}\n");
        out
    }
}

/// The per-job instance: a current state and the table of its kind.
#[derive(Debug)]
pub struct JobStateMachine<S: 'static, E: 'static> {
    table: &'static TransitionTable<S, E>,
    current: S,
}

impl<S: JobState, E: JobEvent> JobStateMachine<S, E> {
    pub fn new(table: &'static TransitionTable<S, E>) -> Self {
        Self {
            table,
            current: S::INITIAL,
        }
    }

    pub fn reset(&mut self) {
        self.current = S::INITIAL;
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.current == S::TERMINAL
    }

    pub fn table(&self) -> &'static TransitionTable<S, E> {
        self.table
    }

    /// Drive the machine until it suspends or completes. `action` runs the action of the given
    /// state; `on_transition` observes every transition taken.
    pub fn run(
        &mut self,
        mut action: impl FnMut(S) -> Result<E>,
        mut on_transition: impl FnMut(S, E, S),
    ) -> Result<MachineStatus> {
        loop {
            if self.current == S::TERMINAL {
                return Ok(MachineStatus::Completed);
            }
            let from = self.current;
            let event = action(from)?;
            let to = self.table.next(from, event)?;
            on_transition(from, event, to);
            self.current = to;
            if to == from {
                return Ok(MachineStatus::Suspended);
            }
        }
    }
}
