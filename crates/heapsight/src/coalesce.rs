//! At most one aggregates request in flight, at most one queued behind it.
//!
//! Intermediate filters are dropped: when the user drags a selection across
//! a timeline only the first and the last filter are ever sent.

use heapsight_types::NodeFilter;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    InFlight(NodeFilter),
    InFlightWithQueued(NodeFilter, NodeFilter),
}

/// What to do with a response that just arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Show the response.
    Apply,
    /// Drop the response and send this filter instead.
    Reissue(NodeFilter),
    /// The response does not belong to the current request.
    Stale,
}

#[derive(Debug, Default)]
pub struct FilterCoalescer {
    state: State,
    last_applied: Option<NodeFilter>,
}

impl FilterCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the filter to send now, if any.
    pub fn request(&mut self, filter: NodeFilter) -> Option<NodeFilter> {
        match std::mem::take(&mut self.state) {
            State::Idle => {
                if self.last_applied.as_ref() == Some(&filter) {
                    return None;
                }
                self.state = State::InFlight(filter.clone());
                Some(filter)
            }
            State::InFlight(current) => {
                self.state = if current == filter {
                    State::InFlight(current)
                } else {
                    State::InFlightWithQueued(current, filter)
                };
                None
            }
            State::InFlightWithQueued(current, _) => {
                self.state = if current == filter {
                    State::InFlight(current)
                } else {
                    State::InFlightWithQueued(current, filter)
                };
                None
            }
        }
    }

    /// Called with the filter a response was computed for.
    pub fn complete(&mut self, filter: &NodeFilter) -> Completion {
        match std::mem::take(&mut self.state) {
            State::InFlight(current) if current == *filter => {
                self.last_applied = Some(current);
                Completion::Apply
            }
            State::InFlightWithQueued(current, next) if current == *filter => {
                self.state = State::InFlight(next.clone());
                Completion::Reissue(next)
            }
            other => {
                self.state = other;
                Completion::Stale
            }
        }
    }

    /// Filter of the request in flight.
    pub fn in_flight(&self) -> Option<&NodeFilter> {
        match &self.state {
            State::Idle => None,
            State::InFlight(current) | State::InFlightWithQueued(current, _) => Some(current),
        }
    }

    pub fn last_applied(&self) -> Option<&NodeFilter> {
        self.last_applied.as_ref()
    }

    /// Forgets everything, including the last applied filter.
    pub fn clear(&mut self) {
        self.state = State::Idle;
        self.last_applied = None;
    }
}
