//! Types shared by the heapsight worker and the UI-side proxies.
//!
//! Everything in here crosses the worker boundary as JSON, so every type
//! derives `Facet`.

use facet::Facet;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod aggregate;
pub mod filter;
pub mod items;
pub mod sort;
pub mod stats;

pub use aggregate::{Aggregate, AggregateForDiff, Aggregates, DiffForClass, aggregates_by_name};
pub use filter::NodeFilter;
pub use items::{
    AllocationStackFrame, EdgeItem, ItemsRange, Location, NodeItem, ProviderItem, SearchConfig,
    SerializedAllocationNode,
};
pub use sort::{ComparatorConfig, SortField, SortKey};
pub use stats::{Samples, StaticData, Statistics};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroId(&'static str),
    InvertedRange { start: u32, end: u32 },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroId(field) => write!(f, "{field} must be non-zero"),
            Self::InvertedRange { start, end } => {
                write!(f, "range start {start} is past range end {end}")
            }
        }
    }
}

impl Error for InvariantError {}

macro_rules! define_u64_id {
    (
        $(#[$meta:meta])*
        $name:ident,
        field = $field:literal
    ) => {
        #[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[facet(transparent)]
        $(#[$meta])*
        pub struct $name(u64);

        impl $name {
            pub fn new(value: u64) -> Result<Self, InvariantError> {
                if value == 0 {
                    return Err(InvariantError::ZeroId($field));
                }
                Ok(Self(value))
            }

            /// Takes the next id from a zero-initialized counter; the first id is 1.
            pub fn next_from(counter: &AtomicU64) -> Self {
                Self(counter.fetch_add(1, Ordering::Relaxed) + 1)
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_u64_id!(
    /// Handle of an object living inside a worker. Unique per client while live.
    ObjectId,
    field = "object_id"
);

define_u64_id!(
    /// Correlates a request with its reply.
    CallId,
    field = "call_id"
);

define_u64_id!(
    /// Identity of a loaded profile, used as the base key when diffing.
    ProfileUid,
    field = "profile_uid"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_from_counter_start_at_one_and_never_repeat() {
        let counter = AtomicU64::new(0);
        let first = ObjectId::next_from(&counter);
        let second = ObjectId::next_from(&counter);
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);
        assert_ne!(first, second);
    }

    #[test]
    fn zero_id_is_rejected() {
        assert_eq!(CallId::new(0), Err(InvariantError::ZeroId("call_id")));
        assert_eq!(CallId::new(7).map(CallId::get), Ok(7));
    }

    #[test]
    fn ids_serialize_as_bare_numbers() {
        let id = ObjectId::new(42).expect("non-zero id");
        let json = facet_json::to_string(&id).expect("serialize id");
        assert_eq!(json, "42");
        let back: ObjectId = facet_json::from_str(&json).expect("deserialize id");
        assert_eq!(back, id);
    }
}
