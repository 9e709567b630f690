use std::cmp::Ordering;

use facet::Facet;

/// A sortable attribute of a row, whether it lives in the worker (nodes and
/// edges) or in a UI-side grid (class rollups and diffs).
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum SortField {
    Name,
    Id,
    Distance,
    ShallowSize,
    RetainedSize,
    EdgeName,
    Count,
    AddedCount,
    RemovedCount,
    CountDelta,
    AddedSize,
    RemovedSize,
    SizeDelta,
    LiveCount,
    LiveSize,
    Size,
}

/// Value of one field of one row, as seen by a comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey<'a> {
    Number(i64),
    Text(&'a str),
}

impl From<u64> for SortKey<'_> {
    fn from(value: u64) -> Self {
        Self::Number(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u32> for SortKey<'_> {
    fn from(value: u32) -> Self {
        Self::Number(i64::from(value))
    }
}

impl From<i64> for SortKey<'_> {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl<'a> From<&'a str> for SortKey<'a> {
    fn from(value: &'a str) -> Self {
        Self::Text(value)
    }
}

/// Primary field plus tie-break field, each with its own direction.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComparatorConfig {
    pub field1: SortField,
    pub ascending1: bool,
    pub field2: SortField,
    pub ascending2: bool,
}

impl ComparatorConfig {
    pub fn new(field1: SortField, ascending1: bool, field2: SortField, ascending2: bool) -> Self {
        Self {
            field1,
            ascending1,
            field2,
            ascending2,
        }
    }

    /// Sorts by one field only; the tie-break repeats it.
    pub fn single(field: SortField, ascending: bool) -> Self {
        Self::new(field, ascending, field, ascending)
    }

    pub fn compare<'a, T: ?Sized>(
        &self,
        a: &'a T,
        b: &'a T,
        key: impl Fn(&'a T, SortField) -> SortKey<'a>,
    ) -> Ordering {
        let first = directed(key(a, self.field1).cmp(&key(b, self.field1)), self.ascending1);
        if first != Ordering::Equal {
            return first;
        }
        directed(key(a, self.field2).cmp(&key(b, self.field2)), self.ascending2)
    }
}

fn directed(ordering: Ordering, ascending: bool) -> Ordering {
    if ascending { ordering } else { ordering.reverse() }
}
