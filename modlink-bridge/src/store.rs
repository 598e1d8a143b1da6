//! Shared register buffer with copy-on-write snapshots.
//!
//! Readers always get a complete [`Snapshot`]. Writers build the next one from
//! the current snapshot with a [`SnapshotBuilder`] and swap it in with
//! [`RegisterStore::commit`]; the buffer is never mutated in place.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::RegisterRange;

/// The full register buffer at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Monotonic version; 0 is the zero-filled startup buffer.
    pub version: u64,
    /// Unix epoch milliseconds of the commit, `None` before the first read.
    pub updated_at: Option<i64>,
    registers: Vec<u16>,
}

impl Snapshot {
    /// Register values in address order.
    pub fn registers(&self) -> &[u16] {
        &self.registers
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Start building the successor of this snapshot.
    pub fn to_builder(&self) -> SnapshotBuilder {
        SnapshotBuilder {
            base_version: self.version,
            registers: self.registers.clone(),
        }
    }
}

/// The next snapshot under construction.
///
/// Each [`apply`](Self::apply) either overwrites a whole range or nothing.
#[derive(Debug)]
pub struct SnapshotBuilder {
    base_version: u64,
    registers: Vec<u16>,
}

/// A range update did not fit the buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Update of {len} registers at {start} does not fit a buffer of {capacity}")]
pub struct OutOfBounds {
    pub start: usize,
    pub len: usize,
    pub capacity: usize,
}

impl SnapshotBuilder {
    /// Overwrite the registers of `range` with `values`.
    pub fn apply(&mut self, range: &RegisterRange, values: &[u16]) -> Result<(), OutOfBounds> {
        let span = range.span();
        self.write(span.start..span.start + values.len(), values)
    }

    fn write(&mut self, span: Range<usize>, values: &[u16]) -> Result<(), OutOfBounds> {
        let capacity = self.registers.len();
        let target = self.registers.get_mut(span.clone()).ok_or(OutOfBounds {
            start: span.start,
            len: values.len(),
            capacity,
        })?;
        target.copy_from_slice(values);
        Ok(())
    }
}

/// Fixed-size register buffer shared between the poll loop and readers.
///
/// Cloning is cheap; clones share the same buffer.
#[derive(Debug, Clone)]
pub struct RegisterStore {
    current: Arc<RwLock<Arc<Snapshot>>>,
}

impl RegisterStore {
    /// Create a zero-filled store of `len` registers.
    pub fn new(len: usize) -> Self {
        let initial = Snapshot {
            version: 0,
            updated_at: None,
            registers: vec![0; len],
        };
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Number of registers; fixed for the lifetime of the store.
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in the snapshot built by `builder` and return it.
    ///
    /// Builders always start from a snapshot of this store, so the length is
    /// preserved. The new version follows the latest committed one even if
    /// another commit happened since the builder was created.
    pub fn commit(&self, builder: SnapshotBuilder) -> Arc<Snapshot> {
        let mut current = self.current.write();
        debug_assert_eq!(builder.registers.len(), current.len());

        let next = Arc::new(Snapshot {
            version: current.version.max(builder.base_version) + 1,
            updated_at: Some(modlink_common::current_timestamp_millis()),
            registers: builder.registers,
        });
        *current = next.clone();
        next
    }
}
