//! Per-instance state and the view host functions get of it.
//!
//! This module provides:
//! - [`StoreState`]: Data kept in every instance's store
//! - [`InstanceContext`]: Handle passed to imported functions while the
//!   calling instance is suspended

use wasmtime::{AsContext, AsContextMut, Caller, Global, Memory, Val};

use crate::memory::{MemoryView, MemoryViewMut};

/// Data stored alongside an instance.
///
/// `memory` and `points` are filled in after the export walk, so host
/// functions running during instantiation (a start function) see neither.
pub(crate) struct StoreState<T> {
    /// Arbitrary host data attached to the instance.
    pub(crate) context_data: Option<T>,

    /// The exported linear memory, if any.
    pub(crate) memory: Option<Memory>,

    /// The injected points-used global of a metered instance.
    pub(crate) points: Option<Global>,
}

impl<T> StoreState<T> {
    pub(crate) fn new() -> Self {
        Self {
            context_data: None,
            memory: None,
            points: None,
        }
    }
}

/// Context passed as the first argument of every imported function.
///
/// Gives access to the calling instance's context data and exported memory.
/// It is only valid for the duration of the host call.
pub struct InstanceContext<'a, T: 'static> {
    caller: Caller<'a, StoreState<T>>,
}

impl<'a, T: 'static> InstanceContext<'a, T> {
    pub(crate) fn new(caller: Caller<'a, StoreState<T>>) -> Self {
        Self { caller }
    }

    /// Context data previously attached with
    /// [`Instance::set_context_data`](crate::Instance::set_context_data).
    pub fn data(&self) -> Option<&T> {
        self.caller.data().context_data.as_ref()
    }

    /// Mutable access to the context data.
    pub fn data_mut(&mut self) -> Option<&mut T> {
        self.caller.data_mut().context_data.as_mut()
    }

    /// The calling instance's exported memory.
    pub fn memory(&self) -> Option<MemoryView<'_, T>> {
        let memory = self.caller.data().memory?;
        Some(MemoryView::new(memory, self.caller.as_context()))
    }

    /// Mutable access to the calling instance's exported memory.
    pub fn memory_mut(&mut self) -> Option<MemoryViewMut<'_, T>> {
        let memory = self.caller.data().memory?;
        Some(MemoryViewMut::new(memory, self.caller.as_context_mut()))
    }

    /// Points consumed so far by a metered caller; 0 otherwise.
    pub fn points_used(&mut self) -> u64 {
        let points = self.caller.data().points;
        points.map_or(0, |global| read_points(&global, &mut self.caller))
    }
}

impl<T: 'static> std::fmt::Debug for InstanceContext<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.caller.data();
        f.debug_struct("InstanceContext")
            .field("has_data", &state.context_data.is_some())
            .field("has_memory", &state.memory.is_some())
            .field("is_metered", &state.points.is_some())
            .finish()
    }
}

/// Read the points-used global; the `i64` holds the unsigned count.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn read_points(global: &Global, store: impl AsContextMut) -> u64 {
    match global.get(store) {
        Val::I64(points) => points as u64,
        _ => 0,
    }
}
