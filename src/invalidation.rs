// This module keeps the bookkeeping an external invalidator and a relocating garbage collector
// need about compiled code. Every committed unit is recorded with its owning execution unit,
// its code region, the offsets of the Value immediates embedded in that code and the runtime
// assumptions it was compiled under. An index from assumption to units lets each hook find the
// affected units directly; hooks mark those units invalidated and return their ids, leaving
// the redirection of entry points to the caller. The GC side reports embedded values for
// marking and, when an owner's objects move, rewrites the immediates in place through the
// arena and updates the records so later reports see the new addresses.

//! Invalidation bookkeeping and GC cooperation.

use crate::core::error::CompileResult;
use crate::core::operand::{CodePtr, Value};
use crate::exec_mem::{CodeRegion, ExecArena};
use hashbrown::HashMap;

/// Offset of an embedded `Value` immediate within a unit's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef {
    pub offset: u32,
    pub value: Value,
}

/// Identity of the execution unit (bytecode routine) a compiled unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u32);

impl UnitId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A runtime fact compiled code relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assumption {
    /// Method `method` resolves the same way on class `class`.
    MethodLookup { class: u64, method: u64 },
    /// A resolved call entry stays valid.
    CallEntry(u64),
    /// Basic operator `op` on `class` is not redefined.
    BasicOperator { class: u64, op: u32 },
    /// The constant named `name` keeps its value.
    StableConstant(u64),
    /// Inline cache `cache` keeps its contents.
    InlineCache(u64),
    /// Only one actor is running.
    SingleActor,
}

/// Everything recorded about one committed unit.
#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub owner: OwnerId,
    pub region: CodeRegion,
    pub entry: CodePtr,
    pub gc_refs: Vec<GcRef>,
    pub assumptions: Vec<Assumption>,
    pub invalidated: bool,
}

#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: Vec<Option<UnitRecord>>,
    by_assumption: HashMap<Assumption, Vec<UnitId>>,
    by_owner: HashMap<OwnerId, Vec<UnitId>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        owner: OwnerId,
        region: CodeRegion,
        gc_refs: Vec<GcRef>,
        assumptions: Vec<Assumption>,
    ) -> UnitId {
        let id = UnitId(self.units.len() as u32);
        for &a in &assumptions {
            let ids = self.by_assumption.entry(a).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.by_owner.entry(owner).or_default().push(id);
        self.units.push(Some(UnitRecord {
            owner,
            region,
            entry: region.start(),
            gc_refs,
            assumptions,
            invalidated: false,
        }));
        id
    }

    pub fn unit(&self, id: UnitId) -> Option<&UnitRecord> {
        self.units.get(id.index()).and_then(Option::as_ref)
    }

    pub fn is_invalidated(&self, id: UnitId) -> bool {
        self.unit(id).is_some_and(|u| u.invalidated)
    }

    /// Number of recorded units, freed ones excluded.
    pub fn len(&self) -> usize {
        self.units.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn units_of(&self, owner: OwnerId) -> Vec<UnitId> {
        self.by_owner.get(&owner).cloned().unwrap_or_default()
    }

    fn mark(&mut self, ids: impl IntoIterator<Item = UnitId>) -> Vec<UnitId> {
        let mut newly = Vec::new();
        for id in ids {
            if let Some(Some(unit)) = self.units.get_mut(id.index()) {
                if !unit.invalidated {
                    unit.invalidated = true;
                    newly.push(id);
                }
            }
        }
        newly.sort_unstable();
        newly.dedup();
        newly
    }

    fn invalidate_matching(&mut self, pred: impl Fn(&Assumption) -> bool) -> Vec<UnitId> {
        let keys: Vec<Assumption> = self.by_assumption.keys().filter(|a| pred(a)).copied().collect();
        let mut ids = Vec::new();
        for key in keys {
            if let Some(units) = self.by_assumption.remove(&key) {
                ids.extend(units);
            }
        }
        let newly = self.mark(ids);
        if !newly.is_empty() {
            log::info!("invalidated {} compiled units", newly.len());
        }
        newly
    }

    fn invalidate(&mut self, assumption: Assumption) -> Vec<UnitId> {
        self.invalidate_matching(|a| *a == assumption)
    }

    pub fn invalidate_all_method_lookups(&mut self) -> Vec<UnitId> {
        self.invalidate_matching(|a| matches!(a, Assumption::MethodLookup { .. }))
    }

    pub fn method_lookup_changed(&mut self, class: u64, method: u64) -> Vec<UnitId> {
        self.invalidate(Assumption::MethodLookup { class, method })
    }

    pub fn call_entry_invalidated(&mut self, entry: u64) -> Vec<UnitId> {
        self.invalidate(Assumption::CallEntry(entry))
    }

    pub fn basic_operator_redefined(&mut self, class: u64, op: u32) -> Vec<UnitId> {
        self.invalidate(Assumption::BasicOperator { class, op })
    }

    pub fn constant_state_changed(&mut self, name: u64) -> Vec<UnitId> {
        self.invalidate(Assumption::StableConstant(name))
    }

    pub fn inline_cache_updated(&mut self, cache: u64) -> Vec<UnitId> {
        self.invalidate(Assumption::InlineCache(cache))
    }

    /// Instrumentation was switched on: no compiled code may run.
    pub fn tracing_enabled(&mut self) -> Vec<UnitId> {
        self.by_assumption.clear();
        let all: Vec<UnitId> = (0..self.units.len() as u32).map(UnitId).collect();
        let newly = self.mark(all);
        log::info!("tracing enabled, invalidated {} compiled units", newly.len());
        newly
    }

    pub fn before_actor_fork(&mut self) -> Vec<UnitId> {
        self.invalidate(Assumption::SingleActor)
    }

    /// The owner was freed; its units are invalidated and forgotten.
    pub fn owner_freed(&mut self, owner: OwnerId) -> Vec<UnitId> {
        let ids = self.by_owner.remove(&owner).unwrap_or_default();
        let newly = self.mark(ids.iter().copied());
        for &id in &ids {
            if let Some(slot) = self.units.get_mut(id.index()) {
                *slot = None;
            }
        }
        for units in self.by_assumption.values_mut() {
            units.retain(|id| !ids.contains(id));
        }
        newly
    }

    /// Report every `Value` embedded in the owner's code.
    pub fn mark_owner(&self, owner: OwnerId, mut mark: impl FnMut(Value)) {
        for id in self.by_owner.get(&owner).into_iter().flatten() {
            if let Some(unit) = self.unit(*id) {
                for r in &unit.gc_refs {
                    mark(r.value);
                }
            }
        }
    }

    /// Objects referenced by the owner's code moved; rewrite the immediates.
    /// Returns the number of rewritten references.
    pub fn owner_relocated(
        &mut self,
        arena: &ExecArena,
        owner: OwnerId,
        mut relocate: impl FnMut(Value) -> Value,
    ) -> CompileResult<usize> {
        let ids = self.by_owner.get(&owner).cloned().unwrap_or_default();
        let mut rewritten = 0;
        for id in ids {
            let Some(Some(unit)) = self.units.get_mut(id.index()) else {
                continue;
            };
            for r in unit.gc_refs.iter_mut() {
                let moved = relocate(r.value);
                if moved != r.value {
                    arena.patch(&unit.region, r.offset as usize, &moved.as_u64().to_le_bytes())?;
                    r.value = moved;
                    rewritten += 1;
                }
            }
        }
        log::debug!("relocated {rewritten} references of owner {}", owner.0);
        Ok(rewritten)
    }
}
