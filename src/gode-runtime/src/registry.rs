//! In-memory store of resolved modules.

use std::collections::HashMap;

use rquickjs::{Object, Persistent};

use crate::error::Error;
use crate::resolve::ModuleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Builtin,
    File,
    Plugin,
    Url,
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Created, plan not yet executed.
    Resolving,
    /// Top-level source is executing; exports may be partially populated.
    Evaluating,
    Evaluated,
    Failed,
}

/// One module. `module` holds the CommonJS `module` object so cycle
/// participants observe live (possibly partial) `module.exports`.
pub struct ModuleRecord {
    pub id: ModuleId,
    pub kind: ModuleKind,
    pub state: ModuleState,
    pub module: Option<Persistent<Object<'static>>>,
    pub failure: Option<Error>,
    /// Modules that requested this one; kept for cycle diagnostics.
    pub referrers: Vec<ModuleId>,
}

/// ModuleId → ModuleRecord map. A given id gets at most one record for the
/// lifetime of the VM; Evaluated and Failed records are final.
#[derive(Default)]
pub struct ModuleRegistry {
    records: HashMap<ModuleId, ModuleRecord>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ModuleId) -> Option<&ModuleRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.records.contains_key(id)
    }

    /// Create the record for `id`. Panics in debug builds if one exists; the
    /// loader checks before inserting.
    pub fn insert(
        &mut self,
        id: ModuleId,
        kind: ModuleKind,
        state: ModuleState,
        module: Option<Persistent<Object<'static>>>,
    ) {
        debug_assert!(
            !self.records.contains_key(&id),
            "duplicate module record for {id}"
        );
        self.records.insert(
            id.clone(),
            ModuleRecord {
                id,
                kind,
                state,
                module,
                failure: None,
                referrers: Vec::new(),
            },
        );
    }

    pub fn note_referrer(&mut self, id: &ModuleId, referrer: &ModuleId) {
        if let Some(record) = self.records.get_mut(id) {
            if !record.referrers.contains(referrer) {
                record.referrers.push(referrer.clone());
            }
        }
    }

    pub fn mark_evaluating(&mut self, id: &ModuleId) {
        if let Some(record) = self.records.get_mut(id) {
            debug_assert!(matches!(
                record.state,
                ModuleState::Resolving | ModuleState::Evaluating
            ));
            record.state = ModuleState::Evaluating;
        }
    }

    pub fn mark_evaluated(&mut self, id: &ModuleId) {
        if let Some(record) = self.records.get_mut(id) {
            record.state = ModuleState::Evaluated;
        }
    }

    /// Attach the module object and finalize the record as Evaluated.
    pub fn complete(&mut self, id: &ModuleId, module: Persistent<Object<'static>>) {
        if let Some(record) = self.records.get_mut(id) {
            record.module = Some(module);
            record.state = ModuleState::Evaluated;
        }
    }

    /// Finalize a record as Failed. Partial exports are discarded; every later
    /// request for `id` gets a clone of `failure`.
    pub fn mark_failed(&mut self, id: &ModuleId, failure: Error) {
        if let Some(record) = self.records.get_mut(id) {
            record.state = ModuleState::Failed;
            record.module = None;
            record.failure = Some(failure);
        }
    }

    /// Drop every engine reference held by the registry. Must run before the
    /// engine itself is dropped.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn failed_record_drops_module_and_keeps_error() {
        let mut registry = ModuleRegistry::new();
        let id = ModuleId::new("/a.js");
        registry.insert(id.clone(), ModuleKind::File, ModuleState::Evaluating, None);
        registry.mark_failed(&id, Error::new(ErrorKind::ModuleEval, "boom"));

        let record = registry.get(&id).unwrap();
        assert_eq!(record.state, ModuleState::Failed);
        assert!(record.module.is_none());
        assert_eq!(record.failure.as_ref().unwrap().kind(), ErrorKind::ModuleEval);
    }

    #[test]
    fn referrers_deduplicate() {
        let mut registry = ModuleRegistry::new();
        let id = ModuleId::new("/a.js");
        let referrer = ModuleId::new("/b.js");
        registry.insert(id.clone(), ModuleKind::File, ModuleState::Evaluated, None);
        registry.note_referrer(&id, &referrer);
        registry.note_referrer(&id, &referrer);
        assert_eq!(registry.get(&id).unwrap().referrers.len(), 1);
    }
}
