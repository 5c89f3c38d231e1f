use std::collections::BTreeMap;

use modbridge_wire::{
    normalize_source_path,
    wire::{ArmedBreakpointInfo, BreakpointSpec, TargetBreakpointId},
};

use crate::dap::types::{Breakpoint, Source};

/// A breakpoint as the client sees it plus what the target made of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedBreakpoint {
    pub dap_id: i64,
    pub spec: BreakpointSpec,
    /// `None` when the target rejected the breakpoint.
    pub target_id: Option<TargetBreakpointId>,
    pub line: u32,
    pub message: Option<String>,
}

impl ArmedBreakpoint {
    pub fn verified(&self) -> bool {
        self.target_id.is_some()
    }

    fn to_dap(&self, path: &str) -> Breakpoint {
        Breakpoint {
            id: self.dap_id,
            verified: self.verified(),
            message: self.message.clone(),
            source: Some(Source {
                name: None,
                path: Some(path.to_string()),
            }),
            line: self.line,
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Keep(ArmedBreakpoint),
    Add { dap_id: i64, spec: BreakpointSpec },
}

/// The target commands needed to bring one source in line with a request.
///
/// Produced by [`BreakpointManager::plan`]; the caller sends `remove` and
/// `add` to the target and feeds the reply back into
/// [`BreakpointManager::commit`].
#[derive(Debug, Clone)]
pub struct BreakpointPlan {
    key: String,
    pub path: String,
    slots: Vec<Slot>,
    pub remove: Vec<TargetBreakpointId>,
    pub add: Vec<BreakpointSpec>,
}

impl BreakpointPlan {
    /// Nothing has to be sent to the target.
    pub fn is_noop(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

#[derive(Debug, Default)]
struct SourceBreakpoints {
    path: String,
    armed: Vec<ArmedBreakpoint>,
}

#[derive(Debug)]
struct Deferred {
    path: String,
    requested: Vec<(i64, BreakpointSpec)>,
}

/// Per-session breakpoint bookkeeping.
///
/// Keyed by normalized source path. A request for a source replaces whatever
/// was armed for it before; breakpoints present in both keep their target id
/// and their DAP id.
#[derive(Debug)]
pub struct BreakpointManager {
    sources: BTreeMap<String, SourceBreakpoints>,
    deferred: BTreeMap<String, Deferred>,
    next_id: i64,
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self {
            sources: BTreeMap::new(),
            deferred: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair each requested breakpoint with a DAP id, reusing the id of an
    /// identical breakpoint already known for the source.
    fn assign_ids(&mut self, key: &str, requested: Vec<BreakpointSpec>) -> Vec<(i64, BreakpointSpec)> {
        let mut known: Vec<(i64, BreakpointSpec)> = match self.deferred.get(key) {
            Some(deferred) => deferred.requested.clone(),
            None => self
                .sources
                .get(key)
                .map(|source| {
                    source
                        .armed
                        .iter()
                        .map(|bp| (bp.dap_id, bp.spec.clone()))
                        .collect()
                })
                .unwrap_or_default(),
        };

        requested
            .into_iter()
            .map(|spec| {
                if let Some(pos) = known.iter().position(|(_, known)| *known == spec) {
                    let (id, _) = known.swap_remove(pos);
                    (id, spec)
                } else {
                    let id = self.next_id;
                    self.next_id += 1;
                    (id, spec)
                }
            })
            .collect()
    }

    /// Compute the diff between `requested` and what is armed for `path`.
    pub fn plan(&mut self, path: &str, requested: Vec<BreakpointSpec>) -> BreakpointPlan {
        let key = normalize_source_path(path);
        let requested = self.assign_ids(&key, requested);
        self.plan_with_ids(key, path.to_string(), requested)
    }

    fn plan_with_ids(
        &self,
        key: String,
        path: String,
        requested: Vec<(i64, BreakpointSpec)>,
    ) -> BreakpointPlan {
        let mut current: Vec<ArmedBreakpoint> = self
            .sources
            .get(&key)
            .map(|source| source.armed.clone())
            .unwrap_or_default();

        let mut slots = Vec::with_capacity(requested.len());
        let mut add = Vec::new();
        for (dap_id, spec) in requested {
            let existing = current
                .iter()
                .position(|bp| bp.spec == spec && bp.target_id.is_some());
            match existing {
                Some(pos) => {
                    let mut kept = current.swap_remove(pos);
                    kept.dap_id = dap_id;
                    slots.push(Slot::Keep(kept));
                }
                None => {
                    add.push(spec.clone());
                    slots.push(Slot::Add { dap_id, spec });
                }
            }
        }

        let remove = current.iter().filter_map(|bp| bp.target_id).collect();
        BreakpointPlan {
            key,
            path,
            slots,
            remove,
            add,
        }
    }

    /// Record the target's answer to `plan.add` and return the resulting
    /// breakpoints in request order.
    pub fn commit(
        &mut self,
        plan: BreakpointPlan,
        armed: Result<Vec<ArmedBreakpointInfo>, String>,
    ) -> Vec<Breakpoint> {
        let (mut replies, failure) = match armed {
            Ok(replies) => (replies.into_iter(), None),
            Err(message) => (Vec::new().into_iter(), Some(message)),
        };

        let armed: Vec<ArmedBreakpoint> = plan
            .slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Keep(kept) => kept,
                Slot::Add { dap_id, spec } => match replies.next() {
                    Some(reply) => ArmedBreakpoint {
                        dap_id,
                        target_id: reply.id.filter(|_| reply.verified),
                        line: reply.line,
                        message: reply.message,
                        spec,
                    },
                    None => ArmedBreakpoint {
                        dap_id,
                        target_id: None,
                        line: spec.line,
                        message: Some(
                            failure
                                .clone()
                                .unwrap_or_else(|| "target did not acknowledge breakpoint".to_string()),
                        ),
                        spec,
                    },
                },
            })
            .collect();

        let result = armed.iter().map(|bp| bp.to_dap(&plan.path)).collect();
        if armed.is_empty() {
            self.sources.remove(&plan.key);
        } else {
            self.sources.insert(
                plan.key,
                SourceBreakpoints {
                    path: plan.path,
                    armed,
                },
            );
        }
        result
    }

    /// Store a request that cannot be sent now; it replaces any earlier
    /// deferred request for the same source.
    ///
    /// Returns the breakpoints as unverified placeholders whose ids stay valid
    /// once they are armed.
    pub fn defer(&mut self, path: &str, requested: Vec<BreakpointSpec>) -> Vec<Breakpoint> {
        let key = normalize_source_path(path);
        let requested = self.assign_ids(&key, requested);
        let placeholders = requested
            .iter()
            .map(|(dap_id, spec)| Breakpoint {
                id: *dap_id,
                verified: false,
                message: Some("pending until the target stops".to_string()),
                source: Some(Source {
                    name: None,
                    path: Some(path.to_string()),
                }),
                line: spec.line,
            })
            .collect();
        self.deferred.insert(
            key,
            Deferred {
                path: path.to_string(),
                requested,
            },
        );
        placeholders
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Turn every deferred request into a plan, emptying the deferred set.
    pub fn take_deferred(&mut self) -> Vec<BreakpointPlan> {
        let deferred = std::mem::take(&mut self.deferred);
        deferred
            .into_iter()
            .map(|(key, deferred)| self.plan_with_ids(key, deferred.path, deferred.requested))
            .collect()
    }

    /// Breakpoints currently recorded for `path`, in request order.
    #[cfg(test)]
    pub fn armed(&self, path: &str) -> &[ArmedBreakpoint] {
        self.sources
            .get(&normalize_source_path(path))
            .map(|source| source.armed.as_slice())
            .unwrap_or(&[])
    }

    /// Path spelling the client last used for a source.
    pub fn client_path(&self, path: &str) -> Option<&str> {
        self.sources
            .get(&normalize_source_path(path))
            .map(|source| source.path.as_str())
    }
}
