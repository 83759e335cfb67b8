//! This module contains the storage that records the results of
//! non-deterministic calls during one concrete invocation.
//!
//! A fresh [`NdResultStorage`] is acquired at the start of every invocation in
//! the sandbox and consumed into an [`NdReplayLog`] at its end, so no record
//! ever leaks between invocations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::program::types::{ConcreteValue, InstructionId};

/// Identifies a non-deterministic object by where it was constructed: the
/// `ordinal`-th instance allocated at `site`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct InstanceKey {
    pub site:    InstructionId,
    pub ordinal: u32,
}

/// Whose non-deterministic call a record belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum NdTarget {
    /// An instance call on a registered object.
    Instance(InstanceKey),

    /// A call to a registered static method.
    Static,

    /// An instance call on an object whose construction was not observed.
    Unregistered,
}

/// The value produced by the `occurrence`-th call to `signature` on `target`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct NdRecord {
    pub target:     NdTarget,
    pub signature:  String,
    pub occurrence: u32,
    pub value:      ConcreteValue,
}

/// The complete record of the non-deterministic values one invocation saw.
///
/// It is what the sandbox reports back, and what a replaying invocation feeds
/// to the program instead of fresh draws.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NdReplayLog {
    pub records: Vec<NdRecord>,
}

impl NdReplayLog {
    /// Looks up the value produced by the `occurrence`-th call to `signature`
    /// on `target`.
    #[must_use]
    pub fn lookup(&self, target: NdTarget, signature: &str, occurrence: u32) -> Option<&ConcreteValue> {
        self.records
            .iter()
            .find(|r| r.target == target && r.signature == signature && r.occurrence == occurrence)
            .map(|r| &r.value)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// The identity of an object in the sandbox's concrete heap.
pub type ObjectId = usize;

/// A call that has been entered but whose result is not recorded yet.
#[derive(Clone, Debug, Eq, PartialEq)]
struct PendingCall {
    receiver: Option<ObjectId>,
    args:     Vec<ConcreteValue>,
}

/// A single recorded call, before keys are assigned.
#[derive(Clone, Debug, Eq, PartialEq)]
struct NdCall {
    signature: String,
    value:     ConcreteValue,
}

/// Records the results of non-deterministic calls for one invocation.
#[derive(Debug, Default)]
pub struct NdResultStorage {
    instance_calls: HashMap<ObjectId, Vec<NdCall>>,
    instance_order: Vec<ObjectId>,
    static_calls:   Vec<NdCall>,
    registrations:  HashMap<ObjectId, InstanceKey>,
    site_counts:    HashMap<InstructionId, u32>,
    call_counts:    HashMap<(NdTarget, String), u32>,
    pending:        Vec<PendingCall>,
}

impl NdResultStorage {
    /// Acquires fresh storage for a new invocation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `object` as the next non-deterministic instance constructed
    /// at `site`, returning its key.
    pub fn register_instance(&mut self, site: InstructionId, object: ObjectId) -> InstanceKey {
        let ordinal = self.site_counts.entry(site).or_insert(0);
        let key = InstanceKey {
            site,
            ordinal: *ordinal,
        };
        *ordinal += 1;
        self.registrations.insert(object, key);
        key
    }

    /// Gets the target that calls on `receiver` are recorded against.
    #[must_use]
    pub fn target_of(&self, receiver: Option<ObjectId>) -> NdTarget {
        match receiver {
            None => NdTarget::Static,
            Some(object) => self
                .registrations
                .get(&object)
                .copied()
                .map_or(NdTarget::Unregistered, NdTarget::Instance),
        }
    }

    /// Gets the occurrence index the next call to `signature` on `target`
    /// will be recorded with.
    #[must_use]
    pub fn next_occurrence(&self, target: NdTarget, signature: &str) -> u32 {
        self.call_counts
            .get(&(target, signature.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Pushes the receiver and arguments of a call that is about to happen.
    pub fn enter(&mut self, receiver: Option<ObjectId>, args: Vec<ConcreteValue>) {
        self.pending.push(PendingCall { receiver, args });
    }

    /// Gets the arguments of the innermost entered call.
    #[must_use]
    pub fn pending_args(&self) -> Option<&[ConcreteValue]> {
        self.pending.last().map(|p| p.args.as_slice())
    }

    /// Records `value` as the result of the innermost entered call to
    /// `signature`.
    ///
    /// A record without a matching entry is kept as a static call.
    pub fn record(&mut self, signature: &str, is_static: bool, value: ConcreteValue) {
        let receiver = self.pending.pop().and_then(|p| p.receiver);
        let receiver = if is_static { None } else { receiver };
        let target = self.target_of(receiver);
        *self
            .call_counts
            .entry((target, signature.to_string()))
            .or_insert(0) += 1;

        let call = NdCall {
            signature: signature.to_string(),
            value,
        };
        match receiver {
            None => self.static_calls.push(call),
            Some(object) => {
                if !self.instance_calls.contains_key(&object) {
                    self.instance_order.push(object);
                }
                self.instance_calls.entry(object).or_default().push(call);
            }
        }
    }

    /// Consumes the storage, producing the log keyed by instance identity.
    #[must_use]
    pub fn into_log(mut self) -> NdReplayLog {
        let mut records = Vec::new();
        let mut occurrences: HashMap<(NdTarget, String), u32> = HashMap::new();
        let mut push = |target: NdTarget, call: NdCall| {
            let occurrence = occurrences.entry((target, call.signature.clone())).or_insert(0);
            records.push(NdRecord {
                target,
                signature: call.signature,
                occurrence: *occurrence,
                value: call.value,
            });
            *occurrence += 1;
        };

        for object in std::mem::take(&mut self.instance_order) {
            let target = self.target_of(Some(object));
            for call in self.instance_calls.remove(&object).unwrap_or_default() {
                push(target, call);
            }
        }
        for call in self.static_calls {
            push(NdTarget::Static, call);
        }

        NdReplayLog { records }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        instrumentation::storage::{InstanceKey, NdResultStorage, NdTarget},
        program::types::{ConcreteValue, InstructionId, MethodId},
    };

    const NEXT_INT: &str = "java.util.Random.nextInt()";

    #[test]
    fn instances_are_keyed_by_construction_site_and_ordinal() {
        let site = InstructionId::new(MethodId(7), 2);
        let mut storage = NdResultStorage::new();
        let first = storage.register_instance(site, 10);
        let second = storage.register_instance(site, 11);

        assert_eq!(first, InstanceKey { site, ordinal: 0 });
        assert_eq!(second, InstanceKey { site, ordinal: 1 });
        assert_eq!(storage.target_of(Some(11)), NdTarget::Instance(second));
        assert_eq!(storage.target_of(Some(12)), NdTarget::Unregistered);
        assert_eq!(storage.target_of(None), NdTarget::Static);
    }

    #[test]
    fn log_numbers_occurrences_per_target_and_signature() {
        let site = InstructionId::new(MethodId(1), 0);
        let mut storage = NdResultStorage::new();
        let key = storage.register_instance(site, 3);

        storage.enter(Some(3), vec![]);
        storage.record(NEXT_INT, false, ConcreteValue::Int(5));
        storage.enter(Some(3), vec![]);
        assert_eq!(storage.next_occurrence(NdTarget::Instance(key), NEXT_INT), 1);
        storage.record(NEXT_INT, false, ConcreteValue::Int(-8));
        storage.enter(None, vec![]);
        storage.record("java.lang.System.currentTimeMillis()", true, ConcreteValue::Int(99));

        let log = storage.into_log();
        assert_eq!(log.len(), 3);
        assert_eq!(
            log.lookup(NdTarget::Instance(key), NEXT_INT, 1),
            Some(&ConcreteValue::Int(-8))
        );
        assert_eq!(
            log.lookup(NdTarget::Static, "java.lang.System.currentTimeMillis()", 0),
            Some(&ConcreteValue::Int(99))
        );
    }

    #[test]
    fn fresh_storage_has_no_records() {
        let mut first = NdResultStorage::new();
        first.enter(None, vec![]);
        first.record(NEXT_INT, true, ConcreteValue::Int(1));
        assert_eq!(first.into_log().len(), 1);

        let second = NdResultStorage::new();
        assert!(second.into_log().is_empty());
    }
}
