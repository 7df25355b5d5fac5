//! Name gates: continuity policy over group/object names

use serde::{Deserialize, Serialize};

/// Which continuity rule a handler applies before decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NameGateKind {
    /// Next object in the same group, or the first object of a later group
    #[default]
    Sequential,
    /// Everything passes
    AllowAll,
}

/// What happens to a unit the gate rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GapPolicy {
    /// Drop the unit; the display freezes on the last good image
    #[default]
    Freeze,
    /// Decode the unit anyway, marked discontinuous
    Artifact,
}

/// Tracks the last accepted name and judges the next one.
#[derive(Debug, Clone)]
pub struct NameGate {
    kind: NameGateKind,
    last: Option<(u32, u16)>,
}

impl NameGate {
    pub fn new(kind: NameGateKind) -> Self {
        Self { kind, last: None }
    }

    /// Last accepted `(group, object)`
    pub fn last(&self) -> Option<(u32, u16)> {
        self.last
    }

    /// Whether `(group, object)` continues the last accepted name.
    ///
    /// Does not record anything; call [`NameGate::accept`] once the unit is passed on.
    pub fn check(&self, group: u32, object: u16) -> bool {
        match self.kind {
            NameGateKind::AllowAll => true,
            NameGateKind::Sequential => match self.last {
                None => true,
                Some((last_group, last_object)) => {
                    if group == last_group {
                        last_object.checked_add(1) == Some(object)
                    } else {
                        // A later group is independently decodable from its first object
                        group > last_group && object == 0
                    }
                }
            },
        }
    }

    /// Record `(group, object)` as the last name passed to the decoder
    pub fn accept(&mut self, group: u32, object: u16) {
        self.last = Some((group, object));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_accepts_contiguous_names() {
        let mut gate = NameGate::new(NameGateKind::Sequential);
        assert!(gate.check(4, 2), "first unit is always accepted");
        gate.accept(4, 2);

        assert!(gate.check(4, 3));
        assert!(gate.check(5, 0));
        assert!(gate.check(9, 0), "new group start is decodable");
    }

    #[test]
    fn sequential_rejects_gaps_and_rewinds() {
        let mut gate = NameGate::new(NameGateKind::Sequential);
        gate.accept(4, 2);

        assert!(!gate.check(4, 4), "object gap");
        assert!(!gate.check(4, 2), "repeat");
        assert!(!gate.check(5, 1), "mid-group join");
        assert!(!gate.check(3, 0), "older group");
    }

    #[test]
    fn sequential_handles_object_overflow() {
        let mut gate = NameGate::new(NameGateKind::Sequential);
        gate.accept(1, u16::MAX);
        assert!(!gate.check(1, 0));
        assert!(gate.check(2, 0));
    }

    #[test]
    fn allow_all_accepts_everything() {
        let mut gate = NameGate::new(NameGateKind::AllowAll);
        gate.accept(10, 10);
        assert!(gate.check(0, 0));
        assert!(gate.check(10, 10));
        assert!(gate.check(11, 5));
    }
}
