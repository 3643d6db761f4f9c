use crate::expr::Expr;
use crate::logic::Logical;
use serde::{Deserialize, Serialize};

/// Index of a named leaf slot in a [`Registry`].
///
/// Expression trees never own named leaves; they hold one of these indices.
/// Two trees mentioning the same declared name therefore alias the same
/// slot, and `set_value` on that slot is visible to every holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub usize);

/// Index of an auxiliary definition in a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuxId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    Variable,
    Parameter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    pub kind: SlotKind,
    pub value: f64,
}

/// Body of a named auxiliary: a scalar expression, or (rarely) a logical
/// one. Logical auxiliaries are neither differentiable nor expandable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuxBody {
    Scalar(Expr),
    Truth(Logical),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxDef {
    pub name: String,
    pub body: AuxBody,
}

/// Arena owning every named leaf of one compiled program.
///
/// The registry is the only mutable piece of a model: `set_value` updates a
/// slot in place, which is how state vectors and parameter assignments reach
/// the shared leaves of every tree that mentions them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    slots: Vec<Slot>,
    auxiliaries: Vec<AuxDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_variable(&mut self, name: impl Into<String>, value: f64) -> SlotId {
        self.intern(name.into(), SlotKind::Variable, value)
    }

    pub fn intern_parameter(&mut self, name: impl Into<String>, value: f64) -> SlotId {
        self.intern(name.into(), SlotKind::Parameter, value)
    }

    fn intern(&mut self, name: String, kind: SlotKind, value: f64) -> SlotId {
        self.slots.push(Slot { name, kind, value });
        SlotId(self.slots.len() - 1)
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id.0]
    }

    pub fn name(&self, id: SlotId) -> &str {
        &self.slots[id.0].name
    }

    pub fn kind(&self, id: SlotId) -> SlotKind {
        self.slots[id.0].kind
    }

    pub fn value(&self, id: SlotId) -> f64 {
        self.slots[id.0].value
    }

    pub fn set_value(&mut self, id: SlotId, value: f64) {
        self.slots[id.0].value = value;
    }

    /// Looks a name up over every slot in the arena, most recent first so
    /// that temporarily interned names (user-function formals) shadow older
    /// ones of the same spelling.
    pub fn lookup(&self, name: &str) -> Option<SlotId> {
        self.slots
            .iter()
            .rposition(|slot| slot.name == name)
            .map(SlotId)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn define_auxiliary(&mut self, name: impl Into<String>, body: AuxBody) -> AuxId {
        self.auxiliaries.push(AuxDef {
            name: name.into(),
            body,
        });
        AuxId(self.auxiliaries.len() - 1)
    }

    pub fn auxiliary(&self, id: AuxId) -> &AuxDef {
        &self.auxiliaries[id.0]
    }

    pub fn auxiliary_count(&self) -> usize {
        self.auxiliaries.len()
    }

    pub fn auxiliaries(&self) -> &[AuxDef] {
        &self.auxiliaries
    }

    pub fn set_auxiliary_body(&mut self, id: AuxId, body: AuxBody) {
        self.auxiliaries[id.0].body = body;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interned_slots_share_values_through_the_registry() {
        let mut registry = Registry::new();
        let x = registry.intern_variable("x", 2.3);
        assert_eq!(registry.name(x), "x");
        assert_eq!(registry.kind(x), SlotKind::Variable);
        assert_eq!(registry.value(x), 2.3);

        registry.set_value(x, -1.0);
        assert_eq!(registry.value(x), -1.0);
    }

    #[test]
    fn lookup_prefers_the_most_recent_slot() {
        let mut registry = Registry::new();
        let first = registry.intern_variable("x", 0.0);
        let shadow = registry.intern_variable("x", 1.0);
        assert_ne!(first, shadow);
        assert_eq!(registry.lookup("x"), Some(shadow));
        assert_eq!(registry.lookup("y"), None);
    }
}
