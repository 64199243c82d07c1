use std::collections::HashMap;

/// Membership delta observed on the presence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined(String),
    Left(String),
}

/// Reference-counted online membership.
///
/// The membership snapshot and the join/leave feed are independent and may be
/// observed in any order, so a plain set cannot be trusted: a leave may
/// arrive before its matching join. A signed counter per id makes the final
/// state independent of the interleaving: the count goes transiently
/// negative and settles once both halves of the pair have been processed.
#[derive(Debug, Default)]
pub struct Presence {
    refcount: HashMap<String, i64>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits every id of a point-in-time membership snapshot.
    pub fn seed(&mut self, members: impl IntoIterator<Item = String>) {
        for id in members {
            *self.refcount.entry(id).or_default() += 1;
        }
    }

    pub fn apply(&mut self, event: PresenceEvent) {
        let (id, delta) = match event {
            PresenceEvent::Joined(id) => (id, 1),
            PresenceEvent::Left(id) => (id, -1),
        };
        let count = self.refcount.entry(id.clone()).or_default();
        *count += delta;
        // settled pairs can be dropped, negative counts must stay
        if *count == 0 {
            self.refcount.remove(&id);
        }
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.refcount.get(id).copied().unwrap_or(0) > 0
    }

    pub fn online(&self) -> impl Iterator<Item = &str> {
        self.refcount
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| id.as_str())
    }
}
