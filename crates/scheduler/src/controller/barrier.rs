//! PhaseBarrier - Feuert genau einmal, wenn alle Nodes eine Phase erreicht haben

use crate::state::{ClusterState, NodeState};

/// Einmalige Barriere über die Phasen aller nicht-fatalen Nodes.
#[derive(Debug, Clone)]
pub struct PhaseBarrier {
    target: NodeState,
    fired: bool,
}

impl PhaseBarrier {
    pub fn new(target: NodeState) -> Self {
        Self { target, fired: false }
    }

    /// Barriere, die bereits gefeuert hat (z.B. nach einem Neustart).
    pub fn already_fired(target: NodeState) -> Self {
        Self { target, fired: true }
    }

    pub fn target(&self) -> NodeState {
        self.target
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Gibt genau einmal true zurück: wenn alle nicht-fatalen Nodes (mindestens
    /// einer) genau auf der Ziel-Phase stehen.
    pub fn check(&mut self, snapshot: &ClusterState) -> bool {
        if self.fired || !snapshot.all_exactly(self.target) {
            return false;
        }
        self.fired = true;
        true
    }
}
