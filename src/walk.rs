/*!
Bookkeeping for concurrently running walk types. An `ActiveWalk` ties one
traversal strategy to one compute kernel (a smoothing pass), a cache
policy and its own progress state, so a force walk and a density walk can
run over the same particle set without sharing progress. The registry is a
lookup record maintained by the orchestrator; it owns none of its
referents' lifetimes and refers to the pass by slot.
*/

/// Identifies one registered walk. Slots are reused after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalkId(u32);

/// Handle into the orchestrator's pass table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSlot(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalKind {
    /// Gather within the active particle's own ball.
    BallGather,
    /// Inverse query: find particles whose ball contains the active one.
    InverseBall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Fetch remote particles into snapshots on demand.
    ReadThrough,
    /// Restrict the walk to locally owned particles.
    LocalOnly,
}

/// Mutable per-walk progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkState {
    /// Remote fetches issued but not yet answered; the walk resumes when
    /// this drains to zero.
    pub outstanding_requests: u32,
    /// Index of the next unprocessed active particle.
    pub next_particle: usize,
    pub finished: bool,
}

impl WalkState {
    pub fn fresh() -> WalkState {
        WalkState {
            outstanding_requests: 0,
            next_particle: 0,
            finished: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWalk {
    pub traversal: TraversalKind,
    pub pass: PassSlot,
    pub policy: CachePolicy,
    pub state: WalkState,
}

/// Slot-reusing table of in-flight walks.
#[derive(Debug, Default)]
pub struct WalkRegistry {
    walks: Vec<Option<ActiveWalk>>,
}

impl WalkRegistry {
    pub fn new() -> WalkRegistry {
        WalkRegistry { walks: Vec::new() }
    }

    pub fn register(&mut self, traversal: TraversalKind, pass: PassSlot, policy: CachePolicy) -> WalkId {
        let walk = ActiveWalk {
            traversal,
            pass,
            policy,
            state: WalkState::fresh(),
        };
        for (i, slot) in self.walks.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(walk);
                return WalkId(i as u32);
            }
        }
        self.walks.push(Some(walk));
        WalkId((self.walks.len() - 1) as u32)
    }

    pub fn get(&self, id: WalkId) -> Option<&ActiveWalk> {
        self.walks.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: WalkId) -> Option<&mut ActiveWalk> {
        self.walks.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn remove(&mut self, id: WalkId) -> Option<ActiveWalk> {
        self.walks.get_mut(id.0 as usize)?.take()
    }

    pub fn len(&self) -> usize {
        self.walks.iter().filter(|w| w.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[test]
fn walks_progress_independently() {
    let mut reg = WalkRegistry::new();
    let force = reg.register(TraversalKind::BallGather, PassSlot(0), CachePolicy::ReadThrough);
    let density = reg.register(TraversalKind::BallGather, PassSlot(1), CachePolicy::ReadThrough);

    reg.get_mut(force).unwrap().state.next_particle = 40;
    reg.get_mut(force).unwrap().state.outstanding_requests = 2;

    assert_eq!(reg.get(density).unwrap().state, WalkState::fresh());
    assert_eq!(reg.get(force).unwrap().state.next_particle, 40);
    assert_eq!(reg.len(), 2);
}

#[test]
fn removed_slots_are_reused() {
    let mut reg = WalkRegistry::new();
    let a = reg.register(TraversalKind::BallGather, PassSlot(0), CachePolicy::ReadThrough);
    let _b = reg.register(TraversalKind::InverseBall, PassSlot(1), CachePolicy::LocalOnly);

    let removed = reg.remove(a).unwrap();
    assert_eq!(removed.pass, PassSlot(0));
    assert!(reg.get(a).is_none());

    let c = reg.register(TraversalKind::BallGather, PassSlot(2), CachePolicy::ReadThrough);
    assert_eq!(a, c); // slot reused
    assert_eq!(reg.get(c).unwrap().pass, PassSlot(2));
    assert_eq!(reg.len(), 2);
}
