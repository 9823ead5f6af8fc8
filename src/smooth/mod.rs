/*!
The smoothing-pass contract: the six-hook lifecycle every pass implements,
plus the neighbor-list entry type handed to `evaluate`.

Lifecycle per active particle: selection (`is_active`), per-tree-build init
(`prepare_for_traversal`), per-smooth init (`prepare_for_smoothing`),
kernel evaluation (`evaluate`), merge of remote contributions (`combine`,
any number of times, any order), then `finalize`.
*/

pub mod deleted;
pub mod density;
pub mod envelope;
pub mod mark;
pub mod pressure;

use crate::{
    floating_type_mod::FT,
    particle::{CacheAccumulators, ExternalParticleView, ParticleRecord, ParticleType},
    V3,
};
use enum_dispatch::enum_dispatch;
use thiserror::Error;

pub use deleted::DeletedGasRedistribution;
pub use density::{DensityDerivatives, NeighborDensityDerivatives};
pub use mark::MarkNeighbor;
pub use pressure::PressureForce;

/// Errors raised when validating a pass configuration. A pass refuses to
/// build rather than failing mid-traversal.
#[derive(Debug, Error, PartialEq)]
pub enum PassConfigError {
    #[error("particle type filter selects no particle type")]
    EmptyTypeFilter,
    #[error("{name} must be non-negative, got {value}")]
    NegativeCoefficient { name: &'static str, value: f64 },
    #[error("scale factor must be positive, got {0}")]
    NonPositiveScaleFactor(f64),
}

/// Base selection shared by all passes: which particle types a pass
/// operates on and the rung threshold that defines "active".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSelection {
    pub types: ParticleType,
    pub active_rung: i32,
}

impl PassSelection {
    pub fn new(types: ParticleType, active_rung: i32) -> Result<PassSelection, PassConfigError> {
        if types.is_empty() {
            return Err(PassConfigError::EmptyTypeFilter);
        }
        Ok(PassSelection { types, active_rung })
    }

    pub fn type_matches(&self, p: &ParticleRecord) -> bool {
        p.ptype.test(self.types)
    }

    pub fn rung_active(&self, p: &ParticleRecord) -> bool {
        self.rung_is_active(p.rung)
    }

    pub fn rung_is_active(&self, rung: i32) -> bool {
        rung >= self.active_rung
    }
}

/// A resolved neighbor: either a particle owned by the local partition or a
/// cached snapshot of a remote one. Reads are uniform across the two;
/// scatter writes apply directly to local particles and accumulate on
/// cached views for a later `combine` on the owner.
pub enum NeighborParticle<'a> {
    Local(&'a mut ParticleRecord),
    Cached(&'a mut ExternalParticleView),
}

impl NeighborParticle<'_> {
    pub fn mass(&self) -> FT {
        match self {
            NeighborParticle::Local(p) => p.mass,
            NeighborParticle::Cached(v) => v.mass,
        }
    }

    pub fn position(&self) -> V3 {
        match self {
            NeighborParticle::Local(p) => p.position,
            NeighborParticle::Cached(v) => v.position,
        }
    }

    pub fn velocity(&self) -> V3 {
        match self {
            NeighborParticle::Local(p) => p.velocity,
            NeighborParticle::Cached(v) => v.velocity,
        }
    }

    pub fn density(&self) -> FT {
        match self {
            NeighborParticle::Local(p) => p.density,
            NeighborParticle::Cached(v) => v.density,
        }
    }

    pub fn ball(&self) -> FT {
        match self {
            NeighborParticle::Local(p) => p.ball,
            NeighborParticle::Cached(v) => v.ball,
        }
    }

    pub fn rung(&self) -> i32 {
        match self {
            NeighborParticle::Local(p) => p.rung,
            NeighborParticle::Cached(v) => v.rung,
        }
    }

    pub fn u(&self) -> FT {
        match self {
            NeighborParticle::Local(p) => p.u,
            NeighborParticle::Cached(v) => v.u,
        }
    }

    pub fn metals(&self) -> FT {
        match self {
            NeighborParticle::Local(p) => p.metals,
            NeighborParticle::Cached(v) => v.metals,
        }
    }

    pub fn diff_coeff(&self) -> FT {
        match self {
            NeighborParticle::Local(p) => p.hydro.diff_coeff,
            NeighborParticle::Cached(v) => v.diff_coeff,
        }
    }

    pub fn ptype(&self) -> ParticleType {
        match self {
            NeighborParticle::Local(p) => p.ptype,
            NeighborParticle::Cached(v) => v.ptype,
        }
    }

    pub fn is_gas(&self) -> bool {
        self.ptype().test(ParticleType::GAS)
    }

    pub fn is_deleted(&self) -> bool {
        self.ptype().test(ParticleType::DELETED)
    }

    /// Inverse-neighbor marking. Idempotent on both sides.
    pub fn mark_neighbor_of_active(&mut self) {
        match self {
            NeighborParticle::Local(p) => p.ptype.set(ParticleType::NBR_OF_ACTIVE),
            NeighborParticle::Cached(v) => v.accum.marked = true,
        }
    }

    pub fn add_acceleration(&mut self, da: V3) {
        match self {
            NeighborParticle::Local(p) => p.hydro.acceleration += da,
            NeighborParticle::Cached(v) => v.accum.acceleration += da,
        }
    }

    pub fn add_pdv(&mut self, dpdv: FT) {
        match self {
            NeighborParticle::Local(p) => p.hydro.pdv += dpdv,
            NeighborParticle::Cached(v) => v.accum.pdv += dpdv,
        }
    }

    pub fn add_diffusion(&mut self, du: FT, dz: FT) {
        match self {
            NeighborParticle::Local(p) => {
                p.hydro.u_dot_diff += du;
                p.hydro.metals_dot += dz;
            }
            NeighborParticle::Cached(v) => {
                v.accum.u_dot_diff += du;
                v.accum.metals_dot += dz;
            }
        }
    }

    pub fn raise_mu_max(&mut self, mu: FT) {
        match self {
            NeighborParticle::Local(p) => p.hydro.mu_max = FT::max(p.hydro.mu_max, mu),
            NeighborParticle::Cached(v) => v.accum.mu_max = FT::max(v.accum.mu_max, mu),
        }
    }

    /// Deposit from a deleted particle: mass `dm` with its share of
    /// momentum, thermal energy and metal mass.
    pub fn receive_deleted(&mut self, dm: FT, d_momentum: V3, d_thermal: FT, d_metal_mass: FT) {
        match self {
            NeighborParticle::Local(p) => apply_deletion_deposit(p, dm, d_momentum, d_thermal, d_metal_mass),
            NeighborParticle::Cached(v) => {
                v.accum.d_mass += dm;
                v.accum.d_momentum += d_momentum;
                v.accum.d_thermal += d_thermal;
                v.accum.d_metal_mass += d_metal_mass;
            }
        }
    }
}

/// Mass-weighted application of a deletion deposit. Commutative over any
/// split of the same totals, so repeated `combine` calls in any delivery
/// order end in the same state.
pub fn apply_deletion_deposit(p: &mut ParticleRecord, dm: FT, d_momentum: V3, d_thermal: FT, d_metal_mass: FT) {
    let m_new = p.mass + dm;
    p.velocity = (p.velocity * p.mass + d_momentum) / m_new;
    p.u = (p.u * p.mass + d_thermal) / m_new;
    p.metals = (p.metals * p.mass + d_metal_mass) / m_new;
    p.mass = m_new;
}

/// One entry of the neighbor list handed to `evaluate`: ascending-distance
/// order, capped length, local and cached entries mixed.
pub struct NeighborEntry<'a> {
    pub dist: FT,
    pub particle: NeighborParticle<'a>,
}

#[enum_dispatch]
pub trait SmoothPass {
    /// Base type filter and rung threshold, also the leading fields of the
    /// transfer envelope.
    fn selection(&self) -> &PassSelection;

    /// Pure selection predicate over the particle's persisted state.
    fn is_active(&self, p: &ParticleRecord) -> bool;

    /// One-time hook per tree build.
    fn prepare_for_traversal(&self, _p: &mut ParticleRecord) {}

    /// Invoked before this particle's neighbor search begins. Must zero
    /// every accumulator `evaluate` writes.
    fn prepare_for_smoothing(&self, _p: &mut ParticleRecord) {}

    /// Snapshot shipped when this particle is first read by a remote
    /// partition. The default zeroes the scatter accumulators.
    fn prepare_cache_entry(&self, p: &ParticleRecord) -> ExternalParticleView {
        ExternalParticleView::snapshot(p)
    }

    /// The kernel. Called exactly once per active particle once its
    /// neighbor set is fully resolved.
    fn evaluate(&self, _p: &mut ParticleRecord, _neighbors: &mut [NeighborEntry]) {}

    /// Merge one remote contribution. Must be order-independent over any
    /// fixed set of contributions.
    fn combine(&self, _p: &mut ParticleRecord, _remote: &CacheAccumulators) {}

    /// Post-processing after all contributions are merged.
    fn finalize(&self, _p: &mut ParticleRecord) {}

    /// Whether this pass participates in the max-ball smoothing-length
    /// growth heuristic. Deletion must not, so a doomed particle's radius
    /// cannot influence dynamic ball growth elsewhere.
    fn grows_ball_max(&self) -> bool {
        true
    }

    /// True for the inverse-neighbor marking pass: the traversal sets the
    /// flag on discovered inverse neighbors and `evaluate` stays absent.
    fn marks_inverse_neighbors(&self) -> bool {
        false
    }
}

/// The concrete passes, dispatched over the fixed six-hook contract.
#[enum_dispatch(SmoothPass)]
#[derive(Debug, Clone, PartialEq)]
pub enum SmoothPassKind {
    DensityDerivatives(DensityDerivatives),
    NeighborDensityDerivatives(NeighborDensityDerivatives),
    MarkNeighbor(MarkNeighbor),
    PressureForce(PressureForce),
    DeletedGasRedistribution(DeletedGasRedistribution),
}

#[test]
fn selection_rejects_empty_type_filter() {
    assert_eq!(
        PassSelection::new(ParticleType::none(), 0),
        Err(PassConfigError::EmptyTypeFilter)
    );
    assert!(PassSelection::new(ParticleType::GAS | ParticleType::STAR, 3).is_ok());
}

#[test]
fn neighbor_reads_agree_between_local_and_cached() {
    use crate::vec3f;

    let mut p = ParticleRecord::new(1, 0, ParticleType::GAS, 2.5, 0.1, vec3f(1., 2., 3.));
    p.velocity = vec3f(0.1, 0.2, 0.3);
    p.density = 0.7;
    p.ball = 1.5;
    p.u = 4.0;
    p.metals = 0.02;
    p.hydro.diff_coeff = 0.3;

    let mut view = ExternalParticleView::snapshot(&p);
    let mut copy = p.clone();

    let local = NeighborParticle::Local(&mut copy);
    let cached = NeighborParticle::Cached(&mut view);

    assert_eq!(local.mass(), cached.mass());
    assert_eq!(local.position(), cached.position());
    assert_eq!(local.velocity(), cached.velocity());
    assert_eq!(local.density(), cached.density());
    assert_eq!(local.ball(), cached.ball());
    assert_eq!(local.rung(), cached.rung());
    assert_eq!(local.u(), cached.u());
    assert_eq!(local.metals(), cached.metals());
    assert_eq!(local.diff_coeff(), cached.diff_coeff());
    assert_eq!(local.ptype(), cached.ptype());
}

#[test]
fn deletion_deposit_is_commutative() {
    use crate::vec3f;

    let mut p1 = ParticleRecord::new(1, 0, ParticleType::GAS, 2.0, 0.1, vec3f(0., 0., 0.));
    p1.velocity = vec3f(1., 0., 0.);
    p1.u = 10.;
    p1.metals = 0.01;
    let mut p2 = p1.clone();

    let dep_a = (0.5, vec3f(0.2, 0.1, 0.), 3.0, 0.004);
    let dep_b = (0.25, vec3f(-0.1, 0.3, 0.1), 1.5, 0.001);

    apply_deletion_deposit(&mut p1, dep_a.0, dep_a.1, dep_a.2, dep_a.3);
    apply_deletion_deposit(&mut p1, dep_b.0, dep_b.1, dep_b.2, dep_b.3);

    apply_deletion_deposit(&mut p2, dep_b.0, dep_b.1, dep_b.2, dep_b.3);
    apply_deletion_deposit(&mut p2, dep_a.0, dep_a.1, dep_a.2, dep_a.3);

    crate::assert_ft_approx_eq(p1.mass, p2.mass, 1e-6, || "mass".to_string());
    crate::assert_ft_approx_eq(p1.u, p2.u, 1e-5, || "u".to_string());
    crate::assert_ft_approx_eq(p1.metals, p2.metals, 1e-6, || "metals".to_string());
    crate::assert_ft_approx_eq((p1.velocity - p2.velocity).norm(), 0., 1e-6, || "velocity".to_string());
}
