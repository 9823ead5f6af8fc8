use crate::{floating_type_mod::FT, V3};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Space-filling-curve key. Gives the total order used for sorting and
/// bucketing; recomputed only when a position change triggers a rebalance.
pub type ParticleKey = u64;

/// Input order of the particle at initial load. Never changes afterwards.
pub type OrderId = u64;

/// Non-exclusive particle type flags. Bits are set and tested with bitwise
/// operations and are never implicitly cleared during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParticleType(u32);

impl ParticleType {
    pub const GAS: ParticleType = ParticleType(1 << 0);
    pub const DARK: ParticleType = ParticleType(1 << 1);
    pub const STAR: ParticleType = ParticleType(1 << 2);
    pub const PHOTOGENIC: ParticleType = ParticleType(1 << 3);
    /// Inactive particle inside the ball of an active one.
    pub const NBR_OF_ACTIVE: ParticleType = ParticleType(1 << 4);
    /// Marked for removal; consumed by the deleted-gas redistribution pass.
    pub const DELETED: ParticleType = ParticleType(1 << 5);

    pub fn none() -> ParticleType {
        ParticleType(0)
    }

    pub fn from_bits(bits: u32) -> ParticleType {
        ParticleType(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if any of the bits in `mask` is set. Never mutates.
    pub fn test(self, mask: ParticleType) -> bool {
        self.0 & mask.0 != 0
    }

    /// Setting an already-set bit is a no-op.
    pub fn set(&mut self, mask: ParticleType) {
        self.0 |= mask.0;
    }

    pub fn unset(&mut self, mask: ParticleType) {
        self.0 &= !mask.0;
    }
}

impl std::ops::BitOr for ParticleType {
    type Output = ParticleType;
    fn bitor(self, rhs: ParticleType) -> ParticleType {
        ParticleType(self.0 | rhs.0)
    }
}

/// Pass-local scratch accumulators. Every field a pass evaluation writes is
/// zeroed by that pass's `prepare_for_smoothing`, so a cancelled-and-retried
/// particle never carries stale state.
#[derive(Debug, Clone, PartialEq)]
pub struct HydroScratch {
    /// Velocity divergence. Raw kernel sum until `finalize` normalizes it.
    pub div_v: FT,
    /// Velocity curl, same convention as `div_v`.
    pub curl_v: V3,
    /// Per-particle diffusion coefficient derived from the local shear.
    pub diff_coeff: FT,
    /// Largest viscous mu seen in the pressure pass (timestep control).
    pub mu_max: FT,
    /// PdV + viscous heating rate.
    pub pdv: FT,
    /// Thermal diffusion rate du/dt.
    pub u_dot_diff: FT,
    /// Metal diffusion rate dZ/dt.
    pub metals_dot: FT,
    /// Hydro acceleration of the current pressure sweep. Kept apart from the
    /// gravity acceleration so the sweep can be retried from scratch.
    pub acceleration: V3,
}

impl HydroScratch {
    pub fn zeroed() -> HydroScratch {
        HydroScratch {
            div_v: 0.,
            curl_v: V3::zeros(),
            diff_coeff: 0.,
            mu_max: 0.,
            pdv: 0.,
            u_dot_diff: 0.,
            metals_dot: 0.,
            acceleration: V3::zeros(),
        }
    }
}

/// Authoritative particle, owned by exactly one partition.
#[derive(Debug, Clone)]
pub struct ParticleRecord {
    pub key: ParticleKey,
    pub mass: FT,
    pub soft: FT,
    pub position: V3,
    pub velocity: V3,
    /// Acceleration accumulated by the gravity walk.
    pub tree_acceleration: V3,
    pub potential: FT,
    /// Current timestep rung; greater means a smaller timestep.
    pub rung: i32,
    /// Smoothing ball: the neighbor search radius (twice the smoothing length).
    pub ball: FT,
    /// Kernel-estimated density from the last density pass.
    pub density: FT,
    /// Specific internal energy (gas only).
    pub u: FT,
    /// Metal mass fraction (gas only).
    pub metals: FT,
    pub ptype: ParticleType,
    pub hydro: HydroScratch,
    order: OrderId,
}

impl ParticleRecord {
    pub fn new(key: ParticleKey, order: OrderId, ptype: ParticleType, mass: FT, soft: FT, position: V3) -> ParticleRecord {
        ParticleRecord {
            key,
            mass,
            soft,
            position,
            velocity: V3::zeros(),
            tree_acceleration: V3::zeros(),
            potential: 0.,
            rung: 0,
            ball: 0.,
            density: 0.,
            u: 0.,
            metals: 0.,
            ptype,
            hydro: HydroScratch::zeroed(),
            order,
        }
    }

    pub fn order(&self) -> OrderId {
        self.order
    }

    pub fn is_gas(&self) -> bool {
        self.ptype.test(ParticleType::GAS)
    }

    pub fn is_deleted(&self) -> bool {
        self.ptype.test(ParticleType::DELETED)
    }

    /// Smoothing length of the kernel, half the search ball.
    pub fn smoothing_length(&self) -> FT {
        0.5 * self.ball
    }
}

impl PartialEq for ParticleRecord {
    fn eq(&self, other: &ParticleRecord) -> bool {
        self.key == other.key
    }
}
impl Eq for ParticleRecord {}

impl PartialOrd for ParticleRecord {
    fn partial_cmp(&self, other: &ParticleRecord) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParticleRecord {
    fn cmp(&self, other: &ParticleRecord) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Scatter contributions collected on a remote partition, merged back into
/// the owner through a pass's `combine`. All numeric fields are additive
/// under merge; `marked` merges with logical or.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheAccumulators {
    pub density: FT,
    pub div_v: FT,
    pub curl_v: V3,
    pub mu_max: FT,
    pub acceleration: V3,
    pub pdv: FT,
    pub u_dot_diff: FT,
    pub metals_dot: FT,
    /// Mass deposited by deleted-gas redistribution.
    pub d_mass: FT,
    /// Momentum carried with `d_mass`.
    pub d_momentum: V3,
    /// Thermal energy carried with `d_mass` (mass times specific energy).
    pub d_thermal: FT,
    /// Metal mass carried with `d_mass`.
    pub d_metal_mass: FT,
    pub marked: bool,
}

impl CacheAccumulators {
    pub fn zeroed() -> CacheAccumulators {
        CacheAccumulators {
            density: 0.,
            div_v: 0.,
            curl_v: V3::zeros(),
            mu_max: 0.,
            acceleration: V3::zeros(),
            pdv: 0.,
            u_dot_diff: 0.,
            metals_dot: 0.,
            d_mass: 0.,
            d_momentum: V3::zeros(),
            d_thermal: 0.,
            d_metal_mass: 0.,
            marked: false,
        }
    }
}

/// Read-only projection of a `ParticleRecord` shipped to a remote partition
/// for neighbor queries. Carries exactly the fields a kernel evaluation
/// reads, plus the scatter accumulators that flow back through `combine`.
/// A view is a snapshot; the source particle never observes it except
/// through an explicit merge.
#[derive(Debug, Clone)]
pub struct ExternalParticleView {
    pub mass: FT,
    pub soft: FT,
    pub position: V3,
    pub velocity: V3,
    pub density: FT,
    pub ball: FT,
    pub rung: i32,
    pub u: FT,
    pub metals: FT,
    pub diff_coeff: FT,
    pub ptype: ParticleType,
    pub accum: CacheAccumulators,
}

impl ExternalParticleView {
    pub fn snapshot(p: &ParticleRecord) -> ExternalParticleView {
        ExternalParticleView {
            mass: p.mass,
            soft: p.soft,
            position: p.position,
            velocity: p.velocity,
            density: p.density,
            ball: p.ball,
            rung: p.rung,
            u: p.u,
            metals: p.metals,
            diff_coeff: p.hydro.diff_coeff,
            ptype: p.ptype,
            accum: CacheAccumulators::zeroed(),
        }
    }
}

#[test]
fn type_bits_set_and_test() {
    let mut t = ParticleType::GAS;
    assert!(t.test(ParticleType::GAS));
    assert!(!t.test(ParticleType::STAR));

    // testing never mutates
    let before = t;
    let _ = t.test(ParticleType::DELETED);
    assert_eq!(t, before);

    // setting an already-set bit is a no-op
    t.set(ParticleType::GAS);
    assert_eq!(t, before);

    t.set(ParticleType::NBR_OF_ACTIVE);
    assert!(t.test(ParticleType::GAS));
    assert!(t.test(ParticleType::NBR_OF_ACTIVE));

    t.unset(ParticleType::NBR_OF_ACTIVE);
    assert_eq!(t, before);
}

#[test]
fn records_order_by_key() {
    use crate::vec3f;

    let a = ParticleRecord::new(10, 0, ParticleType::GAS, 1., 0.1, vec3f(0., 0., 0.));
    let b = ParticleRecord::new(3, 1, ParticleType::GAS, 1., 0.1, vec3f(1., 0., 0.));
    let c = ParticleRecord::new(7, 2, ParticleType::DARK, 1., 0.1, vec3f(2., 0., 0.));

    let mut v = vec![a, b, c];
    v.sort();
    let keys: Vec<ParticleKey> = v.iter().map(|p| p.key).collect();
    assert_eq!(keys, vec![3, 7, 10]);

    // input order ids unaffected by sorting
    let orders: Vec<OrderId> = v.iter().map(|p| p.order()).collect();
    assert_eq!(orders, vec![1, 2, 0]);
}

#[test]
fn snapshot_is_detached_from_source() {
    use crate::vec3f;

    let mut p = ParticleRecord::new(1, 0, ParticleType::GAS, 2., 0.1, vec3f(1., 2., 3.));
    p.density = 0.5;
    let view = ExternalParticleView::snapshot(&p);

    p.density = 9.;
    p.mass = 7.;
    assert_eq!(view.density, 0.5);
    assert_eq!(view.mass, 2.);
    assert_eq!(view.accum, CacheAccumulators::zeroed());
}
