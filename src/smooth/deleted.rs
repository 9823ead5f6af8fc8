use crate::{
    floating_type_mod::FT,
    particle::{CacheAccumulators, ParticleRecord, ParticleType},
    smooth::{apply_deletion_deposit, NeighborEntry, PassConfigError, PassSelection, SmoothPass},
    sph_kernels::kernel_w,
};

/// Distributes a deleted gas particle's mass, momentum, thermal energy and
/// metal content onto its gas neighbors, weighted by kernel distance. Must
/// run before the particle is actually removed.
///
/// Merge rule: deposits are additive (mass, momentum, energy, metal mass)
/// and applied mass-weighted, so any delivery order conserves the totals.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedGasRedistribution {
    selection: PassSelection,
}

impl DeletedGasRedistribution {
    pub fn new(types: ParticleType, active_rung: i32) -> Result<DeletedGasRedistribution, PassConfigError> {
        Ok(DeletedGasRedistribution {
            selection: PassSelection::new(types, active_rung)?,
        })
    }
}

impl SmoothPass for DeletedGasRedistribution {
    fn selection(&self) -> &PassSelection {
        &self.selection
    }

    fn is_active(&self, p: &ParticleRecord) -> bool {
        self.selection.type_matches(p) && p.ptype.test(ParticleType::DELETED)
    }

    fn evaluate(&self, p: &mut ParticleRecord, neighbors: &mut [NeighborEntry]) {
        let h = p.smoothing_length();
        if h <= 0. {
            log::warn!("deleted particle {} has no smoothing ball, nothing redistributed", p.order());
            return;
        }

        // survivors only: live gas, and not the deleted particle itself
        let eligible = |n: &NeighborEntry| n.particle.is_gas() && !n.particle.is_deleted();

        let mut weight_sum: FT = 0.;
        for entry in neighbors.iter() {
            if eligible(entry) {
                weight_sum += kernel_w(entry.dist, h);
            }
        }
        if weight_sum <= 0. {
            log::warn!(
                "deleted particle {} has no surviving gas neighbor, its content is lost",
                p.order()
            );
            return;
        }

        for entry in neighbors.iter_mut() {
            if !(entry.particle.is_gas() && !entry.particle.is_deleted()) {
                continue;
            }
            let frac = kernel_w(entry.dist, h) / weight_sum;
            let dm = frac * p.mass;
            entry
                .particle
                .receive_deleted(dm, p.velocity * dm, p.u * dm, p.metals * dm);
        }
    }

    fn combine(&self, p: &mut ParticleRecord, remote: &CacheAccumulators) {
        if remote.d_mass > 0. {
            apply_deletion_deposit(p, remote.d_mass, remote.d_momentum, remote.d_thermal, remote.d_metal_mass);
        }
    }

    /// A deleted particle's radius must not feed the dynamic
    /// smoothing-length growth heuristic.
    fn grows_ball_max(&self) -> bool {
        false
    }
}

#[cfg(test)]
fn gas(order: u64, x: FT, mass: FT, u: FT) -> ParticleRecord {
    let mut p = ParticleRecord::new(order, order, ParticleType::GAS, mass, 0.01, crate::vec3f(x, 0., 0.));
    p.ball = 2.0;
    p.u = u;
    p
}

#[test]
fn redistribution_conserves_mass_and_energy() {
    use crate::smooth::NeighborParticle;

    let mut doomed = gas(0, 0., 1.2, 5.0);
    doomed.velocity = crate::vec3f(0.4, -0.2, 0.);
    doomed.metals = 0.03;
    doomed.ptype.set(ParticleType::DELETED);

    let mut n1 = gas(1, 0.5, 1.0, 1.0);
    let mut n2 = gas(2, 1.2, 2.0, 2.0);

    let mass_before = doomed.mass + n1.mass + n2.mass;
    let energy_before = doomed.mass * doomed.u + n1.mass * n1.u + n2.mass * n2.u;
    let momentum_before = doomed.velocity * doomed.mass + n1.velocity * n1.mass + n2.velocity * n2.mass;
    let metal_before = doomed.mass * doomed.metals + n1.mass * n1.metals + n2.mass * n2.metals;

    let pass = DeletedGasRedistribution::new(ParticleType::GAS, 0).unwrap();
    assert!(pass.is_active(&doomed));
    assert!(!pass.grows_ball_max());

    let mut entries = vec![
        NeighborEntry { dist: 0.5, particle: NeighborParticle::Local(&mut n1) },
        NeighborEntry { dist: 1.2, particle: NeighborParticle::Local(&mut n2) },
    ];
    pass.prepare_for_smoothing(&mut doomed);
    pass.evaluate(&mut doomed, &mut entries);
    drop(entries);

    // the doomed particle is consumed by removal afterwards; survivors carry everything
    let mass_after = n1.mass + n2.mass;
    let energy_after = n1.mass * n1.u + n2.mass * n2.u;
    let momentum_after = n1.velocity * n1.mass + n2.velocity * n2.mass;
    let metal_after = n1.mass * n1.metals + n2.mass * n2.metals;

    crate::assert_ft_approx_eq(mass_after, mass_before, 1e-5, || "total mass".to_string());
    crate::assert_ft_approx_eq(energy_after, energy_before, 1e-4, || "total thermal energy".to_string());
    crate::assert_ft_approx_eq((momentum_after - momentum_before).norm(), 0., 1e-5, || {
        "total momentum".to_string()
    });
    crate::assert_ft_approx_eq(metal_after, metal_before, 1e-6, || "total metal mass".to_string());

    // split proportional to kernel weight: the closer neighbor receives more
    let h = 1.0;
    let expected_ratio = kernel_w(0.5, h) / kernel_w(1.2, h);
    let received_1 = n1.mass - 1.0;
    let received_2 = n2.mass - 2.0;
    crate::assert_ft_approx_eq(received_1 / received_2, expected_ratio, 1e-4, || {
        "kernel-weighted split".to_string()
    });
    assert!(received_1 > received_2);
}

#[test]
fn deleted_neighbors_receive_nothing() {
    use crate::smooth::NeighborParticle;

    let mut doomed = gas(0, 0., 1.0, 1.0);
    doomed.ptype.set(ParticleType::DELETED);

    let mut alive = gas(1, 0.5, 1.0, 1.0);
    let mut also_doomed = gas(2, 0.6, 1.0, 1.0);
    also_doomed.ptype.set(ParticleType::DELETED);
    let mut star = ParticleRecord::new(3, 3, ParticleType::STAR, 1.0, 0.01, crate::vec3f(0.4, 0., 0.));
    star.ball = 2.0;

    let pass = DeletedGasRedistribution::new(ParticleType::GAS, 0).unwrap();
    let mut entries = vec![
        NeighborEntry { dist: 0.4, particle: NeighborParticle::Local(&mut star) },
        NeighborEntry { dist: 0.5, particle: NeighborParticle::Local(&mut alive) },
        NeighborEntry { dist: 0.6, particle: NeighborParticle::Local(&mut also_doomed) },
    ];
    pass.evaluate(&mut doomed, &mut entries);
    drop(entries);

    // the sole eligible neighbor absorbs the full mass
    crate::assert_ft_approx_eq(alive.mass, 2.0, 1e-6, || "surviving neighbor mass".to_string());
    assert_eq!(also_doomed.mass, 1.0);
    assert_eq!(star.mass, 1.0);
}

#[test]
fn no_surviving_neighbor_is_a_logged_skip() {
    let mut doomed = gas(0, 0., 1.0, 1.0);
    doomed.ptype.set(ParticleType::DELETED);

    let pass = DeletedGasRedistribution::new(ParticleType::GAS, 0).unwrap();
    pass.evaluate(&mut doomed, &mut []);
    assert!(doomed.mass.is_finite());
    assert_eq!(doomed.mass, 1.0);
}

#[test]
fn remote_deposits_merge_in_any_order() {
    let pass = DeletedGasRedistribution::new(ParticleType::GAS, 0).unwrap();

    let mut a = CacheAccumulators::zeroed();
    a.d_mass = 0.5;
    a.d_momentum = crate::vec3f(0.1, 0., 0.);
    a.d_thermal = 2.0;
    a.d_metal_mass = 0.01;

    let mut b = CacheAccumulators::zeroed();
    b.d_mass = 0.25;
    b.d_momentum = crate::vec3f(0., -0.2, 0.);
    b.d_thermal = 0.5;
    b.d_metal_mass = 0.002;

    let mut p1 = gas(1, 0., 1.0, 1.0);
    let mut p2 = p1.clone();

    pass.combine(&mut p1, &a);
    pass.combine(&mut p1, &b);
    pass.combine(&mut p2, &b);
    pass.combine(&mut p2, &a);

    crate::assert_ft_approx_eq(p1.mass, p2.mass, 1e-6, || "mass".to_string());
    crate::assert_ft_approx_eq(p1.u, p2.u, 1e-6, || "u".to_string());
    crate::assert_ft_approx_eq((p1.velocity - p2.velocity).norm(), 0., 1e-6, || "velocity".to_string());
}
