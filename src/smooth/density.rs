use crate::{
    cosmology::CosmologyTerms,
    floating_type_mod::FT,
    particle::{CacheAccumulators, ParticleRecord, ParticleType},
    smooth::{NeighborEntry, PassConfigError, PassSelection, SmoothPass},
    sph_kernels::{kernel_grad, kernel_w},
    V3,
};

/// First SPH smooth: kernel-weighted density estimate and velocity
/// derivatives (divergence, curl), corrected for comoving expansion.
///
/// Merge rule: all accumulators are raw kernel sums and merge additively;
/// `finalize` normalizes by density afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityDerivatives {
    selection: PassSelection,
    cosmo: CosmologyTerms,
    active_only: bool,
    constant_diffusion: bool,
}

impl DensityDerivatives {
    /// `active_only` restricts the active set to particles at or above the
    /// selection rung; otherwise every particle of the filtered type is
    /// smoothed. `constant_diffusion` selects a unit per-particle diffusion
    /// coefficient so the pass coefficients alone set the diffusion
    /// strength; otherwise the coefficient is estimated from local shear.
    pub fn new(
        types: ParticleType,
        active_rung: i32,
        cosmo: CosmologyTerms,
        active_only: bool,
        constant_diffusion: bool,
    ) -> Result<DensityDerivatives, PassConfigError> {
        if cosmo.a <= 0. {
            return Err(PassConfigError::NonPositiveScaleFactor(cosmo.a as f64));
        }
        Ok(DensityDerivatives {
            selection: PassSelection::new(types, active_rung)?,
            cosmo,
            active_only,
            constant_diffusion,
        })
    }

    pub fn cosmo(&self) -> CosmologyTerms {
        self.cosmo
    }

    pub fn active_only(&self) -> bool {
        self.active_only
    }

    pub fn constant_diffusion(&self) -> bool {
        self.constant_diffusion
    }
}

impl SmoothPass for DensityDerivatives {
    fn selection(&self) -> &PassSelection {
        &self.selection
    }

    fn is_active(&self, p: &ParticleRecord) -> bool {
        !p.is_deleted() && self.selection.type_matches(p) && (!self.active_only || self.selection.rung_active(p))
    }

    fn prepare_for_traversal(&self, p: &mut ParticleRecord) {
        // seed the scratch field the later pressure search reads
        p.hydro.diff_coeff = 0.;
    }

    fn prepare_for_smoothing(&self, p: &mut ParticleRecord) {
        p.density = 0.;
        p.hydro.div_v = 0.;
        p.hydro.curl_v = V3::zeros();
    }

    fn evaluate(&self, p: &mut ParticleRecord, neighbors: &mut [NeighborEntry]) {
        let h = p.smoothing_length();
        if h <= 0. {
            log::warn!("particle {} has no smoothing ball, clamping density to its mass", p.order());
            p.density = p.mass;
            // the clamp is a full assignment; stale sums must not survive it
            p.hydro.div_v = 0.;
            p.hydro.curl_v = V3::zeros();
            return;
        }

        // self contribution; also the no-neighbor fallback
        let mut rho = p.mass * kernel_w(0., h);
        let mut div_sum = 0.;
        let mut curl_sum = V3::zeros();

        if neighbors.is_empty() {
            log::warn!(
                "density smooth of particle {} resolved no neighbors, keeping self contribution",
                p.order()
            );
        }

        let a_h = self.cosmo.a * self.cosmo.hubble;
        for entry in neighbors.iter() {
            let n = &entry.particle;
            let dx = p.position - n.position();
            rho += n.mass() * kernel_w(entry.dist, h);

            let grad = kernel_grad(dx, h);
            // peculiar velocity difference plus the Hubble flow across the pair
            let dv = (n.velocity() - p.velocity) - a_h * dx;
            div_sum += n.mass() * dv.dot(&grad);
            curl_sum += n.mass() * dv.cross(&grad);
        }

        p.density = rho;
        p.hydro.div_v = div_sum;
        p.hydro.curl_v = curl_sum;
    }

    fn combine(&self, p: &mut ParticleRecord, remote: &CacheAccumulators) {
        p.density += remote.density;
        p.hydro.div_v += remote.div_v;
        p.hydro.curl_v += remote.curl_v;
    }

    fn finalize(&self, p: &mut ParticleRecord) {
        if p.density <= 0. {
            p.hydro.div_v = 0.;
            p.hydro.curl_v = V3::zeros();
            p.hydro.diff_coeff = if self.constant_diffusion { 1. } else { 0. };
            return;
        }

        let norm = 1. / (p.density * self.cosmo.a);
        p.hydro.div_v *= norm;
        p.hydro.curl_v *= norm;

        p.hydro.diff_coeff = if self.constant_diffusion {
            1.
        } else {
            // shear estimate from the peculiar velocity gradients
            let h = p.smoothing_length();
            let shear = (p.hydro.div_v * p.hydro.div_v + p.hydro.curl_v.norm_squared()).sqrt();
            shear * h * h
        };

        // comoving expansion contributes 3H to the physical divergence
        p.hydro.div_v += 3. * self.cosmo.hubble;
    }
}

/// Density and velocity derivatives for "neighbor of active" particles
/// that are not active themselves: the second half of the fast-gas step.
/// Tree and cache init hooks are all no-ops so the bookkeeping of the
/// primary density pass stays untouched, and no particle gets marked.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborDensityDerivatives {
    inner: DensityDerivatives,
}

impl NeighborDensityDerivatives {
    pub fn new(
        types: ParticleType,
        active_rung: i32,
        cosmo: CosmologyTerms,
        constant_diffusion: bool,
    ) -> Result<NeighborDensityDerivatives, PassConfigError> {
        Ok(NeighborDensityDerivatives {
            inner: DensityDerivatives::new(types, active_rung, cosmo, false, constant_diffusion)?,
        })
    }

    pub fn cosmo(&self) -> CosmologyTerms {
        self.inner.cosmo()
    }

    pub fn constant_diffusion(&self) -> bool {
        self.inner.constant_diffusion()
    }
}

impl SmoothPass for NeighborDensityDerivatives {
    fn selection(&self) -> &PassSelection {
        self.inner.selection()
    }

    fn is_active(&self, p: &ParticleRecord) -> bool {
        !p.is_deleted()
            && self.inner.selection().type_matches(p)
            && !self.inner.selection().rung_active(p)
            && p.ptype.test(ParticleType::NBR_OF_ACTIVE)
    }

    // prepare_for_traversal, prepare_for_smoothing, combine: deliberately
    // the default no-ops. evaluate assigns fresh values, so a skipped init
    // never leaks stale state into the result.

    fn evaluate(&self, p: &mut ParticleRecord, neighbors: &mut [NeighborEntry]) {
        self.inner.evaluate(p, neighbors);
    }

    fn finalize(&self, p: &mut ParticleRecord) {
        self.inner.finalize(p);
    }
}

#[cfg(test)]
fn test_particle(order: u64, pos: V3, mass: FT, ball: FT) -> ParticleRecord {
    let mut p = ParticleRecord::new(order, order, ParticleType::GAS, mass, 0.01, pos);
    p.ball = ball;
    p
}

#[test]
fn density_matches_hand_computed_reference() {
    use crate::smooth::NeighborParticle;
    use crate::vec3f;

    // one active gas particle, three stationary neighbors, h = 1
    let mut p = test_particle(0, vec3f(0., 0., 0.), 1.5, 2.0);
    let mut n1 = test_particle(1, vec3f(0.5, 0., 0.), 1.0, 2.0);
    let mut n2 = test_particle(2, vec3f(0., 1.0, 0.), 2.0, 2.0);
    let mut n3 = test_particle(3, vec3f(0., 0., 1.5), 0.5, 2.0);

    let pass = DensityDerivatives::new(ParticleType::GAS, 0, CosmologyTerms::static_universe(), false, true).unwrap();

    let mut entries = vec![
        NeighborEntry { dist: 0.5, particle: NeighborParticle::Local(&mut n1) },
        NeighborEntry { dist: 1.0, particle: NeighborParticle::Local(&mut n2) },
        NeighborEntry { dist: 1.5, particle: NeighborParticle::Local(&mut n3) },
    ];

    pass.prepare_for_smoothing(&mut p);
    pass.evaluate(&mut p, &mut entries);
    pass.finalize(&mut p);

    // cubic spline, h=1: W(r) = f(r/2) / pi with
    // f(q) = 6(q^3 - q^2) + 1 for q < 1/2, 2(1-q)^3 for q < 1
    let pi = crate::floating_type_mod::PI;
    let w0 = 1.0 / pi; // f(0) = 1
    let w05 = (6. * (0.25 as FT * 0.25 * 0.25 - 0.25 * 0.25) + 1.) / pi; // q = 0.25
    let w10 = (6. * (0.125 as FT - 0.25) + 1.) / pi; // q = 0.5
    let w15 = 2. * (0.25 as FT * 0.25 * 0.25) / pi; // q = 0.75
    let expected = 1.5 * w0 + 1.0 * w05 + 2.0 * w10 + 0.5 * w15;

    crate::assert_ft_approx_eq(p.density, expected, 1e-5, || "kernel-weighted density".to_string());
    // stationary neighbors, static universe: no velocity gradients
    crate::assert_ft_approx_eq(p.hydro.div_v, 0., 1e-6, || "div v".to_string());
}

#[test]
fn empty_neighbor_list_falls_back_to_self_density() {
    use crate::vec3f;

    let mut p = test_particle(0, vec3f(0., 0., 0.), 1.0, 2.0);
    let pass = DensityDerivatives::new(ParticleType::GAS, 0, CosmologyTerms::static_universe(), false, true).unwrap();

    pass.prepare_for_smoothing(&mut p);
    pass.evaluate(&mut p, &mut []);
    pass.finalize(&mut p);

    assert!(p.density.is_finite());
    assert!(p.density > 0.);
    assert!(p.hydro.div_v.is_finite());

    // degenerate ball is clamped, not propagated
    let mut q = test_particle(1, vec3f(0., 0., 0.), 1.0, 0.);
    pass.prepare_for_smoothing(&mut q);
    pass.evaluate(&mut q, &mut []);
    assert!(q.density.is_finite());
}

#[test]
fn degenerate_ball_clears_stale_derivatives() {
    use crate::vec3f;

    // the neighbor variant skips the per-smooth init, so the clamp branch
    // itself must overwrite everything evaluate normally assigns
    let pass =
        NeighborDensityDerivatives::new(ParticleType::GAS, 2, CosmologyTerms::static_universe(), true).unwrap();

    let mut p = test_particle(0, vec3f(0., 0., 0.), 1.3, 0.);
    p.ptype.set(ParticleType::NBR_OF_ACTIVE);
    p.hydro.div_v = 7.;
    p.hydro.curl_v = vec3f(1., -2., 3.);

    pass.evaluate(&mut p, &mut []);
    pass.finalize(&mut p);

    assert_eq!(p.density, 1.3);
    assert_eq!(p.hydro.div_v, 0.);
    assert_eq!(p.hydro.curl_v, V3::zeros());
}

#[test]
fn is_active_is_stable_and_respects_flags() {
    use crate::vec3f;

    let pass = DensityDerivatives::new(ParticleType::GAS, 2, CosmologyTerms::static_universe(), true, true).unwrap();

    let mut p = test_particle(0, vec3f(0., 0., 0.), 1.0, 2.0);
    p.rung = 1;
    // below the active rung with active_only set
    assert!(!pass.is_active(&p));
    assert_eq!(pass.is_active(&p), pass.is_active(&p));

    p.rung = 2;
    assert!(pass.is_active(&p));

    let all = DensityDerivatives::new(ParticleType::GAS, 2, CosmologyTerms::static_universe(), false, true).unwrap();
    p.rung = 0;
    assert!(all.is_active(&p));

    let mut star = test_particle(1, vec3f(0., 0., 0.), 1.0, 2.0);
    star.ptype = ParticleType::STAR;
    assert!(!all.is_active(&star));
}

#[test]
fn combine_is_order_independent() {
    use crate::vec3f;
    use rand::seq::SliceRandom;

    let pass = DensityDerivatives::new(ParticleType::GAS, 0, CosmologyTerms::static_universe(), false, true).unwrap();

    let mut contributions = Vec::new();
    for i in 0..6 {
        let mut c = CacheAccumulators::zeroed();
        c.density = 0.1 * (i + 1) as FT;
        c.div_v = -0.05 * i as FT;
        c.curl_v = vec3f(0.01 * i as FT, 0., 0.02);
        contributions.push(c);
    }

    let base = test_particle(0, vec3f(0., 0., 0.), 1.0, 2.0);

    let mut rng = rand::thread_rng();
    let mut reference: Option<ParticleRecord> = None;
    for _ in 0..4 {
        let mut p = base.clone();
        let mut order: Vec<usize> = (0..contributions.len()).collect();
        order.shuffle(&mut rng);
        for &i in &order {
            pass.combine(&mut p, &contributions[i]);
        }
        if let Some(r) = &reference {
            crate::assert_ft_approx_eq(p.density, r.density, 1e-5, || "density after permuted merge".to_string());
            crate::assert_ft_approx_eq(p.hydro.div_v, r.hydro.div_v, 1e-5, || "div v after permuted merge".to_string());
        } else {
            reference = Some(p);
        }
    }
}

#[test]
fn neighbor_variant_selects_marked_inactive_gas_only() {
    use crate::vec3f;

    let pass =
        NeighborDensityDerivatives::new(ParticleType::GAS, 2, CosmologyTerms::static_universe(), true).unwrap();

    let mut p = test_particle(0, vec3f(0., 0., 0.), 1.0, 2.0);
    p.rung = 0;
    assert!(!pass.is_active(&p)); // not marked

    p.ptype.set(ParticleType::NBR_OF_ACTIVE);
    assert!(pass.is_active(&p));

    p.rung = 3; // active itself, handled by the primary pass
    assert!(!pass.is_active(&p));
}

#[test]
fn neighbor_variant_does_not_grow_marked_set() {
    use crate::smooth::NeighborParticle;
    use crate::vec3f;

    let pass =
        NeighborDensityDerivatives::new(ParticleType::GAS, 2, CosmologyTerms::static_universe(), true).unwrap();

    let mut p = test_particle(0, vec3f(0., 0., 0.), 1.0, 2.0);
    p.ptype.set(ParticleType::NBR_OF_ACTIVE);
    let mut n = test_particle(1, vec3f(0.5, 0., 0.), 1.0, 2.0);
    let n_type_before = n.ptype;

    let mut entries = vec![NeighborEntry { dist: 0.5, particle: NeighborParticle::Local(&mut n) }];
    pass.prepare_for_smoothing(&mut p);
    pass.evaluate(&mut p, &mut entries);
    drop(entries);

    assert!(p.density > 0.);
    assert_eq!(n.ptype, n_type_before);
}
