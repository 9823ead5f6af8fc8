use crate::{
    particle::{CacheAccumulators, ParticleRecord, ParticleType},
    smooth::{PassConfigError, PassSelection, SmoothPass},
};

/// Inverse nearest-neighbor marking: every particle whose own ball contains
/// an active particle gets the `NBR_OF_ACTIVE` flag. The traversal itself
/// performs the marking while resolving the inverse relation; there is no
/// kernel evaluation.
///
/// Merge rule: logical or of the flag, so repeated or reordered remote
/// deliveries are idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkNeighbor {
    selection: PassSelection,
}

impl MarkNeighbor {
    pub fn new(types: ParticleType, active_rung: i32) -> Result<MarkNeighbor, PassConfigError> {
        Ok(MarkNeighbor {
            selection: PassSelection::new(types, active_rung)?,
        })
    }
}

impl SmoothPass for MarkNeighbor {
    fn selection(&self) -> &PassSelection {
        &self.selection
    }

    /// Active particles seed the inverse query; the marked set is whatever
    /// the traversal finds around them.
    fn is_active(&self, p: &ParticleRecord) -> bool {
        !p.is_deleted() && self.selection.type_matches(p) && self.selection.rung_active(p)
    }

    fn combine(&self, p: &mut ParticleRecord, remote: &CacheAccumulators) {
        if remote.marked {
            p.ptype.set(ParticleType::NBR_OF_ACTIVE);
        }
    }

    fn marks_inverse_neighbors(&self) -> bool {
        true
    }
}

#[test]
fn mark_combine_is_idempotent() {
    use crate::vec3f;

    let pass = MarkNeighbor::new(ParticleType::GAS, 1).unwrap();
    let mut p = ParticleRecord::new(0, 0, ParticleType::GAS, 1., 0.1, vec3f(0., 0., 0.));

    let mut marked = CacheAccumulators::zeroed();
    marked.marked = true;

    pass.combine(&mut p, &marked);
    let after_first = p.ptype;
    assert!(p.ptype.test(ParticleType::NBR_OF_ACTIVE));

    pass.combine(&mut p, &marked);
    pass.combine(&mut p, &CacheAccumulators::zeroed());
    assert_eq!(p.ptype, after_first);
}

#[test]
fn mark_pass_has_no_evaluation() {
    use crate::vec3f;

    let pass = MarkNeighbor::new(ParticleType::GAS, 1).unwrap();
    assert!(pass.marks_inverse_neighbors());

    let mut p = ParticleRecord::new(0, 0, ParticleType::GAS, 1., 0.1, vec3f(0., 0., 0.));
    p.rung = 1;
    assert!(pass.is_active(&p));

    let before = p.clone();
    pass.prepare_for_smoothing(&mut p);
    pass.evaluate(&mut p, &mut []);
    assert_eq!(p.density, before.density);
    assert_eq!(p.ptype, before.ptype);
}
