use crate::floating_type_mod::FT;
use serde::{Deserialize, Serialize};

/// Scale factor and Hubble rate at one simulation time. Passes receive this
/// pair at construction and never look cosmology up from ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosmologyTerms {
    pub a: FT,
    pub hubble: FT,
}

impl CosmologyTerms {
    /// Non-comoving run: `a = 1`, `H = 0`.
    pub fn static_universe() -> CosmologyTerms {
        CosmologyTerms { a: 1., hubble: 0. }
    }

    pub fn at_time(converter: &impl CosmologyConverter, time: FT) -> CosmologyTerms {
        CosmologyTerms {
            a: converter.scale_factor(time),
            hubble: converter.hubble_rate(time),
        }
    }
}

/// Time-to-cosmology conversion, provided by the caller.
pub trait CosmologyConverter {
    fn scale_factor(&self, time: FT) -> FT;
    fn hubble_rate(&self, time: FT) -> FT;
}

/// Einstein-de Sitter universe, `a = (t / t0)^(2/3)`. Mostly useful for
/// exercising comoving code paths in tests.
#[derive(Debug, Clone, Copy)]
pub struct EinsteinDeSitter {
    pub t0: FT,
}

impl CosmologyConverter for EinsteinDeSitter {
    fn scale_factor(&self, time: FT) -> FT {
        (time / self.t0).powf(2. / 3.)
    }

    fn hubble_rate(&self, time: FT) -> FT {
        2. / (3. * time)
    }
}

#[test]
fn eds_hubble_matches_scale_factor_growth() {
    let csm = EinsteinDeSitter { t0: 1. };
    let t = 2.0;
    let dt = 1e-4;
    // H = (da/dt) / a
    let dadt = (csm.scale_factor(t + dt) - csm.scale_factor(t - dt)) / (2. * dt);
    let h_numeric = dadt / csm.scale_factor(t);
    crate::assert_ft_approx_eq(csm.hubble_rate(t), h_numeric, 1e-3, || format!("H at t={}", t));
}

#[test]
fn static_universe_terms() {
    let terms = CosmologyTerms::static_universe();
    assert_eq!(terms.a, 1.);
    assert_eq!(terms.hubble, 0.);
}
