/*!
Smoothing passes for a partitioned SPH/gravity particle set.

A "smooth" is one sweep over the particles that computes a
neighbor-weighted aggregate (density, pressure forces, ...). The particle
set is split across partitions; neighbors owned elsewhere are read through
a cache of snapshots and their scatter contributions are merged back into
the owning partition afterwards.
*/

pub mod concurrency;
pub mod config;
pub mod cosmology;
pub mod particle;
pub mod partition;
pub mod smooth;
pub mod sph_kernels;
pub mod walk;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::{FRAC_1_PI, PI};
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::{FRAC_1_PI, PI};
}

use floating_type_mod::FT;
use nalgebra::SVector;
use num_traits::Float;
use std::fmt::Display;

pub type V<T, const D: usize> = SVector<T, D>;
pub type V3 = V<FT, 3>;

pub fn vec3f(x: FT, y: FT, z: FT) -> V3 {
    [x, y, z].into()
}

pub fn is_ft_approx_eq<T: Float>(a: T, b: T, tolerance: T) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<T: Float + Display>(a: T, b: T, tolerance: T, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}
