use crate::{
    floating_type_mod::{FT, PI},
    V3,
};

/// Cubic spline kernel, unnormalized, with support `q in [0, 1]` where
/// `q = r / (2h)`.
pub fn cubic_kernel_unnormalized(q: FT) -> FT {
    if q < 0.5 {
        6. * (q * q * q - q * q) + 1.
    } else if q < 1. {
        let v = 1. - q;
        2. * (v * v * v)
    } else {
        0.
    }
}

pub fn cubic_kernel_unnormalized_deriv(q: FT) -> FT {
    if q < 0.5 {
        18. * q * q - 12. * q
    } else if q < 1. {
        let v = 1. - q;
        -6. * v * v
    } else {
        0.
    }
}

/// 3D kernel value for distance `r` and smoothing length `h`. The support
/// radius is `2h`, i.e. the particle's ball.
pub fn kernel_w(r: FT, h: FT) -> FT {
    let norm_factor = 1. / (PI * (h * h * h));
    norm_factor * cubic_kernel_unnormalized(r / (2. * h))
}

/// Kernel gradient dW/dx where `W = kernel(|x-y| / h)` and `x - y = diff`.
pub fn kernel_grad(mut diff: V3, h: FT) -> V3 {
    let r = diff.norm();
    let q: FT = r / (2. * h);
    if q <= 1.0e-5 {
        return V3::zeros();
    }
    diff.unscale_mut(r);

    let norm_factor = 1. / (PI * (h * h * h));
    norm_factor * cubic_kernel_unnormalized_deriv(q) / (2. * h) * diff
}

/// Symmetrized smoothing length for a particle pair with search balls
/// `ball_i` and `ball_j`.
pub fn pair_smoothing_length(ball_i: FT, ball_j: FT) -> FT {
    0.25 * (ball_i + ball_j)
}

#[test]
fn cubic_kernel_3d_integration_test() {
    // integrate W over its support; must come out as 1
    let h = 2.5;
    let support_radius = 2.0 * h;
    let grid_size = 100;
    let cube_len = 2. * support_radius / grid_size as FT;
    let cube_vol = cube_len * cube_len * cube_len;

    let mut integral = 0.;
    for z in 0..grid_size {
        for y in 0..grid_size {
            for x in 0..grid_size {
                let p = crate::vec3f(
                    (x as FT + 0.5) * cube_len - support_radius,
                    (y as FT + 0.5) * cube_len - support_radius,
                    (z as FT + 0.5) * cube_len - support_radius,
                );
                integral += kernel_w(p.norm(), h) * cube_vol;
            }
        }
    }

    crate::assert_ft_approx_eq(1.0, integral, 0.001, || format!("kernel integral with h={}", h));
}

#[test]
fn cubic_kernel_3d_derivative_test() {
    let h = 1.5;
    let diff = 1e-3;

    for probe in [
        crate::vec3f(0.3, 0.1, -0.2),
        crate::vec3f(-1.0, 0.8, 0.4),
        crate::vec3f(2.0, -1.0, 0.5),
        crate::vec3f(0.0, 2.4, 0.0),
    ] {
        let analytical = kernel_grad(probe, h);
        for d in 0..3 {
            let mut offset = crate::V3::zeros();
            offset[d] = diff * 0.5;
            let approx = (kernel_w((probe + offset).norm(), h) - kernel_w((probe - offset).norm(), h)) / diff;
            crate::assert_ft_approx_eq(analytical[d], approx, 0.001, || {
                format!("dW/dx[{}] at {:?}", d, probe)
            });
        }
    }
}

#[test]
fn kernel_support_ends_at_ball() {
    let h = 1.0;
    assert!(kernel_w(1.99 * h, h) > 0.);
    assert_eq!(kernel_w(2.0 * h, h), 0.);
    assert_eq!(kernel_grad(crate::vec3f(2.5 * h, 0., 0.), h), crate::V3::zeros());
}
