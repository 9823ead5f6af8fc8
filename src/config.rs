use crate::floating_type_mod::FT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smoothing configuration shared by the driver and the pass constructors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothConfig {
    /// Upper bound on the neighbor list handed to a pass evaluation.
    pub max_neighbors: usize,
    pub viscosity_alpha: FT,
    pub viscosity_beta: FT,
    pub thermal_diffusion: FT,
    pub metal_diffusion: FT,
    /// Use a unit per-particle diffusion coefficient instead of the
    /// shear-based estimate.
    pub constant_diffusion: bool,
    /// Restrict the density pass to the active rung.
    pub density_active_only: bool,
}

impl Default for SmoothConfig {
    fn default() -> SmoothConfig {
        SmoothConfig {
            max_neighbors: 64,
            viscosity_alpha: 1.,
            viscosity_beta: 2.,
            thermal_diffusion: 0.,
            metal_diffusion: 0.,
            constant_diffusion: false,
            density_active_only: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed parsing smooth config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("max_neighbors must be at least 1")]
    NoNeighborsAllowed,
    #[error("{name} must be non-negative, got {value}")]
    NegativeCoefficient { name: &'static str, value: f64 },
}

impl SmoothConfig {
    pub fn from_yaml_str(s: &str) -> Result<SmoothConfig, ConfigError> {
        let config: SmoothConfig = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_neighbors == 0 {
            return Err(ConfigError::NoNeighborsAllowed);
        }
        for (name, value) in [
            ("viscosity_alpha", self.viscosity_alpha),
            ("viscosity_beta", self.viscosity_beta),
            ("thermal_diffusion", self.thermal_diffusion),
            ("metal_diffusion", self.metal_diffusion),
        ] {
            if value < 0. {
                return Err(ConfigError::NegativeCoefficient { name, value: value as f64 });
            }
        }
        Ok(())
    }
}

#[test]
fn yaml_config_round_trip() {
    let yaml = "
max_neighbors: 32
viscosity_alpha: 1.0
viscosity_beta: 2.0
thermal_diffusion: 0.1
metal_diffusion: 0.05
constant_diffusion: true
density_active_only: false
";
    let config = SmoothConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(config.max_neighbors, 32);
    assert!(config.constant_diffusion);
    assert_eq!(config.thermal_diffusion, 0.1);

    let reserialized = serde_yaml::to_string(&config).unwrap();
    assert_eq!(SmoothConfig::from_yaml_str(&reserialized).unwrap(), config);
}

#[test]
fn invalid_config_refuses_to_build() {
    assert!(matches!(
        SmoothConfig { max_neighbors: 0, ..SmoothConfig::default() }.validate(),
        Err(ConfigError::NoNeighborsAllowed)
    ));
    assert!(matches!(
        SmoothConfig { viscosity_beta: -1., ..SmoothConfig::default() }.validate(),
        Err(ConfigError::NegativeCoefficient { .. })
    ));
}
