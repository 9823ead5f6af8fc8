/*!
Fixed-order binary form of a pass configuration, used when a pass is
shipped to another execution unit. Layout per pass: one tag byte, the base
selection fields (type filter bits, active rung), then the pass-specific
scalars in declaration order, little-endian. Scalars travel as `f64`
independent of the crate's float width.

Decoding re-runs constructor validation, so a reconstructed pass behaves
identically to the original or fails to build at all.
*/

use crate::{
    cosmology::CosmologyTerms,
    floating_type_mod::FT,
    particle::ParticleType,
    smooth::{
        DeletedGasRedistribution, DensityDerivatives, MarkNeighbor, NeighborDensityDerivatives, PassConfigError,
        PassSelection, PressureForce, SmoothPass, SmoothPassKind,
    },
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

const TAG_DENSITY: u8 = 1;
const TAG_NEIGHBOR_DENSITY: u8 = 2;
const TAG_MARK: u8 = 3;
const TAG_PRESSURE: u8 = 4;
const TAG_DELETED: u8 = 5;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown pass tag {0}")]
    UnknownTag(u8),
    #[error(transparent)]
    Config(#[from] PassConfigError),
}

fn write_selection<W: Write>(w: &mut W, sel: &PassSelection) -> io::Result<()> {
    w.write_u32::<LittleEndian>(sel.types.bits())?;
    w.write_i32::<LittleEndian>(sel.active_rung)
}

fn read_selection<R: Read>(r: &mut R) -> io::Result<(ParticleType, i32)> {
    let types = ParticleType::from_bits(r.read_u32::<LittleEndian>()?);
    let active_rung = r.read_i32::<LittleEndian>()?;
    Ok((types, active_rung))
}

fn write_ft<W: Write>(w: &mut W, x: FT) -> io::Result<()> {
    w.write_f64::<LittleEndian>(x as f64)
}

fn read_ft<R: Read>(r: &mut R) -> io::Result<FT> {
    Ok(r.read_f64::<LittleEndian>()? as FT)
}

fn write_bool<W: Write>(w: &mut W, x: bool) -> io::Result<()> {
    w.write_u8(x as u8)
}

fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
    Ok(r.read_u8()? != 0)
}

impl SmoothPassKind {
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            SmoothPassKind::DensityDerivatives(p) => {
                w.write_u8(TAG_DENSITY)?;
                write_selection(w, p.selection())?;
                write_ft(w, p.cosmo().a)?;
                write_ft(w, p.cosmo().hubble)?;
                write_bool(w, p.active_only())?;
                write_bool(w, p.constant_diffusion())
            }
            SmoothPassKind::NeighborDensityDerivatives(p) => {
                w.write_u8(TAG_NEIGHBOR_DENSITY)?;
                write_selection(w, p.selection())?;
                write_ft(w, p.cosmo().a)?;
                write_ft(w, p.cosmo().hubble)?;
                write_bool(w, p.constant_diffusion())
            }
            SmoothPassKind::MarkNeighbor(p) => {
                w.write_u8(TAG_MARK)?;
                write_selection(w, p.selection())
            }
            SmoothPassKind::PressureForce(p) => {
                w.write_u8(TAG_PRESSURE)?;
                write_selection(w, p.selection())?;
                write_ft(w, p.time())?;
                write_ft(w, p.cosmo().a)?;
                write_ft(w, p.cosmo().hubble)?;
                write_ft(w, p.alpha())?;
                write_ft(w, p.beta())?;
                write_ft(w, p.thermal_diffusion())?;
                write_ft(w, p.metal_diffusion())
            }
            SmoothPassKind::DeletedGasRedistribution(p) => {
                w.write_u8(TAG_DELETED)?;
                write_selection(w, p.selection())
            }
        }
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<SmoothPassKind, EnvelopeError> {
        let tag = r.read_u8()?;
        let (types, active_rung) = read_selection(r)?;
        let pass = match tag {
            TAG_DENSITY => {
                let a = read_ft(r)?;
                let hubble = read_ft(r)?;
                let active_only = read_bool(r)?;
                let constant_diffusion = read_bool(r)?;
                DensityDerivatives::new(types, active_rung, CosmologyTerms { a, hubble }, active_only, constant_diffusion)?
                    .into()
            }
            TAG_NEIGHBOR_DENSITY => {
                let a = read_ft(r)?;
                let hubble = read_ft(r)?;
                let constant_diffusion = read_bool(r)?;
                NeighborDensityDerivatives::new(types, active_rung, CosmologyTerms { a, hubble }, constant_diffusion)?
                    .into()
            }
            TAG_MARK => MarkNeighbor::new(types, active_rung)?.into(),
            TAG_PRESSURE => {
                let time = read_ft(r)?;
                let a = read_ft(r)?;
                let hubble = read_ft(r)?;
                let alpha = read_ft(r)?;
                let beta = read_ft(r)?;
                let thermal = read_ft(r)?;
                let metal = read_ft(r)?;
                PressureForce::new(
                    types,
                    active_rung,
                    time,
                    CosmologyTerms { a, hubble },
                    alpha,
                    beta,
                    thermal,
                    metal,
                )?
                .into()
            }
            TAG_DELETED => DeletedGasRedistribution::new(types, active_rung)?.into(),
            other => return Err(EnvelopeError::UnknownTag(other)),
        };
        Ok(pass)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf).expect("writing to a Vec cannot fail");
        buf
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<SmoothPassKind, EnvelopeError> {
        SmoothPassKind::decode(&mut bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::ParticleRecord;
    use crate::vec3f;

    fn sample_passes() -> Vec<SmoothPassKind> {
        let cosmo = CosmologyTerms { a: 0.8, hubble: 0.05 };
        vec![
            DensityDerivatives::new(ParticleType::GAS, 2, cosmo, true, false).unwrap().into(),
            NeighborDensityDerivatives::new(ParticleType::GAS, 2, cosmo, true).unwrap().into(),
            MarkNeighbor::new(ParticleType::GAS | ParticleType::STAR, 1).unwrap().into(),
            PressureForce::new(ParticleType::GAS, 3, 1.25, cosmo, 1., 2., 0.1, 0.05)
                .unwrap()
                .into(),
            DeletedGasRedistribution::new(ParticleType::GAS, 0).unwrap().into(),
        ]
    }

    #[test]
    fn round_trip_reconstructs_every_pass() {
        for pass in sample_passes() {
            let decoded = SmoothPassKind::from_bytes(&pass.to_bytes()).unwrap();
            assert_eq!(pass, decoded);
        }
    }

    #[test]
    fn round_trip_preserves_behavior() {
        use crate::smooth::{NeighborEntry, NeighborParticle};

        let cosmo = CosmologyTerms { a: 0.8, hubble: 0.05 };
        let pass: SmoothPassKind = DensityDerivatives::new(ParticleType::GAS, 2, cosmo, true, false)
            .unwrap()
            .into();
        let decoded = SmoothPassKind::from_bytes(&pass.to_bytes()).unwrap();

        let mut p = ParticleRecord::new(0, 0, ParticleType::GAS, 1.3, 0.01, vec3f(0., 0., 0.));
        p.rung = 2;
        p.ball = 2.0;
        p.velocity = vec3f(0.2, 0., 0.);
        let mut n = ParticleRecord::new(1, 1, ParticleType::GAS, 0.9, 0.01, vec3f(0.6, 0.2, 0.));
        n.ball = 2.0;
        n.velocity = vec3f(-0.1, 0.1, 0.);

        assert_eq!(pass.is_active(&p), decoded.is_active(&p));

        let mut p1 = p.clone();
        let mut n1 = n.clone();
        pass.prepare_for_smoothing(&mut p1);
        let mut entries = vec![NeighborEntry { dist: n1.position.norm(), particle: NeighborParticle::Local(&mut n1) }];
        pass.evaluate(&mut p1, &mut entries);
        drop(entries);
        pass.finalize(&mut p1);

        let mut p2 = p.clone();
        let mut n2 = n.clone();
        decoded.prepare_for_smoothing(&mut p2);
        let mut entries = vec![NeighborEntry { dist: n2.position.norm(), particle: NeighborParticle::Local(&mut n2) }];
        decoded.evaluate(&mut p2, &mut entries);
        drop(entries);
        decoded.finalize(&mut p2);

        assert_eq!(p1.density, p2.density);
        assert_eq!(p1.hydro.div_v, p2.hydro.div_v);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = sample_passes()[0].to_bytes();
        bytes[0] = 99;
        assert!(matches!(
            SmoothPassKind::from_bytes(&bytes),
            Err(EnvelopeError::UnknownTag(99))
        ));
    }

    #[test]
    fn invalid_decoded_configuration_refuses_to_build() {
        // corrupt the type filter of a mark pass to "no types"
        let pass: SmoothPassKind = MarkNeighbor::new(ParticleType::GAS, 1).unwrap().into();
        let mut bytes = pass.to_bytes();
        bytes[1] = 0;
        bytes[2] = 0;
        bytes[3] = 0;
        bytes[4] = 0;
        assert!(matches!(
            SmoothPassKind::from_bytes(&bytes),
            Err(EnvelopeError::Config(PassConfigError::EmptyTypeFilter))
        ));
    }

    #[test]
    fn truncated_envelope_is_an_io_error() {
        let bytes = sample_passes()[3].to_bytes();
        assert!(matches!(
            SmoothPassKind::from_bytes(&bytes[..bytes.len() - 4]),
            Err(EnvelopeError::Io(_))
        ));
    }
}
