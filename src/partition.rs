/*!
A minimal orchestrator over horizontally partitioned particles. It drives
the full pass lifecycle: active-set selection, per-tree-build init,
neighbor resolution against an R-tree spanning all partitions, read-through
caching of remote particles as snapshots, kernel evaluation, cache flush
through `combine`, and finalization.

This driver resolves remote reads synchronously; cooperative suspension on
a cache miss belongs to a production traversal and changes nothing about
the pass contract exercised here. `combine` deliveries are sequential per
particle, which provides the required mutual exclusion.
*/

use crate::{
    concurrency::par_iter_mut1,
    config::SmoothConfig,
    floating_type_mod::FT,
    particle::{ExternalParticleView, ParticleRecord},
    smooth::{NeighborEntry, NeighborParticle, SmoothPass, SmoothPassKind},
};
use rstar::{primitives::GeomWithData, RTree};
use std::collections::HashMap;

/// (partition index, particle index). Stable for the duration of a pass;
/// removal of deleted particles happens between passes.
pub type ParticleAddr = (usize, usize);

type TreeElem = GeomWithData<[FT; 3], ParticleAddr>;

/// Owner of a disjoint subset of the particle set.
pub struct Partition {
    pub particles: Vec<ParticleRecord>,
}

pub struct SmoothDomain {
    partitions: Vec<Partition>,
    config: SmoothConfig,
    /// Largest ball of any live particle, tracked only by passes that
    /// participate in the growth heuristic. Bounds the inverse query.
    max_ball: FT,
}

impl SmoothDomain {
    pub fn new(partitions: Vec<Vec<ParticleRecord>>, config: SmoothConfig) -> SmoothDomain {
        SmoothDomain {
            partitions: partitions.into_iter().map(|particles| Partition { particles }).collect(),
            config,
            max_ball: 0.,
        }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn config(&self) -> &SmoothConfig {
        &self.config
    }

    pub fn max_ball(&self) -> FT {
        self.max_ball
    }

    pub fn particle(&self, addr: ParticleAddr) -> &ParticleRecord {
        &self.partitions[addr.0].particles[addr.1]
    }

    pub fn particle_mut(&mut self, addr: ParticleAddr) -> &mut ParticleRecord {
        &mut self.partitions[addr.0].particles[addr.1]
    }

    /// Find a particle by its immutable input order id.
    pub fn by_order(&self, order: u64) -> Option<&ParticleRecord> {
        self.partitions
            .iter()
            .flat_map(|part| part.particles.iter())
            .find(|p| p.order() == order)
    }

    fn build_tree(&self) -> RTree<TreeElem> {
        let elems: Vec<TreeElem> = self
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(pi, part)| {
                part.particles
                    .iter()
                    .enumerate()
                    .map(move |(i, p)| TreeElem::new([p.position.x, p.position.y, p.position.z], (pi, i)))
            })
            .collect();
        RTree::bulk_load(elems)
    }

    /// Run one smoothing pass to logical completion over every partition.
    pub fn run_smooth(&mut self, pass: &SmoothPassKind) {
        for part in &mut self.partitions {
            par_iter_mut1(&mut part.particles, |_, p| pass.prepare_for_traversal(p));
        }

        if pass.grows_ball_max() {
            self.max_ball = self
                .partitions
                .iter()
                .flat_map(|part| part.particles.iter())
                .filter(|p| !p.is_deleted())
                .map(|p| p.ball)
                .fold(0., FT::max);
        }

        let tree = self.build_tree();
        let inverse = pass.marks_inverse_neighbors();

        let active: Vec<ParticleAddr> = self
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(pi, part)| {
                part.particles
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| pass.is_active(p))
                    .map(move |(i, _)| (pi, i))
            })
            .collect();

        for part in &mut self.partitions {
            par_iter_mut1(&mut part.particles, |_, p| {
                if pass.is_active(p) {
                    pass.prepare_for_smoothing(p);
                }
            });
        }

        for pi in 0..self.partitions.len() {
            // read-through cache of this partition's remote fetches
            let mut cache: HashMap<ParticleAddr, ExternalParticleView> = HashMap::new();

            let active_here: Vec<usize> = active.iter().filter(|a| a.0 == pi).map(|a| a.1).collect();
            for i in active_here {
                let (pos, ball) = {
                    let p = &self.partitions[pi].particles[i];
                    (p.position, p.ball)
                };

                let radius = if inverse { self.max_ball } else { ball };
                let mut candidates: Vec<(FT, ParticleAddr)> = Vec::new();
                if radius > 0. {
                    for elem in tree.locate_within_distance([pos.x, pos.y, pos.z], radius * radius) {
                        let addr = elem.data;
                        if addr == (pi, i) {
                            continue;
                        }
                        let q = &self.partitions[addr.0].particles[addr.1];
                        let dist = (q.position - pos).norm();
                        // the inverse relation tests the neighbor's own ball
                        let within = if inverse { dist < q.ball } else { dist < ball };
                        if within {
                            candidates.push((dist, addr));
                        }
                    }
                }
                candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("particle distances are finite"));
                candidates.truncate(self.config.max_neighbors);

                for &(_, addr) in &candidates {
                    if addr.0 != pi && !cache.contains_key(&addr) {
                        let view = pass.prepare_cache_entry(&self.partitions[addr.0].particles[addr.1]);
                        cache.insert(addr, view);
                    }
                }

                let rank: HashMap<ParticleAddr, (usize, FT)> = candidates
                    .iter()
                    .enumerate()
                    .map(|(k, &(dist, addr))| (addr, (k, dist)))
                    .collect();

                let mut p = self.partitions[pi].particles[i].clone();
                {
                    let mut slots: Vec<Option<NeighborEntry>> = (0..candidates.len()).map(|_| None).collect();

                    let locals = &mut self.partitions[pi].particles;
                    for (j, q) in locals.iter_mut().enumerate() {
                        if j == i {
                            continue;
                        }
                        if let Some(&(k, dist)) = rank.get(&(pi, j)) {
                            slots[k] = Some(NeighborEntry {
                                dist,
                                particle: NeighborParticle::Local(q),
                            });
                        }
                    }
                    for (addr, view) in cache.iter_mut() {
                        if let Some(&(k, dist)) = rank.get(addr) {
                            slots[k] = Some(NeighborEntry {
                                dist,
                                particle: NeighborParticle::Cached(view),
                            });
                        }
                    }

                    let mut neighbors: Vec<NeighborEntry> = slots
                        .into_iter()
                        .map(|s| s.expect("every ranked candidate gets an entry"))
                        .collect();

                    if inverse {
                        for entry in neighbors.iter_mut() {
                            entry.particle.mark_neighbor_of_active();
                        }
                    } else {
                        pass.evaluate(&mut p, &mut neighbors);
                    }
                }
                self.partitions[pi].particles[i] = p;
            }

            // merge the partition's remote contributions back into the owners;
            // a target deleted in the meantime silently drops its share
            for (addr, view) in cache {
                let target = &mut self.partitions[addr.0].particles[addr.1];
                if target.is_deleted() {
                    continue;
                }
                pass.combine(target, &view.accum);
            }
        }

        for part in &mut self.partitions {
            par_iter_mut1(&mut part.particles, |_, p| {
                if pass.is_active(p) {
                    pass.finalize(p);
                }
            });
        }
    }

    /// Drop particles marked for deletion. Only valid after the
    /// redistribution pass has consumed them.
    pub fn remove_deleted(&mut self) {
        for part in &mut self.partitions {
            part.particles.retain(|p| !p.is_deleted());
        }
    }
}
