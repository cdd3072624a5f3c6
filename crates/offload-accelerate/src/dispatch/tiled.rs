//! 2-D tiled dispatch: each work-item owns one `tile x tile` output block.

use log::info;
use offload_api::{OffloadError, Result, WorkExtent};

use super::common::pad_to;
use super::KernelDispatcher;
use crate::binder::KernelLaunch;
use crate::kernels::{GEMM_TILE, GEMM_WORKGROUP};
use crate::profiler::{ProfileSummary, ProfilingSample};

/// Output extent padded to whole tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub width: u32,
    pub height: u32,
    pub tile: u32,
}

impl TilePlan {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_tile(width, height, GEMM_TILE)
    }

    pub fn with_tile(width: u32, height: u32, tile: u32) -> Self {
        let tile = tile.max(1);
        Self {
            width: pad_to(width, tile),
            height: pad_to(height, tile),
            tile,
        }
    }

    /// One work-item per block: `(width / tile, height / tile)`.
    pub fn global(&self) -> WorkExtent {
        WorkExtent::D2(self.width / self.tile, self.height / self.tile)
    }

    pub fn local(&self) -> WorkExtent {
        WorkExtent::D2(GEMM_WORKGROUP[0], GEMM_WORKGROUP[1])
    }

    /// Top-left `(row, col)` of the block owned by each work-item.
    pub fn blocks(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let [gx, gy, _] = self.global().dims();
        (0..gy).flat_map(move |y| (0..gx).map(move |x| (y * self.tile, x * self.tile)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TiledOutcome {
    pub samples: Vec<ProfilingSample>,
    pub summary: ProfileSummary,
}

impl TiledOutcome {
    pub fn mean_ms(&self) -> f64 {
        self.summary.mean_ms()
    }
}

/// One untimed warm-up launch and a drain, then `iterations` timed launches.
pub fn run_tiled(
    dispatcher: &mut KernelDispatcher<'_>,
    launch: &KernelLaunch<'_>,
    iterations: u32,
) -> Result<TiledOutcome> {
    if iterations == 0 {
        return Err(OffloadError::Dispatch(
            "tiled dispatch needs at least one timed iteration".to_string(),
        ));
    }
    let warm = dispatcher.warm_up(launch)?;
    warm.wait()?;
    dispatcher.drain()?;

    let mut samples = Vec::with_capacity(iterations as usize);
    for _ in 0..iterations {
        let completion = dispatcher.launch(launch, None)?;
        if let Some(sample) = dispatcher.complete(&completion)? {
            samples.push(sample);
        }
    }
    dispatcher.drain()?;
    let summary: ProfileSummary = samples.iter().collect();
    info!(
        "tiled: {} on {:?}, {} timed launches, mean {:.4} ms",
        launch.kernel().entry(),
        launch.global(),
        iterations,
        summary.mean_ms()
    );
    Ok(TiledOutcome { samples, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn pads_to_whole_tiles() {
        let plan = TilePlan::new(4095, 6);
        assert_eq!((plan.width, plan.height), (4096, 8));
        assert_eq!(plan.global(), WorkExtent::D2(1024, 2));
    }

    #[test]
    fn every_element_covered_once() {
        for (w, h) in [(4, 4), (8, 12), (13, 5), (1, 1)] {
            let plan = TilePlan::new(w, h);
            let mut hits: HashMap<(u32, u32), u32> = HashMap::new();
            for (row, col) in plan.blocks() {
                for r in row..row + plan.tile {
                    for c in col..col + plan.tile {
                        *hits.entry((r, c)).or_default() += 1;
                    }
                }
            }
            assert_eq!(hits.len() as u32, plan.width * plan.height);
            assert!(hits.values().all(|&n| n == 1));
            assert!(hits.keys().all(|&(r, c)| r < plan.height && c < plan.width));
        }
    }
}
