//! Progressive photon mapping: each segment shoots a fresh photon batch and
//! rebuilds the structures with radii shrunk through the
//! `(k + alpha)/(k + 1)` schedule, so the accumulated estimate is
//! consistent as the iteration count grows.

// std
use std::sync::Arc;
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::error::RenderResult;
use crate::core::film::Film;
use crate::core::lumen::Float;
use crate::integrators::photon_map::{PhotonMapIntegrator, PhotonMapSettings};
use crate::renderer::thread_pool::ThreadPool;
use crate::scene::TraceableScene;

fn default_alpha() -> Float {
    0.3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressivePhotonMapSettings {
    #[serde(flatten)]
    pub photon_map: PhotonMapSettings,
    /// radius shrink exponent, in (0, 1)
    #[serde(default = "default_alpha")]
    pub alpha: Float,
}

impl Default for ProgressivePhotonMapSettings {
    fn default() -> Self {
        ProgressivePhotonMapSettings {
            photon_map: PhotonMapSettings::default(),
            alpha: default_alpha(),
        }
    }
}

pub struct ProgressivePhotonMapIntegrator {
    inner: PhotonMapIntegrator,
}

impl ProgressivePhotonMapIntegrator {
    pub fn new(settings: ProgressivePhotonMapSettings) -> Self {
        ProgressivePhotonMapIntegrator {
            inner: PhotonMapIntegrator::new_progressive(settings.photon_map, settings.alpha),
        }
    }

    pub fn prepare_for_render(
        &mut self,
        scene: Arc<TraceableScene>,
        film: Arc<Film>,
        pool: Arc<ThreadPool>,
        seed: u32,
    ) {
        self.inner.prepare_for_render(scene, film, pool, seed);
    }

    pub fn teardown_after_render(&mut self) {
        self.inner.teardown_after_render();
    }

    pub fn done(&self) -> bool {
        self.inner.done()
    }

    pub fn current_spp(&self) -> u32 {
        self.inner.current_spp()
    }

    pub fn start_render(&mut self) {
        self.inner.start_render();
    }

    pub fn wait_for_completion(&mut self) {
        self.inner.wait_for_completion();
    }

    pub fn abort_render(&mut self) {
        self.inner.abort_render();
    }

    pub fn save_state<W: std::io::Write>(&mut self, out: &mut W) -> RenderResult<()> {
        self.inner.save_state(out)
    }

    pub fn load_state<R: std::io::Read>(&mut self, input: &mut R) -> RenderResult<()> {
        self.inner.load_state(input)
    }
}
