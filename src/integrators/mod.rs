//! The integrator family. Deep virtual hierarchies map to one tagged
//! variant with method dispatch; the scene description selects a variant by
//! its `type` tag.

pub mod bdpt;
pub mod light_tracer;
pub mod mlt;
pub mod path_tracer;
pub mod photon_map;
pub mod progressive_photon_map;
pub mod trace_base;

// std
use std::io::{Read, Write};
use std::sync::Arc;
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::error::RenderResult;
use crate::core::film::Film;
use crate::renderer::thread_pool::ThreadPool;
use crate::scene::TraceableScene;

pub use bdpt::{BdptIntegrator, BdptSettings};
pub use light_tracer::{LightTraceIntegrator, LightTracerSettings};
pub use mlt::kelemen::{KelemenMltIntegrator, KelemenMltSettings};
pub use mlt::multiplexed::{MultiplexedMltIntegrator, MultiplexedMltSettings};
pub use mlt::reversible_jump::{ReversibleJumpMltIntegrator, ReversibleJumpMltSettings};
pub use path_tracer::{PathTraceIntegrator, PathTracerSettings};
pub use photon_map::{PhotonMapIntegrator, PhotonMapSettings};
pub use progressive_photon_map::{
    ProgressivePhotonMapIntegrator, ProgressivePhotonMapSettings,
};
pub use trace_base::{TraceBase, TraceSettings};

pub const INTEGRATOR_TAG_PATH_TRACER: u8 = 0;
pub const INTEGRATOR_TAG_LIGHT_TRACER: u8 = 1;
pub const INTEGRATOR_TAG_BDPT: u8 = 2;
pub const INTEGRATOR_TAG_PHOTON_MAP: u8 = 3;
pub const INTEGRATOR_TAG_PROGRESSIVE_PHOTON_MAP: u8 = 4;
pub const INTEGRATOR_TAG_KELEMEN_MLT: u8 = 5;
pub const INTEGRATOR_TAG_MULTIPLEXED_MLT: u8 = 6;
pub const INTEGRATOR_TAG_REVERSIBLE_JUMP_MLT: u8 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegratorSettings {
    PathTracer(PathTracerSettings),
    LightTracer(LightTracerSettings),
    Bdpt(BdptSettings),
    PhotonMap(PhotonMapSettings),
    ProgressivePhotonMap(ProgressivePhotonMapSettings),
    KelemenMlt(KelemenMltSettings),
    MultiplexedMlt(MultiplexedMltSettings),
    ReversibleJumpMlt(ReversibleJumpMltSettings),
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        IntegratorSettings::PathTracer(PathTracerSettings::default())
    }
}

pub enum Integrator {
    PathTracer(PathTraceIntegrator),
    LightTracer(LightTraceIntegrator),
    Bdpt(BdptIntegrator),
    PhotonMap(PhotonMapIntegrator),
    ProgressivePhotonMap(ProgressivePhotonMapIntegrator),
    KelemenMlt(KelemenMltIntegrator),
    MultiplexedMlt(MultiplexedMltIntegrator),
    ReversibleJumpMlt(ReversibleJumpMltIntegrator),
}

macro_rules! dispatch {
    ($self:expr, $name:ident ( $($arg:expr),* )) => {
        match $self {
            Integrator::PathTracer(i) => i.$name($($arg),*),
            Integrator::LightTracer(i) => i.$name($($arg),*),
            Integrator::Bdpt(i) => i.$name($($arg),*),
            Integrator::PhotonMap(i) => i.$name($($arg),*),
            Integrator::ProgressivePhotonMap(i) => i.$name($($arg),*),
            Integrator::KelemenMlt(i) => i.$name($($arg),*),
            Integrator::MultiplexedMlt(i) => i.$name($($arg),*),
            Integrator::ReversibleJumpMlt(i) => i.$name($($arg),*),
        }
    };
}

impl Integrator {
    pub fn from_settings(settings: &IntegratorSettings) -> Self {
        match settings {
            IntegratorSettings::PathTracer(s) => {
                Integrator::PathTracer(PathTraceIntegrator::new(s.clone()))
            }
            IntegratorSettings::LightTracer(s) => {
                Integrator::LightTracer(LightTraceIntegrator::new(s.clone()))
            }
            IntegratorSettings::Bdpt(s) => Integrator::Bdpt(BdptIntegrator::new(s.clone())),
            IntegratorSettings::PhotonMap(s) => {
                Integrator::PhotonMap(PhotonMapIntegrator::new(s.clone()))
            }
            IntegratorSettings::ProgressivePhotonMap(s) => Integrator::ProgressivePhotonMap(
                ProgressivePhotonMapIntegrator::new(s.clone()),
            ),
            IntegratorSettings::KelemenMlt(s) => {
                Integrator::KelemenMlt(KelemenMltIntegrator::new(s.clone()))
            }
            IntegratorSettings::MultiplexedMlt(s) => {
                Integrator::MultiplexedMlt(MultiplexedMltIntegrator::new(s.clone()))
            }
            IntegratorSettings::ReversibleJumpMlt(s) => {
                Integrator::ReversibleJumpMlt(ReversibleJumpMltIntegrator::new(s.clone()))
            }
        }
    }

    pub fn prepare_for_render(
        &mut self,
        scene: Arc<TraceableScene>,
        film: Arc<Film>,
        pool: Arc<ThreadPool>,
        seed: u32,
    ) {
        dispatch!(self, prepare_for_render(scene, film, pool, seed))
    }

    pub fn teardown_after_render(&mut self) {
        dispatch!(self, teardown_after_render())
    }

    pub fn done(&self) -> bool {
        dispatch!(self, done())
    }

    pub fn current_spp(&self) -> u32 {
        dispatch!(self, current_spp())
    }

    pub fn start_render(&mut self) {
        dispatch!(self, start_render())
    }

    pub fn wait_for_completion(&mut self) {
        dispatch!(self, wait_for_completion())
    }

    pub fn abort_render(&mut self) {
        dispatch!(self, abort_render())
    }

    pub fn supports_resume(&self) -> bool {
        matches!(self, Integrator::PathTracer(_) | Integrator::Bdpt(_))
    }

    pub fn save_state<W: Write>(&mut self, out: &mut W) -> RenderResult<()> {
        dispatch!(self, save_state(out))
    }

    pub fn load_state<R: Read>(&mut self, input: &mut R) -> RenderResult<()> {
        dispatch!(self, load_state(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_by_type_tag() {
        let parsed: IntegratorSettings =
            serde_json::from_str(r#"{"type": "path_tracer", "max_bounces": 12}"#).unwrap();
        match parsed {
            IntegratorSettings::PathTracer(s) => assert_eq!(s.trace.max_bounces, 12),
            _ => panic!("wrong variant"),
        }

        let parsed: IntegratorSettings = serde_json::from_str(
            r#"{"type": "photon_map", "photon_count": 1000, "volume_photon_type": "beams"}"#,
        )
        .unwrap();
        match parsed {
            IntegratorSettings::PhotonMap(s) => {
                assert_eq!(s.photon_count, 1000);
                assert_eq!(
                    s.volume_photon_type,
                    crate::integrators::photon_map::VolumePhotonType::Beams
                );
            }
            _ => panic!("wrong variant"),
        }
    }
}
