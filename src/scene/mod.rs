//! JSON scene description and the frozen `TraceableScene` the integrators
//! trace against. Intersection is a linear sweep over the primitive list;
//! the scene sizes this renderer targets do not warrant more.

// std
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::cameras::{Camera, CameraSettings};
use crate::core::error::{RenderError, RenderResult};
use crate::core::film::Tonemap;
use crate::core::geometry::{Bounds3f, Point3f, Ray, Vector3f};
use crate::core::lumen::Float;
use crate::core::sampling::Distribution1D;
use crate::core::spectrum::Spectrum;
use crate::integrators::IntegratorSettings;
use crate::materials::Bsdf;
use crate::media::Medium;
use crate::samplers::PathSampleGenerator;
use crate::shapes::{load_instances, InstanceSet, IntersectionInfo, Primitive, Quad, Shape, Sphere};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShapeSettings {
    Quad {
        base: Point3f,
        edge0: Vector3f,
        edge1: Vector3f,
    },
    Sphere {
        center: Point3f,
        radius: Float,
    },
    Point {
        pos: Point3f,
    },
    Infinite,
    Instances {
        file: PathBuf,
        masters: Vec<ShapeSettings>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitiveSettings {
    pub shape: ShapeSettings,
    #[serde(default = "PrimitiveSettings::default_bsdf")]
    pub bsdf: Bsdf,
    #[serde(default)]
    pub emission: Option<Spectrum>,
    #[serde(default)]
    pub int_medium: Option<String>,
    #[serde(default)]
    pub ext_medium: Option<String>,
}

impl PrimitiveSettings {
    fn default_bsdf() -> Bsdf {
        Bsdf::Lambert {
            albedo: Spectrum::new(0.5),
        }
    }
}

fn default_spp() -> u32 {
    32
}

fn default_true() -> bool {
    true
}

fn default_output() -> String {
    "output".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererSettings {
    #[serde(default = "default_spp")]
    pub spp: u32,
    /// 0 selects a doubling schedule.
    #[serde(default)]
    pub spp_step: u32,
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default = "default_true")]
    pub adaptive_sampling: bool,
    #[serde(default = "default_true")]
    pub use_sobol: bool,
    #[serde(default = "default_output")]
    pub output_file: String,
    #[serde(default = "default_true")]
    pub hdr_output: bool,
    #[serde(default)]
    pub save_variance: bool,
    #[serde(default)]
    pub aux_outputs: bool,
    #[serde(default)]
    pub tonemap: Tonemap,
}

impl Default for RendererSettings {
    fn default() -> Self {
        RendererSettings {
            spp: default_spp(),
            spp_step: 0,
            checkpoint: false,
            adaptive_sampling: true,
            use_sobol: true,
            output_file: default_output(),
            hdr_output: true,
            save_variance: false,
            aux_outputs: false,
            tonemap: Tonemap::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneDescription {
    pub resolution: [u32; 2],
    pub camera: CameraSettings,
    #[serde(default)]
    pub media: HashMap<String, Medium>,
    #[serde(default)]
    pub camera_medium: Option<String>,
    pub primitives: Vec<PrimitiveSettings>,
    pub integrator: IntegratorSettings,
    #[serde(default)]
    pub renderer: RendererSettings,
}

impl SceneDescription {
    pub fn from_file(path: &Path) -> RenderResult<Self> {
        let file =
            File::open(path).map_err(|e| RenderError::SceneLoad(format!("{:?}: {}", path, e)))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RenderError::SceneLoad(e.to_string()))
    }
}

pub struct TraceableScene {
    cam: Arc<Camera>,
    primitives: Vec<Arc<Primitive>>,
    lights: Vec<(u32, Arc<Primitive>)>,
    light_distribution: Distribution1D,
    light_pdf_by_prim: Vec<Float>,
    bounds: Bounds3f,
    camera_medium: Option<Arc<Medium>>,
    media: Vec<Arc<Medium>>,
    renderer_settings: RendererSettings,
}

fn build_shape(settings: &ShapeSettings, scene_radius: Float, base_dir: &Path) -> RenderResult<Shape> {
    Ok(match settings {
        ShapeSettings::Quad { base, edge0, edge1 } => Shape::Quad(Quad::new(*base, *edge0, *edge1)),
        ShapeSettings::Sphere { center, radius } => Shape::Sphere(Sphere::new(*center, *radius)),
        ShapeSettings::Point { pos } => Shape::Point { pos: *pos },
        ShapeSettings::Infinite => Shape::InfiniteSphere { scene_radius },
        ShapeSettings::Instances { file, masters } => {
            let path = base_dir.join(file);
            let handle = File::open(&path)
                .map_err(|e| RenderError::SceneLoad(format!("{:?}: {}", path, e)))?;
            let parsed = load_instances(&mut BufReader::new(handle))?;
            let mut master_prims = Vec::new();
            for master in masters {
                let shape = build_shape(master, scene_radius, base_dir)?;
                master_prims.push(Box::new(Primitive::new(
                    shape,
                    Arc::new(PrimitiveSettings::default_bsdf()),
                )));
            }
            Shape::Instances(InstanceSet {
                masters: master_prims,
                master_ids: parsed.master_ids,
                transforms: parsed.transforms,
                bounds: parsed.bounds,
            })
        }
    })
}

impl TraceableScene {
    /// Freeze a scene description into the read-only structure shared by all
    /// workers for the duration of a render.
    pub fn prepare_for_render(desc: &SceneDescription, base_dir: &Path) -> RenderResult<Self> {
        let cam = Arc::new(Camera::new(
            &desc.camera,
            desc.resolution[0],
            desc.resolution[1],
        ));

        let mut media_by_name: HashMap<&str, Arc<Medium>> = HashMap::new();
        let mut media = Vec::new();
        for (name, medium) in &desc.media {
            let arc = Arc::new(medium.clone());
            media.push(arc.clone());
            media_by_name.insert(name.as_str(), arc);
        }
        let lookup_medium = |name: &Option<String>| -> RenderResult<Option<Arc<Medium>>> {
            match name {
                None => Ok(None),
                Some(n) => media_by_name
                    .get(n.as_str())
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| RenderError::SceneLoad(format!("unknown medium {:?}", n))),
            }
        };

        // First pass for finite bounds so infinite emitters know the scene size.
        let mut bounds = Bounds3f::from_point(desc.camera.position);
        for prim in &desc.primitives {
            match &prim.shape {
                ShapeSettings::Quad { base, edge0, edge1 } => {
                    bounds.grow_pnt(base);
                    bounds.grow_pnt(&(*base + *edge0 + *edge1));
                }
                ShapeSettings::Sphere { center, radius } => {
                    let r = Vector3f::new(*radius, *radius, *radius);
                    bounds.grow_pnt(&(*center - r));
                    bounds.grow_pnt(&(*center + r));
                }
                ShapeSettings::Point { pos } => bounds.grow_pnt(pos),
                _ => {}
            }
        }
        let scene_radius = (bounds.diagonal().length() * 0.5).max(1.0);

        let mut primitives = Vec::new();
        let mut lights = Vec::new();
        let mut light_power = Vec::new();
        let mut light_pdf_by_prim = Vec::new();
        for settings in &desc.primitives {
            let shape = build_shape(&settings.shape, scene_radius, base_dir)?;
            let mut prim = Primitive::new(shape, Arc::new(settings.bsdf.clone()));
            prim.emission = settings.emission;
            prim.int_medium = lookup_medium(&settings.int_medium)?;
            prim.ext_medium = lookup_medium(&settings.ext_medium)?;
            let prim = Arc::new(prim);
            if prim.is_emissive() && prim.is_samplable() {
                lights.push((primitives.len() as u32, prim.clone()));
                light_power.push(prim.approximate_radiance());
            }
            light_pdf_by_prim.push(0.0);
            primitives.push(prim);
        }
        if lights.is_empty() {
            tracing::warn!("scene contains no samplable emitters");
        }

        let light_distribution = Distribution1D::new(if light_power.is_empty() {
            vec![1.0]
        } else {
            light_power
        });
        for (i, (prim_idx, _)) in lights.iter().enumerate() {
            light_pdf_by_prim[*prim_idx as usize] = light_distribution.discrete_pdf(i);
        }

        Ok(TraceableScene {
            cam,
            primitives,
            lights,
            light_distribution,
            light_pdf_by_prim,
            bounds,
            camera_medium: lookup_medium(&desc.camera_medium)?,
            media,
            renderer_settings: desc.renderer.clone(),
        })
    }

    pub fn cam(&self) -> &Arc<Camera> {
        &self.cam
    }

    pub fn bounds(&self) -> Bounds3f {
        self.bounds
    }

    pub fn camera_medium(&self) -> Option<Arc<Medium>> {
        self.camera_medium.clone()
    }

    pub fn media(&self) -> &[Arc<Medium>] {
        &self.media
    }

    pub fn renderer_settings(&self) -> &RendererSettings {
        &self.renderer_settings
    }

    pub fn primitive(&self, index: u32) -> &Arc<Primitive> {
        &self.primitives[index as usize]
    }

    pub fn lights(&self) -> &[(u32, Arc<Primitive>)] {
        &self.lights
    }

    pub fn intersect(&self, ray: &mut Ray) -> Option<IntersectionInfo> {
        let mut best: Option<IntersectionInfo> = None;
        for (i, prim) in self.primitives.iter().enumerate() {
            if let Some(mut info) = prim.intersect(ray) {
                info.prim = i as u32;
                best = Some(info);
            }
        }
        best
    }

    pub fn intersect_infinites(&self, ray: &Ray) -> Option<IntersectionInfo> {
        for (i, prim) in self.primitives.iter().enumerate() {
            if let Some(mut info) = prim.intersect_infinite(ray) {
                info.prim = i as u32;
                return Some(info);
            }
        }
        None
    }

    pub fn occluded(&self, ray: &Ray) -> bool {
        self.primitives.iter().any(|prim| prim.occluded(ray))
    }

    pub fn hit_distance(&self, mut ray: Ray) -> Float {
        match self.intersect(&mut ray) {
            Some(_) => ray.t_max,
            None => Float::INFINITY,
        }
    }

    /// Pick an emitter proportionally to its approximate radiance.
    pub fn choose_light(
        &self,
        sampler: &mut PathSampleGenerator,
    ) -> Option<(Arc<Primitive>, Float)> {
        if self.lights.is_empty() {
            return None;
        }
        let u = sampler.next_1d();
        let mut pdf = 0.0;
        let idx = self.light_distribution.sample_discrete(u, Some(&mut pdf));
        let idx = idx.min(self.lights.len() - 1);
        Some((self.lights[idx].1.clone(), pdf))
    }

    /// Selection probability of the emitter behind a primitive index.
    pub fn light_pdf(&self, prim_index: u32) -> Float {
        self.light_pdf_by_prim
            .get(prim_index as usize)
            .copied()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    /// Quad emitter facing a parallel quad wall at unit distance.
    pub fn quad_fixture(resolution: u32) -> SceneDescription {
        SceneDescription {
            resolution: [resolution, resolution],
            camera: CameraSettings {
                position: Point3f::new(0.0, 0.0, -2.0),
                look_at: Point3f::new(0.0, 0.0, 0.5),
                up: Vector3f::new(0.0, 1.0, 0.0),
                fov_degrees: 60.0,
            },
            media: HashMap::new(),
            camera_medium: None,
            primitives: vec![
                // wall at z = 1, facing the camera
                PrimitiveSettings {
                    shape: ShapeSettings::Quad {
                        base: Point3f::new(2.0, -2.0, 1.0),
                        edge0: Vector3f::new(-4.0, 0.0, 0.0),
                        edge1: Vector3f::new(0.0, 4.0, 0.0),
                    },
                    bsdf: Bsdf::Lambert {
                        albedo: Spectrum::new(1.0),
                    },
                    emission: None,
                    int_medium: None,
                    ext_medium: None,
                },
                // emitter at z = 0, facing the wall
                PrimitiveSettings {
                    shape: ShapeSettings::Quad {
                        base: Point3f::new(-0.5, -0.5, 0.0),
                        edge0: Vector3f::new(1.0, 0.0, 0.0),
                        edge1: Vector3f::new(0.0, 1.0, 0.0),
                    },
                    bsdf: Bsdf::Lambert {
                        albedo: Spectrum::new(0.0),
                    },
                    emission: Some(Spectrum::new(1.0)),
                    int_medium: None,
                    ext_medium: None,
                },
            ],
            integrator: IntegratorSettings::default(),
            renderer: RendererSettings {
                use_sobol: false,
                adaptive_sampling: false,
                ..Default::default()
            },
        }
    }

    /// Point light inside a homogeneous isotropic medium.
    pub fn medium_fixture(resolution: u32, sigma: Float) -> SceneDescription {
        let mut media = HashMap::new();
        media.insert(
            "fog".to_string(),
            Medium {
                sigma_a: Spectrum::new(sigma),
                sigma_s: Spectrum::new(sigma),
                phase: crate::media::PhaseFunction::Isotropic,
            },
        );
        SceneDescription {
            resolution: [resolution, resolution],
            camera: CameraSettings {
                position: Point3f::new(0.0, 0.0, -3.0),
                look_at: Point3f::new(0.0, 0.0, 0.0),
                up: Vector3f::new(0.0, 1.0, 0.0),
                fov_degrees: 60.0,
            },
            media,
            camera_medium: Some("fog".to_string()),
            primitives: vec![PrimitiveSettings {
                shape: ShapeSettings::Point {
                    pos: Point3f::new(0.0, 0.0, 0.0),
                },
                bsdf: Bsdf::Lambert {
                    albedo: Spectrum::new(0.0),
                },
                emission: Some(Spectrum::new(4.0 * crate::core::lumen::PI)),
                int_medium: None,
                ext_medium: Some("fog".to_string()),
            }],
            integrator: IntegratorSettings::default(),
            renderer: RendererSettings {
                use_sobol: false,
                adaptive_sampling: false,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::quad_fixture;
    use super::*;

    #[test]
    fn prepare_freezes_lights_and_bounds() {
        let desc = quad_fixture(16);
        let scene = TraceableScene::prepare_for_render(&desc, Path::new(".")).unwrap();
        assert_eq!(scene.lights().len(), 1);
        assert!(scene.bounds().contains(&Point3f::new(0.0, 0.0, 0.5)));
        let mut sampler = PathSampleGenerator::uniform(1);
        let (light, pdf) = scene.choose_light(&mut sampler).unwrap();
        assert!(light.is_emissive());
        assert!((pdf - 1.0).abs() < 1e-6);
        assert_eq!(scene.light_pdf(1), pdf);
    }

    #[test]
    fn intersect_returns_nearest() {
        let desc = quad_fixture(16);
        let scene = TraceableScene::prepare_for_render(&desc, Path::new(".")).unwrap();
        let mut ray = Ray::new(Point3f::new(0.0, 0.0, -2.0), Vector3f::new(0.0, 0.0, 1.0));
        let info = scene.intersect(&mut ray).unwrap();
        // emitter quad at z=0 is closer than the wall at z=1
        assert_eq!(info.prim, 1);
        assert!((ray.t_max - 2.0).abs() < 1e-4);
    }
}
