//! Protocol layer between the integrators and the scene: local-frame
//! construction, direct-light estimation, medium transitions, and
//! generalized shadow rays that see through forward (transparency) events.

// std
use std::sync::Arc;
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::geometry::{Ray, TangentFrame, Vector3f};
use crate::core::lumen::{Float, DEFAULT_EPSILON};
use crate::core::records::{LightSample, MediumSample, SurfaceScatterEvent};
use crate::core::sampling::balance_heuristic;
use crate::core::spectrum::Spectrum;
use crate::materials::BsdfLobes;
use crate::media::{Medium, MediumState};
use crate::samplers::PathSampleGenerator;
use crate::scene::TraceableScene;
use crate::shapes::{IntersectionInfo, Primitive};

fn default_max_bounces() -> u32 {
    64
}

fn default_rr_depth() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub min_bounces: u32,
    #[serde(default = "default_max_bounces")]
    pub max_bounces: u32,
    #[serde(default = "default_true")]
    pub enable_light_sampling: bool,
    #[serde(default = "default_true")]
    pub enable_volume_light_sampling: bool,
    /// Russian roulette begins after this bounce.
    #[serde(default = "default_rr_depth")]
    pub rr_depth: u32,
}

impl Default for TraceSettings {
    fn default() -> Self {
        TraceSettings {
            min_bounces: 0,
            max_bounces: default_max_bounces(),
            enable_light_sampling: true,
            enable_volume_light_sampling: true,
            rr_depth: default_rr_depth(),
        }
    }
}

/// Per-worker tracing context shared by every integrator.
pub struct TraceBase {
    pub scene: Arc<TraceableScene>,
    pub settings: TraceSettings,
    pub thread_id: u32,
}

impl TraceBase {
    pub fn new(scene: Arc<TraceableScene>, settings: TraceSettings, thread_id: u32) -> Self {
        TraceBase {
            scene,
            settings,
            thread_id,
        }
    }

    /// Orthonormal frame with +z along the shading normal, incident
    /// direction expressed locally.
    pub fn make_local_scatter_event(
        &self,
        info: &IntersectionInfo,
        ray: &Ray,
    ) -> SurfaceScatterEvent {
        let frame = TangentFrame::from_normal(info.ns.to_vec());
        SurfaceScatterEvent {
            frame,
            wi: frame.to_local(&-ray.d),
            wo: Vector3f::default(),
            weight: Spectrum::new(1.0),
            pdf: 1.0,
            requested_lobe: BsdfLobes::all(),
            sampled_lobe: BsdfLobes::empty(),
        }
    }

    pub fn choose_light_adjoint(
        &self,
        sampler: &mut PathSampleGenerator,
    ) -> Option<(Arc<Primitive>, Float)> {
        self.scene.choose_light(sampler)
    }

    /// Transmittance along a shadow ray, punching through forward events
    /// (transparency, index-matched interfaces) and accumulating medium
    /// transmittance.
    pub fn generalized_shadow_ray(
        &self,
        sampler: &mut PathSampleGenerator,
        ray: &Ray,
        medium: Option<Arc<Medium>>,
        bounce: u32,
    ) -> Spectrum {
        let (tr, _, _) = self.generalized_shadow_ray_and_pdfs(ray, medium, bounce, true, true);
        let _ = sampler;
        tr
    }

    /// Shadow-ray transmittance together with the forward/backward density
    /// products of the traversed media, for bidirectional MIS.
    pub fn generalized_shadow_ray_and_pdfs(
        &self,
        ray: &Ray,
        mut medium: Option<Arc<Medium>>,
        bounce: u32,
        start_on_surface: bool,
        end_on_surface: bool,
    ) -> (Spectrum, Float, Float) {
        let mut transmittance = Spectrum::new(1.0);
        let mut pdf_forward = 1.0;
        let mut pdf_backward = 1.0;

        let mut current = *ray;
        let mut first_segment = true;
        let mut forward_events = 0;
        let max_forward = self.settings.max_bounces.saturating_sub(bounce) + 8;

        loop {
            let mut probe = current;
            let hit = self.scene.intersect(&mut probe);

            let segment_end = match &hit {
                Some(_) => probe.t_max,
                None => current.t_max,
            };
            if let Some(medium) = &medium {
                if segment_end.is_finite() {
                    let seg = Ray::new_segment(current.o, current.d, current.t_min, segment_end);
                    let start_surface = if first_segment { start_on_surface } else { true };
                    let end_surface = hit.is_some() || end_on_surface;
                    let (tr, pf, pb) =
                        medium.transmittance_and_pdfs(&seg, start_surface, end_surface);
                    transmittance *= tr;
                    pdf_forward *= pf;
                    pdf_backward *= pb;
                }
            }

            let info = match hit {
                Some(info) => info,
                None => return (transmittance, pdf_forward, pdf_backward),
            };

            let prim = self.scene.primitive(info.prim);
            if !prim.bsdf.lobes().is_forward() {
                return (Spectrum::default(), pdf_forward, pdf_backward);
            }
            // transparency: attenuate and continue along the same line
            let frame = TangentFrame::from_normal(info.ns.to_vec());
            let event = SurfaceScatterEvent {
                frame,
                wi: frame.to_local(&-current.d),
                ..Default::default()
            }
            .make_forward_query();
            transmittance *= prim.bsdf.eval(&event, false);
            if transmittance.max_component() == 0.0 {
                return (Spectrum::default(), pdf_forward, pdf_backward);
            }
            medium = prim.select_medium(&info, &current.d);

            forward_events += 1;
            if forward_events > max_forward {
                return (Spectrum::default(), pdf_forward, pdf_backward);
            }
            let remaining = if current.t_max.is_finite() {
                current.t_max - probe.t_max
            } else {
                Float::INFINITY
            };
            if remaining <= 0.0 {
                return (transmittance, pdf_forward, pdf_backward);
            }
            current = Ray::new_segment(
                probe.position(probe.t_max),
                current.d,
                info.epsilon.max(DEFAULT_EPSILON),
                remaining,
            );
            first_segment = false;
        }
    }

    fn shadow_to(
        &self,
        sampler: &mut PathSampleGenerator,
        from: &Intersectionish,
        sample: &LightSample,
        medium: Option<Arc<Medium>>,
        bounce: u32,
    ) -> Spectrum {
        let t_max = if sample.dist.is_finite() {
            sample.dist * (1.0 - 1e-4)
        } else {
            Float::INFINITY
        };
        let ray = Ray::new_segment(from.p, sample.d, from.epsilon, t_max);
        let (tr, _, _) =
            self.generalized_shadow_ray_and_pdfs(&ray, medium, bounce, from.on_surface, true);
        let _ = sampler;
        tr
    }

    /// One-sample next-event estimation at a surface vertex: a light sample
    /// MIS-weighted against the BSDF density, plus a BSDF sample
    /// MIS-weighted against the light's direct density.
    pub fn estimate_direct(
        &self,
        event: &SurfaceScatterEvent,
        info: &IntersectionInfo,
        sampler: &mut PathSampleGenerator,
        medium: Option<Arc<Medium>>,
        bounce: u32,
        adjoint: bool,
    ) -> Spectrum {
        let (light, light_pdf) = match self.choose_light_adjoint(sampler) {
            Some(pair) => pair,
            None => return Spectrum::default(),
        };
        let bsdf = self.scene.primitive(info.prim).bsdf.clone();
        let mut result = Spectrum::default();

        // light-sampling half
        let mut light_sample = LightSample::default();
        if light.sample_direct(sampler, &info.p, &mut light_sample) && light_sample.pdf > 0.0 {
            let query = event.make_warped_query(event.wi, event.frame.to_local(&light_sample.d));
            let f = bsdf.eval(&query, adjoint);
            if f.max_component() > 0.0 {
                let from = Intersectionish {
                    p: info.p,
                    epsilon: info.epsilon,
                    on_surface: true,
                };
                let tr = self.shadow_to(sampler, &from, &light_sample, medium.clone(), bounce);
                if tr.max_component() > 0.0 {
                    let radiance = light.direct_radiance(&light_sample);
                    let weight = if light.is_dirac() {
                        1.0
                    } else {
                        balance_heuristic(light_sample.pdf, bsdf.pdf(&query))
                    };
                    result += f * tr * radiance * (weight / (light_sample.pdf * light_pdf));
                }
            }
        }

        // BSDF-sampling half; Dirac emitters cannot be hit this way
        if !light.is_dirac() && !bsdf.is_dirac() {
            let mut bsdf_event = *event;
            bsdf_event.requested_lobe = BsdfLobes::all();
            if bsdf.sample(&mut bsdf_event, sampler, adjoint)
                && !bsdf_event.sampled_lobe.is_pure_specular()
            {
                let wo = event.frame.to_global(&bsdf_event.wo);
                let mut probe = Ray::new_segment(
                    info.p,
                    wo,
                    info.epsilon,
                    Float::INFINITY,
                );
                let hit = self.scene.intersect(&mut probe);
                let hit_light = match &hit {
                    Some(hit_info) => Arc::ptr_eq(self.scene.primitive(hit_info.prim), &light),
                    None => light.is_infinite(),
                };
                if hit_light {
                    let (direct_pdf, radiance) = match &hit {
                        Some(hit_info) => (
                            light.direct_pdf(hit_info, &info.p) * light_pdf,
                            light.eval_direct(hit_info, &wo),
                        ),
                        None => {
                            let env_info = light
                                .intersect_infinite(&probe)
                                .unwrap_or_default();
                            (
                                light.direct_pdf(&env_info, &info.p) * light_pdf,
                                light.eval_direct(&env_info, &wo),
                            )
                        }
                    };
                    if radiance.max_component() > 0.0 && bsdf_event.pdf > 0.0 {
                        let tr = match &medium {
                            Some(m) => {
                                let seg = Ray::new_segment(
                                    info.p,
                                    wo,
                                    info.epsilon,
                                    probe.t_max.min(1e30),
                                );
                                m.transmittance(&seg)
                            }
                            None => Spectrum::new(1.0),
                        };
                        let weight = balance_heuristic(bsdf_event.pdf, direct_pdf);
                        result +=
                            bsdf_event.weight * tr * radiance * weight;
                    }
                }
            }
        }

        result
    }

    /// Next-event estimation from a point inside a medium.
    pub fn volume_estimate_direct(
        &self,
        medium_sample: &MediumSample,
        ray_dir: &Vector3f,
        sampler: &mut PathSampleGenerator,
        medium: &Arc<Medium>,
        bounce: u32,
    ) -> Spectrum {
        let (light, light_pdf) = match self.choose_light_adjoint(sampler) {
            Some(pair) => pair,
            None => return Spectrum::default(),
        };
        let mut light_sample = LightSample::default();
        if !light.sample_direct(sampler, &medium_sample.p, &mut light_sample)
            || light_sample.pdf <= 0.0
        {
            return Spectrum::default();
        }
        let phase = medium_sample.phase;
        let f = phase.eval(ray_dir, &light_sample.d);
        if f <= 0.0 {
            return Spectrum::default();
        }
        let from = Intersectionish {
            p: medium_sample.p,
            epsilon: 0.0,
            on_surface: false,
        };
        let tr = self.shadow_to(sampler, &from, &light_sample, Some(medium.clone()), bounce);
        if tr.max_component() == 0.0 {
            return Spectrum::default();
        }
        let radiance = light.direct_radiance(&light_sample);
        let weight = if light.is_dirac() {
            1.0
        } else {
            balance_heuristic(light_sample.pdf, phase.pdf(ray_dir, &light_sample.d))
        };
        tr * radiance * (f * weight / (light_sample.pdf * light_pdf))
    }

    /// Scatter at a surface: optional next-event estimation, then a BSDF
    /// sample driving the continuation ray and the medium transition.
    /// Returns false when the path terminates here.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_surface(
        &self,
        event: &mut SurfaceScatterEvent,
        info: &IntersectionInfo,
        sampler: &mut PathSampleGenerator,
        medium: &mut Option<Arc<Medium>>,
        bounce: u32,
        adjoint: bool,
        enable_light_sampling: bool,
        ray: &mut Ray,
        throughput: &mut Spectrum,
        emission: &mut Spectrum,
        was_specular: &mut bool,
    ) -> bool {
        let prim = self.scene.primitive(info.prim).clone();
        let bsdf = prim.bsdf.clone();

        // direct emitter hits count only when next-event estimation could
        // not have produced this path
        if !adjoint
            && prim.is_emissive()
            && bounce >= self.settings.min_bounces
            && (!enable_light_sampling || *was_specular || !prim.is_samplable())
        {
            *emission += *throughput * prim.eval_direct(info, &ray.d);
        }

        if !adjoint
            && enable_light_sampling
            && !bsdf.lobes().is_pure_specular()
            && !bsdf.lobes().is_forward()
            && bounce + 1 >= self.settings.min_bounces
            && bounce + 1 < self.settings.max_bounces
        {
            *emission += *throughput
                * self.estimate_direct(event, info, sampler, medium.clone(), bounce, adjoint);
        }

        event.requested_lobe = BsdfLobes::all() | BsdfLobes::FORWARD;
        if !bsdf.sample(event, sampler, adjoint) {
            return false;
        }
        if event.weight.max_component() <= 0.0 {
            return false;
        }
        let wo = event.frame.to_global(&event.wo);
        *throughput *= event.weight;
        *was_specular = bsdf.lobes().is_pure_specular() || event.sampled_lobe.is_forward();
        *medium = prim.select_medium(info, &wo);
        *ray = ray.scatter(info.p, wo, info.epsilon.max(DEFAULT_EPSILON));
        true
    }

    /// Advance through a medium segment: sample a scattering distance and
    /// either scatter via the phase function or hand control back to the
    /// surface at the segment end. `hit_surface` reports which happened.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_volume(
        &self,
        sampler: &mut PathSampleGenerator,
        medium: &Arc<Medium>,
        bounce: u32,
        adjoint: bool,
        enable_light_sampling: bool,
        ray: &mut Ray,
        throughput: &mut Spectrum,
        emission: &mut Spectrum,
        was_specular: &mut bool,
        hit_surface: &mut bool,
        state: &mut MediumState,
        sample_out: Option<&mut MediumSample>,
    ) -> bool {
        let mut sample = MediumSample::default();
        if !medium.sample_distance(sampler, ray, state, &mut sample) {
            return false;
        }
        *throughput *= sample.weight;
        *hit_surface = sample.exited;

        if !sample.exited {
            if !adjoint
                && enable_light_sampling
                && self.settings.enable_volume_light_sampling
                && bounce + 1 >= self.settings.min_bounces
                && bounce + 1 < self.settings.max_bounces
            {
                *emission += *throughput
                    * self.volume_estimate_direct(&sample, &ray.d, sampler, medium, bounce);
            }
            let phase_sample = sample.phase.sample(&ray.d, sampler);
            *throughput *= phase_sample.weight;
            *was_specular = false;
            let mut next = Ray::new(sample.p, phase_sample.w);
            next.bounce = ray.bounce + 1;
            *ray = next;
        }
        if let Some(out) = sample_out {
            *out = sample;
        }
        true
    }
}

/// Minimal origin description for shadow rays (surface or volume point).
struct Intersectionish {
    p: crate::core::geometry::Point3f,
    epsilon: Float,
    on_surface: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::testutil::quad_fixture;
    use crate::scene::TraceableScene;
    use std::path::Path;

    fn fixture() -> Arc<TraceableScene> {
        Arc::new(TraceableScene::prepare_for_render(&quad_fixture(8), Path::new(".")).unwrap())
    }

    #[test]
    fn shadow_ray_blocked_by_wall() {
        let scene = fixture();
        let tracer = TraceBase::new(scene, TraceSettings::default(), 0);
        let mut sampler = PathSampleGenerator::uniform(1);
        // passes through the wall at z=1
        let ray = Ray::new_segment(
            crate::core::geometry::Point3f::new(0.0, 0.0, -1.0),
            Vector3f::new(0.0, 0.0, 1.0),
            1e-4,
            5.0,
        );
        let tr = tracer.generalized_shadow_ray(&mut sampler, &ray, None, 0);
        assert_eq!(tr, Spectrum::default());

        // parallel to everything: unoccluded
        let ray = Ray::new_segment(
            crate::core::geometry::Point3f::new(0.0, 0.0, -1.0),
            Vector3f::new(1.0, 0.0, 0.0),
            1e-4,
            5.0,
        );
        let tr = tracer.generalized_shadow_ray(&mut sampler, &ray, None, 0);
        assert_eq!(tr, Spectrum::new(1.0));
    }

    #[test]
    fn transparency_attenuates_but_passes() {
        use crate::materials::Bsdf;
        use crate::scene::{PrimitiveSettings, ShapeSettings};
        use crate::core::geometry::{Point3f, Vector3f as V};

        let mut desc = quad_fixture(8);
        desc.primitives.push(PrimitiveSettings {
            shape: ShapeSettings::Quad {
                base: Point3f::new(-2.0, -2.0, -0.5),
                edge0: V::new(4.0, 0.0, 0.0),
                edge1: V::new(0.0, 4.0, 0.0),
            },
            bsdf: Bsdf::Transparency {
                color: Spectrum::new(0.5),
            },
            emission: None,
            int_medium: None,
            ext_medium: None,
        });
        let scene =
            Arc::new(TraceableScene::prepare_for_render(&desc, Path::new(".")).unwrap());
        let tracer = TraceBase::new(scene, TraceSettings::default(), 0);
        let mut sampler = PathSampleGenerator::uniform(1);
        // from behind the transparent sheet toward open space at x
        let ray = Ray::new_segment(
            Point3f::new(0.0, 1.5, -1.0),
            V::new(0.0, 0.0, -1.0),
            1e-4,
            5.0,
        );
        let tr = tracer.generalized_shadow_ray(&mut sampler, &ray, None, 0);
        assert_eq!(tr, Spectrum::new(1.0));

        let ray = Ray::new_segment(
            Point3f::new(0.0, 1.5, 0.5),
            V::new(0.0, 0.0, -1.0),
            1e-4,
            5.0,
        );
        let tr = tracer.generalized_shadow_ray(&mut sampler, &ray, None, 0);
        // one transparent sheet between origin and the far side
        assert_eq!(tr, Spectrum::new(0.5));
    }
}
