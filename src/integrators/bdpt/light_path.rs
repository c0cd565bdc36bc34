//! Subpath container and the bidirectional algebra on top of it: pruning to
//! area measure, balance-heuristic MIS over all techniques of a path
//! length, tip connections, camera splats, and sample-space inversion for
//! reversible-jump chains.

// others
use smallvec::SmallVec;
// lumen
use crate::core::geometry::{Point2f, Ray};
use crate::core::lumen::Float;
use crate::core::spectrum::Spectrum;
use crate::integrators::bdpt::vertex::{PathEdge, PathVertex, TraceState};
use crate::integrators::trace_base::TraceBase;
use crate::samplers::{PathSampleGenerator, WritableSampler};
use crate::scene::TraceableScene;

type VertexVec = SmallVec<[PathVertex; 8]>;
type EdgeVec = SmallVec<[PathEdge; 8]>;
type Scratch = SmallVec<[Float; 16]>;

pub struct LightPath {
    max_length: usize,
    adjoint: bool,
    vertices: VertexVec,
    edges: EdgeVec,
    /// original index of each retained vertex before forward collapse
    vertex_index: SmallVec<[usize; 16]>,
}

impl LightPath {
    pub fn new(max_length: usize) -> Self {
        LightPath {
            max_length,
            adjoint: false,
            vertices: SmallVec::new(),
            edges: SmallVec::new(),
            vertex_index: SmallVec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.edges.clear();
        self.vertex_index.clear();
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex(&self, i: usize) -> &PathVertex {
        &self.vertices[i]
    }

    pub fn edge(&self, i: usize) -> &PathEdge {
        &self.edges[i]
    }

    pub fn vertex_index(&self, i: usize) -> usize {
        self.vertex_index[i]
    }

    pub fn start_camera_path(
        &mut self,
        camera: std::sync::Arc<crate::cameras::Camera>,
        pixel: Option<crate::core::geometry::Point2i>,
    ) {
        self.clear();
        self.adjoint = false;
        self.vertices.push(PathVertex::camera_root(camera, pixel));
    }

    pub fn start_emitter_path(
        &mut self,
        emitter: std::sync::Arc<crate::shapes::Primitive>,
        emitter_pdf: Float,
    ) {
        self.clear();
        self.adjoint = true;
        self.vertices.push(PathVertex::emitter_root(emitter, emitter_pdf));
    }

    /// Extend the subpath up to `length` vertices, then prune to area
    /// measure.
    pub fn trace(
        &mut self,
        scene: &TraceableScene,
        tracer: &TraceBase,
        sampler: &mut PathSampleGenerator,
        length: Option<usize>,
    ) {
        let target = length.unwrap_or(self.max_length).min(self.max_length);
        let adjoint = self.adjoint;
        let mut state = TraceState::new(sampler);
        if !adjoint {
            state.medium = scene.camera_medium();
        }
        if self.vertices.is_empty() || !self.vertices[0].sample_root_vertex(&mut state) {
            self.vertices.clear();
            return;
        }

        while self.vertices.len() < target {
            let len = self.vertices.len();
            let LightPath {
                vertices, edges, ..
            } = self;
            let (head, tail) = vertices.split_at_mut(len - 1);
            let current = &mut tail[0];
            let prev = head.last_mut();
            let prev_edge = if len >= 2 {
                edges.get_mut(len - 2)
            } else {
                None
            };
            let extended =
                current.sample_next_vertex(scene, tracer, &mut state, adjoint, prev, prev_edge);
            match extended {
                Some((vertex, edge)) => {
                    state.sampler.advance_path();
                    self.vertices.push(vertex);
                    self.edges.push(edge);
                }
                None => break,
            }
        }

        // Trim tip vertices no technique can connect to; terminal infinite
        // surfaces stay for the pure-camera technique.
        while let Some(last) = self.vertices.last() {
            if self.vertices.len() <= 1 || last.connectable() || last.is_infinite_surface() {
                break;
            }
            self.vertices.pop();
            self.edges.pop();
        }

        self.prune();
    }

    /// Collapse forward events and convert vertex densities to area
    /// measure.
    pub fn prune(&mut self) {
        let length = self.vertices.len();
        if length == 0 {
            return;
        }
        self.vertex_index.clear();
        self.vertex_index.push(0);

        // Step 1: forward chains are punched through by the generalized
        // shadow ray, so the vertices are removed and their pdfs folded
        // into the surviving edge, which is extended accordingly.
        let mut insertion = 1_usize;
        for i in 1..length {
            if i + 1 < length && self.vertices[i].is_forward() {
                let tail = insertion - 1;
                self.edges[tail].r += self.edges[i].r;
                self.edges[tail].pdf_forward *=
                    self.edges[i].pdf_forward * self.vertices[i + 1].pdf_forward();
                self.edges[tail].pdf_backward *=
                    self.edges[i].pdf_backward * self.vertices[tail].pdf_backward();
                let fwd = self.vertices[i].pdf_forward();
                let bwd = self.vertices[i].pdf_backward();
                *self.vertices[tail].pdf_backward_mut() = bwd;
                *self.vertices[i + 1].pdf_forward_mut() = fwd;
            } else {
                self.vertex_index.push(i);
                self.vertices.swap(insertion, i);
                if i < self.edges.len() {
                    self.edges.swap(insertion, i);
                }
                insertion += 1;
            }
        }
        self.vertices.truncate(insertion);
        self.edges.truncate(insertion.saturating_sub(1));
        let length = insertion;

        // Step 2: recompute squared lengths and fold transmittance pdfs
        // onto the vertices.
        for i in 1..length {
            self.edges[i - 1].r_sq = self.edges[i - 1].r * self.edges[i - 1].r;
            let ef = self.edges[i - 1].pdf_forward;
            let eb = self.edges[i - 1].pdf_backward;
            *self.vertices[i].pdf_forward_mut() *= ef;
            *self.vertices[i - 1].pdf_backward_mut() *= eb;
        }

        // Step 3: convert to area measure. Dirac vertices stay discrete,
        // infinite emitters stay in solid angle.
        for i in 1..length {
            if self.vertices[i - 1].is_dirac() || self.vertices[i].is_infinite_surface() {
                continue;
            }
            if self.vertices[i].on_surface() {
                let cos = self.vertices[i].cosine_factor(&self.edges[i - 1].d);
                *self.vertices[i].pdf_forward_mut() *= cos;
            }
            if !self.vertices[i - 1].is_infinite_emitter() {
                let r_sq = self.edges[i - 1].r_sq.max(1e-12);
                *self.vertices[i].pdf_forward_mut() /= r_sq;
            }
        }
        for i in (0..length.saturating_sub(2)).rev() {
            if self.vertices[i + 1].is_dirac() || self.vertices[i].is_infinite_emitter() {
                continue;
            }
            if self.vertices[i].on_surface() {
                let cos = self.vertices[i].cosine_factor(&self.edges[i].d);
                *self.vertices[i].pdf_backward_mut() *= cos;
            }
            let r_sq = self.edges[i].r_sq.max(1e-12);
            *self.vertices[i].pdf_backward_mut() /= r_sq;
        }
    }

    /// Densities of Dirac-adjacent vertices are re-expressed in projected
    /// solid angle to keep technique ratios meaningful.
    fn inv_geometry_factor(&self, start: usize) -> Float {
        let edge = &self.edges[start];
        let v0 = &self.vertices[start];
        let v1 = &self.vertices[start + 1];
        edge.r_sq / (v0.cosine_factor(&edge.d) * v1.cosine_factor(&edge.d)).max(1e-12)
    }

    /// Balance-heuristic weight of the (s, t) technique over all
    /// techniques producing this path. `ratios[i]` receives the relative
    /// density of technique i when requested.
    #[allow(clippy::too_many_arguments)]
    fn mis_weight(
        camera: &LightPath,
        emitter: &LightPath,
        edge: &PathEdge,
        s: usize,
        t: usize,
        ratios: Option<&mut [Float]>,
    ) -> Float {
        let n = s + t;
        if !camera.vertices[t - 1].segment_connectable(&emitter.vertices[s - 1]) {
            return 0.0;
        }

        let mut pdf_forward: Scratch = SmallVec::from_elem(0.0, n);
        let mut pdf_backward: Scratch = SmallVec::from_elem(0.0, n);
        let mut connectable: SmallVec<[bool; 16]> = SmallVec::from_elem(false, n);

        for i in 0..s {
            pdf_forward[i] = emitter.vertices[i].pdf_forward();
            pdf_backward[i] = emitter.vertices[i].pdf_backward();
            connectable[i] = !emitter.vertices[i].is_dirac();
        }
        for i in 0..t {
            pdf_forward[n - (i + 1)] = camera.vertices[i].pdf_backward();
            pdf_backward[n - (i + 1)] = camera.vertices[i].pdf_forward();
            connectable[n - (i + 1)] = !camera.vertices[i].is_dirac();
        }
        connectable[s - 1] = true;
        connectable[s] = true;

        {
            let (fwd_at_s, bwd_before) = {
                let mut fwd = 0.0;
                let mut bwd = 0.0;
                emitter.vertices[s - 1].eval_pdfs(
                    if s >= 2 {
                        Some(&emitter.vertices[s - 2])
                    } else {
                        None
                    },
                    if s >= 2 { Some(&emitter.edges[s - 2]) } else { None },
                    &camera.vertices[t - 1],
                    edge,
                    &mut fwd,
                    if s >= 2 { Some(&mut bwd) } else { None },
                );
                (fwd, bwd)
            };
            pdf_forward[s] = fwd_at_s;
            if s >= 2 {
                pdf_backward[s - 2] = bwd_before;
            }
        }
        {
            let (bwd_at_tip, fwd_after) = {
                let mut fwd = 0.0;
                let mut bwd = 0.0;
                camera.vertices[t - 1].eval_pdfs(
                    if t >= 2 {
                        Some(&camera.vertices[t - 2])
                    } else {
                        None
                    },
                    if t >= 2 { Some(&camera.edges[t - 2]) } else { None },
                    &emitter.vertices[s - 1],
                    &edge.reverse(),
                    &mut fwd,
                    if t >= 2 { Some(&mut bwd) } else { None },
                );
                (fwd, bwd)
            };
            pdf_backward[s - 1] = bwd_at_tip;
            if t >= 2 {
                pdf_forward[s + 1] = fwd_after;
            }
        }

        // convert densities of Dirac vertices sampled from non-Dirac ones
        // to projected solid angle measure
        if connectable[0] && n > 1 && !connectable[1] && !emitter.vertices[0].is_infinite_emitter()
        {
            pdf_forward[1] *= emitter.inv_geometry_factor(0);
        }
        for i in 1..n - 1 {
            if connectable[i] && !connectable[i + 1] {
                let factor = if i < s {
                    emitter.inv_geometry_factor(i)
                } else {
                    camera.inv_geometry_factor(n - 2 - i)
                };
                pdf_forward[i + 1] *= factor;
            }
        }
        for i in (1..n).rev() {
            if connectable[i] && !connectable[i - 1] {
                let factor = if i < s {
                    emitter.inv_geometry_factor(i - 1)
                } else {
                    camera.inv_geometry_factor(n - 1 - i)
                };
                pdf_backward[i - 1] *= factor;
            }
        }

        let vertex_at = |i: usize| -> &PathVertex {
            if i < s {
                &emitter.vertices[i]
            } else {
                &camera.vertices[n - 1 - i]
            }
        };

        let mut ratios = ratios;
        let mut set_ratio = |ratios: &mut Option<&mut [Float]>, i: usize, v: Float| {
            if let Some(r) = ratios {
                if i < r.len() {
                    r[i] = v;
                }
            }
        };

        let mut weight = 1.0;
        let mut pi = 1.0;
        set_ratio(&mut ratios, s, 1.0);
        for i in s + 1..n {
            pi *= pdf_forward[i - 1] / pdf_backward[i - 1].max(1e-12);
            if connectable[i - 1]
                && connectable[i]
                && vertex_at(i - 1).segment_connectable(vertex_at(i))
            {
                weight += pi;
                set_ratio(&mut ratios, i, pi);
            } else {
                set_ratio(&mut ratios, i, 0.0);
            }
        }
        pi = 1.0;
        for i in (1..s).rev() {
            pi *= pdf_backward[i] / pdf_forward[i].max(1e-12);
            if connectable[i - 1]
                && connectable[i]
                && vertex_at(i - 1).segment_connectable(vertex_at(i))
            {
                weight += pi;
                set_ratio(&mut ratios, i, pi);
            } else {
                set_ratio(&mut ratios, i, 0.0);
            }
        }
        let root_dirac = emitter.vertices[0]
            .emitter()
            .map(|e| e.is_dirac())
            .unwrap_or(true);
        if !root_dirac {
            pi *= pdf_backward[0] / pdf_forward[0].max(1e-12);
            weight += pi;
            set_ratio(&mut ratios, 0, pi);
        } else {
            set_ratio(&mut ratios, 0, 0.0);
        }

        1.0 / weight
    }

    /// MIS-weighted emission picked up by the camera subpath itself
    /// (the s = 0 family of techniques).
    pub fn bdpt_weighted_path_emission(
        &self,
        min_length: usize,
        max_length: usize,
        mut ratios: Option<&mut [Float]>,
    ) -> Spectrum {
        let mut result = Spectrum::default();

        for t in 2..=self.vertices.len() {
            let real_t = self.vertex_index[t - 1] + 1;
            if real_t > max_length {
                break;
            }
            if real_t < min_length || !self.vertices[t - 1].on_surface() {
                continue;
            }
            let (prim, record) = match &self.vertices[t - 1] {
                PathVertex::Surface { prim, record, .. } => (prim, record),
                _ => continue,
            };
            if !prim.is_emissive() {
                continue;
            }
            let emission = prim.eval_direct(&record.info, &self.edges[t - 2].d);
            if emission.max_component() == 0.0 {
                continue;
            }

            // camera rays escaping to the environment can only be sampled
            // one way
            if real_t == 2 && self.vertices[t - 1].is_infinite_surface() {
                let v = emission * self.vertices[t - 1].throughput();
                if let Some(r) = ratios.as_deref_mut() {
                    for value in r.iter_mut() {
                        *value = 0.0;
                    }
                    if !r.is_empty() {
                        r[0] = 1.0;
                    }
                }
                return v;
            }

            let n = t;
            let mut pdf_forward: Scratch = SmallVec::from_elem(0.0, n);
            let mut pdf_backward: Scratch = SmallVec::from_elem(0.0, n);
            let mut connectable: SmallVec<[bool; 16]> = SmallVec::from_elem(false, n);
            for i in 0..t {
                pdf_forward[t - (i + 1)] = self.vertices[i].pdf_backward();
                pdf_backward[t - (i + 1)] = self.vertices[i].pdf_forward();
                connectable[t - (i + 1)] = !self.vertices[i].is_dirac();
            }
            connectable[0] = true;

            let point = crate::core::records::PositionSample {
                p: record.info.p,
                ng: record.info.ng,
                ..Default::default()
            };
            let reverse_dir = -self.edges[t - 2].d;
            if prim.is_infinite() {
                // direction sampled first; the first vertex density stays
                // in solid angle measure
                pdf_forward[0] = prim.directional_pdf(&point, &reverse_dir);
                pdf_forward[1] = prim.positional_pdf(&point)
                    * self.edges[t - 2].pdf_backward
                    * self.vertices[t - 2].cosine_factor(&self.edges[t - 2].d);
            } else {
                pdf_forward[0] = prim.positional_pdf(&point);
                pdf_forward[1] = prim.directional_pdf(&point, &reverse_dir)
                    * self.edges[t - 2].pdf_backward
                    * self.vertices[t - 2].cosine_factor(&self.edges[t - 2].d)
                    / self.edges[t - 2].r_sq.max(1e-12);
            }

            if connectable[0] && !connectable[1] && !self.vertices[t - 1].is_infinite_surface() {
                pdf_forward[1] *= self.inv_geometry_factor(t - 2);
            }
            for i in 1..n - 1 {
                if connectable[i] && !connectable[i + 1] {
                    pdf_forward[i + 1] *= self.inv_geometry_factor(t - 2 - i);
                }
            }
            for i in (1..n).rev() {
                if connectable[i] && !connectable[i - 1] {
                    pdf_backward[i - 1] *= self.inv_geometry_factor(t - 1 - i);
                }
            }

            let mut weight = 1.0;
            let mut pi = 1.0;
            if let Some(r) = ratios.as_deref_mut() {
                if !r.is_empty() {
                    r[0] = 1.0;
                }
            }
            for i in 1..t {
                pi *= pdf_forward[i - 1] / pdf_backward[i - 1].max(1e-12);
                if connectable[i - 1] && connectable[i] {
                    weight += pi;
                    if let Some(r) = ratios.as_deref_mut() {
                        if i < r.len() {
                            r[i] = pi;
                        }
                    }
                } else if let Some(r) = ratios.as_deref_mut() {
                    if i < r.len() {
                        r[i] = 0.0;
                    }
                }
            }

            result += self.vertices[t - 1].throughput() * emission / weight;
        }

        result
    }

    /// Connect subpath tips for a given (s, t); returns the weighted
    /// contribution.
    pub fn bdpt_connect(
        tracer: &TraceBase,
        camera: &LightPath,
        emitter: &LightPath,
        s: usize,
        t: usize,
        max_bounce: usize,
        ratios: Option<&mut [Float]>,
    ) -> Spectrum {
        let a = &emitter.vertices[s - 1];
        let b = &camera.vertices[t - 1];

        let bounce = emitter.vertex_index(s - 1) + camera.vertex_index(t - 1);
        if bounce >= max_bounce {
            return Spectrum::default();
        }
        if b.is_infinite_surface() {
            return Spectrum::default();
        }

        let emitter_prim = emitter.vertices[0].emitter();
        let infinite_s1 = s == 1 && emitter_prim.map(|e| e.is_infinite()).unwrap_or(false);

        if infinite_s1 {
            // s=1 with an infinite emitter is direct environment sampling;
            // solid-angle measure, no distance falloff
            let d = emitter.vertices[0]
                .emitter_record()
                .map(|r| r.point.ng.to_vec())
                .unwrap_or_default();
            let mut edge = PathEdge::from_direction(d, 1.0, 1.0);
            let ray = Ray::new_segment(b.pos(), -d, 1e-4, Float::INFINITY);
            let (tr, pf, pb) = tracer.generalized_shadow_ray_and_pdfs(
                &ray,
                b.select_medium(&-d),
                bounce as u32,
                b.on_surface(),
                true,
            );
            edge.pdf_backward = pf;
            edge.pdf_forward = pb;
            if tr.max_component() == 0.0 {
                return Spectrum::default();
            }
            let unweighted =
                tr * a.throughput() * a.eval(&d, true) * b.eval(&-d, false) * b.throughput();
            unweighted * Self::mis_weight(camera, emitter, &edge, s, t, ratios)
        } else {
            let mut edge = PathEdge::between(a, b);
            // same-surface pathologies
            if a.cosine_factor(&edge.d) < 1e-5 || b.cosine_factor(&edge.d) < 1e-5 {
                return Spectrum::default();
            }
            let ray = Ray::new_segment(a.pos(), edge.d, 1e-4, edge.r * (1.0 - 1e-4));
            let (tr, pf, pb) = tracer.generalized_shadow_ray_and_pdfs(
                &ray,
                a.select_medium(&edge.d),
                bounce as u32,
                a.on_surface(),
                b.on_surface(),
            );
            edge.pdf_forward = pf;
            edge.pdf_backward = pb;
            if tr.max_component() == 0.0 {
                return Spectrum::default();
            }
            let unweighted = tr
                * a.throughput()
                * a.eval(&edge.d, true)
                * b.eval(&-edge.d, false)
                * b.throughput()
                / edge.r_sq;
            unweighted * Self::mis_weight(camera, emitter, &edge, s, t, ratios)
        }
    }

    /// t = 1: connect an emitter subpath tip straight to the camera and
    /// splat. Returns the weight and fractional pixel on success.
    pub fn bdpt_camera_connect(
        tracer: &TraceBase,
        camera: &LightPath,
        emitter: &LightPath,
        s: usize,
        max_bounce: usize,
        ratios: Option<&mut [Float]>,
    ) -> Option<(Spectrum, Point2f)> {
        let a = &emitter.vertices[s - 1];
        let b = &camera.vertices[0];

        let bounce = emitter.vertex_index(s - 1) + camera.vertex_index(0);
        if bounce >= max_bounce {
            return None;
        }
        // s=1, t=1 paths are useless for infinite emitters
        if s == 1
            && emitter.vertices[0]
                .emitter()
                .map(|e| e.is_infinite())
                .unwrap_or(false)
        {
            return None;
        }

        let mut edge = PathEdge::between(a, b);
        let ray = Ray::new_segment(a.pos(), edge.d, 1e-4, edge.r * (1.0 - 1e-4));
        let (tr, pf, pb) = tracer.generalized_shadow_ray_and_pdfs(
            &ray,
            a.select_medium(&edge.d),
            bounce as u32,
            a.on_surface(),
            true,
        );
        edge.pdf_forward = pf;
        edge.pdf_backward = pb;
        if tr.max_component() == 0.0 {
            return None;
        }

        let camera_arc = b.camera()?;
        let (splat_weight, pixel) = camera_arc.eval_direction(&-edge.d)?;

        let mut weight =
            tr * a.eval(&edge.d, true) * a.throughput() * b.throughput() * splat_weight / edge.r_sq;
        weight *= Self::mis_weight(camera, emitter, &edge, s, 1, ratios);
        Some((weight, pixel))
    }

    /// Reconstruct the sampler states that regenerate the merged path under
    /// a new bidirectional split `new_s`. The root templates supply the
    /// camera and emitter sampling strategies even when the corresponding
    /// subpath is empty under the old split. Returns false when any vertex
    /// is non-invertible under the target strategy.
    #[allow(clippy::too_many_arguments)]
    pub fn invert(
        camera_sampler: &mut WritableSampler,
        emitter_sampler: &mut WritableSampler,
        camera_root: &PathVertex,
        emitter_root: &PathVertex,
        camera: &LightPath,
        emitter: &LightPath,
        new_s: usize,
    ) -> bool {
        let s = emitter.len();
        let t = camera.len();
        let n = s + t;
        if n == 0 {
            return false;
        }
        let new_t = n - new_s;
        let v_end = n - 1;
        let e_end = n.saturating_sub(2);

        let mut vertices: SmallVec<[&PathVertex; 16]> = SmallVec::with_capacity(n);
        for _ in 0..n {
            vertices.push(camera_root);
        }
        for i in 0..s {
            vertices[i] = &emitter.vertices[i];
        }
        for i in 0..t {
            vertices[v_end - i] = &camera.vertices[i];
        }

        let mut edges: SmallVec<[PathEdge; 16]> = SmallVec::from_elem(PathEdge::default(), n.max(1) - 1);
        for i in 0..s.saturating_sub(1) {
            edges[i] = *emitter.edge(i);
        }
        for i in 0..t.saturating_sub(1) {
            edges[e_end - i] = camera.edge(i).reverse();
        }
        if s == 1 && emitter.vertices[0].is_infinite_emitter() {
            let d = emitter.vertices[0]
                .emitter_record()
                .map(|r| r.direction.d)
                .unwrap_or_default();
            edges[0] = PathEdge::from_direction(d, 1.0, 1.0);
        } else if s != 0 && t != 0 {
            edges[s - 1] = PathEdge::between(&emitter.vertices[s - 1], &camera.vertices[t - 1]);
        }

        let emitter_template = emitter_root;
        emitter_sampler.seek(0);
        if !emitter_template.invert_root_vertex(emitter_sampler, vertices[0]) {
            return false;
        }
        for i in 0..new_s.saturating_sub(1) {
            let template = if i == 0 { emitter_template } else { vertices[i] };
            let prev_edge = if i > 0 { Some(&edges[i - 1]) } else { None };
            if !template.invert_vertex(
                emitter_sampler,
                prev_edge,
                &edges[i],
                vertices[i],
                vertices[i + 1],
            ) {
                return false;
            }
            emitter_sampler.seek(i + 1);
        }

        let camera_template = camera_root;
        camera_sampler.seek(0);
        if !camera_template.invert_root_vertex(camera_sampler, vertices[v_end]) {
            return false;
        }
        let mut prev_edge: Option<PathEdge> = None;
        for i in 0..new_t.saturating_sub(1) {
            let next_edge = edges[e_end - i].reverse();
            let template = if i == 0 {
                camera_template
            } else {
                vertices[v_end - i]
            };
            if !template.invert_vertex(
                camera_sampler,
                prev_edge.as_ref(),
                &next_edge,
                vertices[v_end - i],
                vertices[v_end - (i + 1)],
            ) {
                return false;
            }
            prev_edge = Some(next_edge);
            camera_sampler.seek(i + 1);
        }

        true
    }
}
