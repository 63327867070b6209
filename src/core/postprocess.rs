//! Minimum-mapping-unit enforcement on a label raster.
//!
//! 1. Optional majority filter over a square window.
//! 2. Connected-component labelling, row tiles labelled independently and
//!    merged along their seams with a union-find over the full grid.
//! 3. Components smaller than the MMU take the most frequent class among
//!    their outside neighbours (ties to the lowest class id).
//! 4. Steps 2-3 repeat up to a fixed number of passes; anything still below
//!    the MMU afterwards is reported as residual.

use crate::core::fusion::{Backcast, LabelMap};
use crate::core::provenance::{Artifact, ArtifactKind};
use crate::core::tiling::TileExecutor;
use crate::types::{BackcastError, BackcastResult, ClassId, ClassProbabilities, Raster, RasterValue};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

const NONE: usize = usize::MAX;

/// Pixel adjacency used for regions and neighbour votes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Four,
    Eight,
}

impl Connectivity {
    fn offsets(self) -> &'static [(isize, isize)] {
        match self {
            Connectivity::Four => &[(-1, 0), (0, -1), (0, 1), (1, 0)],
            Connectivity::Eight => &[(-1, -1), (-1, 0), (-1, 1), (0, -1), (0, 1), (1, -1), (1, 0), (1, 1)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessParams {
    /// Minimum region size in pixels
    pub min_mapping_unit: usize,
    /// Majority-filter window side, 0 disables smoothing
    pub smoothing_window: usize,
    pub connectivity: Connectivity,
    /// Upper bound on label/reassign passes
    pub max_iterations: usize,
}

impl Default for PostProcessParams {
    fn default() -> Self {
        Self {
            min_mapping_unit: 9,
            smoothing_window: 3,
            connectivity: Connectivity::Eight,
            max_iterations: 10,
        }
    }
}

impl PostProcessParams {
    pub fn validate(&self) -> BackcastResult<()> {
        if self.min_mapping_unit == 0 {
            return Err(BackcastError::Config("Minimum mapping unit must be at least 1 pixel".to_string()));
        }
        if self.smoothing_window != 0 && self.smoothing_window % 2 == 0 {
            return Err(BackcastError::Config(format!(
                "Smoothing window must be odd, got {}",
                self.smoothing_window
            )));
        }
        if self.max_iterations == 0 {
            return Err(BackcastError::Config("max_iterations must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Disjoint-set forest over pixel indices (path halving, union by rank)
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn from_parents(parent: Vec<usize>) -> Self {
        let rank = vec![0; parent.len()];
        Self { parent, rank }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (root, child) = if self.rank[ra] >= self.rank[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        if self.rank[root] == self.rank[child] {
            self.rank[root] = self.rank[root].saturating_add(1);
        }
    }
}

/// One connected region of identical class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
    pub class: ClassId,
    pub size: usize,
    /// Row-major index of the first pixel
    pub first_pixel: usize,
}

/// Component membership of every valid pixel
#[derive(Debug, Clone)]
pub struct ComponentMap {
    cols: usize,
    ids: Vec<usize>,
    components: Vec<Component>,
}

impl ComponentMap {
    pub fn component_of(&self, row: usize, col: usize) -> Option<usize> {
        match self.ids[row * self.cols + col] {
            NONE => None,
            id => Some(id),
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

fn same_class(classes: &Array2<ClassId>, a: (usize, usize), b: (usize, usize)) -> bool {
    let va = classes[a];
    va.is_valid() && va == classes[b]
}

/// Label connected regions of identical valid class.
///
/// Each row tile builds its own union-find; the tile forests are then
/// concatenated into one global forest and joined across tile seams.
pub fn label_components(
    classes: &Array2<ClassId>,
    connectivity: Connectivity,
    executor: &TileExecutor,
) -> ComponentMap {
    let (rows, cols) = classes.dim();
    let eight = connectivity == Connectivity::Eight;

    let parents = executor.collect(rows, |tile| {
        let offset = tile.start * cols;
        let mut uf = UnionFind::new(tile.len() * cols);
        for r in tile.rows() {
            for c in 0..cols {
                let here = (r - tile.start) * cols + c;
                if c > 0 && same_class(classes, (r, c), (r, c - 1)) {
                    uf.union(here, here - 1);
                }
                if r > tile.start {
                    if same_class(classes, (r, c), (r - 1, c)) {
                        uf.union(here, here - cols);
                    }
                    if eight && c > 0 && same_class(classes, (r, c), (r - 1, c - 1)) {
                        uf.union(here, here - cols - 1);
                    }
                    if eight && c + 1 < cols && same_class(classes, (r, c), (r - 1, c + 1)) {
                        uf.union(here, here - cols + 1);
                    }
                }
            }
        }
        (0..tile.len() * cols).map(|i| uf.find(i) + offset).collect()
    });

    let mut uf = UnionFind::from_parents(parents);
    for tile in executor.tiles(rows).iter().skip(1) {
        let r = tile.start;
        for c in 0..cols {
            let here = r * cols + c;
            if same_class(classes, (r, c), (r - 1, c)) {
                uf.union(here, here - cols);
            }
            if eight && c > 0 && same_class(classes, (r, c), (r - 1, c - 1)) {
                uf.union(here, here - cols - 1);
            }
            if eight && c + 1 < cols && same_class(classes, (r, c), (r - 1, c + 1)) {
                uf.union(here, here - cols + 1);
            }
        }
    }

    let mut root_to_id = vec![NONE; rows * cols];
    let mut ids = vec![NONE; rows * cols];
    let mut components = Vec::new();
    for (i, class) in classes.iter().enumerate() {
        if class.is_nodata() {
            continue;
        }
        let root = uf.find(i);
        if root_to_id[root] == NONE {
            root_to_id[root] = components.len();
            components.push(Component {
                class: *class,
                size: 0,
                first_pixel: i,
            });
        }
        let id = root_to_id[root];
        components[id].size += 1;
        ids[i] = id;
    }
    ComponentMap { cols, ids, components }
}

/// Mode of valid classes in a square window. The centre class is kept when
/// it ties for the maximum, otherwise the lowest tied class wins. Nodata
/// pixels stay nodata.
pub fn majority_filter(
    classes: &Array2<ClassId>,
    window: usize,
    executor: &TileExecutor,
) -> BackcastResult<Array2<ClassId>> {
    let (rows, cols) = classes.dim();
    let half = window / 2;
    let filtered = executor.collect(rows, |tile| {
        let mut out = Vec::with_capacity(tile.len() * cols);
        let mut values: Vec<ClassId> = Vec::with_capacity(window * window);
        for r in tile.rows() {
            for c in 0..cols {
                let centre = classes[[r, c]];
                if centre.is_nodata() {
                    out.push(centre);
                    continue;
                }
                values.clear();
                for wr in r.saturating_sub(half)..(r + half + 1).min(rows) {
                    for wc in c.saturating_sub(half)..(c + half + 1).min(cols) {
                        let v = classes[[wr, wc]];
                        if v.is_valid() {
                            values.push(v);
                        }
                    }
                }
                values.sort_unstable();

                let (mut best, mut best_count, mut centre_count) = (centre, 0usize, 0usize);
                let mut i = 0;
                while i < values.len() {
                    let class = values[i];
                    let run = values[i..].iter().take_while(|&&v| v == class).count();
                    if run > best_count {
                        best = class;
                        best_count = run;
                    }
                    if class == centre {
                        centre_count = run;
                    }
                    i += run;
                }
                out.push(if centre_count == best_count { centre } else { best });
            }
        }
        out
    });
    Array2::from_shape_vec((rows, cols), filtered)
        .map_err(|e| BackcastError::Processing(format!("majority filter: {}", e)))
}

/// Outcome of MMU enforcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessReport {
    /// Label/reassign passes run
    pub iterations: usize,
    /// True when no region below the MMU remains
    pub converged: bool,
    pub residual_components: usize,
    pub residual_pixels: usize,
    pub smoothed_pixels: usize,
    pub reassigned_pixels: usize,
}

/// Reassign regions below the MMU in place and report what is left
pub fn enforce_mmu(
    classes: &mut Array2<ClassId>,
    params: &PostProcessParams,
    executor: &TileExecutor,
) -> (PostProcessReport, Array2<bool>) {
    let (rows, cols) = classes.dim();
    let mmu = params.min_mapping_unit;
    let offsets = params.connectivity.offsets();
    let mut report = PostProcessReport {
        iterations: 0,
        converged: false,
        residual_components: 0,
        residual_pixels: 0,
        smoothed_pixels: 0,
        reassigned_pixels: 0,
    };
    let mut stamp = vec![NONE; rows * cols];

    let neighbours = move |i: usize| {
        let (r, c) = ((i / cols) as isize, (i % cols) as isize);
        offsets.iter().filter_map(move |(dr, dc)| {
            let (nr, nc) = (r + dr, c + dc);
            if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                None
            } else {
                Some(nr as usize * cols + nc as usize)
            }
        })
    };

    let mut map = label_components(classes, params.connectivity, executor);
    while report.iterations < params.max_iterations {
        let mut small: Vec<usize> = (0..map.len()).filter(|&id| map.components[id].size < mmu).collect();
        if small.is_empty() {
            break;
        }
        report.iterations += 1;
        small.sort_by_key(|&id| (map.components[id].size, map.components[id].first_pixel));

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); map.len()];
        for &id in &small {
            members[id].reserve(map.components[id].size);
        }
        for (i, &id) in map.ids.iter().enumerate() {
            if id != NONE && map.components[id].size < mmu {
                members[id].push(i);
            }
        }

        let mut changed = 0usize;
        for &id in &small {
            let own = map.components[id].class;
            let mut votes = [0usize; 256];
            let mut touched = false;
            let mut stale = false;
            for &p in &members[id] {
                for n in neighbours(p) {
                    if map.ids[n] == id || stamp[n] == id {
                        continue;
                    }
                    stamp[n] = id;
                    let v = classes[[n / cols, n % cols]];
                    if v.is_nodata() {
                        continue;
                    }
                    if v == own {
                        stale = true;
                    }
                    votes[v as usize] += 1;
                    touched = true;
                }
            }
            if stale || !touched {
                continue;
            }
            let mut winner = 0usize;
            for class in 1..votes.len() {
                if votes[class] > votes[winner] {
                    winner = class;
                }
            }
            for &p in &members[id] {
                classes[[p / cols, p % cols]] = winner as ClassId;
            }
            report.reassigned_pixels += members[id].len();
            changed += 1;
        }
        stamp.iter_mut().for_each(|s| *s = NONE);

        map = label_components(classes, params.connectivity, executor);
        if changed == 0 {
            break;
        }
    }

    let mut residual = Array2::from_elem((rows, cols), false);
    for (i, &id) in map.ids.iter().enumerate() {
        if id != NONE && map.components[id].size < mmu {
            residual[[i / cols, i % cols]] = true;
            report.residual_pixels += 1;
        }
    }
    report.residual_components = map.components.iter().filter(|c| c.size < mmu).count();
    report.converged = report.residual_components == 0;
    (report, residual)
}

/// Regularised label map with its residual mask
#[derive(Debug, Clone)]
pub struct PostProcessed {
    pub labels: LabelMap,
    pub report: PostProcessReport,
    /// Pixels of regions still below the MMU
    pub residual_mask: Array2<bool>,
    /// Fused probabilities the labels were drawn from, when supplied
    pub probabilities: Option<ClassProbabilities>,
}

pub struct PostProcessor {
    params: PostProcessParams,
    executor: TileExecutor,
}

impl PostProcessor {
    pub fn new(params: PostProcessParams) -> BackcastResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            executor: TileExecutor::default(),
        })
    }

    pub fn with_executor(mut self, executor: TileExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Smooth and enforce the MMU. Pixels whose class changed take the
    /// fused probability of their new class as confidence when
    /// `probabilities` is given.
    pub fn process_labels(
        &self,
        labels: &LabelMap,
        probabilities: Option<&ClassProbabilities>,
    ) -> BackcastResult<PostProcessed> {
        let grid = labels.classes.grid();
        grid.ensure_same(labels.confidence.grid(), "label confidence")?;
        if let Some(probs) = probabilities {
            grid.ensure_same(probs.grid(), "fused probabilities")?;
        }
        let original = labels.classes.data();

        let mut classes = if self.params.smoothing_window > 1 {
            majority_filter(original, self.params.smoothing_window, &self.executor)?
        } else {
            original.clone()
        };
        let smoothed_pixels = classes.iter().zip(original.iter()).filter(|(a, b)| a != b).count();

        let (mut report, residual_mask) = enforce_mmu(&mut classes, &self.params, &self.executor);
        report.smoothed_pixels = smoothed_pixels;

        let mut confidence = labels.confidence.data().clone();
        if let Some(probs) = probabilities {
            for ((r, c), class) in classes.indexed_iter() {
                if *class != original[[r, c]] {
                    confidence[[r, c]] = probs.probability(*class, r, c);
                }
            }
        }

        Ok(PostProcessed {
            labels: LabelMap {
                classes: Raster::from_array(grid.clone(), classes)?,
                confidence: Raster::from_array(grid.clone(), confidence)?,
            },
            report,
            residual_mask,
            probabilities: probabilities.cloned(),
        })
    }

    /// Post-process a back-cast artifact, recording the report in provenance
    pub fn process(&self, input: &Artifact<Backcast>) -> BackcastResult<Artifact<PostProcessed>> {
        let output = self.process_labels(&input.data.labels, Some(&input.data.probabilities))?;

        let mut provenance = input.provenance.clone();
        provenance.kind = ArtifactKind::Classification;
        provenance.param("min_mapping_unit", self.params.min_mapping_unit);
        provenance.param("smoothing_window", self.params.smoothing_window);
        provenance.param("connectivity", format!("{:?}", self.params.connectivity).to_lowercase());
        provenance.param("max_iterations", self.params.max_iterations);
        provenance.param("mmu_iterations", output.report.iterations);
        provenance.param("smoothed_pixels", output.report.smoothed_pixels);
        provenance.param("reassigned_pixels", output.report.reassigned_pixels);
        if !output.report.converged {
            provenance.warn(format!(
                "{} regions ({} pixels) remain below the minimum mapping unit of {} after {} passes",
                output.report.residual_components,
                output.report.residual_pixels,
                self.params.min_mapping_unit,
                output.report.iterations
            ));
        }
        log::info!(
            "Post-processing {:?}: {} smoothed, {} reassigned, {} residual regions",
            provenance.year,
            output.report.smoothed_pixels,
            output.report.reassigned_pixels,
            output.report.residual_components
        );
        Ok(Artifact::new(output, provenance))
    }
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self {
            params: PostProcessParams::default(),
            executor: TileExecutor::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, GridSpec, NO_CLASS};
    use ndarray::array;

    fn label_map(classes: Array2<ClassId>) -> LabelMap {
        let (rows, cols) = classes.dim();
        let grid = GridSpec::new(rows, cols, GeoTransform::north_up(0.0, rows as f64, 1.0), "EPSG:32635");
        LabelMap {
            confidence: Raster::filled(grid.clone(), 0.9),
            classes: Raster::from_array(grid, classes).unwrap(),
        }
    }

    #[test]
    fn test_seams_join_components_across_tiles() {
        let classes = array![[1, 1, 2], [2, 1, 2], [2, 1, 1], [2, 2, 1]];
        let whole = label_components(&classes, Connectivity::Four, &TileExecutor::new(64));
        let tiled = label_components(&classes, Connectivity::Four, &TileExecutor::new(1));
        assert_eq!(whole.len(), 3);
        assert_eq!(tiled.len(), 3);
        let sizes = |m: &ComponentMap| m.components().iter().map(|c| c.size).collect::<Vec<_>>();
        assert_eq!(sizes(&whole), sizes(&tiled));
    }

    #[test]
    fn test_diagonal_joins_only_with_eight_connectivity() {
        let classes = array![[1, 2], [2, 1]];
        assert_eq!(label_components(&classes, Connectivity::Four, &TileExecutor::new(1)).len(), 4);
        assert_eq!(label_components(&classes, Connectivity::Eight, &TileExecutor::new(1)).len(), 2);
    }

    #[test]
    fn test_majority_filter_removes_speck_and_keeps_tied_centre() {
        let speck = array![[1, 1, 1], [1, 2, 1], [1, 1, 1]];
        let out = majority_filter(&speck, 3, &TileExecutor::default()).unwrap();
        assert_eq!(out[[1, 1]], 1);

        // Corner window holds two 3s and two 4s: the centre keeps its class
        let tie = array![[3, 4], [4, 3]];
        let out = majority_filter(&tie, 3, &TileExecutor::default()).unwrap();
        assert_eq!(out, tie);
    }

    #[test]
    fn test_single_pixel_merged_into_surroundings() {
        let labels = label_map(array![[1, 1, 1], [1, 2, 1], [1, 1, 1]]);
        let params = PostProcessParams {
            smoothing_window: 0,
            ..PostProcessParams::default()
        };
        let out = PostProcessor::new(params).unwrap().process_labels(&labels, None).unwrap();
        assert!(out.labels.classes.data().iter().all(|&c| c == 1));
        assert!(out.report.converged);
        assert_eq!(out.report.reassigned_pixels, 1);
    }

    #[test]
    fn test_isolated_region_is_residual() {
        let classes = array![[2, 2, NO_CLASS], [2, 2, NO_CLASS], [NO_CLASS, NO_CLASS, NO_CLASS]];
        let params = PostProcessParams {
            smoothing_window: 0,
            ..PostProcessParams::default()
        };
        let out = PostProcessor::new(params).unwrap().process_labels(&label_map(classes), None).unwrap();
        assert!(!out.report.converged);
        assert_eq!(out.report.residual_components, 1);
        assert_eq!(out.report.residual_pixels, 4);
        assert!(out.residual_mask[[0, 0]]);
        assert!(!out.residual_mask[[2, 2]]);
        assert_eq!(out.labels.classes.get(2, 2), NO_CLASS);
    }

    #[test]
    fn test_vote_ties_go_to_lowest_class() {
        // The 1-pixel island of 9 touches two 5s and two 3s
        let classes = array![
            [5, 5, 5, 5, 5],
            [5, 5, 5, 5, 5],
            [3, 3, 9, 5, 5],
            [3, 3, 3, 5, 5],
            [3, 3, 3, 3, 3]
        ];
        let params = PostProcessParams {
            min_mapping_unit: 2,
            smoothing_window: 0,
            connectivity: Connectivity::Four,
            max_iterations: 1,
        };
        let mut data = classes.clone();
        let (report, _) = enforce_mmu(&mut data, &params, &TileExecutor::default());
        assert_eq!(data[[2, 2]], 3);
        assert!(report.converged);
    }

    #[test]
    fn test_confidence_follows_new_class() {
        let labels = label_map(array![[1, 1, 1], [1, 2, 1], [1, 1, 1]]);
        let mut data = ndarray::Array3::<f64>::zeros((2, 3, 3));
        data.index_axis_mut(ndarray::Axis(0), 0).fill(0.6);
        data.index_axis_mut(ndarray::Axis(0), 1).fill(0.4);
        let probs = ClassProbabilities::from_array(labels.classes.grid().clone(), vec![1, 2], data).unwrap();
        let out = PostProcessor::default().process_labels(&labels, Some(&probs)).unwrap();
        assert_eq!(out.labels.confidence.get(1, 1), 0.6);
        assert_eq!(out.labels.confidence.get(0, 0), 0.9);
    }

    #[test]
    fn test_even_window_rejected() {
        let params = PostProcessParams {
            smoothing_window: 4,
            ..PostProcessParams::default()
        };
        assert!(params.validate().is_err());
    }
}
