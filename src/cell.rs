//! Worksets of elements with their geometry, dofs and material data.
use crate::config::{MeshPerturbation, Settings};
use crate::distributed::Communicator;
use crate::dof::DofManager;
use crate::element::{ElementShape, ElementValues};
use crate::error::{MultiscaleError, Result};
use crate::io::text::read_table_with_columns;
use crate::mesh::BlockMesh;
use crate::microstructure::{MaterialData, SeedSet};
use crate::subgrid::SubgridHandle;
use log::{debug, info};
use nalgebra::{DVector, Point3};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Seed assigned to one element.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SeedAssignment {
    pub seed: usize,
    /// Class index of the seed.
    pub class: usize,
    pub distance: f64,
    pub material: MaterialData,
}

impl SeedAssignment {
    fn new(seeds: &SeedSet, seed: usize, distance: f64) -> Self {
        Self {
            seed,
            class: seeds.class_indices()[seed],
            distance,
            material: seeds.material()[seed],
        }
    }
}

/// A sensor located inside an element.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedSensor {
    pub slot: usize,
    pub point: Point3<f64>,
    /// Reference coordinates within the element.
    pub xi: Vec<f64>,
}

/// Mean of the first `dim` coordinates of the nodes. Remaining coordinates are zero.
pub fn element_centroid(nodes: &[Point3<f64>], dim: usize) -> Point3<f64> {
    let mut centroid = Point3::origin();
    for node in nodes {
        for d in 0..dim {
            centroid[d] += node[d];
        }
    }
    for d in 0..dim {
        centroid[d] /= nodes.len() as f64;
    }
    centroid
}

/// A batch of elements from a single block.
#[derive(Debug, Clone)]
pub struct Cell {
    block: usize,
    block_name: String,
    shape: ElementShape,
    elements: Vec<usize>,
    nodes: Vec<Vec<usize>>,
    coords: Vec<Vec<Point3<f64>>>,
    perturbation: Vec<Vec<f64>>,
    dofs: Vec<Vec<usize>>,
    parameter_dofs: Vec<Vec<usize>>,
    values: Vec<ElementValues>,
    seeds: Vec<Option<SeedAssignment>>,
    subgrid: Vec<Option<(usize, SubgridHandle)>>,
    sensors: Vec<Vec<LocatedSensor>>,
    state: Vec<DVector<f64>>,
    previous_state: Vec<DVector<f64>>,
    adjoint: Vec<DVector<f64>>,
    parameters: Vec<DVector<f64>>,
}

impl Cell {
    pub fn block(&self) -> usize {
        self.block
    }

    pub fn block_name(&self) -> &str {
        &self.block_name
    }

    pub fn shape(&self) -> ElementShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Global element ids.
    pub fn elements(&self) -> &[usize] {
        &self.elements
    }

    pub fn element_nodes(&self, e: usize) -> &[usize] {
        &self.nodes[e]
    }

    /// Perturbed node coordinates.
    pub fn element_coords(&self, e: usize) -> &[Point3<f64>] {
        &self.coords[e]
    }

    /// Displacement applied to the last spatial coordinate of each node.
    pub fn element_perturbation(&self, e: usize) -> &[f64] {
        &self.perturbation[e]
    }

    pub fn element_dofs(&self, e: usize) -> &[usize] {
        &self.dofs[e]
    }

    pub fn element_parameter_dofs(&self, e: usize) -> &[usize] {
        &self.parameter_dofs[e]
    }

    pub fn element_values(&self, e: usize) -> &ElementValues {
        &self.values[e]
    }

    pub fn centroid(&self, e: usize) -> Point3<f64> {
        element_centroid(&self.coords[e], self.shape.dim())
    }

    pub fn seed_assignment(&self, e: usize) -> Option<&SeedAssignment> {
        self.seeds[e].as_ref()
    }

    pub fn material(&self, e: usize) -> Option<&MaterialData> {
        self.seeds[e].as_ref().map(|assignment| &assignment.material)
    }

    pub fn has_rotation(&self) -> bool {
        self.seeds
            .iter()
            .any(|s| matches!(s, Some(SeedAssignment { material: MaterialData::Rotation(_), .. })))
    }

    pub fn has_orientation_angle(&self) -> bool {
        self.seeds.iter().any(|s| {
            matches!(
                s,
                Some(SeedAssignment {
                    material: MaterialData::OrientationAngles(_),
                    ..
                })
            )
        })
    }

    pub fn subgrid(&self, e: usize) -> Option<(usize, SubgridHandle)> {
        self.subgrid[e]
    }

    pub fn set_subgrid(&mut self, e: usize, model: usize, handle: SubgridHandle) {
        self.subgrid[e] = Some((model, handle));
    }

    /// Removes all subgrid delegations and sensors.
    pub fn clear_delegation(&mut self) {
        self.subgrid.iter_mut().for_each(|subgrid| *subgrid = None);
        self.sensors.iter_mut().for_each(Vec::clear);
    }

    pub fn sensors(&self, e: usize) -> &[LocatedSensor] {
        &self.sensors[e]
    }

    pub fn add_sensor(&mut self, e: usize, sensor: LocatedSensor) {
        self.sensors[e].push(sensor);
    }

    /// Copies the element-local entries of an overlapped vector into `target`.
    fn gather_into(target: &mut Vec<DVector<f64>>, dofs: &[Vec<usize>], lookup: impl Fn(usize) -> f64) {
        *target = dofs
            .iter()
            .map(|dofs| DVector::from_iterator(dofs.len(), dofs.iter().map(|&gid| lookup(gid))))
            .collect();
    }

    pub fn gather_state(&mut self, lookup: impl Fn(usize) -> f64) {
        Self::gather_into(&mut self.state, &self.dofs, lookup);
    }

    pub fn gather_previous_state(&mut self, lookup: impl Fn(usize) -> f64) {
        Self::gather_into(&mut self.previous_state, &self.dofs, lookup);
    }

    pub fn gather_adjoint(&mut self, lookup: impl Fn(usize) -> f64) {
        Self::gather_into(&mut self.adjoint, &self.dofs, lookup);
    }

    pub fn gather_parameters(&mut self, lookup: impl Fn(usize) -> f64) {
        Self::gather_into(&mut self.parameters, &self.parameter_dofs, lookup);
    }

    pub fn state(&self, e: usize) -> &DVector<f64> {
        &self.state[e]
    }

    pub fn previous_state(&self, e: usize) -> &DVector<f64> {
        &self.previous_state[e]
    }

    pub fn adjoint(&self, e: usize) -> &DVector<f64> {
        &self.adjoint[e]
    }

    pub fn parameters(&self, e: usize) -> &DVector<f64> {
        &self.parameters[e]
    }
}

/// Node displacements along the last spatial axis.
fn node_perturbations(mesh: &BlockMesh, perturbation: &MeshPerturbation) -> Result<Option<Vec<f64>>> {
    let axis = mesh.dim() - 1;
    match perturbation {
        MeshPerturbation::None => Ok(None),
        MeshPerturbation::Sinusoidal => Ok(Some(
            mesh.vertices()
                .iter()
                .map(|v| 0.2 * (2.0 * PI * v.x).sin() * (2.0 * PI * v.y).sin())
                .collect(),
        )),
        MeshPerturbation::HeightFile(path) => {
            let rows = read_table_with_columns(path, 3)?;
            if rows.is_empty() {
                return Err(MultiscaleError::data_format(path, "empty perturbation file"));
            }
            let (lo, hi) = mesh
                .vertices()
                .iter()
                .map(|v| v[axis])
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| (lo.min(c), hi.max(c)));
            if !(hi > lo) {
                return Err(MultiscaleError::configuration("mesh has no extent along the perturbed axis"));
            }
            Ok(Some(
                mesh.vertices()
                    .iter()
                    .map(|v| {
                        let mut nearest = (f64::INFINITY, 0.0);
                        for row in &rows {
                            let d = (row[0] - v.x).powi(2) + (row[1] - v.y).powi(2);
                            if d < nearest.0 {
                                nearest = (d, row[2]);
                            }
                        }
                        nearest.1 * (v[axis] - lo) / (hi - lo)
                    })
                    .collect(),
            ))
        }
    }
}

/// All cells of one process.
pub struct CellPartition {
    cells: Vec<Cell>,
    local_comm: Box<dyn Communicator>,
}

impl std::fmt::Debug for CellPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellPartition")
            .field("cells", &self.cells.len())
            .finish()
    }
}

impl CellPartition {
    /// Splits the owned elements of every block into cells of at most `workset_size` elements.
    ///
    /// `owned` lists the owned elements per block, as returned by [`BlockMesh::owned_elements`].
    pub fn build(
        mesh: &BlockMesh,
        owned: &[Vec<usize>],
        dofs: &DofManager,
        parameter_dofs: &DofManager,
        settings: &Settings,
        comm: &dyn Communicator,
    ) -> Result<Self> {
        let workset_size = settings.mesh.workset_size;
        if workset_size == 0 {
            return Err(MultiscaleError::configuration("workset size must be positive"));
        }
        assert_eq!(owned.len(), mesh.blocks().len());

        let perturbation = node_perturbations(mesh, &settings.mesh.perturbation)?;
        let axis = mesh.dim() - 1;

        let mut cells = Vec::new();
        for (b, (block, elements)) in mesh.blocks().iter().zip(owned).enumerate() {
            for batch in elements.chunks(workset_size) {
                let nodes: Vec<Vec<usize>> = batch
                    .iter()
                    .map(|&e| mesh.element_nodes(e).to_vec())
                    .collect();
                let offsets: Vec<Vec<f64>> = nodes
                    .iter()
                    .map(|nodes| {
                        nodes
                            .iter()
                            .map(|&v| perturbation.as_ref().map(|p| p[v]).unwrap_or(0.0))
                            .collect()
                    })
                    .collect();
                let coords: Vec<Vec<Point3<f64>>> = nodes
                    .iter()
                    .zip(&offsets)
                    .map(|(nodes, offsets)| {
                        nodes
                            .iter()
                            .zip(offsets)
                            .map(|(&v, dz)| {
                                let mut x = mesh.vertices()[v];
                                x[axis] += dz;
                                x
                            })
                            .collect()
                    })
                    .collect();
                let values = coords
                    .iter()
                    .map(|coords| ElementValues::compute(block.shape.reference(), coords))
                    .collect::<eyre::Result<Vec<_>>>()?;
                let n = batch.len();
                cells.push(Cell {
                    block: b,
                    block_name: block.name.clone(),
                    shape: block.shape,
                    elements: batch.to_vec(),
                    dofs: nodes.iter().map(|nodes| dofs.element_dofs(nodes)).collect(),
                    parameter_dofs: nodes
                        .iter()
                        .map(|nodes| parameter_dofs.element_dofs(nodes))
                        .collect(),
                    nodes,
                    coords,
                    perturbation: offsets,
                    values,
                    seeds: vec![None; n],
                    subgrid: vec![None; n],
                    sensors: vec![Vec::new(); n],
                    state: Vec::new(),
                    previous_state: Vec::new(),
                    adjoint: Vec::new(),
                    parameters: Vec::new(),
                });
            }
        }

        if settings.verbosity > 0 {
            info!(
                "Rank {}: built {} cells from {} elements",
                comm.rank(),
                cells.len(),
                owned.iter().map(Vec::len).sum::<usize>()
            );
        }

        Ok(Self {
            cells,
            local_comm: comm.split_self(),
        })
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    pub fn num_elements(&self) -> usize {
        self.cells.iter().map(Cell::len).sum()
    }

    /// Communicator containing only this process.
    pub fn local_communicator(&self) -> &dyn Communicator {
        self.local_comm.as_ref()
    }

    /// Assigns every element the seed nearest to its centroid.
    pub fn assign_synthesized(&mut self, seeds: &SeedSet) -> Result<()> {
        for cell in &mut self.cells {
            let centroids: Vec<_> = (0..cell.len()).map(|e| cell.centroid(e)).collect();
            cell.seeds
                .par_iter_mut()
                .zip(centroids.par_iter())
                .try_for_each(|(assignment, centroid)| -> Result<()> {
                    let (seed, distance) = seeds.nearest_seed(centroid)?;
                    *assignment = Some(SeedAssignment::new(seeds, seed, distance));
                    Ok(())
                })?;
        }
        debug!("Assigned {} elements to {} seeds", self.num_elements(), seeds.len());
        Ok(())
    }

    /// Merges several imported seed sets.
    ///
    /// The first pass is accepted unconditionally. Later passes replace an element's data only
    /// when their nearest seed is strictly closer than the one stored.
    pub fn assign_imported(&mut self, passes: &[SeedSet]) -> Result<()> {
        if passes.is_empty() {
            return Err(MultiscaleError::DataFormat {
                path: None,
                message: "no seed files to import".to_string(),
            });
        }
        for (pass, seeds) in passes.iter().enumerate() {
            for cell in &mut self.cells {
                let centroids: Vec<_> = (0..cell.len()).map(|e| cell.centroid(e)).collect();
                cell.seeds
                    .par_iter_mut()
                    .zip(centroids.par_iter())
                    .try_for_each(|(assignment, centroid)| -> Result<()> {
                        let (seed, distance) = seeds.nearest_seed(centroid)?;
                        let accept = pass == 0 || assignment.map(|a| distance < a.distance).unwrap_or(true);
                        if accept {
                            *assignment = Some(SeedAssignment::new(seeds, seed, distance));
                        }
                        Ok(())
                    })?;
            }
        }
        debug!("Merged {} seed files", passes.len());
        Ok(())
    }
}
