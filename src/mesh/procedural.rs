//! Structured mesh generation.
use crate::element::ElementShape;
use crate::error::{MultiscaleError, Result};
use crate::mesh::{BlockMesh, ElementBlock};
use nalgebra::Point3;
use std::collections::BTreeMap;

/// Side set names, indexed by local side number (`2 * axis + positive`).
pub const SIDE_NAMES: [&str; 6] = ["left", "right", "bottom", "top", "back", "front"];

/// Axis-aligned structured quad or hex mesh, optionally split into several blocks along `x`.
#[derive(Debug, Clone)]
pub struct StructuredMeshBuilder {
    dim: usize,
    cells: [usize; 3],
    min: [f64; 3],
    max: [f64; 3],
    blocks_along_x: usize,
}

impl StructuredMeshBuilder {
    pub fn rectangle(nx: usize, ny: usize, min: [f64; 2], max: [f64; 2]) -> Self {
        Self {
            dim: 2,
            cells: [nx, ny, 1],
            min: [min[0], min[1], 0.0],
            max: [max[0], max[1], 0.0],
            blocks_along_x: 1,
        }
    }

    pub fn cuboid(nx: usize, ny: usize, nz: usize, min: [f64; 3], max: [f64; 3]) -> Self {
        Self {
            dim: 3,
            cells: [nx, ny, nz],
            min,
            max,
            blocks_along_x: 1,
        }
    }

    /// Splits the elements into `n` blocks `eblock-0 .. eblock-(n-1)` by their column index.
    pub fn with_blocks_along_x(self, n: usize) -> Self {
        Self {
            blocks_along_x: n,
            ..self
        }
    }

    pub fn build(&self) -> Result<BlockMesh> {
        let dim = self.dim;
        let [nx, ny, nz] = self.cells;
        let nz = if dim == 2 { 1 } else { nz };
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(MultiscaleError::configuration("structured mesh needs at least one cell per axis"));
        }
        if self.blocks_along_x == 0 || self.blocks_along_x > nx {
            return Err(MultiscaleError::configuration(format!(
                "cannot split {} columns into {} blocks",
                nx, self.blocks_along_x
            )));
        }

        let vertex_layers = if dim == 2 { 1 } else { nz + 1 };
        let vertex_index = |i: usize, j: usize, k: usize| i + (nx + 1) * (j + (ny + 1) * k);
        let h: Vec<f64> = (0..3)
            .map(|d| (self.max[d] - self.min[d]) / self.cells[d] as f64)
            .collect();

        let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1) * vertex_layers);
        for k in 0..vertex_layers {
            for j in 0..=ny {
                for i in 0..=nx {
                    let z = if dim == 2 { 0.0 } else { self.min[2] + k as f64 * h[2] };
                    vertices.push(Point3::new(
                        self.min[0] + i as f64 * h[0],
                        self.min[1] + j as f64 * h[1],
                        z,
                    ));
                }
            }
        }

        let shape = if dim == 2 { ElementShape::Quad4 } else { ElementShape::Hex8 };
        let mut connectivity = Vec::with_capacity(nx * ny * nz);
        let mut block_elements = vec![Vec::new(); self.blocks_along_x];
        let mut side_sets: BTreeMap<String, Vec<(usize, usize)>> = BTreeMap::new();

        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let e = connectivity.len();
                    let mut nodes = vec![
                        vertex_index(i, j, k),
                        vertex_index(i + 1, j, k),
                        vertex_index(i + 1, j + 1, k),
                        vertex_index(i, j + 1, k),
                    ];
                    if dim == 3 {
                        let top: Vec<usize> = nodes.iter().map(|v| v + (nx + 1) * (ny + 1)).collect();
                        nodes.extend(top);
                    }
                    connectivity.push(nodes);
                    block_elements[i * self.blocks_along_x / nx].push(e);

                    let index = [i, j, k];
                    for axis in 0..dim {
                        let n_axis = [nx, ny, nz][axis];
                        if index[axis] == 0 {
                            side_sets.entry(SIDE_NAMES[2 * axis].to_string()).or_default().push((e, 2 * axis));
                        }
                        if index[axis] + 1 == n_axis {
                            side_sets
                                .entry(SIDE_NAMES[2 * axis + 1].to_string())
                                .or_default()
                                .push((e, 2 * axis + 1));
                        }
                    }
                }
            }
        }

        let blocks = block_elements
            .into_iter()
            .enumerate()
            .map(|(b, elements)| ElementBlock {
                name: format!("eblock-{}", b),
                shape,
                elements,
            })
            .collect();

        BlockMesh::new(dim, vertices, connectivity, blocks, side_sets)
    }
}

pub fn create_unit_square_quad_mesh(cells_per_dim: usize) -> Result<BlockMesh> {
    StructuredMeshBuilder::rectangle(cells_per_dim, cells_per_dim, [0.0, 0.0], [1.0, 1.0]).build()
}

pub fn create_unit_cube_hex_mesh(cells_per_dim: usize) -> Result<BlockMesh> {
    StructuredMeshBuilder::cuboid(cells_per_dim, cells_per_dim, cells_per_dim, [0.0; 3], [1.0; 3]).build()
}
