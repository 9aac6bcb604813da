//! Block-structured meshes.
//!
//! A [`BlockMesh`] holds the global geometry: vertices, element connectivity, material blocks
//! and named side sets. Every process keeps the full geometry; which elements a process
//! evaluates is decided by [`BlockMesh::owned_elements`].
use crate::element::ElementShape;
use crate::error::{MultiscaleError, Result};
use nalgebra::{Point3, Vector3};
use std::collections::{BTreeMap, BTreeSet};

pub mod procedural;

#[derive(Debug, Clone, PartialEq)]
pub struct ElementBlock {
    pub name: String,
    pub shape: ElementShape,
    /// Global element indices, sorted.
    pub elements: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockMesh {
    dim: usize,
    vertices: Vec<Point3<f64>>,
    connectivity: Vec<Vec<usize>>,
    blocks: Vec<ElementBlock>,
    /// Side set name to `(element, local side)` pairs.
    side_sets: BTreeMap<String, Vec<(usize, usize)>>,
}

impl BlockMesh {
    pub fn new(
        dim: usize,
        vertices: Vec<Point3<f64>>,
        connectivity: Vec<Vec<usize>>,
        blocks: Vec<ElementBlock>,
        side_sets: BTreeMap<String, Vec<(usize, usize)>>,
    ) -> Result<Self> {
        if dim != 2 && dim != 3 {
            return Err(MultiscaleError::configuration(format!("unsupported mesh dimension {}", dim)));
        }
        let mut element_block = vec![None; connectivity.len()];
        for (b, block) in blocks.iter().enumerate() {
            if block.shape.dim() != dim {
                return Err(MultiscaleError::configuration(format!(
                    "block {} has {:?} elements in a {}-dimensional mesh",
                    block.name, block.shape, dim
                )));
            }
            for &e in &block.elements {
                let nodes = connectivity.get(e).ok_or_else(|| {
                    MultiscaleError::configuration(format!("block {} references missing element {}", block.name, e))
                })?;
                if nodes.len() != block.shape.num_nodes() || nodes.iter().any(|&v| v >= vertices.len()) {
                    return Err(MultiscaleError::configuration(format!("invalid connectivity for element {}", e)));
                }
                if element_block[e].replace(b).is_some() {
                    return Err(MultiscaleError::configuration(format!("element {} is in several blocks", e)));
                }
            }
        }
        if let Some(e) = element_block.iter().position(Option::is_none) {
            return Err(MultiscaleError::configuration(format!("element {} belongs to no block", e)));
        }
        for (name, sides) in &side_sets {
            for &(e, side) in sides {
                let valid = element_block
                    .get(e)
                    .and_then(|b| *b)
                    .map(|b| side < blocks[b].shape.num_sides())
                    .unwrap_or(false);
                if !valid {
                    return Err(MultiscaleError::configuration(format!(
                        "side set {} references invalid side ({}, {})",
                        name, e, side
                    )));
                }
            }
        }

        Ok(Self {
            dim,
            vertices,
            connectivity,
            blocks,
            side_sets,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_elements(&self) -> usize {
        self.connectivity.len()
    }

    pub fn element_nodes(&self, element: usize) -> &[usize] {
        &self.connectivity[element]
    }

    pub fn element_coords(&self, element: usize) -> Vec<Point3<f64>> {
        self.connectivity[element]
            .iter()
            .map(|&v| self.vertices[v])
            .collect()
    }

    pub fn blocks(&self) -> &[ElementBlock] {
        &self.blocks
    }

    pub fn side_sets(&self) -> &BTreeMap<String, Vec<(usize, usize)>> {
        &self.side_sets
    }

    pub fn side_set_names(&self) -> Vec<String> {
        self.side_sets.keys().cloned().collect()
    }

    /// All vertices lying on the named side set.
    pub fn side_set_nodes(&self, name: &str) -> Option<BTreeSet<usize>> {
        let sides = self.side_sets.get(name)?;
        let mut nodes = BTreeSet::new();
        for &(e, side) in sides {
            let shape = self.element_shape(e);
            for local in shape.side_nodes(side) {
                nodes.insert(self.connectivity[e][local]);
            }
        }
        Some(nodes)
    }

    pub fn element_shape(&self, element: usize) -> ElementShape {
        self.blocks
            .iter()
            .find(|block| block.elements.binary_search(&element).is_ok())
            .map(|block| block.shape)
            .unwrap_or_else(|| panic!("element {} belongs to no block", element))
    }

    /// For each local side of the element, the index of the side set it belongs to (in the
    /// order of [`BlockMesh::side_set_names`]), if any.
    pub fn element_boundary_flags(&self, element: usize) -> Vec<Option<usize>> {
        let mut flags = vec![None; self.element_shape(element).num_sides()];
        for (index, sides) in self.side_sets.values().enumerate() {
            for &(e, side) in sides {
                if e == element {
                    flags[side] = Some(index);
                }
            }
        }
        flags
    }

    /// Contiguous split of every block's elements across `size` processes.
    ///
    /// This is a placeholder for a real partitioner and does not balance load beyond element
    /// counts.
    pub fn owned_elements(&self, rank: usize, size: usize) -> Vec<Vec<usize>> {
        assert!(rank < size);
        self.blocks
            .iter()
            .map(|block| {
                let n = block.elements.len();
                let begin = rank * n / size;
                let end = (rank + 1) * n / size;
                block.elements[begin..end].to_vec()
            })
            .collect()
    }

    /// Moves every vertex by the given displacement. Topology is unchanged.
    pub fn displace_vertices(&mut self, displacement: &[Vector3<f64>]) {
        assert_eq!(displacement.len(), self.vertices.len());
        for (vertex, u) in self.vertices.iter_mut().zip(displacement) {
            *vertex += u;
        }
    }
}
