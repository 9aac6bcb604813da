//! Degree-of-freedom numbering.
//!
//! Global ids are node-major (`node * num_variables + variable`). Within an element, local
//! dofs are variable-major: all nodes of the first variable, then all nodes of the second and
//! so on, so that `offsets[var][i] = var * num_nodes + i`.

/// Numbering of nodal fields, used both for the state variables and for discretized
/// parameter fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DofManager {
    variables: Vec<String>,
    num_nodes: usize,
}

impl DofManager {
    pub fn new(variables: Vec<String>, num_nodes: usize) -> Self {
        Self { variables, num_nodes }
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == name)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_dofs(&self) -> usize {
        self.num_nodes * self.variables.len()
    }

    pub fn gid(&self, node: usize, variable: usize) -> usize {
        debug_assert!(variable < self.variables.len());
        node * self.variables.len() + variable
    }

    /// Inverse of [`DofManager::gid`].
    pub fn node_and_variable(&self, gid: usize) -> (usize, usize) {
        (gid / self.variables.len(), gid % self.variables.len())
    }

    /// Global ids of an element's local dofs in variable-major order.
    pub fn element_dofs(&self, nodes: &[usize]) -> Vec<usize> {
        (0..self.variables.len())
            .flat_map(|var| nodes.iter().map(move |&node| self.gid(node, var)))
            .collect()
    }

    pub fn offsets(&self, num_element_nodes: usize) -> Vec<Vec<usize>> {
        (0..self.variables.len())
            .map(|var| (0..num_element_nodes).map(|i| var * num_element_nodes + i).collect())
            .collect()
    }
}
