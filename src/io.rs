//! Result persistence.
//!
//! Results are named scalar fields per node or per element. A [`ResultSink`] decides how they
//! are stored; [`vtk::VtkResultSink`] writes legacy VTK files.
use crate::element::ElementShape;
use nalgebra::Point3;

pub mod text;
pub mod vtk;

/// Geometry that results are attached to.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMesh {
    pub shape: ElementShape,
    pub vertices: Vec<Point3<f64>>,
    pub connectivity: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub node_fields: Vec<(String, Vec<f64>)>,
    pub cell_fields: Vec<(String, Vec<f64>)>,
}

impl ResultSet {
    pub fn with_node_field(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.node_fields.push((name.into(), values));
        self
    }

    pub fn with_cell_field(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.cell_fields.push((name.into(), values));
        self
    }

    pub fn node_field(&self, name: &str) -> Option<&[f64]> {
        self.node_fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn cell_field(&self, name: &str) -> Option<&[f64]> {
        self.cell_fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

pub trait ResultSink {
    fn write(
        &mut self,
        label: &str,
        time_index: usize,
        time: f64,
        mesh: &OutputMesh,
        results: &ResultSet,
    ) -> eyre::Result<()>;
}
