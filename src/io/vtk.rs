use crate::element::ElementShape;
use crate::io::{OutputMesh, ResultSet, ResultSink};
use eyre::eyre;
use std::convert::TryInto;
use std::path::{Path, PathBuf};
use vtkio::model::{
    Attribute, Attributes, ByteOrder, CellType, Cells, DataSet, Piece, UnstructuredGridPiece, Version, VertexNumbers,
    Vtk,
};

fn cell_type(shape: ElementShape) -> CellType {
    match shape {
        ElementShape::Quad4 => CellType::Quad,
        ElementShape::Hex8 => CellType::Hexahedron,
    }
}

/// Builds an unstructured grid data set with the given fields attached.
pub fn build_data_set(mesh: &OutputMesh, results: &ResultSet) -> eyre::Result<DataSet> {
    let points: Vec<f64> = mesh
        .vertices
        .iter()
        .flat_map(|v| v.coords.iter().copied())
        .collect();

    // Legacy layout: N, i_1, ..., i_N per cell
    let mut vertices: Vec<u32> = Vec::new();
    for cell in &mesh.connectivity {
        vertices.push(cell.len().try_into()?);
        for &idx in cell {
            vertices.push(idx.try_into()?);
        }
    }

    let mut data = Attributes::new();
    for (name, values) in &results.node_fields {
        if values.len() != mesh.vertices.len() {
            return Err(eyre!("node field {} has {} values for {} nodes", name, values.len(), mesh.vertices.len()));
        }
        data.point
            .push(Attribute::scalars(name, 1).with_data(values.clone()));
    }
    for (name, values) in &results.cell_fields {
        if values.len() != mesh.connectivity.len() {
            return Err(eyre!(
                "cell field {} has {} values for {} cells",
                name,
                values.len(),
                mesh.connectivity.len()
            ));
        }
        data.cell
            .push(Attribute::scalars(name, 1).with_data(values.clone()));
    }

    let piece = UnstructuredGridPiece {
        points: points.into(),
        cells: Cells {
            cell_verts: VertexNumbers::Legacy {
                num_cells: mesh.connectivity.len().try_into()?,
                vertices,
            },
            types: vec![cell_type(mesh.shape); mesh.connectivity.len()],
        },
        data,
    };

    Ok(DataSet::UnstructuredGrid {
        meta: None,
        pieces: vec![Piece::Inline(Box::new(piece))],
    })
}

pub fn export(path: &Path, title: &str, data: DataSet) -> eyre::Result<()> {
    Vtk {
        version: Version { major: 4, minor: 1 },
        title: title.to_string(),
        byte_order: ByteOrder::BigEndian,
        data,
        file_path: None,
    }
    .export(path)
    .map_err(|err| eyre!("failed to export {}: {}", path.display(), err))
}

/// Writes `<directory>/<label>_<time_index>.vtk` for every call.
#[derive(Debug, Clone)]
pub struct VtkResultSink {
    directory: PathBuf,
    written: Vec<PathBuf>,
}

impl VtkResultSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            written: Vec::new(),
        }
    }

    /// Files written so far.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl ResultSink for VtkResultSink {
    fn write(
        &mut self,
        label: &str,
        time_index: usize,
        time: f64,
        mesh: &OutputMesh,
        results: &ResultSet,
    ) -> eyre::Result<()> {
        let path = self.directory.join(format!("{}_{}.vtk", label, time_index));
        let data = build_data_set(mesh, results)?;
        export(&path, &format!("{} at t = {}", label, time), data)?;
        self.written.push(path);
        Ok(())
    }
}
