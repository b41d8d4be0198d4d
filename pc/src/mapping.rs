//! Mapping between heat-fluids elements and field cells

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::driver::{CellHandle, ElementIndex, FieldDriver, HeatFluidsDriver, Position};
use crate::error::{CouplingError, Result};
use crate::topology::Topology;

/// Element-to-cell mapping held by one heat-fluids rank
///
/// `cells` is the rank's global cell list: the distinct cells its elements
/// fall into, in ascending handle order. Every per-cell array on the rank is
/// indexed by it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellMapping {
    elem_to_cell: Vec<CellHandle>,
    cell_to_elems: BTreeMap<CellHandle, Vec<ElementIndex>>,
    cells: Vec<CellHandle>,
}

impl CellMapping {
    /// Build from the cell of each local element
    pub fn from_element_cells(elem_to_cell: Vec<CellHandle>) -> Self {
        let mut cell_to_elems: BTreeMap<CellHandle, Vec<ElementIndex>> = BTreeMap::new();
        for (element, &cell) in elem_to_cell.iter().enumerate() {
            cell_to_elems.entry(cell).or_default().push(element);
        }
        let cells = cell_to_elems.keys().copied().collect();

        Self {
            elem_to_cell,
            cell_to_elems,
            cells,
        }
    }

    /// Global cell list of this rank
    pub fn cells(&self) -> &[CellHandle] {
        &self.cells
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn n_elements(&self) -> usize {
        self.elem_to_cell.len()
    }

    /// Cell of each local element
    pub fn element_cells(&self) -> &[CellHandle] {
        &self.elem_to_cell
    }

    pub fn cell_to_elements(&self) -> &BTreeMap<CellHandle, Vec<ElementIndex>> {
        &self.cell_to_elems
    }

    /// Local elements inside `cell`
    pub fn elements_of(&self, cell: CellHandle) -> &[ElementIndex] {
        self.cell_to_elems.get(&cell).map(Vec::as_slice).unwrap_or(&[])
    }

    fn check_len(&self, what: &str, len: usize) -> Result<()> {
        if len == self.n_elements() {
            Ok(())
        } else {
            Err(CouplingError::Invariant(format!(
                "{} has {} entries for {} local elements",
                what,
                len,
                self.n_elements()
            )))
        }
    }

    /// Total element volume of each cell
    pub fn cell_volumes(&self, volumes: &[f64]) -> Result<Vec<f64>> {
        self.check_len("element volumes", volumes.len())?;
        self.cells
            .iter()
            .map(|cell| {
                let total: f64 = self.elements_of(*cell).iter().map(|&e| volumes[e]).sum();
                if total > 0.0 {
                    Ok(total)
                } else {
                    Err(CouplingError::Invariant(format!("cell {} has volume {}", cell, total)))
                }
            })
            .collect()
    }

    fn cell_average(&self, quantity: &str, cell: CellHandle, values: &[f64], volumes: &[f64]) -> Result<f64> {
        let elements = self.elements_of(cell);
        let weighted: f64 = elements.iter().map(|&e| values[e] * volumes[e]).sum();
        let volume: f64 = elements.iter().map(|&e| volumes[e]).sum();
        let average = weighted / volume;
        if average > 0.0 {
            Ok(average)
        } else {
            Err(CouplingError::Invariant(format!(
                "average {} in cell {} is {}",
                quantity, cell, average
            )))
        }
    }

    /// Volume-weighted average of element `values` over each cell
    ///
    /// `quantity` names the values in the error raised for a non-positive average.
    pub fn volume_average(&self, quantity: &str, values: &[f64], volumes: &[f64]) -> Result<Vec<f64>> {
        self.check_len(quantity, values.len())?;
        self.check_len("element volumes", volumes.len())?;
        self.cells
            .iter()
            .map(|&cell| self.cell_average(quantity, cell, values, volumes))
            .collect()
    }

    /// Overwrite `out` with the volume-weighted average of the cells whose mask is set
    pub fn volume_average_masked(
        &self,
        quantity: &str,
        values: &[f64],
        volumes: &[f64],
        mask: &[bool],
        out: &mut [f64],
    ) -> Result<()> {
        self.check_len(quantity, values.len())?;
        self.check_len("element volumes", volumes.len())?;
        if mask.len() != self.n_cells() || out.len() != self.n_cells() {
            return Err(CouplingError::Invariant(format!(
                "cell arrays of length {} and {} for {} cells",
                mask.len(),
                out.len(),
                self.n_cells()
            )));
        }
        for (i, &cell) in self.cells.iter().enumerate() {
            if mask[i] {
                out[i] = self.cell_average(quantity, cell, values, volumes)?;
            }
        }
        Ok(())
    }

    /// Fluid flag of each cell, taken from its first element
    pub fn fluid_mask(&self, element_mask: &[bool]) -> Result<Vec<bool>> {
        self.check_len("fluid mask", element_mask.len())?;
        Ok(self
            .cells
            .iter()
            .map(|cell| self.elements_of(*cell).first().is_some_and(|&e| element_mask[e]))
            .collect())
    }
}

/// Builds each heat-fluids rank's [`CellMapping`] with the field root's help
pub struct SpatialMapper;

impl SpatialMapper {
    /// Resolve every heat-fluids element to a field cell
    ///
    /// Heat-fluids ranks are served one after another: each ships its
    /// centroids to the field root, which locates them and sends the handles
    /// back. Collective over the world; ranks outside the heat-fluids group
    /// get an empty mapping.
    pub async fn build(topology: &Topology, field: &dyn FieldDriver, heat: &dyn HeatFluidsDriver) -> Result<CellMapping> {
        let world = &topology.world;
        let me = world.world_rank();
        let field_root = topology.field_root();
        debug!(world_rank = me, "SpatialMapper::build: called");

        let mut mapping = CellMapping::default();
        for &heat_rank in topology.heat_ranks() {
            let mut centroids: Vec<Position> = if me == heat_rank && heat.has_coupling_data() {
                heat.centroid_local()
            } else {
                Vec::new()
            };
            world.send_and_recv(&mut centroids, field_root, heat_rank).await?;

            let mut handles: Vec<CellHandle> = Vec::new();
            if me == field_root {
                handles = locate_all(field, heat_rank, &centroids)?;
                debug!(heat_rank, elements = handles.len(), "SpatialMapper::build: located elements");
            }
            world.send_and_recv(&mut handles, heat_rank, field_root).await?;

            if me == heat_rank {
                mapping = CellMapping::from_element_cells(handles);
            }
        }

        world.barrier().await?;
        world.message("Mapped heat-fluids elements to field cells");
        if topology.is_heat() {
            info!(
                world_rank = me,
                elements = mapping.n_elements(),
                cells = mapping.n_cells(),
                "Local cell mapping"
            );
        }
        Ok(mapping)
    }
}

fn locate_all(field: &dyn FieldDriver, heat_rank: usize, centroids: &[Position]) -> Result<Vec<CellHandle>> {
    field
        .find(centroids)
        .into_iter()
        .zip(centroids)
        .enumerate()
        .map(|(element, (found, position))| {
            found.ok_or(CouplingError::UnmappedElement {
                rank: heat_rank,
                element,
                position: *position,
            })
        })
        .collect()
}
