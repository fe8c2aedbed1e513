use anyhow::{anyhow, bail, Result};
use pasture_core::{
    math::AABB,
    nalgebra::{Point3, Vector3},
};
use rustc_hash::FxHashMap;

/// Whether the cells of a `SparseGrid` are unbounded along z (columns, used for horizontal footprints) or
/// regular cubes (used for radius queries)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CellShape {
    Columns,
    Cubes,
}

/// Exact axis-aligned bounds of the given positions, or `None` if there are no positions
pub fn bounds_of(positions: &[Vector3<f64>]) -> Option<AABB<f64>> {
    let first = positions.first()?;
    let (min, max) = positions
        .iter()
        .fold((*first, *first), |(min, max), pos| (min.inf(pos), max.sup(pos)));
    Some(AABB::from_min_max_unchecked(
        Point3::from(min),
        Point3::from(max),
    ))
}

/// Sparse uniform grid over the points of one scene. Each occupied cell stores the indices of its points,
/// cells are addressed by a bit-packed u64 key
pub struct SparseGrid {
    bounds: AABB<f64>,
    cell_size: f64,
    shape: CellShape,
    dimensions: Vector3<u64>,
    bits_per_dimension: Vector3<u64>,
    cells: FxHashMap<u64, Vec<usize>>,
}

impl SparseGrid {
    pub fn new(bounds: AABB<f64>, cell_size: f64, shape: CellShape) -> Result<Self> {
        if cell_size <= 0.0 || !cell_size.is_finite() {
            bail!("Cell size of a SparseGrid must be positive (got {})", cell_size);
        }
        let cells_along = |extent: f64| f64::ceil(extent / cell_size).max(1.0);
        let num_cells_per_dimension = Vector3::new(
            cells_along(bounds.max().x - bounds.min().x),
            cells_along(bounds.max().y - bounds.min().y),
            match shape {
                CellShape::Columns => 1.0,
                CellShape::Cubes => cells_along(bounds.max().z - bounds.min().z),
            },
        );
        let x_bits = f64::ceil(f64::log2(num_cells_per_dimension.x)) as u64;
        let y_bits = f64::ceil(f64::log2(num_cells_per_dimension.y)) as u64;
        let z_bits = f64::ceil(f64::log2(num_cells_per_dimension.z)) as u64;
        if (x_bits + y_bits + z_bits) as usize > (std::mem::size_of::<u64>() * 8) {
            return Err(anyhow!(
                "Too many cells ({}*{}*{}) in SparseGrid! The number of cells exceeds the capacity of a u64 index!",
                num_cells_per_dimension.x,
                num_cells_per_dimension.y,
                num_cells_per_dimension.z
            ));
        }

        Ok(Self {
            bounds,
            cell_size,
            shape,
            dimensions: Vector3::new(
                num_cells_per_dimension.x as u64,
                num_cells_per_dimension.y as u64,
                num_cells_per_dimension.z as u64,
            ),
            bits_per_dimension: Vector3::new(x_bits, y_bits, z_bits),
            cells: FxHashMap::default(),
        })
    }

    /// Builds a grid over the bounds of `positions` and inserts all of them
    pub fn from_positions(
        positions: &[Vector3<f64>],
        cell_size: f64,
        shape: CellShape,
    ) -> Result<Self> {
        let bounds = bounds_of(positions)
            .ok_or_else(|| anyhow!("Can't build a SparseGrid over zero points"))?;
        let mut grid = Self::new(bounds, cell_size, shape)?;
        for (index, position) in positions.iter().enumerate() {
            grid.insert(index, position);
        }
        Ok(grid)
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn shape(&self) -> CellShape {
        self.shape
    }

    fn cell_along(&self, coordinate: f64, min: f64, dimension: u64) -> u64 {
        let relative = ((coordinate - min) / self.cell_size).floor();
        if relative <= 0.0 {
            0
        } else {
            (relative as u64).min(dimension - 1)
        }
    }

    /// Integer cell coordinates of `position`. Positions outside of the bounds are clamped to the border cells
    pub fn cell_coordinates(&self, position: &Vector3<f64>) -> Vector3<u64> {
        let z = match self.shape {
            CellShape::Columns => 0,
            CellShape::Cubes => {
                self.cell_along(position.z, self.bounds.min().z, self.dimensions.z)
            }
        };
        Vector3::new(
            self.cell_along(position.x, self.bounds.min().x, self.dimensions.x),
            self.cell_along(position.y, self.bounds.min().y, self.dimensions.y),
            z,
        )
    }

    fn cell_center(&self, cell: &Vector3<u64>) -> Vector3<f64> {
        Vector3::new(
            (cell.x as f64 + 0.5) * self.cell_size + self.bounds.min().x,
            (cell.y as f64 + 0.5) * self.cell_size + self.bounds.min().y,
            (cell.z as f64 + 0.5) * self.cell_size + self.bounds.min().z,
        )
    }

    fn cell_key(&self, cell: &Vector3<u64>) -> u64 {
        let x_bit_mask = (1_u64 << self.bits_per_dimension.x) - 1;
        let y_bit_mask = (1_u64 << self.bits_per_dimension.y) - 1;
        let z_bit_mask = (1_u64 << self.bits_per_dimension.z) - 1;

        let y_bit_shift = self.bits_per_dimension.x;
        let z_bit_shift = self.bits_per_dimension.x + self.bits_per_dimension.y;
        (cell.x & x_bit_mask) | (cell.y & y_bit_mask) << y_bit_shift | (cell.z & z_bit_mask) << z_bit_shift
    }

    pub fn insert(&mut self, index: usize, position: &Vector3<f64>) {
        let key = self.cell_key(&self.cell_coordinates(position));
        self.cells.entry(key).or_default().push(index);
    }

    pub fn num_occupied_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> impl Iterator<Item = &u64> {
        self.cells.keys()
    }

    /// Indices of all points in cells that overlap the box `[min, max]`. This is a superset of the points
    /// inside the box, in no particular order. For column grids the z range is ignored
    pub fn candidates_in_box(
        &self,
        min: &Vector3<f64>,
        max: &Vector3<f64>,
    ) -> impl Iterator<Item = usize> + '_ {
        let low = self.cell_coordinates(min);
        let high = self.cell_coordinates(max);
        (low.z..=high.z)
            .flat_map(move |z| {
                (low.y..=high.y).flat_map(move |y| (low.x..=high.x).map(move |x| Vector3::new(x, y, z)))
            })
            .filter_map(move |cell| self.cells.get(&self.cell_key(&cell)))
            .flat_map(|indices| indices.iter().copied())
    }

    /// Indices of all points whose position lies in the closed box `[min, max]`, sorted ascending. Identical to
    /// a scan over `positions`. For column grids only x and y are compared
    pub fn indices_in_box(
        &self,
        positions: &[Vector3<f64>],
        min: &Vector3<f64>,
        max: &Vector3<f64>,
    ) -> Vec<usize> {
        let check_z = self.shape == CellShape::Cubes;
        let mut indices = self
            .candidates_in_box(min, max)
            .filter(|idx| {
                let pos = &positions[*idx];
                pos.x >= min.x
                    && pos.x <= max.x
                    && pos.y >= min.y
                    && pos.y <= max.y
                    && (!check_z || (pos.z >= min.z && pos.z <= max.z))
            })
            .collect::<Vec<_>>();
        indices.sort_unstable();
        indices
    }

    /// Indices of all points within `radius` of `center` (inclusive), sorted ascending
    pub fn within_radius(
        &self,
        positions: &[Vector3<f64>],
        center: &Vector3<f64>,
        radius: f64,
    ) -> Vec<usize> {
        let offset = Vector3::new(radius, radius, radius);
        let radius_sqr = radius * radius;
        let mut indices = self
            .candidates_in_box(&(center - offset), &(center + offset))
            .filter(|idx| (positions[*idx] - center).norm_squared() <= radius_sqr)
            .collect::<Vec<_>>();
        indices.sort_unstable();
        indices
    }
}

/// Thins `positions` to one point per occupied cube of side `voxel_size`: the point closest to the cube's
/// center, the lowest index on ties. The returned indices are sorted ascending
pub fn voxel_downsample(positions: &[Vector3<f64>], voxel_size: f64) -> Result<Vec<usize>> {
    let grid = SparseGrid::from_positions(positions, voxel_size, CellShape::Cubes)?;
    let mut kept = grid
        .cells
        .values()
        .filter_map(|indices| {
            let cell = grid.cell_coordinates(&positions[*indices.first()?]);
            let center = grid.cell_center(&cell);
            indices.iter().copied().min_by(|a, b| {
                let distance_a = (positions[*a] - center).norm_squared();
                let distance_b = (positions[*b] - center).norm_squared();
                distance_a.total_cmp(&distance_b)
            })
        })
        .collect::<Vec<_>>();
    kept.sort_unstable();
    Ok(kept)
}
