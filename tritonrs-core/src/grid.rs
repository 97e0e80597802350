use std::fmt;

use crate::{meta::MetadataMapping, Result};

/// A three dimensional launch extent: grid dimensions or block dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn is_empty(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }

    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self { x, y, z }
    }
}

impl From<[u32; 3]> for Dim3 {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<Dim3> for (u32, u32, u32) {
    fn from(d: Dim3) -> Self {
        (d.x, d.y, d.z)
    }
}

pub type GridFn = dyn Fn(&MetadataMapping) -> Result<Dim3> + Send + Sync;

/// How a launch grid is specified at a call site.
pub enum GridSpec {
    Concrete(Dim3),
    /// Computed from the resolved metadata. The closure yields a concrete
    /// grid, so evaluation is always a single step.
    Deferred(Box<GridFn>),
}

impl GridSpec {
    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn(&MetadataMapping) -> Result<Dim3> + Send + Sync + 'static,
    {
        Self::Deferred(Box::new(f))
    }

    pub fn resolve(&self, meta: &MetadataMapping) -> Result<Dim3> {
        match self {
            Self::Concrete(grid) => Ok(*grid),
            Self::Deferred(f) => f(meta),
        }
    }
}

impl From<Dim3> for GridSpec {
    fn from(grid: Dim3) -> Self {
        Self::Concrete(grid)
    }
}

impl From<(u32, u32, u32)> for GridSpec {
    fn from(grid: (u32, u32, u32)) -> Self {
        Self::Concrete(grid.into())
    }
}

impl fmt::Debug for GridSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(grid) => f.debug_tuple("Concrete").field(grid).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

pub fn resolve(spec: &GridSpec, meta: &MetadataMapping) -> Result<Dim3> {
    spec.resolve(meta)
}

/// Ceiling division. Panics if `b` is zero; read divisors from metadata with
/// [`MetadataMapping::require_positive`].
pub fn cdiv(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Smallest power of two that is `>= n`, with `next_power_of_two(0) == 1`.
pub fn next_power_of_two(n: u64) -> u64 {
    n.max(1).next_power_of_two()
}
