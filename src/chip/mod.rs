//! Chips, wafers and matrices.
//!
//! A [`Chip`] is a single entity whatever its family; the family specific behaviour
//! (geometry, coordinate derivation) is looked up through its [`TypeCode`] in the
//! [`registry`]. Chips are identified by `(name, wafer_id)`.

pub mod registry;

pub use registry::{
    registry, ChipCoordinates, ChipFamily, ChipSize, ChipTypeDescriptor, ChipTypeRegistry,
    CoordinateFormula, TypeCode,
};

use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// Identifier of a persisted chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChipId(pub u64);

/// Identifier of a persisted wafer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaferId(pub u64);

/// Identifier of a persisted matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatrixId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chip {
    pub id: ChipId,
    pub wafer_id: WaferId,
    /// Upper-cased chip name, e.g. `XH0512`.
    pub name: String,
    pub type_code: TypeCode,
    pub matrix_id: Option<MatrixId>,
}

impl Chip {
    /// Create a chip, inferring its type from the name unless `explicit_type` is given.
    ///
    /// # Errors
    ///
    /// `UnknownChipType` if the inferred or explicit type is not registered,
    /// `InvalidChipName` if no type prefix can be found.
    pub fn new(
        id: ChipId,
        wafer_id: WaferId,
        name: &str,
        explicit_type: Option<&str>,
    ) -> AppResult<Self> {
        let name = normalize_name(name);
        let type_code = match explicit_type {
            Some(code) => registry().type_code(code)?,
            None => registry().classify(&name)?,
        };
        Ok(Self {
            id,
            wafer_id,
            name,
            type_code,
            matrix_id: None,
        })
    }

    pub fn descriptor(&self) -> &'static ChipTypeDescriptor {
        self.type_code.descriptor()
    }

    pub fn family(&self) -> ChipFamily {
        self.descriptor().family
    }

    pub fn coordinates(&self) -> AppResult<ChipCoordinates> {
        registry().coordinates(self.type_code.as_str(), &self.name)
    }

    pub fn x_coordinate(&self) -> AppResult<u32> {
        self.coordinates().map(|c| c.x)
    }

    pub fn y_coordinate(&self) -> AppResult<u32> {
        self.coordinates().map(|c| c.y)
    }

    pub fn area(&self) -> AppResult<f64> {
        registry().area(self.type_code.as_str())
    }

    pub fn perimeter(&self) -> AppResult<f64> {
        registry().perimeter(self.type_code.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wafer {
    pub id: WaferId,
    pub name: String,
}

/// A grid of pixel chips measured in one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Matrix {
    pub id: MatrixId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub chips: Vec<ChipId>,
}

impl Matrix {
    /// Pixel chip names, row-major over `width` then `height`.
    pub fn pixel_names(name: &str, width: u32, height: u32) -> Vec<String> {
        let name = normalize_name(name);
        (0..width)
            .flat_map(|i| (0..height).map(move |j| (i, j)))
            .map(|(i, j)| format!("{name}_{i}{j}"))
            .collect()
    }
}

/// Chip names are stored upper-case.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_uppercase()
}
