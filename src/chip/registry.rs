//! Chip type registry.
//!
//! Every chip family is a row in a static table built once on first use. A row names its
//! code, the family it belongs to, an optional base type whose geometry it reuses, an
//! optional size override and the formula used to derive coordinates from a chip name.
//! Adding a family is a one-line change to [`TYPE_TABLE`].
//!
//! ```
//! use chip_daq::chip::registry;
//!
//! let code = registry().classify("xh0512")?;
//! assert_eq!(code.as_str(), "XH");
//! // XH reuses the geometry of X
//! assert_eq!(registry().area(code.as_str())?, 1.0);
//! # Ok::<(), chip_daq::error::DaqError>(())
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{AppResult, DaqError};

/// Physical chip dimensions in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipSize {
    pub width: f64,
    pub height: f64,
}

impl ChipSize {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn perimeter(&self) -> f64 {
        (self.width + self.height) * 2.0
    }
}

/// Measurement family a chip type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChipFamily {
    /// Sized chips measured with IV and CV sweeps.
    Simple,
    /// One pixel of a matrix chip.
    Matrix,
    /// Chips measured for external quantum efficiency.
    Eqe,
    /// Test structures; no geometry, no coordinates.
    TestStructure,
}

/// How wafer coordinates are derived from a chip name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateFormula {
    /// `<CODE>XXYY`
    Grid,
    /// `<CODE>XXYY_IJ`, where `IJ` is the pixel offset inside the parent grid cell.
    MatrixPixel,
    /// The type carries no coordinates.
    Undefined,
}

/// One row of the type table.
#[derive(Debug, Clone)]
pub struct ChipTypeDescriptor {
    pub code: &'static str,
    pub family: ChipFamily,
    /// Type whose geometry is reused when `size` is not set.
    pub base: Option<&'static str>,
    pub size: Option<ChipSize>,
    pub coordinates: CoordinateFormula,
}

/// Coordinates derived from a chip name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipCoordinates {
    pub x: u32,
    pub y: u32,
    /// Local `(i, j)` offset for matrix pixels.
    pub pixel: Option<(u32, u32)>,
}

/// A chip type code known to be present in the registry.
///
/// Only the registry hands these out, so every code carries its table row.
#[derive(Debug, Clone, Copy)]
pub struct TypeCode(&'static ChipTypeDescriptor);

impl TypeCode {
    pub fn as_str(&self) -> &'static str {
        self.0.code
    }

    /// The registry row of this code.
    pub fn descriptor(&self) -> &'static ChipTypeDescriptor {
        self.0
    }
}

impl PartialEq for TypeCode {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for TypeCode {}

impl Hash for TypeCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl PartialOrd for TypeCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeCode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TypeCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

const fn row(
    code: &'static str,
    family: ChipFamily,
    base: Option<&'static str>,
    size: Option<ChipSize>,
    coordinates: CoordinateFormula,
) -> ChipTypeDescriptor {
    ChipTypeDescriptor {
        code,
        family,
        base,
        size,
        coordinates,
    }
}

const fn simple(code: &'static str, size: Option<ChipSize>) -> ChipTypeDescriptor {
    row(code, ChipFamily::Simple, None, size, CoordinateFormula::Grid)
}

const fn eqe(code: &'static str, base: Option<&'static str>, size: Option<ChipSize>) -> ChipTypeDescriptor {
    row(code, ChipFamily::Eqe, base, size, CoordinateFormula::Grid)
}

/// Static chip type table.
pub const TYPE_TABLE: &[ChipTypeDescriptor] = &[
    simple("A", Some(ChipSize::new(1.69, 1.69))),
    simple("B", Some(ChipSize::new(1.69, 1.69))),
    simple("C", None),
    simple("D", None),
    simple("E", Some(ChipSize::new(1.806, 1.806))),
    simple("F", Some(ChipSize::new(2.56, 1.25))),
    simple("G", Some(ChipSize::new(1.4, 3.25))),
    simple("S", Some(ChipSize::new(1.825, 1.825))),
    simple("T", Some(ChipSize::new(1.45, 1.45))),
    simple("V", Some(ChipSize::new(10.0, 10.0))),
    row("VH", ChipFamily::Simple, Some("V"), None, CoordinateFormula::Grid),
    simple("X", Some(ChipSize::new(1.0, 1.0))),
    row("XH", ChipFamily::Simple, Some("X"), None, CoordinateFormula::Grid),
    simple("Y", Some(ChipSize::new(2.0, 2.0))),
    row("YH", ChipFamily::Simple, Some("Y"), None, CoordinateFormula::Grid),
    // one pixel out of 9
    row("Q", ChipFamily::Matrix, None, Some(ChipSize::new(0.448, 0.540)), CoordinateFormula::MatrixPixel),
    row("R", ChipFamily::Matrix, None, Some(ChipSize::new(0.830, 0.665)), CoordinateFormula::MatrixPixel),
    eqe("U", None, Some(ChipSize::new(5.0, 5.0))),
    eqe("UH", Some("U"), None),
    eqe("I", None, None),
    eqe("IH", Some("I"), None),
    eqe("IM", Some("I"), None),
    eqe("J", None, None),
    eqe("JH", Some("J"), None),
    eqe("JM", Some("J"), None),
    eqe("L", None, None),
    eqe("LH", Some("L"), None),
    eqe("LM", Some("L"), None),
    row("REF", ChipFamily::Eqe, None, None, CoordinateFormula::Undefined),
    row("TS", ChipFamily::TestStructure, None, None, CoordinateFormula::Undefined),
];

static REGISTRY: Lazy<ChipTypeRegistry> = Lazy::new(|| ChipTypeRegistry::from_table(TYPE_TABLE));

static TYPE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]+").expect("valid regex"));
static GRID_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2})(\d{2})$").expect("valid regex"));
static PIXEL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2})(\d{2})(?:_(\d)(\d))?$").expect("valid regex"));

/// Returns the process-wide chip type registry.
pub fn registry() -> &'static ChipTypeRegistry {
    &REGISTRY
}

/// Immutable lookup over [`TYPE_TABLE`].
#[derive(Debug)]
pub struct ChipTypeRegistry {
    types: HashMap<&'static str, &'static ChipTypeDescriptor>,
}

impl ChipTypeRegistry {
    fn from_table(table: &'static [ChipTypeDescriptor]) -> Self {
        let types = table.iter().map(|d| (d.code, d)).collect();
        Self { types }
    }

    /// Look up the descriptor of a type code.
    pub fn get(&self, code: &str) -> AppResult<&'static ChipTypeDescriptor> {
        self.types
            .get(code)
            .copied()
            .ok_or_else(|| DaqError::UnknownChipType(code.to_string()))
    }

    /// Validate a code and return it as a [`TypeCode`].
    pub fn type_code(&self, code: &str) -> AppResult<TypeCode> {
        let upper = code.to_uppercase();
        self.get(&upper).map(TypeCode)
    }

    /// Infer the chip type from a chip name.
    ///
    /// The name is upper-cased and its alphabetic prefix must be a registered code. The numeric
    /// suffix is not inspected here; coordinates are validated when they are requested.
    pub fn classify(&self, name: &str) -> AppResult<TypeCode> {
        let name = name.trim().to_uppercase();
        let prefix = TYPE_PREFIX
            .find(&name)
            .ok_or_else(|| DaqError::InvalidChipName {
                name: name.clone(),
                reason: "could not infer chip type, expected a type code followed by 4 digits"
                    .to_string(),
            })?;
        self.type_code(prefix.as_str())
    }

    /// Physical size of a type, following the base chain when the row has no size of its own.
    pub fn geometry_of(&self, code: &str) -> AppResult<ChipSize> {
        let mut descriptor = self.get(code)?;
        loop {
            if let Some(size) = descriptor.size {
                return Ok(size);
            }
            match descriptor.base {
                Some(base) => descriptor = self.get(base)?,
                None => return Err(DaqError::GeometryUndefined(code.to_string())),
            }
        }
    }

    pub fn area(&self, code: &str) -> AppResult<f64> {
        self.geometry_of(code).map(|s| s.area())
    }

    pub fn perimeter(&self, code: &str) -> AppResult<f64> {
        self.geometry_of(code).map(|s| s.perimeter())
    }

    /// Whether area and perimeter queries succeed for this type.
    pub fn is_measurable(&self, code: &str) -> bool {
        self.geometry_of(code).is_ok()
    }

    /// Derive wafer coordinates from a chip name of the given type.
    pub fn coordinates(&self, code: &str, name: &str) -> AppResult<ChipCoordinates> {
        let descriptor = self.get(code)?;
        let undefined = |reason: &str| DaqError::CoordinatesUndefined {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let digits = name
            .strip_prefix(descriptor.code)
            .ok_or_else(|| undefined("name does not start with its chip type"))?;

        match descriptor.coordinates {
            CoordinateFormula::Grid => {
                let caps = GRID_SUFFIX
                    .captures(digits)
                    .ok_or_else(|| undefined("expected format is chip type followed by 4 digits"))?;
                Ok(ChipCoordinates {
                    x: parse_group(&caps, 1),
                    y: parse_group(&caps, 2),
                    pixel: None,
                })
            }
            CoordinateFormula::MatrixPixel => {
                let caps = PIXEL_SUFFIX.captures(digits).ok_or_else(|| {
                    undefined("expected format is chip type followed by 4 digits and an optional _IJ pixel")
                })?;
                let pixel = caps
                    .get(3)
                    .map(|_| (parse_group(&caps, 3), parse_group(&caps, 4)));
                Ok(ChipCoordinates {
                    x: parse_group(&caps, 1),
                    y: parse_group(&caps, 2),
                    pixel,
                })
            }
            CoordinateFormula::Undefined => Err(undefined("chip type has no coordinates")),
        }
    }

    /// All registered codes, sorted.
    pub fn codes(&self) -> Vec<&'static str> {
        let mut codes: Vec<_> = self.types.keys().copied().collect();
        codes.sort_unstable();
        codes
    }
}

// Groups only ever match ASCII digits.
fn parse_group(caps: &regex::Captures<'_>, index: usize) -> u32 {
    caps.get(index)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or_default()
}
