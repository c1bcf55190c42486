use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum PuzzleSize {
    Pieces500,
    Pieces1000,
}

impl PuzzleSize {
    pub fn pieces(&self) -> u32 {
        match self {
            PuzzleSize::Pieces500 => 500,
            PuzzleSize::Pieces1000 => 1000,
        }
    }
}

impl TryFrom<u32> for PuzzleSize {
    type Error = ExportError;

    fn try_from(pieces: u32) -> Result<Self, Self::Error> {
        match pieces {
            500 => Ok(PuzzleSize::Pieces500),
            1000 => Ok(PuzzleSize::Pieces1000),
            other => Err(ExportError::UnsupportedSize(other)),
        }
    }
}

impl From<PuzzleSize> for u32 {
    fn from(size: PuzzleSize) -> Self {
        size.pieces()
    }
}

impl fmt::Display for PuzzleSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-piece", self.pieces())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintDimensions {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for PrintDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrintSpec {
    pub size: PuzzleSize,
    pub dimensions: PrintDimensions,
    pub grid_cols: u32,
    pub grid_rows: u32,
    pub dpi: u32,
}

/// Pixel targets per puzzle size, 300 DPI portrait prints.
#[derive(Debug, Clone)]
pub struct PrintSpecs {
    specs: IndexMap<PuzzleSize, PrintSpec>,
}

impl Default for PrintSpecs {
    fn default() -> Self {
        let specs = [
            PrintSpec {
                size: PuzzleSize::Pieces500,
                dimensions: PrintDimensions { width: 4800, height: 6000 },
                grid_cols: 20,
                grid_rows: 25,
                dpi: 300,
            },
            PrintSpec {
                size: PuzzleSize::Pieces1000,
                dimensions: PrintDimensions { width: 6000, height: 8400 },
                grid_cols: 25,
                grid_rows: 40,
                dpi: 300,
            },
        ]
        .into_iter()
        .map(|spec| (spec.size, spec))
        .collect();

        Self { specs }
    }
}

impl PrintSpecs {
    pub fn get(&self, size: PuzzleSize) -> Result<&PrintSpec, ExportError> {
        self.specs
            .get(&size)
            .ok_or(ExportError::UnsupportedSize(size.pieces()))
    }

    pub fn dimensions(&self, size: PuzzleSize) -> Result<PrintDimensions, ExportError> {
        self.get(size).map(|spec| spec.dimensions)
    }

    /// Replaces the pixel target for one size, keeping its grid.
    pub fn with_dimensions(mut self, size: PuzzleSize, width: u32, height: u32) -> Self {
        if let Some(spec) = self.specs.get_mut(&size) {
            spec.dimensions = PrintDimensions { width, height };
        }
        self
    }
}
