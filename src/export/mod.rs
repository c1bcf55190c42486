mod exporter;
mod print_specs;

pub use exporter::{ExportOutput, Exporter};
pub use print_specs::{PrintDimensions, PrintSpec, PrintSpecs, PuzzleSize};
