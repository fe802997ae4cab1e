//! Python bindings for the nuclide_flow disassembler

use pyo3::prelude::*;
use pyo3::types::PyDict;
use pyo3::exceptions::{PyValueError, PyIOError};
use crate::format::OutputFormat;
use crate::{
    parser::GoblinParser,
    decoder::CapstoneDecoder,
    disasm::{Disassembler, Target},
};

/// Interpret an entry given from Python: `0x`-prefixed hex is an address,
/// anything else a label.
fn parse_entry(entry: &str) -> PyResult<Target> {
    match entry.strip_prefix("0x").or_else(|| entry.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map(Target::Address)
            .map_err(|e| PyValueError::new_err(format!("Invalid entry address {}: {}", entry, e))),
        None => Ok(Target::from(entry)),
    }
}

/// Follow control flow from the entry points and format the resulting blocks
#[pyfunction]
#[pyo3(signature = (binary_data, entry_points=Vec::new(), output_format="text"))]
fn disassemble(
    binary_data: Vec<u8>,
    entry_points: Vec<String>,
    output_format: &str,
) -> PyResult<String> {
    let program = GoblinParser::new()
        .parse(&binary_data)
        .map_err(|e| PyValueError::new_err(format!("Failed to parse binary: {}", e)))?;

    let decoder = CapstoneDecoder::for_architecture(program.architecture)
        .map_err(|e| PyValueError::new_err(format!("Failed to create decoder: {}", e)))?;

    let output_format: OutputFormat = output_format.parse().map_err(PyValueError::new_err)?;

    let mut entries = entry_points
        .iter()
        .map(|e| parse_entry(e))
        .collect::<PyResult<Vec<_>>>()?;
    if entries.is_empty() {
        match program.entry_point {
            Some(entry) => entries.push(Target::Address(entry)),
            None => return Err(PyValueError::new_err("No entry points given and the binary has none")),
        }
    }

    let mut dasm = Disassembler::new(&program, &decoder);
    dasm.disassemble_all(entries);

    output_format
        .get_formatter()
        .format(&program, dasm.graph())
        .map_err(|e| PyValueError::new_err(format!("Failed to format output: {}", e)))
}

/// Disassemble a file from the entry points and format the resulting blocks
#[pyfunction]
#[pyo3(signature = (file_path, entry_points=Vec::new(), output_format="text"))]
fn disassemble_file(
    file_path: &str,
    entry_points: Vec<String>,
    output_format: &str,
) -> PyResult<String> {
    let bytes = std::fs::read(file_path)
        .map_err(|e| PyIOError::new_err(format!("Failed to read file {}: {}", file_path, e)))?;

    log::debug!("disassembling file {}", file_path);
    disassemble(bytes, entry_points, output_format)
}

/// Python module initialization
#[pymodule]
fn nuclide_flow(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(disassemble, m)?)?;
    m.add_function(wrap_pyfunction!(disassemble_file, m)?)?;

    // Create the OutputFormat class as a dict
    let py = m.py();
    let output_format = PyDict::new(py);
    for format in OutputFormat::available_formats() {
        output_format.set_item(format.to_string().to_uppercase(), format.to_string())?;
    }
    m.setattr("OutputFormat", output_format)?;

    Ok(())
}
