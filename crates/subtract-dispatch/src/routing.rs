//! Static routing table from tool name to execution context.
//!
//! The scientific toolchains ship with conflicting runtime dependencies, so
//! each family lives in its own conda environment. Lookup is a pure function
//! of the program name.

use std::path::Path;

/// Context used for any tool not listed below.
pub const DEFAULT_CONTEXT: &str = "base";

const ANTS_TOOLS: &[&str] = &[
    "antsRegistrationSyNQuick.sh",
    "ConvertTransformFile",
    "antsRegistration",
    "antsApplyTransforms",
];

const MRTRIX_TOOLS: &[&str] = &[
    "mrconvert",
    "dwi2response",
    "dwi2fod",
    "mrcat",
    "mtnormalise",
    "5ttgen",
    "dwiextract",
    "mrmath",
    "mrcalc",
    "mrdegibbs",
    "transformconvert",
    "mrtransform",
    "5tt2gmwmi",
    "dwidenoise",
    "tckgen",
    "tcksample",
    "tcksift2",
    "tck2connectome",
];

const MDT_TOOLS: &[&str] = &[
    "mdt",
    "mdt-create-protocol",
    "mdt-create-mask",
    "mdt-model-fit",
    "mdt-fit-model",
];

/// Name of the execution context `program` must run in.
///
/// Accepts bare names or paths; only the final component is consulted.
pub fn route(program: &str) -> &'static str {
    let tool = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);

    if ANTS_TOOLS.contains(&tool) {
        "ANTs"
    } else if MRTRIX_TOOLS.contains(&tool) {
        "mrtrix3"
    } else if MDT_TOOLS.contains(&tool) {
        "mdt"
    } else {
        // FSL, FreeSurfer, and shell wrappers all live in the base context.
        DEFAULT_CONTEXT
    }
}
