use crate::model::CubedSphereResolution;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// MPI decomposition of a GCHP run over the six faces of the cubed sphere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorLayout {
    pub nodes: u32,
    pub cores_per_node: u32,
    pub total_cores: u32,
    pub cores_per_face: u32,
    /// Number of domains along the X axis of a face (`IM_WORLD` decomposition).
    pub nx: u32,
    /// Number of domains along the Y axis of a face (`JM_WORLD` decomposition).
    pub ny: u32,
    pub vertical_levels: u32,
}

fn factor_pairs(value: u32) -> Vec<(u32, u32)> {
    (1..=value)
        .take_while(|i| i * i <= value)
        .filter(|i| value % i == 0)
        .map(|i| (i, value / i))
        .collect()
}

/// Computes the domain decomposition of a GCHP run.
///
/// Prefers the first factor pair of the cores per face that evenly divides the face
/// side; when there is none, the most square pair is used.
pub fn gchp_layout(
    resolution: CubedSphereResolution,
    nodes: u32,
    cores_per_node: u32,
) -> ProcessorLayout {
    let nodes = nodes.max(1);
    let total_cores = nodes * cores_per_node;
    let cores_per_face = (total_cores / 6).max(1);
    let side = resolution.side_length();

    let pairs = factor_pairs(cores_per_face);
    let (nx, ny) = pairs
        .iter()
        .copied()
        .find_or_last(|(x, y)| side % x == 0 && side % y == 0)
        .unwrap_or((1, cores_per_face));

    ProcessorLayout {
        nodes,
        cores_per_node,
        total_cores,
        cores_per_face,
        nx,
        ny,
        vertical_levels: resolution.vertical_levels(),
    }
}
