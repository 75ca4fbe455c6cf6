//! Converts Kubernetes resource quantities into the units the autoscaler plans in
//!
//! Cpu is tracked in millicpu and memory in mebibytes everywhere so capacity
//! math never mixes units.

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::client::Error;

/// A cpu/memory pair in millicpu and mebibytes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Requests {
    /// The cpu amount in millicpu
    pub cpu: u64,
    /// The memory amount in mebibytes
    pub memory: u64,
}

/// Bounds checks a cpu quantity and converts it to millicpu
///
/// # Arguments
///
/// * `raw` - The raw cpu quantity
pub fn millicpu(raw: Option<&Quantity>) -> Result<u64, Error> {
    // missing quantities count as 0
    let raw = match raw {
        Some(quantity) => quantity.0.as_str(),
        None => return Ok(0),
    };
    // plain values are core counts
    if let Ok(cores) = raw.parse::<f64>() {
        return Ok((cores * 1000.0).ceil() as u64);
    }
    // otherwise this must be a millicpu value
    if let Some(millis) = raw.strip_suffix('m') {
        return millis
            .parse::<u64>()
            .map_err(|_| Error::new(format!("Invalid cpu quantity: {raw}")));
    }
    Err(Error::new(format!("Failed to parse cpu quantity: {raw}")))
}

/// Bounds checks a memory/storage quantity and converts it to mebibytes
///
/// # Arguments
///
/// * `raw` - The raw memory quantity
pub fn mebibytes(raw: Option<&Quantity>) -> Result<u64, Error> {
    // missing quantities count as 0
    let raw = match raw {
        Some(quantity) => quantity.0.as_str(),
        None => return Ok(0),
    };
    // plain values are byte counts
    if let Ok(bytes) = raw.parse::<f64>() {
        return Ok((bytes / 1_048_576.0).ceil() as u64);
    }
    // find where the unit suffix starts
    let split = match raw.find(|ch: char| ch.is_ascii_alphabetic()) {
        Some(split) => split,
        None => return Err(Error::new(format!("Failed to parse quantity: {raw}"))),
    };
    let (amount, unit) = raw.split_at(split);
    let amount = amount
        .parse::<f64>()
        .map_err(|_| Error::new(format!("Invalid quantity amount: {raw}")))?;
    // scale by the binary or decimal unit
    let bytes = match unit {
        "Ki" => amount * 1024.0,
        "Mi" => amount * 1_048_576.0,
        "Gi" => amount * 1_073_741_824.0,
        "Ti" => amount * 1_099_511_627_776.0,
        "k" | "K" => amount * 1e3,
        "M" => amount * 1e6,
        "G" => amount * 1e9,
        "T" => amount * 1e12,
        _ => return Err(Error::new(format!("Unknown quantity unit: {raw}"))),
    };
    Ok((bytes / 1_048_576.0).ceil() as u64)
}

/// Get the effective resource requests for a pod
///
/// Init containers run to completion before the main containers start so they
/// act as a floor on the pods footprint rather than adding to it.
///
/// # Arguments
///
/// * `pod` - The pod to total requests for
pub fn pod_requests(pod: &Pod) -> Result<Requests, Error> {
    // pods without a spec request nothing
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Ok(Requests::default()),
    };
    let mut cpu = 0;
    let mut memory = 0;
    // sum the requests of all main containers
    for container in &spec.containers {
        if let Some(requests) = container
            .resources
            .as_ref()
            .and_then(|resources| resources.requests.as_ref())
        {
            cpu += millicpu(requests.get("cpu"))?;
            memory += mebibytes(requests.get("memory"))?;
        }
    }
    // init containers count as a max not a sum
    if let Some(init_containers) = &spec.init_containers {
        let mut init_cpu = 0;
        let mut init_memory = 0;
        for container in init_containers {
            if let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|resources| resources.requests.as_ref())
            {
                init_cpu = init_cpu.max(millicpu(requests.get("cpu"))?);
                init_memory = init_memory.max(mebibytes(requests.get("memory"))?);
            }
        }
        cpu = cpu.max(init_cpu);
        memory = memory.max(init_memory);
    }
    Ok(Requests { cpu, memory })
}

/// Get the allocatable cpu and memory a node reports
///
/// # Arguments
///
/// * `node` - The node to read allocatable resources from
pub fn node_allocatable(node: &Node) -> Result<Option<Requests>, Error> {
    // nodes without a status offer nothing
    if let Some(status) = &node.status {
        if let Some(allocatable) = &status.allocatable {
            let cpu = millicpu(allocatable.get("cpu"))?;
            let memory = mebibytes(allocatable.get("memory"))?;
            return Ok(Some(Requests { cpu, memory }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use std::collections::BTreeMap;

    /// Build a quantity from a raw string
    fn quantity(raw: &str) -> Quantity {
        Quantity(raw.to_owned())
    }

    /// Build a container with the given cpu and memory requests
    fn container(cpu: &str, memory: &str) -> Container {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_owned(), quantity(cpu));
        requests.insert("memory".to_owned(), quantity(memory));
        Container {
            name: "main".to_owned(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn cpu_quantities_convert_to_millicpu() {
        assert_eq!(millicpu(Some(&quantity("100m"))).unwrap(), 100);
        assert_eq!(millicpu(Some(&quantity("2"))).unwrap(), 2000);
        assert_eq!(millicpu(Some(&quantity("1.5"))).unwrap(), 1500);
        assert_eq!(millicpu(None).unwrap(), 0);
        assert!(millicpu(Some(&quantity("lots"))).is_err());
    }

    #[test]
    fn memory_quantities_convert_to_mebibytes() {
        assert_eq!(mebibytes(Some(&quantity("128Mi"))).unwrap(), 128);
        assert_eq!(mebibytes(Some(&quantity("1Gi"))).unwrap(), 1024);
        assert_eq!(mebibytes(Some(&quantity("1048576"))).unwrap(), 1);
        // decimal gigabytes round up to the next mebibyte
        assert_eq!(mebibytes(Some(&quantity("1G"))).unwrap(), 954);
        assert!(mebibytes(Some(&quantity("1Xi"))).is_err());
    }

    #[test]
    fn init_containers_are_a_floor_not_a_sum() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![container("100m", "128Mi"), container("100m", "128Mi")],
                init_containers: Some(vec![
                    container("1", "64Mi"),
                    container("500m", "512Mi"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let requests = pod_requests(&pod).unwrap();
        // the init cpu max (1000m) beats the main sum (200m)
        assert_eq!(requests.cpu, 1000);
        // the init memory max (512Mi) beats the main sum (256Mi)
        assert_eq!(requests.memory, 512);
    }

    #[test]
    fn main_containers_win_when_they_outweigh_init() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![container("2", "1Gi"), container("1", "1Gi")],
                init_containers: Some(vec![container("100m", "64Mi")]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let requests = pod_requests(&pod).unwrap();
        assert_eq!(requests.cpu, 3000);
        assert_eq!(requests.memory, 2048);
    }
}
