//! Decides which partitions a patch run touches and in what order vbmeta
//! images must be rebuilt.

use crate::error::{PatchError, Result};
use crate::proto::DeltaArchiveManifest;
use std::collections::{BTreeMap, BTreeSet};

pub const ROLE_GKI_KERNEL: &str = "@gki_kernel";
pub const ROLE_GKI_RAMDISK: &str = "@gki_ramdisk";
pub const ROLE_OTACERTS: &str = "@otacerts";
pub const ROLE_ROOTPATCH: &str = "@rootpatch";

/// Role to partition-candidate priority lists.
///
/// - the kernel is always in boot;
/// - devices launching with Android 13 use a GKI init_boot ramdisk;
/// - some vendors keep a dedicated recovery image with its own otacerts.
const PARTITION_PRIORITIES: &[(&str, &[&str])] = &[
    (ROLE_GKI_KERNEL, &["boot"]),
    (ROLE_GKI_RAMDISK, &["init_boot", "boot"]),
    (ROLE_OTACERTS, &["recovery", "vendor_boot", "boot"]),
];

/// Classify the manifest's partitions by role. Every partition whose name
/// contains `vbmeta` gets an `@vbmeta:<name>` role of its own.
pub fn partitions_by_role(manifest: &DeltaArchiveManifest) -> Result<BTreeMap<String, String>> {
    let all_partitions: BTreeSet<&str> = manifest
        .partitions
        .iter()
        .map(|p| p.partition_name.as_str())
        .collect();

    let mut by_role = BTreeMap::new();

    for (role, candidates) in PARTITION_PRIORITIES {
        let partition = candidates
            .iter()
            .find(|c| all_partitions.contains(**c))
            .ok_or_else(|| PatchError::NotFound(format!("cannot find partition of type: {role}")))?;
        by_role.insert(role.to_string(), partition.to_string());
    }

    for partition in &all_partitions {
        if partition.contains("vbmeta") {
            by_role.insert(format!("@vbmeta:{partition}"), partition.to_string());
        }
    }

    Ok(by_role)
}

/// The images a patch run needs: the otacerts target, every vbmeta image,
/// and, when rooting, the configured boot partition under `@rootpatch`.
/// `boot_partition` may be a role name or an actual partition name.
pub fn required_images(
    manifest: &DeltaArchiveManifest,
    boot_partition: &str,
    with_root: bool,
) -> Result<BTreeMap<String, String>> {
    let by_role = partitions_by_role(manifest)?;
    let mut images: BTreeMap<String, String> = by_role
        .iter()
        .filter(|(role, _)| *role == ROLE_OTACERTS || role.starts_with("@vbmeta:"))
        .map(|(role, partition)| (role.clone(), partition.clone()))
        .collect();

    if with_root {
        if let Some(partition) = by_role.get(boot_partition) {
            images.insert(ROLE_ROOTPATCH.to_string(), partition.clone());
        } else if manifest
            .partitions
            .iter()
            .any(|p| p.partition_name == boot_partition)
        {
            images.insert(ROLE_ROOTPATCH.to_string(), boot_partition.to_string());
        } else {
            return Err(PatchError::NotFound(format!(
                "boot partition not found: {boot_partition}"
            )));
        }
    }

    Ok(images)
}

/// Reduce the vbmeta dependency graph to the working set, elide vbmeta
/// images none of whose descendants changed, and topologically order the
/// rest (dependencies first, ties broken by name).
///
/// `dep_graph` maps each vbmeta image to the partitions referenced by its
/// chain and hash descriptors; `image_names` is the working set of images on
/// disk; `vbmeta_images` the subset that are vbmeta partitions.
pub fn vbmeta_patch_order(
    dep_graph: &BTreeMap<String, BTreeSet<String>>,
    image_names: &BTreeSet<String>,
    vbmeta_images: &BTreeSet<String>,
) -> Result<(BTreeMap<String, BTreeSet<String>>, Vec<String>)> {
    // Keep only dependencies among the images we are working with.
    let mut graph: BTreeMap<String, BTreeSet<String>> = dep_graph
        .iter()
        .filter(|(name, _)| image_names.contains(*name))
        .map(|(name, deps)| {
            let deps = deps
                .iter()
                .filter(|d| image_names.contains(*d))
                .cloned()
                .collect();
            (name.clone(), deps)
        })
        .collect();

    // A vbmeta image with no remaining dependencies references nothing that
    // changed, so it does not need a rewrite.
    loop {
        let unneeded: BTreeSet<String> = graph
            .iter()
            .filter(|(name, deps)| vbmeta_images.contains(*name) && deps.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        if unneeded.is_empty() {
            break;
        }
        graph.retain(|name, _| !unneeded.contains(name));
        for deps in graph.values_mut() {
            deps.retain(|d| !unneeded.contains(d));
        }
    }

    // Kahn's algorithm over keys and referenced nodes; the BTreeSet makes
    // the tie-break lexicographic.
    let mut remaining: BTreeSet<String> = graph.keys().cloned().collect();
    for deps in graph.values() {
        remaining.extend(deps.iter().cloned());
    }

    let mut done: BTreeSet<String> = BTreeSet::new();
    let mut order = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|name| {
                graph
                    .get(*name)
                    .is_none_or(|deps| deps.iter().all(|d| done.contains(d)))
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            return Err(PatchError::Corrupt(format!(
                "vbmeta dependency cycle among: {remaining:?}"
            )));
        }

        for name in ready {
            remaining.remove(&name);
            done.insert(name.clone());
            if vbmeta_images.contains(&name) {
                order.push(name);
            }
        }
    }

    Ok((graph, order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::PartitionUpdate;

    fn manifest_with(partitions: &[&str]) -> DeltaArchiveManifest {
        DeltaArchiveManifest {
            partitions: partitions
                .iter()
                .map(|name| PartitionUpdate {
                    partition_name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_roles_prefer_priority_order() {
        let manifest = manifest_with(&["boot", "init_boot", "vendor_boot", "vbmeta", "system"]);
        let roles = partitions_by_role(&manifest).unwrap();

        assert_eq!(roles[ROLE_GKI_KERNEL], "boot");
        assert_eq!(roles[ROLE_GKI_RAMDISK], "init_boot");
        assert_eq!(roles[ROLE_OTACERTS], "vendor_boot");
        assert_eq!(roles["@vbmeta:vbmeta"], "vbmeta");
    }

    #[test]
    fn test_missing_role_is_fatal() {
        let manifest = manifest_with(&["system", "vendor"]);
        assert!(matches!(
            partitions_by_role(&manifest),
            Err(PatchError::NotFound(_))
        ));
    }

    #[test]
    fn test_required_images_with_root() {
        let manifest = manifest_with(&["boot", "init_boot", "vendor_boot", "vbmeta", "vbmeta_system"]);

        let images = required_images(&manifest, ROLE_GKI_RAMDISK, true).unwrap();
        assert_eq!(images[ROLE_ROOTPATCH], "init_boot");
        assert_eq!(images[ROLE_OTACERTS], "vendor_boot");
        assert!(images.contains_key("@vbmeta:vbmeta"));
        assert!(images.contains_key("@vbmeta:vbmeta_system"));

        // An actual partition name also resolves.
        let images = required_images(&manifest, "boot", true).unwrap();
        assert_eq!(images[ROLE_ROOTPATCH], "boot");

        assert!(matches!(
            required_images(&manifest, "missing_part", true),
            Err(PatchError::NotFound(_))
        ));
    }

    #[test]
    fn test_rootless_omits_rootpatch() {
        let manifest = manifest_with(&["boot", "vendor_boot", "vbmeta"]);
        let images = required_images(&manifest, ROLE_GKI_RAMDISK, false).unwrap();
        assert!(!images.contains_key(ROLE_ROOTPATCH));
        assert!(images.contains_key(ROLE_OTACERTS));
    }

    #[test]
    fn test_vbmeta_order_dependencies_first() {
        let mut deps = BTreeMap::new();
        deps.insert("vbmeta".to_string(), set(&["boot", "vbmeta_system"]));
        deps.insert("vbmeta_system".to_string(), set(&["boot"]));

        let working = set(&["boot", "vbmeta", "vbmeta_system"]);
        let vbmetas = set(&["vbmeta", "vbmeta_system"]);

        let (graph, order) = vbmeta_patch_order(&deps, &working, &vbmetas).unwrap();
        assert_eq!(order, vec!["vbmeta_system", "vbmeta"]);
        // Planner ordering invariant: every dependency precedes its dependent.
        for (node, node_deps) in &graph {
            for dep in node_deps {
                if let (Some(a), Some(b)) = (
                    order.iter().position(|n| n == dep),
                    order.iter().position(|n| n == node),
                ) {
                    assert!(a < b, "{dep} must precede {node}");
                }
            }
        }
    }

    #[test]
    fn test_vbmeta_without_changed_deps_is_elided() {
        let mut deps = BTreeMap::new();
        // vbmeta_vendor references only partitions outside the working set.
        deps.insert("vbmeta_vendor".to_string(), set(&["vendor"]));
        deps.insert("vbmeta".to_string(), set(&["boot", "vbmeta_vendor"]));

        let working = set(&["boot", "vbmeta", "vbmeta_vendor"]);
        let vbmetas = set(&["vbmeta", "vbmeta_vendor"]);

        let (graph, order) = vbmeta_patch_order(&deps, &working, &vbmetas).unwrap();
        assert_eq!(order, vec!["vbmeta"]);
        assert!(!graph.contains_key("vbmeta_vendor"));
        // vbmeta's remaining deps no longer mention the elided image.
        assert_eq!(graph["vbmeta"], set(&["boot"]));
    }

    #[test]
    fn test_vbmeta_order_tie_break_is_lexicographic() {
        let mut deps = BTreeMap::new();
        deps.insert("vbmeta_b".to_string(), set(&["boot"]));
        deps.insert("vbmeta_a".to_string(), set(&["boot"]));

        let working = set(&["boot", "vbmeta_a", "vbmeta_b"]);
        let vbmetas = set(&["vbmeta_a", "vbmeta_b"]);

        let (_, order) = vbmeta_patch_order(&deps, &working, &vbmetas).unwrap();
        assert_eq!(order, vec!["vbmeta_a", "vbmeta_b"]);
    }

    #[test]
    fn test_vbmeta_cycle_is_error() {
        let mut deps = BTreeMap::new();
        deps.insert("vbmeta_a".to_string(), set(&["vbmeta_b"]));
        deps.insert("vbmeta_b".to_string(), set(&["vbmeta_a"]));

        let working = set(&["vbmeta_a", "vbmeta_b"]);
        let vbmetas = working.clone();

        assert!(vbmeta_patch_order(&deps, &working, &vbmetas).is_err());
    }
}
