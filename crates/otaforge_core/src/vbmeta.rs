//! vbmeta rebuilding: discover which partitions each vbmeta image references
//! and regenerate it against the patched descendants.

use crate::avb::{self, Descriptor, VbmetaImage};
use crate::crypto::SigningKey;
use crate::error::{PatchError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Map each given vbmeta image to the partition names referenced by its
/// hash, hashtree and chain descriptors.
pub fn vbmeta_deps(
    image_paths: &BTreeMap<String, PathBuf>,
) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut graph = BTreeMap::new();

    for (name, path) in image_paths {
        let data = fs::read(path).map_err(|e| PatchError::io_path(path, e))?;
        let (_, vbmeta) = avb::load_vbmeta(&data)?;

        let deps: BTreeSet<String> = vbmeta
            .descriptors
            .iter()
            .filter_map(|d| d.partition_name())
            .map(|n| n.to_string())
            .collect();
        graph.insert(name.clone(), deps);
    }

    Ok(graph)
}

fn load_image_vbmeta(path: &Path) -> Result<VbmetaImage> {
    let data = fs::read(path).map_err(|e| PatchError::io_path(path, e))?;
    Ok(avb::load_vbmeta(&data)?.1)
}

/// Regenerate one vbmeta image. Descriptors naming a partition in `deps` are
/// replaced with that partition's current descriptor (hash or hashtree) or
/// public key (chain), taken from the patched image on disk. The result is
/// re-signed with `key` and padded to `block_size`.
pub fn patch_vbmeta_image(
    input_path: &Path,
    output_path: &Path,
    deps: &BTreeSet<String>,
    image_paths: &BTreeMap<String, PathBuf>,
    key: &SigningKey,
    block_size: u64,
    clear_vbmeta_flags: bool,
) -> Result<()> {
    let data = fs::read(input_path).map_err(|e| PatchError::io_path(input_path, e))?;
    let (_, mut vbmeta) = avb::load_vbmeta(&data)?;

    let disable_mask = avb::FLAG_HASHTREE_DISABLED | avb::FLAG_VERIFICATION_DISABLED;
    if vbmeta.flags & disable_mask != 0 {
        if clear_vbmeta_flags {
            vbmeta.flags &= !disable_mask;
        } else {
            return Err(PatchError::InvalidArgument(format!(
                "vbmeta flags {:#x} disable AVB; pass --clear-vbmeta-flags to clear them",
                vbmeta.flags
            )));
        }
    }

    let mut descriptors = Vec::with_capacity(vbmeta.descriptors.len());
    for descriptor in std::mem::take(&mut vbmeta.descriptors) {
        let replacement = match &descriptor {
            Descriptor::Hash(d) if deps.contains(&d.partition_name) => {
                Some(dep_descriptor(&d.partition_name, image_paths, avb::TAG_HASH)?)
            }
            Descriptor::Hashtree { partition_name, .. } if deps.contains(partition_name) => {
                Some(dep_descriptor(partition_name, image_paths, avb::TAG_HASHTREE)?)
            }
            Descriptor::ChainPartition(d) if deps.contains(&d.partition_name) => {
                let dep = load_image_vbmeta(&image_paths[&d.partition_name])?;
                if dep.public_key.is_empty() {
                    return Err(PatchError::KeyMismatch(format!(
                        "chained partition {} is unsigned",
                        d.partition_name
                    )));
                }
                let mut chained = d.clone();
                chained.public_key = dep.public_key;
                Some(Descriptor::ChainPartition(chained))
            }
            _ => None,
        };
        descriptors.push(replacement.unwrap_or(descriptor));
    }
    vbmeta.descriptors = descriptors;

    // Some devices sign with 2048-bit keys; re-signing targets 4096-bit
    // keys. Every other algorithm passes through unchanged.
    let algorithm = avb::algorithm_by_type(vbmeta.algorithm_type)?;
    if algorithm.name == "SHA256_RSA2048" {
        vbmeta.algorithm_type = avb::algorithm_by_name("SHA256_RSA4096")?.algorithm_type;
    }

    debug!(
        input = %input_path.display(),
        descriptors = vbmeta.descriptors.len(),
        "rebuilding vbmeta image"
    );

    let mut blob = avb::generate_vbmeta_image(&vbmeta, Some(key))?;
    let padded = (blob.len() as u64).div_ceil(block_size) * block_size;
    blob.resize(padded as usize, 0);

    fs::write(output_path, &blob).map_err(|e| PatchError::io_path(output_path, e))?;
    Ok(())
}

/// Pull the named partition's descriptor of the given tag out of its own
/// (already patched) image.
fn dep_descriptor(
    partition: &str,
    image_paths: &BTreeMap<String, PathBuf>,
    tag: u64,
) -> Result<Descriptor> {
    let path = image_paths.get(partition).ok_or_else(|| {
        PatchError::NotFound(format!("image for dependency partition {partition}"))
    })?;
    let vbmeta = load_image_vbmeta(path)?;

    vbmeta
        .descriptors
        .into_iter()
        .find(|d| {
            d.partition_name() == Some(partition)
                && match (tag, d) {
                    (avb::TAG_HASH, Descriptor::Hash(_)) => true,
                    (avb::TAG_HASHTREE, Descriptor::Hashtree { .. }) => true,
                    _ => false,
                }
        })
        .ok_or_else(|| {
            PatchError::Corrupt(format!(
                "no matching descriptor for partition {partition} in {}",
                path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avb::{ChainPartitionDescriptor, HashDescriptor};

    fn release_string() -> Vec<u8> {
        let mut s = b"avbtool 1.3.0".to_vec();
        s.resize(48, 0);
        s
    }

    fn write_unsigned_vbmeta(path: &Path, descriptors: Vec<Descriptor>, flags: u32) {
        let image = VbmetaImage {
            required_libavb_version_major: 1,
            required_libavb_version_minor: 0,
            algorithm_type: 0,
            rollback_index: 0,
            flags,
            rollback_index_location: 0,
            release_string: release_string(),
            public_key: Vec::new(),
            descriptors,
        };
        fs::write(path, avb::generate_vbmeta_image(&image, None).unwrap()).unwrap();
    }

    #[test]
    fn test_vbmeta_deps_collects_descriptor_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vbmeta.img");
        write_unsigned_vbmeta(
            &path,
            vec![
                Descriptor::Hash(HashDescriptor {
                    image_size: 0x1000,
                    hash_algorithm: "sha256".to_string(),
                    partition_name: "boot".to_string(),
                    salt: vec![1; 32],
                    digest: vec![2; 32],
                    flags: 0,
                }),
                Descriptor::ChainPartition(ChainPartitionDescriptor {
                    rollback_index_location: 1,
                    partition_name: "vbmeta_system".to_string(),
                    public_key: vec![3; 1032],
                    flags: 0,
                }),
            ],
            0,
        );

        let mut paths = BTreeMap::new();
        paths.insert("vbmeta".to_string(), path);
        let graph = vbmeta_deps(&paths).unwrap();

        let expected: BTreeSet<String> =
            ["boot", "vbmeta_system"].iter().map(|s| s.to_string()).collect();
        assert_eq!(graph["vbmeta"], expected);
    }

    #[test]
    fn test_dep_descriptor_picks_matching_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.img");
        write_unsigned_vbmeta(
            &path,
            vec![Descriptor::Hash(HashDescriptor {
                image_size: 0x2000,
                hash_algorithm: "sha256".to_string(),
                partition_name: "boot".to_string(),
                salt: vec![7; 32],
                digest: vec![8; 32],
                flags: 0,
            })],
            0,
        );

        let mut paths = BTreeMap::new();
        paths.insert("boot".to_string(), path);

        let descriptor = dep_descriptor("boot", &paths, avb::TAG_HASH).unwrap();
        match descriptor {
            Descriptor::Hash(d) => assert_eq!(d.digest, vec![8; 32]),
            other => panic!("unexpected descriptor: {other:?}"),
        }

        // Asking for a hashtree descriptor the image does not carry fails.
        assert!(dep_descriptor("boot", &paths, avb::TAG_HASHTREE).is_err());
    }
}
