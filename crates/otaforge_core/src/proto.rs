//! Protobuf messages for the OTA payload manifest (update_metadata.proto,
//! proto2) and the OTA package metadata (ota_metadata.proto, proto3), with
//! field numbers matching AOSP update_engine.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct Extent {
    #[prost(uint64, optional, tag = "1")]
    pub start_block: Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub num_blocks: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Signatures {
    #[prost(message, repeated, tag = "1")]
    pub signatures: Vec<Signature>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Signature {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
    #[prost(fixed32, optional, tag = "3")]
    pub unpadded_signature_size: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PartitionInfo {
    #[prost(uint64, optional, tag = "1")]
    pub size: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub hash: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ImageInfo {
    #[prost(string, optional, tag = "1")]
    pub board: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub key: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub channel: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub version: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub build_channel: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub build_version: Option<String>,
}

pub mod install_operation {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Replace = 0,
        ReplaceBz = 1,
        Move = 2,
        Bsdiff = 3,
        SourceCopy = 4,
        SourceBsdiff = 5,
        Zero = 6,
        Discard = 7,
        ReplaceXz = 8,
        Puffdiff = 9,
        BrotliBsdiff = 10,
        Zucchini = 11,
        Lz4diffBsdiff = 12,
        Lz4diffPuffdiff = 13,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct InstallOperation {
    #[prost(enumeration = "install_operation::Type", required, tag = "1")]
    pub r#type: i32,
    #[prost(uint64, optional, tag = "2")]
    pub data_offset: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub data_length: Option<u64>,
    #[prost(message, repeated, tag = "4")]
    pub src_extents: Vec<Extent>,
    #[prost(uint64, optional, tag = "5")]
    pub src_length: Option<u64>,
    #[prost(message, repeated, tag = "6")]
    pub dst_extents: Vec<Extent>,
    #[prost(uint64, optional, tag = "7")]
    pub dst_length: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub data_sha256_hash: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub src_sha256_hash: Option<Vec<u8>>,
}

pub mod cow_merge_operation {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        CowCopy = 0,
        CowXor = 1,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct CowMergeOperation {
    #[prost(enumeration = "cow_merge_operation::Type", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub src_extent: Option<Extent>,
    #[prost(message, optional, tag = "3")]
    pub dst_extent: Option<Extent>,
    #[prost(uint32, optional, tag = "4")]
    pub src_offset: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PartitionUpdate {
    #[prost(string, required, tag = "1")]
    pub partition_name: String,
    #[prost(bool, optional, tag = "2")]
    pub run_postinstall: Option<bool>,
    #[prost(string, optional, tag = "3")]
    pub postinstall_path: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub filesystem_type: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub new_partition_signature: Vec<Signature>,
    #[prost(message, optional, tag = "6")]
    pub old_partition_info: Option<PartitionInfo>,
    #[prost(message, optional, tag = "7")]
    pub new_partition_info: Option<PartitionInfo>,
    #[prost(message, repeated, tag = "8")]
    pub operations: Vec<InstallOperation>,
    #[prost(bool, optional, tag = "9")]
    pub postinstall_optional: Option<bool>,
    #[prost(message, optional, tag = "10")]
    pub hash_tree_data_extent: Option<Extent>,
    #[prost(message, optional, tag = "11")]
    pub hash_tree_extent: Option<Extent>,
    #[prost(string, optional, tag = "12")]
    pub hash_tree_algorithm: Option<String>,
    #[prost(bytes = "vec", optional, tag = "13")]
    pub hash_tree_salt: Option<Vec<u8>>,
    #[prost(message, optional, tag = "14")]
    pub fec_data_extent: Option<Extent>,
    #[prost(message, optional, tag = "15")]
    pub fec_extent: Option<Extent>,
    #[prost(uint32, optional, tag = "16", default = "2")]
    pub fec_roots: Option<u32>,
    #[prost(string, optional, tag = "17")]
    pub version: Option<String>,
    #[prost(message, repeated, tag = "18")]
    pub merge_operations: Vec<CowMergeOperation>,
    #[prost(uint64, optional, tag = "19")]
    pub estimate_cow_size: Option<u64>,
    #[prost(uint64, optional, tag = "20")]
    pub estimate_op_count_max: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DynamicPartitionGroup {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(uint64, optional, tag = "2")]
    pub size: Option<u64>,
    #[prost(string, repeated, tag = "3")]
    pub partition_names: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VabcFeatureSet {
    #[prost(bool, optional, tag = "1")]
    pub threaded: Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub batch_writes: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DynamicPartitionMetadata {
    #[prost(message, repeated, tag = "1")]
    pub groups: Vec<DynamicPartitionGroup>,
    #[prost(bool, optional, tag = "2")]
    pub snapshot_enabled: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub vabc_enabled: Option<bool>,
    #[prost(string, optional, tag = "4")]
    pub vabc_compression_param: Option<String>,
    #[prost(uint32, optional, tag = "5")]
    pub cow_version: Option<u32>,
    #[prost(message, optional, tag = "6")]
    pub vabc_feature_set: Option<VabcFeatureSet>,
    #[prost(uint64, optional, tag = "7")]
    pub compression_factor: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ApexInfo {
    #[prost(string, optional, tag = "1")]
    pub package_name: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub version: Option<i64>,
    #[prost(bool, optional, tag = "3")]
    pub is_compressed: Option<bool>,
    #[prost(int64, optional, tag = "4")]
    pub decompressed_size: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeltaArchiveManifest {
    #[prost(message, repeated, tag = "1")]
    pub install_operations: Vec<InstallOperation>,
    #[prost(message, repeated, tag = "2")]
    pub kernel_install_operations: Vec<InstallOperation>,
    #[prost(uint32, optional, tag = "3", default = "4096")]
    pub block_size: Option<u32>,
    #[prost(uint64, optional, tag = "4")]
    pub signatures_offset: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub signatures_size: Option<u64>,
    #[prost(message, optional, tag = "6")]
    pub old_kernel_info: Option<PartitionInfo>,
    #[prost(message, optional, tag = "7")]
    pub new_kernel_info: Option<PartitionInfo>,
    #[prost(message, optional, tag = "8")]
    pub old_rootfs_info: Option<PartitionInfo>,
    #[prost(message, optional, tag = "9")]
    pub new_rootfs_info: Option<PartitionInfo>,
    #[prost(message, optional, tag = "10")]
    pub old_image_info: Option<ImageInfo>,
    #[prost(message, optional, tag = "11")]
    pub new_image_info: Option<ImageInfo>,
    #[prost(uint32, optional, tag = "12")]
    pub minor_version: Option<u32>,
    #[prost(message, repeated, tag = "13")]
    pub partitions: Vec<PartitionUpdate>,
    #[prost(int64, optional, tag = "14")]
    pub max_timestamp: Option<i64>,
    #[prost(message, optional, tag = "15")]
    pub dynamic_partition_metadata: Option<DynamicPartitionMetadata>,
    #[prost(bool, optional, tag = "16")]
    pub partial_update: Option<bool>,
    #[prost(message, repeated, tag = "17")]
    pub apex_info: Vec<ApexInfo>,
    #[prost(string, optional, tag = "18")]
    pub security_patch_level: Option<String>,
}

// ---------------------------------------------------------------------------
// ota_metadata.proto (proto3)

pub mod ota_metadata {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum OtaType {
        Unknown = 0,
        Ab = 1,
        Block = 2,
        Brick = 3,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct PartitionState {
    #[prost(string, tag = "1")]
    pub partition_name: String,
    #[prost(string, repeated, tag = "2")]
    pub device: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub build: Vec<String>,
    #[prost(string, tag = "4")]
    pub version: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceState {
    #[prost(string, repeated, tag = "1")]
    pub device: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub build: Vec<String>,
    #[prost(string, tag = "3")]
    pub build_incremental: String,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(string, tag = "5")]
    pub sdk_level: String,
    #[prost(string, tag = "6")]
    pub security_patch_level: String,
    #[prost(message, repeated, tag = "7")]
    pub partition_state: Vec<PartitionState>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OtaMetadata {
    #[prost(enumeration = "ota_metadata::OtaType", tag = "1")]
    pub r#type: i32,
    #[prost(bool, tag = "2")]
    pub wipe: bool,
    #[prost(bool, tag = "3")]
    pub downgrade: bool,
    /// BTreeMap keeps re-encoding deterministic.
    #[prost(btree_map = "string, string", tag = "4")]
    pub property_files: std::collections::BTreeMap<String, String>,
    #[prost(message, optional, tag = "5")]
    pub precondition: Option<DeviceState>,
    #[prost(message, optional, tag = "6")]
    pub postcondition: Option<DeviceState>,
    #[prost(bool, tag = "7")]
    pub retrofit_dynamic_partitions: bool,
    #[prost(int64, tag = "8")]
    pub required_cache: i64,
    #[prost(bool, tag = "9")]
    pub spl_downgrade: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_round_trip() {
        let manifest = DeltaArchiveManifest {
            block_size: Some(4096),
            minor_version: Some(0),
            partitions: vec![PartitionUpdate {
                partition_name: "boot".to_string(),
                new_partition_info: Some(PartitionInfo {
                    size: Some(0x4000000),
                    hash: Some(vec![0xaa; 32]),
                }),
                operations: vec![InstallOperation {
                    r#type: install_operation::Type::ReplaceXz as i32,
                    data_offset: Some(0),
                    data_length: Some(1234),
                    dst_extents: vec![Extent {
                        start_block: Some(0),
                        num_blocks: Some(16384),
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let encoded = manifest.encode_to_vec();
        let decoded = DeltaArchiveManifest::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_ota_metadata_map_is_deterministic() {
        let mut metadata = OtaMetadata {
            r#type: ota_metadata::OtaType::Ab as i32,
            ..Default::default()
        };
        metadata
            .property_files
            .insert("ota-streaming-property-files".to_string(), "a".to_string());
        metadata
            .property_files
            .insert("ota-property-files".to_string(), "b".to_string());

        assert_eq!(metadata.encode_to_vec(), metadata.clone().encode_to_vec());
    }
}
