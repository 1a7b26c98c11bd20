//! OTA payload handling: header/manifest parsing, per-partition extraction,
//! and re-emission of a patched, re-signed payload.

use crate::crypto::SigningKey;
use crate::error::{PatchError, Result};
use crate::proto::{
    DeltaArchiveManifest, Extent, InstallOperation, PartitionInfo, Signature, Signatures,
    install_operation,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use prost::Message;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
pub const PAYLOAD_VERSION: u64 = 2;
const PAYLOAD_HEADER_SIZE: u64 = 4 + 8 + 8 + 4;

const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Callbacks for long-running pipeline work. All methods default to no-ops.
pub trait ProgressReporter: Send + Sync {
    fn begin_step(&self, _msg: &str) {}
    fn on_start(&self, _partition: &str, _total_ops: u64) {}
    fn on_progress(&self, _partition: &str, _completed_ops: u64, _total_ops: u64) {}
    fn on_complete(&self, _partition: &str) {}
    fn warning(&self, _msg: &str) {}
}

pub struct NullReporter;

impl ProgressReporter for NullReporter {}

/// Where the payload bytes live: a byte range of a file. Cheap to clone so
/// every extraction worker can open its own reader.
#[derive(Clone, Debug)]
pub struct PayloadSource {
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

impl PayloadSource {
    pub fn new(path: PathBuf, offset: u64, size: u64) -> Self {
        Self { path, offset, size }
    }

    pub fn open(&self) -> Result<PayloadReader> {
        let file = File::open(&self.path).map_err(|e| PatchError::io_path(&self.path, e))?;
        Ok(PayloadReader {
            file,
            base: self.offset,
            size: self.size,
        })
    }
}

pub struct PayloadReader {
    file: File,
    base: u64,
    size: u64,
}

impl PayloadReader {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(PatchError::Corrupt(format!(
                "payload read beyond end: {} + {} > {}",
                offset,
                buf.len(),
                self.size
            )));
        }
        self.file.seek(SeekFrom::Start(self.base + offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn read_vec_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

#[derive(Clone)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    pub metadata_signature_size: u32,
    /// Absolute offset (within the payload) of the blob section.
    pub blob_offset: u64,
}

/// Read the payload header and decode the manifest.
pub fn parse_payload(reader: &mut PayloadReader) -> Result<PayloadHeader> {
    let mut header = [0u8; PAYLOAD_HEADER_SIZE as usize];
    reader.read_exact_at(0, &mut header)?;

    if &header[0..4] != PAYLOAD_MAGIC {
        return Err(PatchError::UnsupportedFormat(format!(
            "payload magic: {:02x?}",
            &header[0..4]
        )));
    }

    let version = u64::from_be_bytes(header[4..12].try_into().unwrap());
    if version != PAYLOAD_VERSION {
        return Err(PatchError::UnsupportedFormat(format!(
            "payload major version {version}"
        )));
    }

    let manifest_size = u64::from_be_bytes(header[12..20].try_into().unwrap());
    let metadata_signature_size = u32::from_be_bytes(header[20..24].try_into().unwrap());

    let manifest_raw = reader.read_vec_at(PAYLOAD_HEADER_SIZE, manifest_size as usize)?;
    let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())?;

    Ok(PayloadHeader {
        version,
        manifest,
        metadata_signature_size,
        blob_offset: PAYLOAD_HEADER_SIZE + manifest_size + metadata_signature_size as u64,
    })
}

fn worker_count(tasks: usize) -> usize {
    tasks.clamp(1, num_cpus::get())
}

fn op_type(op: &InstallOperation) -> Result<install_operation::Type> {
    install_operation::Type::try_from(op.r#type)
        .map_err(|_| PatchError::UnsupportedFormat(format!("install operation type {}", op.r#type)))
}

/// Extract the named partitions into `<output_dir>/<name>.img`, in parallel.
/// Each worker opens its own reader on the payload; the pool is sized to the
/// partition count, capped at the CPU count. On failure all in-flight
/// workers are awaited before the first error is returned.
pub async fn extract_images(
    source: &PayloadSource,
    manifest: &DeltaArchiveManifest,
    blob_offset: u64,
    output_dir: &Path,
    partitions: &BTreeSet<String>,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<()> {
    let block_size = manifest.block_size.unwrap_or(4096) as u64;

    let mut missing = partitions.clone();
    let mut join_set: JoinSet<Result<()>> = JoinSet::new();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(worker_count(partitions.len())));

    for partition in &manifest.partitions {
        if !missing.remove(&partition.partition_name) {
            continue;
        }

        let partition = partition.clone();
        let source = source.clone();
        let out_path = output_dir.join(format!("{}.img", partition.partition_name));
        let reporter = reporter.clone();
        let semaphore = semaphore.clone();

        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| PatchError::Corrupt(format!("worker pool closed: {e}")))?;
            tokio::task::spawn_blocking(move || {
                extract_one(&source, &partition, block_size, blob_offset, &out_path, &reporter)
            })
            .await
            .map_err(|e| PatchError::Corrupt(format!("extraction worker panicked: {e}")))?
        });
    }

    if !missing.is_empty() {
        join_set.shutdown().await;
        return Err(PatchError::NotFound(format!(
            "partitions not in manifest: {missing:?}"
        )));
    }

    // Always drain every worker so no file handle is orphaned; report the
    // first failure afterwards.
    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        let result = joined
            .map_err(|e| PatchError::Corrupt(format!("extraction worker panicked: {e}")))
            .and_then(|r| r);
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn extract_one(
    source: &PayloadSource,
    partition: &crate::proto::PartitionUpdate,
    block_size: u64,
    blob_offset: u64,
    out_path: &Path,
    reporter: &Arc<dyn ProgressReporter>,
) -> Result<()> {
    let name = &partition.partition_name;
    let total_ops = partition.operations.len() as u64;
    reporter.on_start(name, total_ops);

    let mut reader = source.open()?;
    let mut file = File::create(out_path).map_err(|e| PatchError::io_path(out_path, e))?;

    for (index, op) in partition.operations.iter().enumerate() {
        let kind = op_type(op)?;
        match kind {
            install_operation::Type::Replace
            | install_operation::Type::ReplaceBz
            | install_operation::Type::ReplaceXz => {
                let data = reader.read_vec_at(
                    blob_offset + op.data_offset.unwrap_or(0),
                    op.data_length.unwrap_or(0) as usize,
                )?;

                if let Some(expected) = &op.data_sha256_hash {
                    if !expected.is_empty() && Sha256::digest(&data).as_slice() != expected.as_slice() {
                        return Err(PatchError::Corrupt(format!(
                            "operation {index} of {name} failed blob hash check"
                        )));
                    }
                }

                let raw = match kind {
                    install_operation::Type::Replace => data,
                    install_operation::Type::ReplaceBz => {
                        let mut out = Vec::new();
                        bzip2::read::BzDecoder::new(data.as_slice())
                            .read_to_end(&mut out)
                            .map_err(|e| PatchError::Corrupt(format!("bzip2 blob: {e}")))?;
                        out
                    }
                    install_operation::Type::ReplaceXz => {
                        let mut out = Vec::new();
                        lzma_rs::xz_decompress(&mut data.as_slice(), &mut out)
                            .map_err(|e| PatchError::Corrupt(format!("xz blob: {e:?}")))?;
                        out
                    }
                    _ => unreachable!(),
                };

                write_extents(&mut file, &op.dst_extents, block_size, Some(&raw))?;
            }
            install_operation::Type::Zero => {
                write_extents(&mut file, &op.dst_extents, block_size, None)?;
            }
            install_operation::Type::Discard => {}
            other => {
                return Err(PatchError::UnsupportedFormat(format!(
                    "install operation {other:?} (payload is not a full OTA)"
                )));
            }
        }
        reporter.on_progress(name, index as u64 + 1, total_ops);
    }

    if let Some(size) = partition.new_partition_info.as_ref().and_then(|i| i.size) {
        file.set_len(size)?;
    }

    reporter.on_complete(name);
    Ok(())
}

/// Write `data` (or zeros when `None`) across the destination extents.
fn write_extents(
    file: &mut File,
    extents: &[Extent],
    block_size: u64,
    data: Option<&[u8]>,
) -> Result<()> {
    let mut consumed = 0usize;

    for extent in extents {
        let start = extent.start_block.unwrap_or(0) * block_size;
        let len = (extent.num_blocks.unwrap_or(0) * block_size) as usize;
        file.seek(SeekFrom::Start(start))?;

        match data {
            Some(data) => {
                let end = (consumed + len).min(data.len());
                file.write_all(&data[consumed..end])?;
                consumed = end;
            }
            None => {
                let zeros = vec![0u8; len.min(COPY_BUF_SIZE)];
                let mut remaining = len;
                while remaining > 0 {
                    let chunk = remaining.min(zeros.len());
                    file.write_all(&zeros[..chunk])?;
                    remaining -= chunk;
                }
            }
        }
    }

    Ok(())
}

struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Sha256,
    written: u64,
}

impl<'a, W: Write> HashingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn encode_signatures(signature: Vec<u8>) -> Vec<u8> {
    Signatures {
        signatures: vec![Signature {
            version: None,
            unpadded_signature_size: Some(signature.len() as u32),
            data: Some(signature),
        }],
    }
    .encode_to_vec()
}

/// Outcome of [`patch_payload`]: the `payload_properties.txt` body plus the
/// size of the payload metadata (header, manifest and metadata signature) as
/// needed for the `payload_metadata.bin` property-files token.
pub struct PatchedPayloadInfo {
    pub properties: String,
    pub metadata_size: u64,
}

/// Re-emit the payload with `image_paths` substituted for their original
/// partitions, all blob offsets re-based, and both the metadata and the
/// payload signed with `key`.
pub fn patch_payload<W: Write>(
    source: &PayloadSource,
    writer: &mut W,
    original: &DeltaArchiveManifest,
    blob_offset: u64,
    image_paths: &BTreeMap<String, PathBuf>,
    key: &SigningKey,
) -> Result<PatchedPayloadInfo> {
    let block_size = original.block_size.unwrap_or(4096) as u64;
    let mut manifest = original.clone();

    // Compress the replacement images and rebuild their partition entries as
    // single REPLACE_XZ operations over the whole partition.
    let mut new_blobs: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for partition in &mut manifest.partitions {
        let Some(path) = image_paths.get(&partition.partition_name) else {
            continue;
        };
        let raw = std::fs::read(path).map_err(|e| PatchError::io_path(path, e))?;

        let mut compressed = Vec::new();
        lzma_rs::xz_compress(&mut raw.as_slice(), &mut compressed)
            .map_err(|e| PatchError::Corrupt(format!("xz compression: {e:?}")))?;

        let num_blocks = (raw.len() as u64).div_ceil(block_size);
        partition.operations = vec![InstallOperation {
            r#type: install_operation::Type::ReplaceXz as i32,
            data_offset: Some(0), // re-based below
            data_length: Some(compressed.len() as u64),
            dst_extents: vec![Extent {
                start_block: Some(0),
                num_blocks: Some(num_blocks),
            }],
            data_sha256_hash: Some(Sha256::digest(&compressed).to_vec()),
            ..Default::default()
        }];
        partition.new_partition_info = Some(PartitionInfo {
            size: Some(raw.len() as u64),
            hash: Some(Sha256::digest(&raw).to_vec()),
        });
        partition.old_partition_info = None;

        debug!(
            partition = %partition.partition_name,
            raw = raw.len(),
            compressed = compressed.len(),
            "replacing partition blob"
        );
        new_blobs.insert(partition.partition_name.clone(), compressed);
    }

    // Re-base every operation's data offset to the new blob layout. The blob
    // section is later written in exactly this order.
    let mut old_offsets: Vec<Option<u64>> = Vec::new();
    let mut cursor = 0u64;
    for partition in &mut manifest.partitions {
        for op in &mut partition.operations {
            match op.data_length {
                Some(length) if length > 0 => {
                    old_offsets.push(op.data_offset);
                    op.data_offset = Some(cursor);
                    cursor += length;
                }
                _ => {
                    old_offsets.push(None);
                    op.data_offset = None;
                    op.data_length = None;
                }
            }
        }
    }

    let signatures_size = encode_signatures(vec![0u8; key.signature_size()]).len() as u64;
    manifest.signatures_offset = Some(cursor);
    manifest.signatures_size = Some(signatures_size);

    // Header + manifest form the metadata, which gets its own signature. The
    // signature blob length only depends on the key size, so the header can
    // state it before the signature exists.
    let metadata_signature_size = signatures_size as u32;
    let manifest_raw = manifest.encode_to_vec();
    let mut metadata = Vec::new();
    metadata.extend_from_slice(PAYLOAD_MAGIC);
    metadata.extend_from_slice(&PAYLOAD_VERSION.to_be_bytes());
    metadata.extend_from_slice(&(manifest_raw.len() as u64).to_be_bytes());
    metadata.extend_from_slice(&metadata_signature_size.to_be_bytes());
    metadata.extend_from_slice(&manifest_raw);

    let metadata_signature = encode_signatures(key.sign_sha256(&metadata)?);
    if metadata_signature.len() as u64 != signatures_size {
        return Err(PatchError::SigningFailure(format!(
            "metadata signature blob size changed: {} != {}",
            metadata_signature.len(),
            signatures_size
        )));
    }

    let mut out = HashingWriter::new(writer);
    out.write_all(&metadata)?;
    out.write_all(&metadata_signature)?;

    // Blob section: stream untouched blobs from the input, substitute the
    // recompressed ones.
    let mut reader = source.open()?;
    let mut op_index = 0usize;
    let mut copy_buf = vec![0u8; COPY_BUF_SIZE];

    for partition in &manifest.partitions {
        let replacement = new_blobs.get(&partition.partition_name);
        for op in &partition.operations {
            let old_offset = old_offsets[op_index];
            op_index += 1;
            let Some(length) = op.data_length else {
                continue;
            };

            if let Some(blob) = replacement {
                out.write_all(blob)?;
            } else {
                let old_offset = old_offset.ok_or_else(|| {
                    PatchError::Corrupt("operation with data length but no offset".into())
                })?;
                let mut remaining = length;
                let mut offset = blob_offset + old_offset;
                while remaining > 0 {
                    let chunk = remaining.min(copy_buf.len() as u64) as usize;
                    reader.read_exact_at(offset, &mut copy_buf[..chunk])?;
                    out.write_all(&copy_buf[..chunk])?;
                    offset += chunk as u64;
                    remaining -= chunk as u64;
                }
            }
        }
    }

    // The payload signature covers everything before the signature blob.
    let payload_digest = out.hasher.clone().finalize();
    let payload_signatures = encode_signatures(key.sign_digest("sha256", &payload_digest)?);
    if payload_signatures.len() as u64 != signatures_size {
        return Err(PatchError::SigningFailure(format!(
            "payload signature blob size changed: {} != {}",
            payload_signatures.len(),
            signatures_size
        )));
    }
    out.write_all(&payload_signatures)?;

    let file_size = out.written;
    let file_hash = out.hasher.finalize();

    let metadata_hash = Sha256::digest(&metadata);

    let properties = format!(
        "FILE_HASH={}\nFILE_SIZE={}\nMETADATA_HASH={}\nMETADATA_SIZE={}\n",
        BASE64.encode(file_hash),
        file_size,
        BASE64.encode(metadata_hash),
        metadata.len()
    );

    Ok(PatchedPayloadInfo {
        properties,
        metadata_size: metadata.len() as u64 + metadata_signature.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testkeys;
    use crate::proto::PartitionUpdate;

    fn test_key() -> SigningKey {
        testkeys::rsa1024()
    }

    fn build_payload(manifest: &DeltaArchiveManifest, blob: &[u8]) -> Vec<u8> {
        let manifest_raw = manifest.encode_to_vec();
        let mut payload = Vec::new();
        payload.extend_from_slice(PAYLOAD_MAGIC);
        payload.extend_from_slice(&PAYLOAD_VERSION.to_be_bytes());
        payload.extend_from_slice(&(manifest_raw.len() as u64).to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&manifest_raw);
        payload.extend_from_slice(blob);
        payload
    }

    fn source_for(dir: &Path, payload: &[u8]) -> PayloadSource {
        let path = dir.join("payload.bin");
        std::fs::write(&path, payload).unwrap();
        PayloadSource::new(path, 0, payload.len() as u64)
    }

    fn replace_manifest(data: &[u8]) -> DeltaArchiveManifest {
        DeltaArchiveManifest {
            block_size: Some(4096),
            minor_version: Some(0),
            partitions: vec![PartitionUpdate {
                partition_name: "boot".to_string(),
                operations: vec![InstallOperation {
                    r#type: install_operation::Type::Replace as i32,
                    data_offset: Some(0),
                    data_length: Some(data.len() as u64),
                    dst_extents: vec![Extent {
                        start_block: Some(0),
                        num_blocks: Some((data.len() as u64).div_ceil(4096)),
                    }],
                    data_sha256_hash: Some(Sha256::digest(data).to_vec()),
                    ..Default::default()
                }],
                new_partition_info: Some(PartitionInfo {
                    size: Some(data.len() as u64),
                    hash: Some(Sha256::digest(data).to_vec()),
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_payload_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_for(dir.path(), b"NOPExxxxxxxxxxxxxxxxxxxxxxxx");
        let result = parse_payload(&mut source.open().unwrap());
        assert!(matches!(result, Err(PatchError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_parse_payload_rejects_wrong_version() {
        let mut payload = Vec::new();
        payload.extend_from_slice(PAYLOAD_MAGIC);
        payload.extend_from_slice(&1u64.to_be_bytes());
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());

        let dir = tempfile::tempdir().unwrap();
        let source = source_for(dir.path(), &payload);
        let result = parse_payload(&mut source.open().unwrap());
        assert!(matches!(result, Err(PatchError::UnsupportedFormat(_))));
    }

    #[tokio::test]
    async fn test_extract_replace_operation() {
        let image: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let manifest = replace_manifest(&image);
        let payload = build_payload(&manifest, &image);

        let dir = tempfile::tempdir().unwrap();
        let source = source_for(dir.path(), &payload);
        let header = parse_payload(&mut source.open().unwrap()).unwrap();

        let partitions: BTreeSet<String> = ["boot".to_string()].into();
        extract_images(
            &source,
            &header.manifest,
            header.blob_offset,
            dir.path(),
            &partitions,
            Arc::new(NullReporter),
        )
        .await
        .unwrap();

        let extracted = std::fs::read(dir.path().join("boot.img")).unwrap();
        assert_eq!(extracted, image);
    }

    #[tokio::test]
    async fn test_extract_missing_partition_is_not_found() {
        let image = vec![0u8; 4096];
        let manifest = replace_manifest(&image);
        let payload = build_payload(&manifest, &image);

        let dir = tempfile::tempdir().unwrap();
        let source = source_for(dir.path(), &payload);
        let header = parse_payload(&mut source.open().unwrap()).unwrap();

        let partitions: BTreeSet<String> = ["nonexistent".to_string()].into();
        let result = extract_images(
            &source,
            &header.manifest,
            header.blob_offset,
            dir.path(),
            &partitions,
            Arc::new(NullReporter),
        )
        .await;
        assert!(matches!(result, Err(PatchError::NotFound(_))));
    }

    #[test]
    fn test_extract_corrupt_blob_hash() {
        let image = vec![7u8; 4096];
        let mut manifest = replace_manifest(&image);
        manifest.partitions[0].operations[0].data_sha256_hash = Some(vec![0u8; 32]);
        let payload = build_payload(&manifest, &image);

        let dir = tempfile::tempdir().unwrap();
        let source = source_for(dir.path(), &payload);
        let reporter: Arc<dyn ProgressReporter> = Arc::new(NullReporter);

        let result = extract_one(
            &source,
            &manifest.partitions[0],
            4096,
            PAYLOAD_HEADER_SIZE + manifest.encode_to_vec().len() as u64,
            &dir.path().join("boot.img"),
            &reporter,
        );
        assert!(matches!(result, Err(PatchError::Corrupt(_))));
    }

    #[test]
    fn test_patch_payload_round_trip() {
        // Start from a payload whose single partition gets replaced.
        let original_image = vec![1u8; 8192];
        let manifest = replace_manifest(&original_image);
        let payload = build_payload(&manifest, &original_image);

        let dir = tempfile::tempdir().unwrap();
        let source = source_for(dir.path(), &payload);
        let header = parse_payload(&mut source.open().unwrap()).unwrap();

        let patched_image: Vec<u8> = (0..8192u32).map(|i| (i % 97) as u8).collect();
        let patched_path = dir.path().join("boot.patched.img");
        std::fs::write(&patched_path, &patched_image).unwrap();
        let mut image_paths = BTreeMap::new();
        image_paths.insert("boot".to_string(), patched_path);

        let key = test_key();
        let mut out = Vec::new();
        let info = patch_payload(
            &source,
            &mut out,
            &header.manifest,
            header.blob_offset,
            &image_paths,
            &key,
        )
        .unwrap();
        let properties = info.properties;

        // The emitted payload parses and its manifest references the patched
        // image's hash.
        let out_path = dir.path().join("payload.out.bin");
        std::fs::write(&out_path, &out).unwrap();
        let out_source = PayloadSource::new(out_path, 0, out.len() as u64);
        let out_header = parse_payload(&mut out_source.open().unwrap()).unwrap();
        assert_eq!(out_header.blob_offset, info.metadata_size);

        let partition = &out_header.manifest.partitions[0];
        assert_eq!(
            partition.new_partition_info.as_ref().unwrap().hash,
            Some(Sha256::digest(&patched_image).to_vec())
        );
        assert_eq!(
            partition.operations[0].r#type,
            install_operation::Type::ReplaceXz as i32
        );

        // The signature blob sits exactly at signatures_offset.
        let sig_offset = out_header.manifest.signatures_offset.unwrap();
        let sig_size = out_header.manifest.signatures_size.unwrap();
        let sig_start = out_header.blob_offset + sig_offset;
        assert_eq!(sig_start + sig_size, out.len() as u64);

        let signatures =
            Signatures::decode(&out[sig_start as usize..(sig_start + sig_size) as usize]).unwrap();
        assert_eq!(
            signatures.signatures[0].unpadded_signature_size,
            Some(key.signature_size() as u32)
        );

        // Properties reflect the emitted bytes.
        assert!(properties.contains(&format!("FILE_SIZE={}\n", out.len())));
        let file_hash = BASE64.encode(Sha256::digest(&out));
        assert!(properties.contains(&format!("FILE_HASH={file_hash}\n")));
    }

    #[test]
    fn test_patch_payload_without_changes_keeps_blobs() {
        let image: Vec<u8> = (0..4096u32).map(|i| (i % 13) as u8).collect();
        let manifest = replace_manifest(&image);
        let payload = build_payload(&manifest, &image);

        let dir = tempfile::tempdir().unwrap();
        let source = source_for(dir.path(), &payload);
        let header = parse_payload(&mut source.open().unwrap()).unwrap();

        let mut out = Vec::new();
        patch_payload(
            &source,
            &mut out,
            &header.manifest,
            header.blob_offset,
            &BTreeMap::new(),
            &test_key(),
        )
        .unwrap();

        let out_path = dir.path().join("payload.out.bin");
        std::fs::write(&out_path, &out).unwrap();
        let out_source = PayloadSource::new(out_path, 0, out.len() as u64);
        let out_header = parse_payload(&mut out_source.open().unwrap()).unwrap();

        // Untouched partition: hashes and blob bytes carried over verbatim.
        let partition = &out_header.manifest.partitions[0];
        assert_eq!(
            partition.new_partition_info,
            header.manifest.partitions[0].new_partition_info
        );
        let op = &partition.operations[0];
        let blob_start = (out_header.blob_offset + op.data_offset.unwrap()) as usize;
        let blob_end = blob_start + op.data_length.unwrap() as usize;
        assert_eq!(&out[blob_start..blob_end], image.as_slice());
    }
}
