//! Top-level patch and extract drivers: walk the outer zip, run the payload
//! pipeline, regenerate metadata, sign, and verify.

use crate::boot::{self, BootPatch, OtaCertPatch};
use crate::crypto::{Certificate, SigningKey};
use crate::error::{PatchError, Result};
use crate::ota::{
    self, CapturedEntry, EntryOptions, METHOD_DEFLATED, METHOD_STORED, MetadataContext,
    PATH_METADATA, PATH_METADATA_PB, PATH_OTACERT, PATH_PAYLOAD, PATH_PROPERTIES, ZipEntryWriter,
};
use crate::payload::{self, PatchedPayloadInfo, PayloadSource, ProgressReporter};
use crate::planner::{self, ROLE_OTACERTS, ROLE_ROOTPATCH};
use crate::proto::OtaMetadata;
use crate::vbmeta;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::info;

/// Everything a patch run needs; keys are loaded (passphrases already
/// applied) before any work starts.
pub struct PatchContext {
    pub replace_images: BTreeMap<String, PathBuf>,
    pub boot_partition: String,
    pub root_patch: Option<Arc<BootPatch>>,
    pub clear_vbmeta_flags: bool,
    pub key_avb: Arc<SigningKey>,
    pub key_ota: Arc<SigningKey>,
    pub cert_ota: Arc<Certificate>,
}

/// Patch the update payload: extract the planner's partitions, apply the
/// boot patches, rebuild vbmeta in dependency order, and re-emit the signed
/// payload into the open streamed zip entry.
async fn patch_ota_payload<W: Write + Seek>(
    source: &PayloadSource,
    writer: &mut ZipEntryWriter<W>,
    context: &PatchContext,
    reporter: &Arc<dyn ProgressReporter>,
) -> Result<PatchedPayloadInfo> {
    let temp_dir = tempfile::tempdir()?;
    let extract_dir = temp_dir.path().join("extract");
    let patch_dir = temp_dir.path().join("patch");
    fs::create_dir(&extract_dir)?;
    fs::create_dir(&patch_dir)?;

    let header = payload::parse_payload(&mut source.open()?)?;
    let manifest = header.manifest;
    let block_size = manifest.block_size.unwrap_or(4096) as u64;

    let mut image_paths: BTreeMap<String, PathBuf> = BTreeMap::new();

    // User-provided replacements may cover more partitions than the patches
    // need; all of them are re-emitted.
    for (name, path) in &context.replace_images {
        if !manifest.partitions.iter().any(|p| &p.partition_name == name) {
            return Err(PatchError::InvalidArgument(format!(
                "cannot replace non-existent partition: {name}"
            )));
        }
        image_paths.insert(name.clone(), path.clone());
    }

    let required =
        planner::required_images(&manifest, &context.boot_partition, context.root_patch.is_some())?;
    let vbmeta_images: BTreeSet<String> = required
        .iter()
        .filter(|(role, _)| role.starts_with("@vbmeta:"))
        .map(|(_, partition)| partition.clone())
        .collect();

    let to_extract: BTreeSet<String> = required
        .values()
        .filter(|name| !image_paths.contains_key(*name))
        .cloned()
        .collect();

    if !to_extract.is_empty() {
        reporter.begin_step(&format!(
            "Extracting {} from the payload",
            to_extract.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
        payload::extract_images(
            source,
            &manifest,
            header.blob_offset,
            &extract_dir,
            &to_extract,
            reporter.clone(),
        )
        .await?;
        for name in &to_extract {
            image_paths.insert(name.clone(), extract_dir.join(format!("{name}.img")));
        }
    }

    let mut image_patches: BTreeMap<String, Vec<Arc<BootPatch>>> = BTreeMap::new();
    if let Some(root_patch) = &context.root_patch {
        image_patches
            .entry(required[ROLE_ROOTPATCH].clone())
            .or_default()
            .push(root_patch.clone());
    }
    image_patches
        .entry(required[ROLE_OTACERTS].clone())
        .or_default()
        .push(Arc::new(BootPatch::OtaCert(OtaCertPatch::new(
            context.cert_ota.raw().to_vec(),
        ))));

    reporter.begin_step(&format!(
        "Patching {}",
        image_patches.keys().cloned().collect::<Vec<_>>().join(", ")
    ));

    // One worker per image; each operates on its own files.
    let mut join_set: JoinSet<Result<(String, PathBuf)>> = JoinSet::new();
    for (image, patches) in image_patches {
        let input = image_paths[&image].clone();
        let output = patch_dir.join(format!("{image}.img"));
        let key = context.key_avb.clone();

        join_set.spawn_blocking(move || {
            boot::patch_boot(&input, &output, Some(key.as_ref()), true, &patches)?;
            Ok((image, output))
        });
    }

    // Drain every worker before acting on the first failure so nothing is
    // left writing into the temp dir.
    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        match joined.map_err(|e| PatchError::Corrupt(format!("patch worker panicked: {e}"))) {
            Ok(Ok((image, path))) => {
                image_paths.insert(image, path);
            }
            Ok(Err(e)) | Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let vbmeta_paths: BTreeMap<String, PathBuf> = vbmeta_images
        .iter()
        .map(|name| (name.clone(), image_paths[name].clone()))
        .collect();
    let deps = vbmeta::vbmeta_deps(&vbmeta_paths)?;
    let working_set: BTreeSet<String> = image_paths.keys().cloned().collect();
    let (graph, order) = planner::vbmeta_patch_order(&deps, &working_set, &vbmeta_images)?;

    if !order.is_empty() {
        reporter.begin_step(&format!("Building {}", order.join(", ")));
    }
    for image in &order {
        let output = patch_dir.join(format!("{image}.img"));
        vbmeta::patch_vbmeta_image(
            &image_paths[image],
            &output,
            &graph[image],
            &image_paths,
            &context.key_avb,
            block_size,
            context.clear_vbmeta_flags,
        )?;
        image_paths.insert(image.clone(), output);
    }

    // vbmeta images that needed no rewrite keep their original bytes.
    let rewritten: BTreeSet<&String> = order.iter().collect();
    for image in &vbmeta_images {
        if !rewritten.contains(image) {
            image_paths.remove(image);
        }
    }

    reporter.begin_step(&format!(
        "Updating OTA payload to reference new {}",
        image_paths.keys().cloned().collect::<Vec<_>>().join(", ")
    ));
    payload::patch_payload(
        source,
        writer,
        &manifest,
        header.blob_offset,
        &image_paths,
        &context.key_ota,
    )
}

struct InputEntry {
    name: String,
    method: u16,
    compressed_size: u64,
    data_start: u64,
    options: EntryOptions,
}

fn method_code(method: zip::CompressionMethod) -> Result<u16> {
    match method {
        zip::CompressionMethod::Stored => Ok(METHOD_STORED),
        zip::CompressionMethod::Deflated => Ok(METHOD_DEFLATED),
        other => Err(PatchError::UnsupportedFormat(format!(
            "zip compression method {other:?}"
        ))),
    }
}

/// Stream the input OTA zip into `staging`, patching entries per the rules
/// in the component design, then append regenerated metadata and the
/// whole-file signature. Returns the final metadata for verification.
async fn patch_ota_zip(
    input_path: &Path,
    staging: File,
    context: &PatchContext,
    reporter: &Arc<dyn ProgressReporter>,
) -> Result<(OtaMetadata, File)> {
    let input =
        File::open(input_path).map_err(|e| PatchError::io_path(input_path, e))?;
    let mut archive = zip::ZipArchive::new(input)?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let (dos_time, dos_date) = entry
            .last_modified()
            .map(|dt| (dt.timepart(), dt.datepart()))
            .unwrap_or((0, 0));
        entries.push(InputEntry {
            name: entry.name().to_string(),
            method: method_code(entry.compression())?,
            compressed_size: entry.compressed_size(),
            data_start: entry.data_start(),
            options: EntryOptions {
                extra: ota::strip_bad_extra_fields(entry.extra_data().unwrap_or(&[]))?,
                unix_mode: entry.unix_mode(),
                dos_time,
                dos_date,
            },
        });
    }

    let mut missing: BTreeSet<&str> = [
        PATH_METADATA,
        PATH_METADATA_PB,
        PATH_OTACERT,
        PATH_PAYLOAD,
        PATH_PROPERTIES,
    ]
    .into();
    for entry in &entries {
        missing.remove(entry.name.as_str());
    }
    if !missing.is_empty() {
        return Err(PatchError::NotFound(format!(
            "missing files in zip: {missing:?}"
        )));
    }

    // The properties text is produced while the payload is patched, so the
    // payload entry must come first.
    let mut order: Vec<usize> = (0..entries.len()).collect();
    let i_payload = entries.iter().position(|e| e.name == PATH_PAYLOAD).unwrap();
    let i_properties = entries
        .iter()
        .position(|e| e.name == PATH_PROPERTIES)
        .unwrap();
    if i_payload > i_properties {
        order.swap(i_payload, i_properties);
    }

    let mut writer = ZipEntryWriter::new(staging);
    let mut payload_info: Option<PatchedPayloadInfo> = None;
    let mut metadata_info: Option<CapturedEntry> = None;
    let mut metadata_pb_info: Option<CapturedEntry> = None;
    let mut metadata_pb_raw: Option<Vec<u8>> = None;

    for index in order {
        let entry = &entries[index];
        match entry.name.as_str() {
            // The plain-text metadata is regenerated from the new pb at the
            // end.
            PATH_METADATA => {
                metadata_info = Some(CapturedEntry {
                    method: entry.method,
                    options: entry.options.clone(),
                });
            }
            PATH_METADATA_PB => {
                let mut raw = Vec::new();
                archive.by_index(index)?.read_to_end(&mut raw)?;
                metadata_pb_info = Some(CapturedEntry {
                    method: entry.method,
                    options: entry.options.clone(),
                });
                metadata_pb_raw = Some(raw);
            }
            PATH_OTACERT => {
                reporter.begin_step(&format!("Replacing {}", entry.name));
                writer.write_entry(
                    &entry.name,
                    entry.method,
                    &entry.options,
                    context.cert_ota.raw(),
                )?;
            }
            PATH_PAYLOAD => {
                reporter.begin_step(&format!("Patching {}", entry.name));
                if entry.method != METHOD_STORED {
                    return Err(PatchError::UnsupportedFormat(format!(
                        "{} is not stored uncompressed",
                        entry.name
                    )));
                }
                let source = PayloadSource::new(
                    input_path.to_path_buf(),
                    entry.data_start,
                    entry.compressed_size,
                );
                writer.start_streamed_entry(&entry.name, &entry.options)?;
                let info = patch_ota_payload(&source, &mut writer, context, reporter).await?;
                writer.finish_streamed_entry()?;
                payload_info = Some(info);
            }
            PATH_PROPERTIES => {
                reporter.begin_step(&format!("Patching {}", entry.name));
                if entry.method != METHOD_STORED {
                    return Err(PatchError::UnsupportedFormat(format!(
                        "{} is not stored uncompressed",
                        entry.name
                    )));
                }
                let info = payload_info.as_ref().ok_or_else(|| {
                    PatchError::Corrupt("properties entry reached before payload".into())
                })?;
                writer.write_entry(
                    &entry.name,
                    entry.method,
                    &entry.options,
                    info.properties.as_bytes(),
                )?;
            }
            _ => {
                reporter.begin_step(&format!("Copying {}", entry.name));
                let mut data = Vec::new();
                archive.by_index(index)?.read_to_end(&mut data)?;
                writer.write_entry(&entry.name, entry.method, &entry.options, &data)?;
            }
        }
    }

    reporter.begin_step(&format!("Generating {PATH_METADATA} and {PATH_METADATA_PB}"));
    let payload_info = payload_info.unwrap();
    let ctx = MetadataContext {
        entry_info: writer.entry_infos(),
        payload_metadata_size: payload_info.metadata_size,
    };
    let metadata = ota::write_metadata_entries(
        &mut writer,
        &metadata_pb_raw.unwrap(),
        &metadata_info.unwrap(),
        &metadata_pb_info.unwrap(),
        &ctx,
    )?;

    // Reserve the comment, then fill in the whole-file signature.
    let comment_len = ota::signature_comment_len(&context.cert_ota, &context.key_ota)?;
    let mut file = writer.finish(&vec![0u8; comment_len])?;
    reporter.begin_step("Signing OTA zip");
    ota::sign_zip(&mut file, &context.cert_ota, &context.key_ota)?;

    Ok((metadata, file))
}

/// Patch a full OTA zip. The output is produced in a staging file next to
/// the final path and renamed into place only after the metadata offsets
/// verify; any failure discards the staging file.
pub async fn patch_ota(
    input_path: &Path,
    output_path: &Path,
    context: &PatchContext,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<()> {
    let file_name = output_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            PatchError::InvalidArgument(format!("bad output path: {}", output_path.display()))
        })?;
    let staging_path = output_path.with_file_name(format!("{file_name}.tmp"));

    let staging_guard = scopeguard::guard(staging_path.clone(), |path| {
        let _ = fs::remove_file(path);
    });

    let staging = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&staging_path)
        .map_err(|e| PatchError::io_path(&staging_path, e))?;

    let (metadata, file) = patch_ota_zip(input_path, staging, context, &reporter).await?;
    drop(file);

    // A lot of offsets were computed by hand; re-open and check them.
    reporter.begin_step("Verifying metadata offsets");
    ota::verify_metadata(&staging_path, &metadata)?;

    fs::rename(&staging_path, output_path)
        .map_err(|e| PatchError::io_path(output_path, e))?;
    let _ = scopeguard::ScopeGuard::into_inner(staging_guard);

    info!(output = %output_path.display(), "patched OTA written");
    Ok(())
}

/// Locate `payload.bin` inside an OTA zip as a byte range for raw reads.
fn payload_source(input_path: &Path) -> Result<PayloadSource> {
    let input = File::open(input_path).map_err(|e| PatchError::io_path(input_path, e))?;
    let mut archive = zip::ZipArchive::new(input)?;
    let entry = archive
        .by_name(PATH_PAYLOAD)
        .map_err(|_| PatchError::NotFound(format!("{PATH_PAYLOAD} in {}", input_path.display())))?;
    if entry.compression() != zip::CompressionMethod::Stored {
        return Err(PatchError::UnsupportedFormat(format!(
            "{PATH_PAYLOAD} is not stored uncompressed"
        )));
    }
    Ok(PayloadSource::new(
        input_path.to_path_buf(),
        entry.data_start(),
        entry.compressed_size(),
    ))
}

/// Extract partition images from an OTA zip's payload.
pub async fn extract_ota(
    input_path: &Path,
    directory: &Path,
    boot_partition: &str,
    all: bool,
    boot_only: bool,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<()> {
    let source = payload_source(input_path)?;
    let header = payload::parse_payload(&mut source.open()?)?;

    let images: BTreeSet<String> = if all {
        header
            .manifest
            .partitions
            .iter()
            .map(|p| p.partition_name.clone())
            .collect()
    } else {
        let required = planner::required_images(&header.manifest, boot_partition, true)?;
        if boot_only {
            [required[ROLE_ROOTPATCH].clone()].into()
        } else {
            required.values().cloned().collect()
        }
    };

    reporter.begin_step(&format!(
        "Extracting {} from the payload",
        images.iter().cloned().collect::<Vec<_>>().join(", ")
    ));
    fs::create_dir_all(directory).map_err(|e| PatchError::io_path(directory, e))?;

    payload::extract_images(
        &source,
        &header.manifest,
        header.blob_offset,
        directory,
        &images,
        reporter,
    )
    .await
}
