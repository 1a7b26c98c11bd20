//! Outer OTA zip re-emission.
//!
//! The writer emits zip records directly: the re-emitter needs to strip
//! individual extra-field records, know entry data offsets mid-stream for the
//! property-files tokens, and leave room in the archive comment for the
//! whole-file signature block that recovery verifies.

use crate::crypto::{Certificate, SigningKey, pkcs7_signed_data};
use crate::error::{PatchError, Result};
use crate::proto::{OtaMetadata, ota_metadata};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use prost::Message;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PATH_METADATA: &str = "META-INF/com/android/metadata";
pub const PATH_METADATA_PB: &str = "META-INF/com/android/metadata.pb";
pub const PATH_OTACERT: &str = "META-INF/com/android/otacert";
pub const PATH_PAYLOAD: &str = "payload.bin";
pub const PATH_PROPERTIES: &str = "payload_properties.txt";

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

const LOCAL_SIG: u32 = 0x0403_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const EOCD64_SIG: u32 = 0x0606_4b50;
const EOCD64_LOCATOR_SIG: u32 = 0x0706_4b50;

const MAX32: u64 = 0xffff_ffff;
const LOCAL_HEADER_LEN: u64 = 30;

// Extra-field record ids that must not be carried over: zip64 sizes are
// regenerated by this writer, and the Android alignment record is only valid
// for the offsets of the archive it was written into.
const EXTRA_ZIP64: u16 = 0x0001;
const EXTRA_ANDROID_ALIGNMENT: u16 = 0xd935;

/// Drop extra-field records that would be stale in the output archive,
/// keeping every other record byte-for-byte.
pub fn strip_bad_extra_fields(extra: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(extra.len());
    let mut offset = 0usize;

    while offset < extra.len() {
        let header = extra
            .get(offset..offset + 4)
            .ok_or_else(|| PatchError::Corrupt("truncated zip extra field".into()))?;
        let record_sig = u16::from_le_bytes(header[0..2].try_into().unwrap());
        let record_len = u16::from_le_bytes(header[2..4].try_into().unwrap()) as usize;
        let next = offset + 4 + record_len;
        if next > extra.len() {
            return Err(PatchError::Corrupt("truncated zip extra record".into()));
        }

        if record_sig != EXTRA_ZIP64 && record_sig != EXTRA_ANDROID_ALIGNMENT {
            out.extend_from_slice(&extra[offset..next]);
        }
        offset = next;
    }

    Ok(out)
}

#[derive(Clone, Debug)]
struct EntryRecord {
    name: String,
    method: u16,
    crc: u32,
    comp_size: u64,
    uncomp_size: u64,
    local_offset: u64,
    data_offset: u64,
    extra: Vec<u8>,
    unix_mode: u32,
    dos_time: u16,
    dos_date: u16,
    zip64_local: bool,
}

struct StreamState {
    crc: crc32fast::Hasher,
    written: u64,
}

/// Options for one output entry; timestamps default to the zeroed DOS epoch.
#[derive(Clone, Debug, Default)]
pub struct EntryOptions {
    pub extra: Vec<u8>,
    pub unix_mode: Option<u32>,
    pub dos_time: u16,
    pub dos_date: u16,
}

/// A zip writer over a seekable sink. Stored entries can be streamed (sizes
/// are patched into a reserved zip64 record afterwards); everything else is
/// written from memory.
pub struct ZipEntryWriter<W: Write + Seek> {
    inner: W,
    entries: Vec<EntryRecord>,
    streaming: Option<StreamState>,
}

impl<W: Write + Seek> ZipEntryWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            entries: Vec::new(),
            streaming: None,
        }
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    /// Data offset the next entry's contents would land at, given its name
    /// and extra field (no zip64 reservation).
    pub fn predict_data_offset(&mut self, name: &str, extra_len: usize) -> Result<u64> {
        Ok(self.position()? + LOCAL_HEADER_LEN + name.len() as u64 + extra_len as u64)
    }

    pub fn entry_info(&self, name: &str) -> Option<(u64, u64)> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| (e.data_offset, e.comp_size))
    }

    /// Data offset and compressed size of every entry written so far.
    pub fn entry_infos(&self) -> BTreeMap<String, (u64, u64)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), (e.data_offset, e.comp_size)))
            .collect()
    }

    fn write_local_header(&mut self, record: &EntryRecord) -> Result<()> {
        let (crc, comp32, uncomp32, mut extra) = if record.zip64_local {
            let mut extra = Vec::with_capacity(20 + record.extra.len());
            extra.extend_from_slice(&EXTRA_ZIP64.to_le_bytes());
            extra.extend_from_slice(&16u16.to_le_bytes());
            extra.extend_from_slice(&record.uncomp_size.to_le_bytes());
            extra.extend_from_slice(&record.comp_size.to_le_bytes());
            (record.crc, MAX32 as u32, MAX32 as u32, extra)
        } else {
            (
                record.crc,
                record.comp_size as u32,
                record.uncomp_size as u32,
                Vec::new(),
            )
        };
        extra.extend_from_slice(&record.extra);

        let version_needed: u16 = if record.zip64_local { 45 } else { 20 };
        let mut header = Vec::with_capacity(LOCAL_HEADER_LEN as usize + record.name.len());
        header.extend_from_slice(&LOCAL_SIG.to_le_bytes());
        header.extend_from_slice(&version_needed.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // general purpose flags
        header.extend_from_slice(&record.method.to_le_bytes());
        header.extend_from_slice(&record.dos_time.to_le_bytes());
        header.extend_from_slice(&record.dos_date.to_le_bytes());
        header.extend_from_slice(&crc.to_le_bytes());
        header.extend_from_slice(&comp32.to_le_bytes());
        header.extend_from_slice(&uncomp32.to_le_bytes());
        header.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
        header.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        header.extend_from_slice(record.name.as_bytes());
        header.extend_from_slice(&extra);

        self.inner.write_all(&header)?;
        Ok(())
    }

    /// Write a whole entry whose contents are in memory.
    pub fn write_entry(
        &mut self,
        name: &str,
        method: u16,
        options: &EntryOptions,
        data: &[u8],
    ) -> Result<()> {
        if self.streaming.is_some() {
            return Err(PatchError::Corrupt("streamed entry still open".into()));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        let crc = hasher.finalize();

        let compressed;
        let payload: &[u8] = match method {
            METHOD_STORED => data,
            METHOD_DEFLATED => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                compressed = encoder.finish()?;
                &compressed
            }
            other => {
                return Err(PatchError::UnsupportedFormat(format!(
                    "zip compression method {other}"
                )));
            }
        };

        let local_offset = self.position()?;
        let zip64_local = payload.len() as u64 >= MAX32 || data.len() as u64 >= MAX32;
        let mut record = EntryRecord {
            name: name.to_string(),
            method,
            crc,
            comp_size: payload.len() as u64,
            uncomp_size: data.len() as u64,
            local_offset,
            data_offset: 0,
            extra: options.extra.clone(),
            unix_mode: options.unix_mode.unwrap_or(0o644),
            dos_time: options.dos_time,
            dos_date: options.dos_date,
            zip64_local,
        };
        self.write_local_header(&record)?;
        record.data_offset = self.position()?;
        self.inner.write_all(payload)?;
        self.entries.push(record);
        Ok(())
    }

    /// Open a stored entry whose size is unknown; contents are streamed via
    /// `Write`. A zip64 record is reserved up front and patched on
    /// [`Self::finish_streamed_entry`].
    pub fn start_streamed_entry(&mut self, name: &str, options: &EntryOptions) -> Result<()> {
        if self.streaming.is_some() {
            return Err(PatchError::Corrupt("streamed entry still open".into()));
        }

        let local_offset = self.position()?;
        let mut record = EntryRecord {
            name: name.to_string(),
            method: METHOD_STORED,
            crc: 0,
            comp_size: 0,
            uncomp_size: 0,
            local_offset,
            data_offset: 0,
            extra: options.extra.clone(),
            unix_mode: options.unix_mode.unwrap_or(0o644),
            dos_time: options.dos_time,
            dos_date: options.dos_date,
            zip64_local: true,
        };
        self.write_local_header(&record)?;
        record.data_offset = self.position()?;
        self.entries.push(record);
        self.streaming = Some(StreamState {
            crc: crc32fast::Hasher::new(),
            written: 0,
        });
        Ok(())
    }

    pub fn finish_streamed_entry(&mut self) -> Result<()> {
        let state = self
            .streaming
            .take()
            .ok_or_else(|| PatchError::Corrupt("no streamed entry open".into()))?;
        let record = self.entries.last_mut().unwrap();
        record.crc = state.crc.finalize();
        record.comp_size = state.written;
        record.uncomp_size = state.written;

        let end = self.inner.stream_position()?;
        // Patch the crc field and the reserved zip64 sizes.
        self.inner.seek(SeekFrom::Start(record.local_offset + 14))?;
        self.inner.write_all(&record.crc.to_le_bytes())?;
        let zip64_values = record.local_offset + LOCAL_HEADER_LEN + record.name.len() as u64 + 4;
        self.inner.seek(SeekFrom::Start(zip64_values))?;
        self.inner.write_all(&record.uncomp_size.to_le_bytes())?;
        self.inner.write_all(&record.comp_size.to_le_bytes())?;
        self.inner.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Write the central directory, zip64 records as required, and the end of
    /// central directory with `comment`. Returns the underlying sink.
    pub fn finish(mut self, comment: &[u8]) -> Result<W> {
        if self.streaming.is_some() {
            return Err(PatchError::Corrupt("streamed entry still open".into()));
        }
        if comment.len() > u16::MAX as usize {
            return Err(PatchError::InvalidArgument("zip comment too long".into()));
        }

        let central_offset = self.position()?;
        let mut any_zip64 = false;

        for record in &self.entries {
            let mut zip64_extra = Vec::new();
            let uncomp32 = if record.uncomp_size >= MAX32 {
                zip64_extra.extend_from_slice(&record.uncomp_size.to_le_bytes());
                MAX32 as u32
            } else {
                record.uncomp_size as u32
            };
            let comp32 = if record.comp_size >= MAX32 {
                zip64_extra.extend_from_slice(&record.comp_size.to_le_bytes());
                MAX32 as u32
            } else {
                record.comp_size as u32
            };
            let offset32 = if record.local_offset >= MAX32 {
                zip64_extra.extend_from_slice(&record.local_offset.to_le_bytes());
                MAX32 as u32
            } else {
                record.local_offset as u32
            };

            let mut extra = Vec::new();
            if !zip64_extra.is_empty() {
                any_zip64 = true;
                extra.extend_from_slice(&EXTRA_ZIP64.to_le_bytes());
                extra.extend_from_slice(&(zip64_extra.len() as u16).to_le_bytes());
                extra.extend_from_slice(&zip64_extra);
            }
            extra.extend_from_slice(&record.extra);

            let version: u16 = if record.zip64_local || !zip64_extra.is_empty() {
                45
            } else {
                20
            };

            let mut header = Vec::new();
            header.extend_from_slice(&CENTRAL_SIG.to_le_bytes());
            header.extend_from_slice(&((3u16 << 8) | version).to_le_bytes()); // made by: unix
            header.extend_from_slice(&version.to_le_bytes());
            header.extend_from_slice(&0u16.to_le_bytes()); // flags
            header.extend_from_slice(&record.method.to_le_bytes());
            header.extend_from_slice(&record.dos_time.to_le_bytes());
            header.extend_from_slice(&record.dos_date.to_le_bytes());
            header.extend_from_slice(&record.crc.to_le_bytes());
            header.extend_from_slice(&comp32.to_le_bytes());
            header.extend_from_slice(&uncomp32.to_le_bytes());
            header.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
            header.extend_from_slice(&(extra.len() as u16).to_le_bytes());
            header.extend_from_slice(&0u16.to_le_bytes()); // comment len
            header.extend_from_slice(&0u16.to_le_bytes()); // disk number
            header.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            header.extend_from_slice(&((record.unix_mode | 0o100000) << 16).to_le_bytes());
            header.extend_from_slice(&offset32.to_le_bytes());
            header.extend_from_slice(record.name.as_bytes());
            header.extend_from_slice(&extra);
            self.inner.write_all(&header)?;
        }

        let central_size = self.position()? - central_offset;
        let num_entries = self.entries.len() as u64;

        let needs_eocd64 = any_zip64
            || self.entries.iter().any(|e| e.zip64_local)
            || num_entries >= u16::MAX as u64
            || central_offset >= MAX32
            || central_size >= MAX32;

        if needs_eocd64 {
            let eocd64_offset = self.position()?;
            let mut eocd64 = Vec::new();
            eocd64.extend_from_slice(&EOCD64_SIG.to_le_bytes());
            eocd64.extend_from_slice(&44u64.to_le_bytes()); // remaining record size
            eocd64.extend_from_slice(&((3u16 << 8) | 45).to_le_bytes());
            eocd64.extend_from_slice(&45u16.to_le_bytes());
            eocd64.extend_from_slice(&0u32.to_le_bytes()); // this disk
            eocd64.extend_from_slice(&0u32.to_le_bytes()); // central dir disk
            eocd64.extend_from_slice(&num_entries.to_le_bytes());
            eocd64.extend_from_slice(&num_entries.to_le_bytes());
            eocd64.extend_from_slice(&central_size.to_le_bytes());
            eocd64.extend_from_slice(&central_offset.to_le_bytes());
            self.inner.write_all(&eocd64)?;

            let mut locator = Vec::new();
            locator.extend_from_slice(&EOCD64_LOCATOR_SIG.to_le_bytes());
            locator.extend_from_slice(&0u32.to_le_bytes());
            locator.extend_from_slice(&eocd64_offset.to_le_bytes());
            locator.extend_from_slice(&1u32.to_le_bytes());
            self.inner.write_all(&locator)?;
        }

        let mut eocd = Vec::new();
        eocd.extend_from_slice(&EOCD_SIG.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&(num_entries.min(u16::MAX as u64) as u16).to_le_bytes());
        eocd.extend_from_slice(&(num_entries.min(u16::MAX as u64) as u16).to_le_bytes());
        eocd.extend_from_slice(&(central_size.min(MAX32) as u32).to_le_bytes());
        eocd.extend_from_slice(&(central_offset.min(MAX32) as u32).to_le_bytes());
        eocd.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        eocd.extend_from_slice(comment);
        self.inner.write_all(&eocd)?;

        Ok(self.inner)
    }
}

impl<W: Write + Seek> Write for ZipEntryWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Some(state) = self.streaming.as_mut() else {
            return Err(std::io::Error::other("no streamed zip entry open"));
        };
        let n = self.inner.write(buf)?;
        state.crc.update(&buf[..n]);
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Metadata regeneration

/// Offsets and sizes needed to rebuild the property-files tokens.
pub struct MetadataContext {
    /// Data offset and compressed size per output entry name.
    pub entry_info: BTreeMap<String, (u64, u64)>,
    /// Size of the payload header + manifest + metadata signature.
    pub payload_metadata_size: u64,
}

fn property_files_value(
    key: &str,
    ctx: &MetadataContext,
    metadata_entries: &[(String, u64, u64)],
) -> Result<String> {
    let mut tokens = Vec::new();

    if key == "ota-property-files" {
        let (payload_offset, _) = ctx.entry_info[PATH_PAYLOAD];
        tokens.push(format!(
            "payload_metadata.bin:{payload_offset}:{}",
            ctx.payload_metadata_size
        ));
    }

    for name in [
        PATH_PAYLOAD,
        PATH_PROPERTIES,
        "care_map.pb",
        "care_map.txt",
        "apex_info.pb",
    ] {
        if let Some((offset, size)) = ctx.entry_info.get(name) {
            tokens.push(format!("{name}:{offset}:{size}"));
        } else if name == PATH_PAYLOAD || name == PATH_PROPERTIES {
            return Err(PatchError::NotFound(format!("output entry {name}")));
        }
    }

    for (name, offset, size) in metadata_entries {
        let short = name.rsplit('/').next().unwrap_or(name);
        tokens.push(format!("{short}:{offset}:{size}"));
    }

    Ok(tokens.join(","))
}

/// Regenerate the legacy plain-text metadata from the protobuf form.
fn legacy_metadata_text(metadata: &OtaMetadata) -> String {
    let mut pairs: BTreeMap<String, String> = BTreeMap::new();

    let ota_type = match ota_metadata::OtaType::try_from(metadata.r#type) {
        Ok(ota_metadata::OtaType::Ab) => "AB",
        Ok(ota_metadata::OtaType::Block) => "BLOCK",
        Ok(ota_metadata::OtaType::Brick) => "BRICK",
        _ => "UNKNOWN",
    };
    pairs.insert("ota-type".into(), ota_type.into());

    if metadata.wipe {
        pairs.insert("ota-wipe".into(), "yes".into());
    }
    if metadata.downgrade {
        pairs.insert("ota-downgrade".into(), "yes".into());
    }
    if metadata.retrofit_dynamic_partitions {
        pairs.insert("ota-retrofit-dynamic-partitions".into(), "yes".into());
    }
    if metadata.spl_downgrade {
        pairs.insert("spl-downgrade".into(), "yes".into());
    }
    if metadata.required_cache != 0 {
        pairs.insert("ota-required-cache".into(), metadata.required_cache.to_string());
    }

    if let Some(pre) = &metadata.precondition {
        if !pre.device.is_empty() {
            pairs.insert("pre-device".into(), pre.device.join("|"));
        }
        if !pre.build.is_empty() {
            pairs.insert("pre-build".into(), pre.build.join("|"));
        }
        if !pre.build_incremental.is_empty() {
            pairs.insert("pre-build-incremental".into(), pre.build_incremental.clone());
        }
    }

    if let Some(post) = &metadata.postcondition {
        if !post.build.is_empty() {
            pairs.insert("post-build".into(), post.build.join("|"));
        }
        if !post.build_incremental.is_empty() {
            pairs.insert("post-build-incremental".into(), post.build_incremental.clone());
        }
        if !post.sdk_level.is_empty() {
            pairs.insert("post-sdk-level".into(), post.sdk_level.clone());
        }
        if !post.security_patch_level.is_empty() {
            pairs.insert(
                "post-security-patch-level".into(),
                post.security_patch_level.clone(),
            );
        }
        if post.timestamp != 0 {
            pairs.insert("post-timestamp".into(), post.timestamp.to_string());
        }
    }

    for (key, value) in &metadata.property_files {
        pairs.insert(key.clone(), value.clone());
    }

    let mut text = String::new();
    for (key, value) in pairs {
        text.push_str(&key);
        text.push('=');
        text.push_str(&value);
        text.push('\n');
    }
    text
}

/// Captured input-zip facts about an entry that gets regenerated.
#[derive(Clone, Debug)]
pub struct CapturedEntry {
    pub method: u16,
    pub options: EntryOptions,
}

fn compressed_len(method: u16, data: &[u8]) -> Result<u64> {
    match method {
        METHOD_STORED => Ok(data.len() as u64),
        METHOD_DEFLATED => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?.len() as u64)
        }
        other => Err(PatchError::UnsupportedFormat(format!(
            "zip compression method {other}"
        ))),
    }
}

/// Regenerate and append the `metadata` and `metadata.pb` entries.
///
/// The property-files tokens include the offsets and sizes of the metadata
/// entries themselves, so the values are iterated to a fixed point before
/// anything is written. Returns the final OtaMetadata for verification.
pub fn write_metadata_entries<W: Write + Seek>(
    writer: &mut ZipEntryWriter<W>,
    pb_raw: &[u8],
    metadata_info: &CapturedEntry,
    metadata_pb_info: &CapturedEntry,
    ctx: &MetadataContext,
) -> Result<OtaMetadata> {
    let mut metadata = OtaMetadata::decode(pb_raw)?;

    let text_offset =
        writer.predict_data_offset(PATH_METADATA, metadata_info.options.extra.len())?;

    let mut text_size = 0u64;
    let mut pb_size = 0u64;
    let mut final_text = String::new();
    let mut final_pb = Vec::new();
    let mut converged = false;

    for _ in 0..10 {
        let pb_offset = text_offset
            + text_size
            + LOCAL_HEADER_LEN
            + PATH_METADATA_PB.len() as u64
            + metadata_pb_info.options.extra.len() as u64;

        let metadata_entries = vec![
            (PATH_METADATA.to_string(), text_offset, text_size),
            (PATH_METADATA_PB.to_string(), pb_offset, pb_size),
        ];

        let keys: Vec<String> = metadata.property_files.keys().cloned().collect();
        for key in keys {
            let value = property_files_value(&key, ctx, &metadata_entries)?;
            metadata.property_files.insert(key, value);
        }

        final_text = legacy_metadata_text(&metadata);
        final_pb = metadata.encode_to_vec();

        let new_text_size = compressed_len(metadata_info.method, final_text.as_bytes())?;
        let new_pb_size = compressed_len(metadata_pb_info.method, &final_pb)?;

        if new_text_size == text_size && new_pb_size == pb_size {
            converged = true;
            break;
        }
        text_size = new_text_size;
        pb_size = new_pb_size;
    }

    if !converged {
        return Err(PatchError::Corrupt(
            "metadata property-files offsets did not converge".into(),
        ));
    }

    writer.write_entry(
        PATH_METADATA,
        metadata_info.method,
        &metadata_info.options,
        final_text.as_bytes(),
    )?;
    writer.write_entry(
        PATH_METADATA_PB,
        metadata_pb_info.method,
        &metadata_pb_info.options,
        &final_pb,
    )?;

    Ok(metadata)
}

// ---------------------------------------------------------------------------
// Whole-file signature

const SIGNATURE_MESSAGE: &[u8] = b"signed by otaforge\0";
const SIGNATURE_FOOTER_LEN: usize = 6;

/// Length of the archive comment that will hold the signature block.
pub fn signature_comment_len(cert: &Certificate, key: &SigningKey) -> Result<usize> {
    let placeholder = pkcs7_signed_data(cert, &vec![0u8; key.signature_size()])?;
    Ok(SIGNATURE_MESSAGE.len() + placeholder.len() + SIGNATURE_FOOTER_LEN)
}

/// Sign the finished archive and write the signature block into the comment
/// space reserved by [`signature_comment_len`]. The signature covers
/// everything up to (and excluding) the comment-length field of the end of
/// central directory record.
pub fn sign_zip(file: &mut File, cert: &Certificate, key: &SigningKey) -> Result<()> {
    let comment_len = signature_comment_len(cert, key)?;
    let file_len = file.metadata()?.len();
    let signed_len = file_len
        .checked_sub(comment_len as u64 + 2)
        .ok_or_else(|| PatchError::Corrupt("archive smaller than signature block".into()))?;

    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut remaining = signed_len;
    let mut buf = vec![0u8; 1024 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..chunk])?;
        hasher.update(&buf[..chunk]);
        remaining -= chunk as u64;
    }

    let signature = key.sign_digest("sha256", &hasher.finalize())?;
    let block = pkcs7_signed_data(cert, &signature)?;

    let mut comment = Vec::with_capacity(comment_len);
    comment.extend_from_slice(SIGNATURE_MESSAGE);
    comment.extend_from_slice(&block);
    comment.extend_from_slice(&((block.len() + SIGNATURE_FOOTER_LEN) as u16).to_le_bytes());
    comment.extend_from_slice(&[0xff, 0xff]);
    comment.extend_from_slice(&(comment_len as u16).to_le_bytes());
    if comment.len() != comment_len {
        return Err(PatchError::SigningFailure(
            "signature block size changed between passes".into(),
        ));
    }

    file.seek(SeekFrom::Start(file_len - comment_len as u64))?;
    file.write_all(&comment)?;
    file.flush()?;
    Ok(())
}

/// Re-open the finished archive and confirm that every property-files token
/// points at the right bytes.
pub fn verify_metadata(path: &Path, metadata: &OtaMetadata) -> Result<()> {
    let file = File::open(path).map_err(|e| PatchError::io_path(path, e))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut actual: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let short = entry
            .name()
            .rsplit('/')
            .next()
            .unwrap_or(entry.name())
            .to_string();
        actual.insert(short, (entry.data_start(), entry.compressed_size()));
    }

    for (key, value) in &metadata.property_files {
        for token in value.split(',') {
            let parts: Vec<&str> = token.split(':').collect();
            if parts.len() != 3 {
                return Err(PatchError::Corrupt(format!(
                    "malformed property-files token in {key}: {token}"
                )));
            }
            let offset: u64 = parts[1]
                .parse()
                .map_err(|_| PatchError::Corrupt(format!("bad offset in token: {token}")))?;
            let size: u64 = parts[2]
                .parse()
                .map_err(|_| PatchError::Corrupt(format!("bad size in token: {token}")))?;

            if parts[0] == "payload_metadata.bin" {
                let (payload_offset, _) = *actual.get(PATH_PAYLOAD).ok_or_else(|| {
                    PatchError::Corrupt(format!("{PATH_PAYLOAD} missing from output"))
                })?;
                if offset != payload_offset {
                    return Err(PatchError::Corrupt(format!(
                        "payload_metadata.bin offset mismatch: {offset} != {payload_offset}"
                    )));
                }
                continue;
            }

            let (actual_offset, actual_size) = actual.get(parts[0]).ok_or_else(|| {
                PatchError::Corrupt(format!("property-files token for missing entry: {token}"))
            })?;
            if offset != *actual_offset || size != *actual_size {
                return Err(PatchError::Corrupt(format!(
                    "offset mismatch for {}: token {offset}:{size}, actual {actual_offset}:{actual_size}",
                    parts[0]
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_back(buf: Vec<u8>) -> zip::ZipArchive<Cursor<Vec<u8>>> {
        zip::ZipArchive::new(Cursor::new(buf)).unwrap()
    }

    #[test]
    fn test_strip_bad_extra_fields() {
        let mut extra = Vec::new();
        // zip64 record: stripped
        extra.extend_from_slice(&0x0001u16.to_le_bytes());
        extra.extend_from_slice(&8u16.to_le_bytes());
        extra.extend_from_slice(&[0u8; 8]);
        // unix extra: kept
        extra.extend_from_slice(&0x7875u16.to_le_bytes());
        extra.extend_from_slice(&4u16.to_le_bytes());
        extra.extend_from_slice(&[1, 2, 3, 4]);
        // android alignment: stripped
        extra.extend_from_slice(&0xd935u16.to_le_bytes());
        extra.extend_from_slice(&2u16.to_le_bytes());
        extra.extend_from_slice(&[0, 0]);

        let stripped = strip_bad_extra_fields(&extra).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&0x7875u16.to_le_bytes());
        expected.extend_from_slice(&4u16.to_le_bytes());
        expected.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(stripped, expected);

        assert!(strip_bad_extra_fields(&[0x01]).is_err());
    }

    #[test]
    fn test_zip_writer_round_trip() {
        let mut writer = ZipEntryWriter::new(Cursor::new(Vec::new()));
        writer
            .write_entry("a.txt", METHOD_STORED, &EntryOptions::default(), b"hello")
            .unwrap();
        writer
            .write_entry(
                "dir/b.bin",
                METHOD_DEFLATED,
                &EntryOptions::default(),
                &vec![7u8; 10000],
            )
            .unwrap();
        let buf = writer.finish(b"").unwrap().into_inner();

        let mut archive = read_back(buf);
        assert_eq!(archive.len(), 2);

        let mut contents = String::new();
        archive
            .by_name("a.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello");

        let mut data = Vec::new();
        archive.by_name("dir/b.bin").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![7u8; 10000]);
    }

    #[test]
    fn test_zip_writer_streamed_entry() {
        let mut writer = ZipEntryWriter::new(Cursor::new(Vec::new()));
        writer
            .start_streamed_entry("payload.bin", &EntryOptions::default())
            .unwrap();
        writer.write_all(b"streamed ").unwrap();
        writer.write_all(b"payload data").unwrap();
        writer.finish_streamed_entry().unwrap();

        let (offset, size) = writer.entry_info("payload.bin").unwrap();
        assert_eq!(size, b"streamed payload data".len() as u64);

        let buf = writer.finish(b"").unwrap().into_inner();
        // The data offset recorded matches where the bytes actually are.
        assert_eq!(
            &buf[offset as usize..offset as usize + size as usize],
            b"streamed payload data"
        );

        let mut archive = read_back(buf);
        let mut data = Vec::new();
        archive
            .by_name("payload.bin")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"streamed payload data");
    }

    #[test]
    fn test_zip_writer_comment() {
        let mut writer = ZipEntryWriter::new(Cursor::new(Vec::new()));
        writer
            .write_entry("x", METHOD_STORED, &EntryOptions::default(), b"y")
            .unwrap();
        let buf = writer.finish(&vec![0x20; 64]).unwrap().into_inner();
        assert_eq!(&buf[buf.len() - 64..], vec![0x20; 64].as_slice());

        // Still parseable with the comment in place.
        let archive = read_back(buf);
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn test_legacy_metadata_text() {
        use crate::proto::DeviceState;

        let mut metadata = OtaMetadata {
            r#type: ota_metadata::OtaType::Ab as i32,
            postcondition: Some(DeviceState {
                device: vec!["raven".into()],
                build: vec!["google/raven/raven:13/TQ2A/9505619:user/release-keys".into()],
                build_incremental: "9505619".into(),
                timestamp: 1678900000,
                sdk_level: "33".into(),
                security_patch_level: "2023-03-05".into(),
                partition_state: vec![],
            }),
            precondition: Some(DeviceState {
                device: vec!["raven".into()],
                ..Default::default()
            }),
            ..Default::default()
        };
        metadata
            .property_files
            .insert("ota-streaming-property-files".into(), "payload.bin:100:200".into());

        let text = legacy_metadata_text(&metadata);
        assert!(text.contains("ota-type=AB\n"));
        assert!(text.contains("pre-device=raven\n"));
        assert!(text.contains("post-timestamp=1678900000\n"));
        assert!(text.contains("ota-streaming-property-files=payload.bin:100:200\n"));
        assert!(!text.contains("ota-wipe"));
        // Lines are sorted.
        let lines: Vec<&str> = text.lines().collect();
        let mut sorted = lines.clone();
        sorted.sort();
        assert_eq!(lines, sorted);
    }

    #[test]
    fn test_write_metadata_entries_fixpoint() {
        let mut pb = OtaMetadata {
            r#type: ota_metadata::OtaType::Ab as i32,
            ..Default::default()
        };
        pb.property_files
            .insert("ota-property-files".into(), "placeholder".into());
        pb.property_files
            .insert("ota-streaming-property-files".into(), "placeholder".into());
        let pb_raw = pb.encode_to_vec();

        let mut writer = ZipEntryWriter::new(Cursor::new(Vec::new()));
        writer
            .write_entry(PATH_PAYLOAD, METHOD_STORED, &EntryOptions::default(), b"fake payload")
            .unwrap();
        writer
            .write_entry(
                PATH_PROPERTIES,
                METHOD_STORED,
                &EntryOptions::default(),
                b"FILE_HASH=x\n",
            )
            .unwrap();

        let mut entry_info = BTreeMap::new();
        for name in [PATH_PAYLOAD, PATH_PROPERTIES] {
            entry_info.insert(name.to_string(), writer.entry_info(name).unwrap());
        }
        let ctx = MetadataContext {
            entry_info,
            payload_metadata_size: 7,
        };

        let captured = CapturedEntry {
            method: METHOD_DEFLATED,
            options: EntryOptions::default(),
        };
        let metadata =
            write_metadata_entries(&mut writer, &pb_raw, &captured, &captured, &ctx).unwrap();

        let streaming = &metadata.property_files["ota-streaming-property-files"];
        assert!(streaming.starts_with(&format!("{PATH_PAYLOAD}:")));
        assert!(streaming.contains("metadata:"));
        assert!(streaming.contains("metadata.pb:"));

        let ab = &metadata.property_files["ota-property-files"];
        assert!(ab.starts_with("payload_metadata.bin:"));

        // Verify the tokens against the actual archive layout.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota.zip");
        let buf = writer.finish(b"").unwrap().into_inner();
        std::fs::write(&path, &buf).unwrap();
        verify_metadata(&path, &metadata).unwrap();
    }
}
