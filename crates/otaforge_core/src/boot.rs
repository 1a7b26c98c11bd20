//! Boot image patching: strip the AVB footer, run the configured patches
//! against the parsed image, then re-sign with the caller's key using the
//! parameters captured from the original footer.

use crate::avb::{self, Descriptor, HashFooterParams};
use crate::bootimg::BootImage;
use crate::compression::CompressedFormat;
use crate::crypto::SigningKey;
use crate::error::{PatchError, Result};
use crate::ramdisk::{self, RamdiskEntry};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub type WarningFn = Arc<dyn Fn(&str) + Send + Sync>;

pub const OTACERTS_PATH: &str = "system/etc/security/otacerts.zip";

/// A transformation applied to an in-memory boot image. `raw_image` holds the
/// serialized bytes of the image as it looked before this patch ran.
pub enum BootPatch {
    Magisk(MagiskRootPatch),
    OtaCert(OtaCertPatch),
    Prepatched(PrepatchedImage),
}

impl BootPatch {
    pub fn apply(&self, raw_image: &[u8], image: BootImage) -> Result<BootImage> {
        match self {
            BootPatch::Magisk(p) => p.patch(raw_image, image),
            BootPatch::OtaCert(p) => p.patch(image),
            BootPatch::Prepatched(p) => p.patch(image),
        }
    }
}

// ---------------------------------------------------------------------------
// Magisk

/// Half-open supported version intervals.
///
/// - Versions <25102 would leave devices on Android 13 GKIs unable to boot
///   into recovery.
/// - Versions 25207-25210 stored the writable block device as an rdev
///   major/minor pair, which was not stable across reboots and was replaced
///   by PREINITDEVICE.
const VERS_SUPPORTED: &[(u32, u32)] = &[(25102, 25207), (25211, 26200), (26201, 27000)];
const VER_PREINIT_DEVICE: (u32, u32) = (25211, 27000);
const VER_RANDOM_SEED: (u32, u32) = (25211, 27000);

const DEFAULT_RANDOM_SEED: u64 = 0xfedc_ba98_7654_3210;

fn in_range(version: u32, range: (u32, u32)) -> bool {
    version >= range.0 && version < range.1
}

pub struct MagiskRootPatch {
    apk_path: PathBuf,
    version: u32,
    preinit_device: Option<String>,
    random_seed: u64,
}

impl MagiskRootPatch {
    pub fn new(
        apk_path: &Path,
        preinit_device: Option<String>,
        random_seed: Option<u64>,
    ) -> Result<Self> {
        let version = Self::read_version(apk_path)?;
        Ok(Self {
            apk_path: apk_path.to_path_buf(),
            version,
            preinit_device,
            // A fixed seed keeps repeated runs byte-for-byte identical.
            random_seed: random_seed.unwrap_or(DEFAULT_RANDOM_SEED),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn read_version(apk_path: &Path) -> Result<u32> {
        let file = File::open(apk_path).map_err(|e| PatchError::io_path(apk_path, e))?;
        let mut apk = zip::ZipArchive::new(file)?;
        let mut script = String::new();
        apk.by_name("assets/util_functions.sh")
            .map_err(|_| {
                PatchError::NotFound(format!(
                    "assets/util_functions.sh in {}",
                    apk_path.display()
                ))
            })?
            .read_to_string(&mut script)?;

        for line in script.lines() {
            if let Some(value) = line.strip_prefix("MAGISK_VER_CODE=") {
                return value.trim().parse().map_err(|_| {
                    PatchError::Corrupt(format!("bad MAGISK_VER_CODE value: {value:?}"))
                });
            }
        }

        Err(PatchError::Corrupt(format!(
            "failed to determine Magisk version from {}",
            apk_path.display()
        )))
    }

    /// Check the version gate and the preinit-device requirement.
    pub fn validate(&self) -> Result<()> {
        if !VERS_SUPPORTED.iter().any(|&r| in_range(self.version, r)) {
            let supported = VERS_SUPPORTED
                .iter()
                .map(|&(lo, hi)| format!("[{lo}, {hi})"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PatchError::InvalidArgument(format!(
                "unsupported Magisk version {} (supported: {supported})",
                self.version
            )));
        }

        if self.preinit_device.is_none() && in_range(self.version, VER_PREINIT_DEVICE) {
            return Err(PatchError::InvalidArgument(format!(
                "Magisk version {} requires a preinit device to be specified",
                self.version
            )));
        }

        Ok(())
    }

    fn patch(&self, raw_image: &[u8], mut image: BootImage) -> Result<BootImage> {
        if image.ramdisks().len() > 1 {
            return Err(PatchError::UnsupportedFormat(format!(
                "boot image has {} ramdisks, expected at most one",
                image.ramdisks().len()
            )));
        }

        // Magisk records the digest of the unpatched image in its config.
        let sha1 = hex::encode(Sha1::digest(raw_image));

        let had_ramdisk = !image.ramdisks().is_empty();
        let (mut entries, format) = match image.ramdisks().first() {
            Some(data) => ramdisk::load(data, false)?,
            None => (Vec::new(), CompressedFormat::Lz4Legacy),
        };
        let old_entries = entries.clone();

        entries.push(RamdiskEntry::new_directory("overlay.d", 0o750));
        entries.push(RamdiskEntry::new_directory("overlay.d/sbin", 0o750));

        if had_ramdisk {
            entries.retain(|e| e.name != "init");
        }

        let file = File::open(&self.apk_path).map_err(|e| PatchError::io_path(&self.apk_path, e))?;
        let mut apk = zip::ZipArchive::new(file)?;

        entries.push(RamdiskEntry::new_file(
            "init",
            0o750,
            read_zip_entry(&mut apk, "lib/arm64-v8a/libmagiskinit.so")?,
        ));

        let mut xz_files = vec![
            ("lib/armeabi-v7a/libmagisk32.so", "magisk32.xz"),
            ("lib/arm64-v8a/libmagisk64.so", "magisk64.xz"),
        ];
        // Only present in newer bundles.
        if apk.by_name("assets/stub.apk").is_ok() {
            xz_files.push(("assets/stub.apk", "stub.xz"));
        }

        for (source, target) in xz_files {
            let data = read_zip_entry(&mut apk, source)?;
            let mut compressed = Vec::new();
            lzma_rs::xz_compress(&mut &data[..], &mut compressed)
                .map_err(|e| PatchError::Corrupt(format!("xz compression: {e:?}")))?;
            entries.push(RamdiskEntry::new_file(
                format!("overlay.d/sbin/{target}"),
                0o644,
                compressed,
            ));
        }

        apply_backup(old_entries, &mut entries);

        let mut config = String::new();
        config.push_str("KEEPVERITY=true\n");
        config.push_str("KEEPFORCEENCRYPT=true\n");
        config.push_str("PATCHVBMETAFLAG=false\n");
        config.push_str("RECOVERYMODE=false\n");
        if in_range(self.version, VER_PREINIT_DEVICE) {
            let device = self.preinit_device.as_deref().ok_or_else(|| {
                PatchError::InvalidArgument("preinit device is required".into())
            })?;
            config.push_str(&format!("PREINITDEVICE={device}\n"));
        }
        config.push_str(&format!("SHA1={sha1}\n"));
        if in_range(self.version, VER_RANDOM_SEED) {
            config.push_str(&format!("RANDOMSEED={:#x}\n", self.random_seed));
        }

        entries.push(RamdiskEntry::new_file(
            ".backup/.magisk",
            0o000,
            config.into_bytes(),
        ));

        let new_ramdisk = ramdisk::save(&entries, format)?;
        let ramdisks = image.ramdisks_mut();
        if ramdisks.is_empty() {
            ramdisks.push(new_ramdisk);
        } else {
            ramdisks[0] = new_ramdisk;
        }

        Ok(image)
    }
}

/// Build the Magisk `.backup/` structure: old entries for deleted or changed
/// names are renamed into `.backup/`, and `.backup/.rmlist` lists the newly
/// added names, sorted and NUL-terminated. The snapshot is consumed.
fn apply_backup(old_entries: Vec<RamdiskEntry>, entries: &mut Vec<RamdiskEntry>) {
    let mut old_by_name: BTreeMap<String, RamdiskEntry> = old_entries
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect();
    let new_by_name: BTreeMap<&str, &RamdiskEntry> =
        entries.iter().map(|e| (e.name.as_str(), e)).collect();

    let added: BTreeSet<String> = new_by_name
        .keys()
        .filter(|name| !old_by_name.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    let backed_up: BTreeSet<String> = old_by_name
        .iter()
        .filter(|(name, old)| match new_by_name.get(name.as_str()) {
            // Deleted names and changed contents both get backed up.
            Some(new) => old.content != new.content,
            None => true,
        })
        .map(|(name, _)| name.clone())
        .collect();

    entries.push(RamdiskEntry::new_directory(".backup", 0o000));

    for name in &backed_up {
        let mut entry = old_by_name.remove(name).unwrap();
        entry.name = format!(".backup/{name}");
        entries.push(entry);
    }

    let mut rmlist = Vec::new();
    for name in &added {
        rmlist.extend_from_slice(name.as_bytes());
        rmlist.push(0);
    }
    entries.push(RamdiskEntry::new_file(".backup/.rmlist", 0o000, rmlist));
}

fn read_zip_entry(apk: &mut zip::ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    apk.by_name(name)
        .map_err(|_| PatchError::NotFound(format!("{name} in Magisk bundle")))?
        .read_to_end(&mut data)?;
    Ok(data)
}

// ---------------------------------------------------------------------------
// OTA certificate

pub struct OtaCertPatch {
    cert: Vec<u8>,
}

impl OtaCertPatch {
    pub fn new(cert: Vec<u8>) -> Self {
        Self { cert }
    }

    fn patch(&self, mut image: BootImage) -> Result<BootImage> {
        let mut found = false;
        let ramdisks = image.ramdisks_mut();

        for ramdisk_data in ramdisks.iter_mut() {
            let (mut entries, format) = ramdisk::load(ramdisk_data, false)?;
            let Some(entry) = entries.iter_mut().find(|e| e.name == OTACERTS_PATH) else {
                continue;
            };
            found = true;

            // The old certs are dropped entirely; flashing a stock OTA on top
            // of a self-signed chain would leave the device unbootable.
            entry.content = build_otacerts_zip(&self.cert)?;
            *ramdisk_data = ramdisk::save(&entries, format)?;
        }

        if !found {
            // Refuse to continue rather than produce an output that locks the
            // user out of future updates.
            return Err(PatchError::NotFound(format!(
                "{OTACERTS_PATH} not found in any ramdisk"
            )));
        }

        Ok(image)
    }
}

fn build_otacerts_zip(cert: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    // Zeroed timestamp and unix permissions keep the archive reproducible.
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    writer.start_file("ota.x509.pem", options)?;
    writer.write_all(cert)?;
    Ok(writer.finish()?.into_inner())
}

// ---------------------------------------------------------------------------
// Prepatched image

pub struct PrepatchedImage {
    prepatched_path: PathBuf,
    fatal_level: u8,
    warning_fn: WarningFn,
}

const MAX_LEVEL: u8 = 2;

impl PrepatchedImage {
    pub fn new(prepatched_path: &Path, fatal_level: u8, warning_fn: WarningFn) -> Self {
        Self {
            prepatched_path: prepatched_path.to_path_buf(),
            fatal_level,
            warning_fn,
        }
    }

    fn patch(&self, image: BootImage) -> Result<BootImage> {
        let data = fs::read(&self.prepatched_path)
            .map_err(|e| PatchError::io_path(&self.prepatched_path, e))?;
        let prepatched = BootImage::load_autodetect(&data)?;

        let issues = compare_images(&image, &prepatched);

        let warnings: Vec<&String> = issues
            .iter()
            .take(self.fatal_level.min(MAX_LEVEL + 1) as usize)
            .flatten()
            .collect();
        let errors: Vec<&String> = issues
            .iter()
            .skip(self.fatal_level as usize)
            .flatten()
            .collect();

        if !warnings.is_empty() {
            let joined = warnings
                .iter()
                .map(|w| format!("- {w}"))
                .collect::<Vec<_>>()
                .join("\n");
            (self.warning_fn)(&format!(
                "The prepatched boot image may not be compatible with the original:\n{joined}"
            ));
        }

        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(|e| format!("- {e}"))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(PatchError::IncompatibleImage(joined));
        }

        Ok(prepatched)
    }
}

/// Compare header fields and section presence of two images, returning the
/// issues bucketed by severity level:
/// level 0 does not affect booting, level 1 may, level 2 very likely does.
fn compare_images(original: &BootImage, prepatched: &BootImage) -> [Vec<String>; 3] {
    let mut issues: [Vec<String>; 3] = Default::default();

    let old_fields = original.header_fields();
    let new_fields = prepatched.header_fields();

    for key in new_fields.keys() {
        if !old_fields.contains_key(key) {
            issues[2].push(format!("{key} header field was added"));
        }
    }
    for key in old_fields.keys() {
        if !new_fields.contains_key(key) {
            issues[2].push(format!("{key} header field was removed"));
        }
    }
    for (key, old_value) in &old_fields {
        if let Some(new_value) = new_fields.get(key) {
            if old_value != new_value {
                let level = match *key {
                    "id" | "os_version" => 0,
                    "cmdline" | "extra_cmdline" => 1,
                    _ => 2,
                };
                issues[level].push(format!(
                    "{key} header field was changed: {old_value} -> {new_value}"
                ));
            }
        }
    }

    let sections: [(&str, Option<&[u8]>, Option<&[u8]>); 5] = [
        ("kernel", original.kernel(), prepatched.kernel()),
        ("second", original.second(), prepatched.second()),
        (
            "recovery_dtbo",
            original.recovery_dtbo(),
            prepatched.recovery_dtbo(),
        ),
        ("dtb", original.dtb(), prepatched.dtb()),
        ("bootconfig", original.bootconfig(), prepatched.bootconfig()),
    ];
    for (name, old, new) in sections {
        match (old, new) {
            (None, Some(_)) => issues[1].push(format!("{name} section was added")),
            (Some(_), None) => issues[2].push(format!("{name} section was removed")),
            _ => {}
        }
    }

    if prepatched.ramdisks().len() < original.ramdisks().len() {
        issues[2].push(format!(
            "Number of ramdisk sections decreased: {} -> {}",
            original.ramdisks().len(),
            prepatched.ramdisks().len()
        ));
    }

    if original.kernel().is_some() {
        let old_kmi = kmi_version(original);
        let new_kmi = kmi_version(prepatched);
        if old_kmi != new_kmi {
            issues[2].push(format!(
                "Kernel module interface version changed: {old_kmi:?} -> {new_kmi:?}"
            ));
        }
    }

    issues
}

/// Extract the KMI version string from a (possibly compressed) kernel.
pub fn kmi_version(image: &BootImage) -> Option<String> {
    let kernel = image.kernel()?;
    let decompressed = crate::compression::decompress(kernel, true)
        .map(|(data, _)| data)
        .unwrap_or_else(|_| kernel.to_vec());

    let re =
        regex::bytes::Regex::new(r"Linux version (\d+\.\d+)\.\d+-(android\d+)-(\d+)-").ok()?;
    let caps = re.captures(&decompressed)?;
    let parts: Vec<String> = (1..=3)
        .map(|i| String::from_utf8_lossy(caps.get(i).unwrap().as_bytes()).into_owned())
        .collect();
    Some(parts.join("-"))
}

// ---------------------------------------------------------------------------
// patch_boot

/// Apply `patches` to the boot image at `input_path` and write the re-signed
/// result to `output_path`.
///
/// The AVB footer is stripped before patching and re-created afterwards with
/// the parameters captured from the original image. With
/// `only_if_previously_signed`, an unsigned input drops the key and stays
/// unsigned; any other signedness mismatch between input and output is fatal.
pub fn patch_boot(
    input_path: &Path,
    output_path: &Path,
    key: Option<&SigningKey>,
    only_if_previously_signed: bool,
    patches: &[Arc<BootPatch>],
) -> Result<()> {
    let data = fs::read(input_path).map_err(|e| PatchError::io_path(input_path, e))?;
    let partition_size = data.len() as u64;

    let footer_info = match avb::parse_footer(&data) {
        Some(footer) => {
            let start = footer.vbmeta_offset as usize;
            let end = start + footer.vbmeta_size as usize;
            let blob = data
                .get(start..end)
                .ok_or_else(|| PatchError::Corrupt("footer vbmeta range out of bounds".into()))?;
            Some((footer, avb::parse_vbmeta_image(blob)?))
        }
        None => None,
    };

    let have_key_old = footer_info
        .as_ref()
        .is_some_and(|(_, vbmeta)| !vbmeta.public_key.is_empty());

    let key = if !have_key_old && only_if_previously_signed {
        None
    } else {
        key
    };

    if have_key_old != key.is_some() {
        return Err(PatchError::KeyMismatch(format!(
            "key presence does not match: {} (old) != {} (new)",
            have_key_old,
            key.is_some()
        )));
    }

    let params = match &footer_info {
        Some((_, vbmeta)) => {
            let mut hash_descriptor = None;
            let mut other_descriptors = Vec::new();
            for descriptor in &vbmeta.descriptors {
                match descriptor {
                    Descriptor::Hash(d) => {
                        if hash_descriptor.replace(d.clone()).is_some() {
                            return Err(PatchError::Corrupt(
                                "expected only one hash descriptor".into(),
                            ));
                        }
                    }
                    other => other_descriptors.push(other.clone()),
                }
            }
            let hash_descriptor = hash_descriptor
                .ok_or_else(|| PatchError::Corrupt("no hash descriptor found".into()))?;

            let mut algorithm = avb::algorithm_by_type(vbmeta.algorithm_type)?;
            // Some devices ship 2048-bit-signed images; re-signing targets
            // 4096-bit keys.
            if algorithm.name == "SHA256_RSA2048" {
                algorithm = avb::algorithm_by_name("SHA256_RSA4096")?;
            }

            Some(HashFooterParams {
                partition_name: hash_descriptor.partition_name,
                hash_algorithm: hash_descriptor.hash_algorithm,
                salt: hash_descriptor.salt,
                rollback_index: vbmeta.rollback_index,
                rollback_index_location: vbmeta.rollback_index_location,
                flags: vbmeta.flags,
                release_string: vbmeta.release_string.clone(),
                algorithm_type: if have_key_old {
                    algorithm.algorithm_type
                } else {
                    0
                },
                required_libavb_version_major: vbmeta.required_libavb_version_major,
                required_libavb_version_minor: vbmeta.required_libavb_version_minor,
                other_descriptors,
            })
        }
        None => None,
    };

    // Strip the footer so patches operate on the raw image.
    let mut current = data;
    if let Some((footer, _)) = &footer_info {
        current.truncate(footer.original_image_size as usize);
    }

    let mut image = BootImage::load_autodetect(&current)?;
    for patch in patches {
        image = patch.apply(&current, image)?;
        current = image.generate()?;
    }

    if let Some(params) = params {
        debug!(
            partition = %params.partition_name,
            size = current.len(),
            "re-adding hash footer"
        );
        avb::add_hash_footer(&mut current, partition_size, &params, key)?;
    }

    fs::write(output_path, &current).map_err(|e| PatchError::io_path(output_path, e))?;
    Ok(())
}

/// Read the Magisk config from a patched boot image's first ramdisk.
pub fn magisk_info(image: &BootImage) -> Result<Vec<u8>> {
    let ramdisk_data = image
        .ramdisks()
        .first()
        .ok_or_else(|| PatchError::NotFound("boot image does not have a ramdisk".into()))?;
    let (entries, _) = ramdisk::load(ramdisk_data, true)?;
    entries
        .into_iter()
        .find(|e| e.name == ".backup/.magisk")
        .map(|e| e.content)
        .ok_or_else(|| PatchError::NotFound("not a Magisk-patched boot image".into()))
}
