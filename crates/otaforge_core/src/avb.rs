//! AVB 2.0 structures: image footers, vbmeta headers and descriptors.
//!
//! Layouts follow libavb. All integers are big-endian and blocks are padded
//! to 64 bytes (vbmeta) or 4096 bytes (appended vbmeta blobs).

use crate::crypto::SigningKey;
use crate::error::{PatchError, Result};
use num_bigint::BigUint;
use sha2::{Digest, Sha256, Sha512};

pub const FOOTER_SIZE: usize = 64;
pub const VBMETA_HEADER_SIZE: usize = 256;
const RELEASE_STRING_SIZE: usize = 48;
const AVB_MAGIC: &[u8; 4] = b"AVB0";
const AVB_FOOTER_MAGIC: &[u8; 4] = b"AVBf";

pub const TAG_PROPERTY: u64 = 0;
pub const TAG_HASHTREE: u64 = 1;
pub const TAG_HASH: u64 = 2;
pub const TAG_KERNEL_CMDLINE: u64 = 3;
pub const TAG_CHAIN_PARTITION: u64 = 4;

/// vbmeta header flags that turn verification off.
pub const FLAG_HASHTREE_DISABLED: u32 = 1 << 0;
pub const FLAG_VERIFICATION_DISABLED: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Algorithm {
    pub algorithm_type: u32,
    pub name: &'static str,
    pub hash_name: &'static str,
    pub signature_size: usize,
}

const ALGORITHMS: &[Algorithm] = &[
    Algorithm { algorithm_type: 0, name: "NONE", hash_name: "", signature_size: 0 },
    Algorithm { algorithm_type: 1, name: "SHA256_RSA2048", hash_name: "sha256", signature_size: 256 },
    Algorithm { algorithm_type: 2, name: "SHA256_RSA4096", hash_name: "sha256", signature_size: 512 },
    Algorithm { algorithm_type: 3, name: "SHA256_RSA8192", hash_name: "sha256", signature_size: 1024 },
    Algorithm { algorithm_type: 4, name: "SHA512_RSA2048", hash_name: "sha512", signature_size: 256 },
    Algorithm { algorithm_type: 5, name: "SHA512_RSA4096", hash_name: "sha512", signature_size: 512 },
    Algorithm { algorithm_type: 6, name: "SHA512_RSA8192", hash_name: "sha512", signature_size: 1024 },
];

pub fn algorithm_by_type(algorithm_type: u32) -> Result<Algorithm> {
    ALGORITHMS
        .iter()
        .copied()
        .find(|a| a.algorithm_type == algorithm_type)
        .ok_or_else(|| PatchError::UnsupportedFormat(format!("AVB algorithm type {algorithm_type}")))
}

pub fn algorithm_by_name(name: &str) -> Result<Algorithm> {
    ALGORITHMS
        .iter()
        .copied()
        .find(|a| a.name == name)
        .ok_or_else(|| PatchError::UnsupportedFormat(format!("AVB algorithm {name}")))
}

fn be32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

fn be64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn read_be32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
        .ok_or_else(|| PatchError::Corrupt(format!("AVB structure truncated at {offset}")))
}

fn read_be64(data: &[u8], offset: usize) -> Result<u64> {
    data.get(offset..offset + 8)
        .map(|b| u64::from_be_bytes(b.try_into().unwrap()))
        .ok_or_else(|| PatchError::Corrupt(format!("AVB structure truncated at {offset}")))
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

fn hash_chunks(hash_name: &str, chunks: &[&[u8]]) -> Result<Vec<u8>> {
    match hash_name {
        "sha256" => {
            let mut hasher = Sha256::new();
            for chunk in chunks {
                hasher.update(chunk);
            }
            Ok(hasher.finalize().to_vec())
        }
        "sha512" => {
            let mut hasher = Sha512::new();
            for chunk in chunks {
                hasher.update(chunk);
            }
            Ok(hasher.finalize().to_vec())
        }
        other => Err(PatchError::UnsupportedFormat(format!(
            "hash algorithm {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Footer

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Footer {
    pub version_major: u32,
    pub version_minor: u32,
    pub original_image_size: u64,
    pub vbmeta_offset: u64,
    pub vbmeta_size: u64,
}

/// Parse the footer from the last 64 bytes of an image, if present.
pub fn parse_footer(image: &[u8]) -> Option<Footer> {
    if image.len() < FOOTER_SIZE {
        return None;
    }
    let footer = &image[image.len() - FOOTER_SIZE..];
    if &footer[0..4] != AVB_FOOTER_MAGIC {
        return None;
    }
    Some(Footer {
        version_major: u32::from_be_bytes(footer[4..8].try_into().unwrap()),
        version_minor: u32::from_be_bytes(footer[8..12].try_into().unwrap()),
        original_image_size: u64::from_be_bytes(footer[12..20].try_into().unwrap()),
        vbmeta_offset: u64::from_be_bytes(footer[20..28].try_into().unwrap()),
        vbmeta_size: u64::from_be_bytes(footer[28..36].try_into().unwrap()),
    })
}

pub fn encode_footer(footer: &Footer) -> Vec<u8> {
    let mut out = vec![0u8; FOOTER_SIZE];
    out[0..4].copy_from_slice(AVB_FOOTER_MAGIC);
    out[4..8].copy_from_slice(&be32(footer.version_major));
    out[8..12].copy_from_slice(&be32(footer.version_minor));
    out[12..20].copy_from_slice(&be64(footer.original_image_size));
    out[20..28].copy_from_slice(&be64(footer.vbmeta_offset));
    out[28..36].copy_from_slice(&be64(footer.vbmeta_size));
    out
}

// ---------------------------------------------------------------------------
// Descriptors

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashDescriptor {
    pub image_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    pub salt: Vec<u8>,
    pub digest: Vec<u8>,
    pub flags: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainPartitionDescriptor {
    pub rollback_index_location: u32,
    pub partition_name: String,
    pub public_key: Vec<u8>,
    pub flags: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Hash(HashDescriptor),
    ChainPartition(ChainPartitionDescriptor),
    /// Kept as raw bytes; only the partition name is interpreted.
    Hashtree { partition_name: String, raw: Vec<u8> },
    /// Property, kernel cmdline and unknown descriptors pass through as-is.
    Raw { tag: u64, raw: Vec<u8> },
}

impl Descriptor {
    pub fn partition_name(&self) -> Option<&str> {
        match self {
            Descriptor::Hash(d) => Some(&d.partition_name),
            Descriptor::ChainPartition(d) => Some(&d.partition_name),
            Descriptor::Hashtree { partition_name, .. } => Some(partition_name),
            Descriptor::Raw { .. } => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Descriptor::Hash(d) => {
                let fixed = 8 + 32 + 4 + 4 + 4 + 4 + 60;
                let tail = d.partition_name.len() + d.salt.len() + d.digest.len();
                let nbf = align_up(fixed + tail, 8) as u64;

                let mut out = Vec::with_capacity(16 + nbf as usize);
                out.extend_from_slice(&be64(TAG_HASH));
                out.extend_from_slice(&be64(nbf));
                out.extend_from_slice(&be64(d.image_size));
                let mut algo = [0u8; 32];
                algo[..d.hash_algorithm.len()].copy_from_slice(d.hash_algorithm.as_bytes());
                out.extend_from_slice(&algo);
                out.extend_from_slice(&be32(d.partition_name.len() as u32));
                out.extend_from_slice(&be32(d.salt.len() as u32));
                out.extend_from_slice(&be32(d.digest.len() as u32));
                out.extend_from_slice(&be32(d.flags));
                out.extend_from_slice(&[0u8; 60]);
                out.extend_from_slice(d.partition_name.as_bytes());
                out.extend_from_slice(&d.salt);
                out.extend_from_slice(&d.digest);
                out.resize(16 + nbf as usize, 0);
                out
            }
            Descriptor::ChainPartition(d) => {
                let fixed = 4 + 4 + 4 + 4 + 60;
                let tail = d.partition_name.len() + d.public_key.len();
                let nbf = align_up(fixed + tail, 8) as u64;

                let mut out = Vec::with_capacity(16 + nbf as usize);
                out.extend_from_slice(&be64(TAG_CHAIN_PARTITION));
                out.extend_from_slice(&be64(nbf));
                out.extend_from_slice(&be32(d.rollback_index_location));
                out.extend_from_slice(&be32(d.partition_name.len() as u32));
                out.extend_from_slice(&be32(d.public_key.len() as u32));
                out.extend_from_slice(&be32(d.flags));
                out.extend_from_slice(&[0u8; 60]);
                out.extend_from_slice(d.partition_name.as_bytes());
                out.extend_from_slice(&d.public_key);
                out.resize(16 + nbf as usize, 0);
                out
            }
            Descriptor::Hashtree { raw, .. } => raw.clone(),
            Descriptor::Raw { raw, .. } => raw.clone(),
        }
    }
}

pub fn parse_descriptors(data: &[u8]) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let tag = read_be64(data, offset)?;
        let nbf = read_be64(data, offset + 8)? as usize;
        if nbf % 8 != 0 {
            return Err(PatchError::Corrupt(format!(
                "descriptor payload size {nbf} is not 8-byte aligned"
            )));
        }
        let total = 16 + nbf;
        let raw = data
            .get(offset..offset + total)
            .ok_or_else(|| PatchError::Corrupt("descriptor overruns descriptor block".into()))?;
        let payload = &raw[16..];

        let descriptor = match tag {
            TAG_HASH => {
                let image_size = read_be64(payload, 0)?;
                let hash_algorithm = parse_cstr32(get_range(payload, 8, 32)?)?;
                let name_len = read_be32(payload, 40)? as usize;
                let salt_len = read_be32(payload, 44)? as usize;
                let digest_len = read_be32(payload, 48)? as usize;
                let flags = read_be32(payload, 52)?;
                let fixed = 116;
                let name = get_range(payload, fixed, name_len)?;
                let salt = get_range(payload, fixed + name_len, salt_len)?;
                let digest = get_range(payload, fixed + name_len + salt_len, digest_len)?;
                Descriptor::Hash(HashDescriptor {
                    image_size,
                    hash_algorithm,
                    partition_name: String::from_utf8_lossy(name).into_owned(),
                    salt: salt.to_vec(),
                    digest: digest.to_vec(),
                    flags,
                })
            }
            TAG_CHAIN_PARTITION => {
                let rollback_index_location = read_be32(payload, 0)?;
                let name_len = read_be32(payload, 4)? as usize;
                let key_len = read_be32(payload, 8)? as usize;
                let flags = read_be32(payload, 12)?;
                let fixed = 76;
                let name = get_range(payload, fixed, name_len)?;
                let public_key = get_range(payload, fixed + name_len, key_len)?;
                Descriptor::ChainPartition(ChainPartitionDescriptor {
                    rollback_index_location,
                    partition_name: String::from_utf8_lossy(name).into_owned(),
                    public_key: public_key.to_vec(),
                    flags,
                })
            }
            TAG_HASHTREE => {
                let name_len = read_be32(payload, 88)? as usize;
                let name = get_range(payload, 164, name_len)?;
                Descriptor::Hashtree {
                    partition_name: String::from_utf8_lossy(name).into_owned(),
                    raw: raw.to_vec(),
                }
            }
            _ => Descriptor::Raw {
                tag,
                raw: raw.to_vec(),
            },
        };

        descriptors.push(descriptor);
        offset += total;
    }

    Ok(descriptors)
}

fn get_range(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    data.get(offset..offset + len)
        .ok_or_else(|| PatchError::Corrupt("descriptor field out of range".into()))
}

fn parse_cstr32(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| PatchError::Corrupt("non-UTF-8 string in descriptor".into()))
}

// ---------------------------------------------------------------------------
// vbmeta image

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VbmetaImage {
    pub required_libavb_version_major: u32,
    pub required_libavb_version_minor: u32,
    pub algorithm_type: u32,
    pub rollback_index: u64,
    pub flags: u32,
    pub rollback_index_location: u32,
    /// Raw 48-byte field, NUL padded.
    pub release_string: Vec<u8>,
    pub public_key: Vec<u8>,
    pub descriptors: Vec<Descriptor>,
}

/// Parse a vbmeta blob starting at offset 0 of `data`. Trailing padding is
/// ignored.
pub fn parse_vbmeta_image(data: &[u8]) -> Result<VbmetaImage> {
    if !data.starts_with(AVB_MAGIC) {
        return Err(PatchError::UnsupportedFormat(format!(
            "vbmeta magic: {:02x?}",
            &data[..data.len().min(4)]
        )));
    }

    let version_major = read_be32(data, 4)?;
    let version_minor = read_be32(data, 8)?;
    let auth_size = read_be64(data, 12)? as usize;
    let aux_size = read_be64(data, 20)? as usize;
    let algorithm_type = read_be32(data, 28)?;
    let public_key_offset = read_be64(data, 64)? as usize;
    let public_key_size = read_be64(data, 72)? as usize;
    let descriptors_offset = read_be64(data, 96)? as usize;
    let descriptors_size = read_be64(data, 104)? as usize;
    let rollback_index = read_be64(data, 112)?;
    let flags = read_be32(data, 120)?;
    let rollback_index_location = read_be32(data, 124)?;
    let release_string = data
        .get(128..128 + RELEASE_STRING_SIZE)
        .ok_or_else(|| PatchError::Corrupt("vbmeta header truncated".into()))?
        .to_vec();

    let aux_start = VBMETA_HEADER_SIZE + auth_size;
    let aux = data
        .get(aux_start..aux_start + aux_size)
        .ok_or_else(|| PatchError::Corrupt("vbmeta auxiliary block truncated".into()))?;

    let public_key = aux
        .get(public_key_offset..public_key_offset + public_key_size)
        .ok_or_else(|| PatchError::Corrupt("vbmeta public key out of range".into()))?
        .to_vec();
    let descriptor_block = aux
        .get(descriptors_offset..descriptors_offset + descriptors_size)
        .ok_or_else(|| PatchError::Corrupt("vbmeta descriptors out of range".into()))?;
    let descriptors = parse_descriptors(descriptor_block)?;

    Ok(VbmetaImage {
        required_libavb_version_major: version_major,
        required_libavb_version_minor: version_minor,
        algorithm_type,
        rollback_index,
        flags,
        rollback_index_location,
        release_string,
        public_key,
        descriptors,
    })
}

/// Locate and parse the vbmeta blob in an image: either the image is itself a
/// vbmeta blob, or it carries one through its footer.
pub fn load_vbmeta(image: &[u8]) -> Result<(Option<Footer>, VbmetaImage)> {
    if image.starts_with(AVB_MAGIC) {
        return Ok((None, parse_vbmeta_image(image)?));
    }
    if let Some(footer) = parse_footer(image) {
        let start = footer.vbmeta_offset as usize;
        let end = start + footer.vbmeta_size as usize;
        let blob = image
            .get(start..end)
            .ok_or_else(|| PatchError::Corrupt("footer vbmeta range out of bounds".into()))?;
        let vbmeta = parse_vbmeta_image(blob)?;
        return Ok((Some(footer), vbmeta));
    }
    Err(PatchError::UnsupportedFormat(
        "image has neither a vbmeta header nor an AVB footer".into(),
    ))
}

/// Serialize and sign a vbmeta blob. `key` must be present unless the
/// algorithm type is NONE. The caller's `public_key` field is ignored; the
/// emitted key block always comes from `key`.
pub fn generate_vbmeta_image(image: &VbmetaImage, key: Option<&SigningKey>) -> Result<Vec<u8>> {
    let algorithm = algorithm_by_type(image.algorithm_type)?;

    if image.release_string.len() != RELEASE_STRING_SIZE {
        return Err(PatchError::Corrupt(format!(
            "release string field must be {RELEASE_STRING_SIZE} bytes"
        )));
    }

    let mut descriptors_blob = Vec::new();
    for descriptor in &image.descriptors {
        descriptors_blob.extend_from_slice(&descriptor.encode());
    }

    let public_key_blob = if algorithm.algorithm_type == 0 {
        Vec::new()
    } else {
        let key = key.ok_or_else(|| {
            PatchError::SigningFailure(format!(
                "algorithm {} requires a signing key",
                algorithm.name
            ))
        })?;
        if key.signature_size() != algorithm.signature_size {
            return Err(PatchError::KeyMismatch(format!(
                "algorithm {} needs a {}-bit key, got {} bits",
                algorithm.name,
                algorithm.signature_size * 8,
                key.signature_size() * 8
            )));
        }
        encode_public_key(key)
    };

    let descriptors_offset = 0usize;
    let public_key_offset = descriptors_blob.len();

    let mut aux = Vec::new();
    aux.extend_from_slice(&descriptors_blob);
    aux.extend_from_slice(&public_key_blob);
    aux.resize(align_up(aux.len(), 64), 0);

    let hash_size = match algorithm.hash_name {
        "sha256" => 32,
        "sha512" => 64,
        _ => 0,
    };
    let auth_size = align_up(hash_size + algorithm.signature_size, 64);

    let mut header = vec![0u8; VBMETA_HEADER_SIZE];
    header[0..4].copy_from_slice(AVB_MAGIC);
    header[4..8].copy_from_slice(&be32(image.required_libavb_version_major));
    header[8..12].copy_from_slice(&be32(image.required_libavb_version_minor));
    header[12..20].copy_from_slice(&be64(auth_size as u64));
    header[20..28].copy_from_slice(&be64(aux.len() as u64));
    header[28..32].copy_from_slice(&be32(algorithm.algorithm_type));
    header[32..40].copy_from_slice(&be64(0)); // hash offset
    header[40..48].copy_from_slice(&be64(hash_size as u64));
    header[48..56].copy_from_slice(&be64(hash_size as u64)); // signature offset
    header[56..64].copy_from_slice(&be64(algorithm.signature_size as u64));
    header[64..72].copy_from_slice(&be64(public_key_offset as u64));
    header[72..80].copy_from_slice(&be64(public_key_blob.len() as u64));
    header[80..88].copy_from_slice(&be64(0)); // public key metadata offset
    header[88..96].copy_from_slice(&be64(0)); // public key metadata size
    header[96..104].copy_from_slice(&be64(descriptors_offset as u64));
    header[104..112].copy_from_slice(&be64(descriptors_blob.len() as u64));
    header[112..120].copy_from_slice(&be64(image.rollback_index));
    header[120..124].copy_from_slice(&be32(image.flags));
    header[124..128].copy_from_slice(&be32(image.rollback_index_location));
    header[128..128 + RELEASE_STRING_SIZE].copy_from_slice(&image.release_string);

    let mut auth = Vec::new();
    if algorithm.algorithm_type != 0 {
        let key = key.unwrap();
        let digest = hash_chunks(algorithm.hash_name, &[&header, &aux])?;
        let signature = key.sign_digest(algorithm.hash_name, &digest)?;
        if signature.len() != algorithm.signature_size {
            return Err(PatchError::SigningFailure(format!(
                "unexpected signature size {} for {}",
                signature.len(),
                algorithm.name
            )));
        }
        auth.extend_from_slice(&digest);
        auth.extend_from_slice(&signature);
        auth.resize(auth_size, 0);
    }

    let mut out = Vec::with_capacity(header.len() + auth.len() + aux.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&auth);
    out.extend_from_slice(&aux);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Hash footer

/// Per-image parameters captured from the original footer and vbmeta, reused
/// when re-signing the patched image.
#[derive(Clone, Debug)]
pub struct HashFooterParams {
    pub partition_name: String,
    pub hash_algorithm: String,
    pub salt: Vec<u8>,
    pub rollback_index: u64,
    pub rollback_index_location: u32,
    pub flags: u32,
    pub release_string: Vec<u8>,
    pub algorithm_type: u32,
    pub required_libavb_version_major: u32,
    pub required_libavb_version_minor: u32,
    /// Descriptors other than the hash descriptor, re-emitted unchanged.
    pub other_descriptors: Vec<Descriptor>,
}

/// Append a signed vbmeta blob and AVB footer, growing `image` to exactly
/// `partition_size` bytes.
pub fn add_hash_footer(
    image: &mut Vec<u8>,
    partition_size: u64,
    params: &HashFooterParams,
    key: Option<&SigningKey>,
) -> Result<()> {
    let original_image_size = image.len() as u64;
    let digest = hash_chunks(&params.hash_algorithm, &[&params.salt, image])?;

    let mut descriptors = vec![Descriptor::Hash(HashDescriptor {
        image_size: original_image_size,
        hash_algorithm: params.hash_algorithm.clone(),
        partition_name: params.partition_name.clone(),
        salt: params.salt.clone(),
        digest,
        flags: 0,
    })];
    descriptors.extend(params.other_descriptors.iter().cloned());

    let vbmeta = generate_vbmeta_image(
        &VbmetaImage {
            required_libavb_version_major: params.required_libavb_version_major,
            required_libavb_version_minor: params.required_libavb_version_minor,
            algorithm_type: params.algorithm_type,
            rollback_index: params.rollback_index,
            flags: params.flags,
            rollback_index_location: params.rollback_index_location,
            release_string: params.release_string.clone(),
            public_key: Vec::new(),
            descriptors,
        },
        key,
    )?;

    let vbmeta_offset = align_up(image.len(), 4096);
    let total = vbmeta_offset + vbmeta.len() + FOOTER_SIZE;
    if total as u64 > partition_size {
        return Err(PatchError::Corrupt(format!(
            "image with vbmeta ({total} bytes) exceeds partition size {partition_size}"
        )));
    }

    image.resize(vbmeta_offset, 0);
    let vbmeta_size = vbmeta.len() as u64;
    image.extend_from_slice(&vbmeta);
    image.resize(partition_size as usize - FOOTER_SIZE, 0);
    image.extend_from_slice(&encode_footer(&Footer {
        version_major: 1,
        version_minor: 0,
        original_image_size,
        vbmeta_offset: vbmeta_offset as u64,
        vbmeta_size,
    }));

    Ok(())
}

/// AVB public key blob: bits, n0inv, modulus, R^2 mod N (all big-endian).
pub fn encode_public_key(key: &SigningKey) -> Vec<u8> {
    let n = BigUint::from_bytes_be(&key.modulus_be());
    let bits = n.bits() as u32;
    let key_bytes = key.signature_size();

    let n_be = n.to_bytes_be();
    let n0 = u32::from_be_bytes(n_be[n_be.len() - 4..].try_into().unwrap());

    // -1 / n[0] mod 2^32, computed with a plain extended gcd.
    fn egcd(a: i64, b: i64) -> (i64, i64, i64) {
        if a == 0 {
            (b, 0, 1)
        } else {
            let (g, x, y) = egcd(b % a, a);
            (g, y - (b / a) * x, x)
        }
    }
    let modulus = 1i64 << 32;
    let (g, x, _) = egcd((n0 as i64).rem_euclid(modulus), modulus);
    let n0inv = if g == 1 {
        let inv = ((x % modulus + modulus) % modulus) as u64;
        ((1u64 << 32) - inv) as u32
    } else {
        0
    };

    let r = BigUint::from(1u32) << bits;
    let rr = (&r * &r) % &n;
    let rr_be = rr.to_bytes_be();

    let mut out = Vec::with_capacity(8 + key_bytes * 2);
    out.extend_from_slice(&be32(bits));
    out.extend_from_slice(&be32(n0inv));
    out.resize(out.len() + key_bytes - n_be.len(), 0);
    out.extend_from_slice(&n_be);
    out.resize(8 + key_bytes + key_bytes - rr_be.len(), 0);
    out.extend_from_slice(&rr_be);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash_descriptor() -> Descriptor {
        Descriptor::Hash(HashDescriptor {
            image_size: 0x100000,
            hash_algorithm: "sha256".to_string(),
            partition_name: "boot".to_string(),
            salt: vec![0xaa; 32],
            digest: vec![0xbb; 32],
            flags: 0,
        })
    }

    fn sample_chain_descriptor() -> Descriptor {
        Descriptor::ChainPartition(ChainPartitionDescriptor {
            rollback_index_location: 2,
            partition_name: "vbmeta_system".to_string(),
            public_key: vec![0xcc; 1032],
            flags: 0,
        })
    }

    #[test]
    fn test_descriptor_round_trip() {
        let descriptors = vec![
            sample_hash_descriptor(),
            sample_chain_descriptor(),
            Descriptor::Raw {
                tag: TAG_KERNEL_CMDLINE,
                raw: {
                    let mut raw = Vec::new();
                    raw.extend_from_slice(&be64(TAG_KERNEL_CMDLINE));
                    raw.extend_from_slice(&be64(16));
                    raw.extend_from_slice(&be32(0));
                    raw.extend_from_slice(&be32(5));
                    raw.extend_from_slice(b"a=b c\0\0\0");
                    raw
                },
            },
        ];

        let mut blob = Vec::new();
        for d in &descriptors {
            blob.extend_from_slice(&d.encode());
        }

        let parsed = parse_descriptors(&blob).unwrap();
        assert_eq!(parsed, descriptors);
    }

    #[test]
    fn test_footer_round_trip() {
        let footer = Footer {
            version_major: 1,
            version_minor: 0,
            original_image_size: 0x2000,
            vbmeta_offset: 0x2000,
            vbmeta_size: 0x500,
        };
        let mut image = vec![0u8; 0x4000 - FOOTER_SIZE];
        image.extend_from_slice(&encode_footer(&footer));

        assert_eq!(parse_footer(&image), Some(footer));
        assert_eq!(parse_footer(&[0u8; 128]), None);
    }

    #[test]
    fn test_unsigned_vbmeta_round_trip() {
        let mut release = b"avbtool 1.3.0".to_vec();
        release.resize(RELEASE_STRING_SIZE, 0);
        let image = VbmetaImage {
            required_libavb_version_major: 1,
            required_libavb_version_minor: 0,
            algorithm_type: 0,
            rollback_index: 7,
            flags: FLAG_VERIFICATION_DISABLED,
            rollback_index_location: 1,
            release_string: release,
            public_key: Vec::new(),
            descriptors: vec![sample_hash_descriptor(), sample_chain_descriptor()],
        };

        let blob = generate_vbmeta_image(&image, None).unwrap();
        let parsed = parse_vbmeta_image(&blob).unwrap();
        assert_eq!(parsed, image);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let mut release = vec![0u8; RELEASE_STRING_SIZE];
        release[..4].copy_from_slice(b"test");
        let image = VbmetaImage {
            required_libavb_version_major: 1,
            required_libavb_version_minor: 0,
            algorithm_type: 0,
            rollback_index: 0,
            flags: 0,
            rollback_index_location: 0,
            release_string: release,
            public_key: Vec::new(),
            descriptors: vec![sample_hash_descriptor()],
        };
        assert_eq!(
            generate_vbmeta_image(&image, None).unwrap(),
            generate_vbmeta_image(&image, None).unwrap()
        );
    }

    #[test]
    fn test_algorithm_lookup() {
        assert_eq!(algorithm_by_type(2).unwrap().name, "SHA256_RSA4096");
        assert_eq!(algorithm_by_name("SHA256_RSA2048").unwrap().algorithm_type, 1);
        assert!(algorithm_by_type(99).is_err());
    }
}
