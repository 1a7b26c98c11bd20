//! Android boot image container formats: boot v0-v4 and vendor_boot v3-v4.
//!
//! Layouts follow AOSP's bootimg.h. All multi-byte header fields are
//! little-endian; every section is padded to the image page size.

use crate::error::{PatchError, Result};
use std::collections::BTreeMap;

pub const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";
pub const VENDOR_BOOT_MAGIC: &[u8; 8] = b"VNDRBOOT";

const BOOT_NAME_SIZE: usize = 16;
const BOOT_ARGS_SIZE: usize = 512;
const BOOT_EXTRA_ARGS_SIZE: usize = 1024;
const BOOT_ID_SIZE: usize = 32;
const V3_PAGE_SIZE: usize = 4096;
const VENDOR_BOOT_ARGS_SIZE: usize = 2048;
const VENDOR_BOOT_NAME_SIZE: usize = 16;
const VENDOR_RAMDISK_NAME_SIZE: usize = 32;
const VENDOR_RAMDISK_BOARD_ID_SIZE: usize = 64;
const VENDOR_RAMDISK_TABLE_ENTRY_SIZE: usize = 108;

#[derive(Clone, Debug, PartialEq)]
pub struct BootImageV0V2 {
    pub header_version: u32,
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub os_version: u32,
    pub name: Vec<u8>,
    pub cmdline: Vec<u8>,
    pub id: Vec<u8>,
    pub extra_cmdline: Vec<u8>,
    /// Only meaningful for header version >= 1.
    pub recovery_dtbo_offset: u64,
    /// Only meaningful for header version 2.
    pub dtb_addr: u64,
    pub kernel: Option<Vec<u8>>,
    pub ramdisks: Vec<Vec<u8>>,
    pub second: Option<Vec<u8>>,
    pub recovery_dtbo: Option<Vec<u8>>,
    pub dtb: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BootImageV3V4 {
    pub header_version: u32,
    pub os_version: u32,
    pub reserved: [u32; 4],
    pub cmdline: Vec<u8>,
    pub kernel: Option<Vec<u8>>,
    pub ramdisks: Vec<Vec<u8>>,
    /// GKI boot signature section, header version 4 only.
    pub boot_signature: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VendorRamdiskMeta {
    pub ramdisk_type: u32,
    pub name: Vec<u8>,
    pub board_id: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VendorBootImage {
    pub header_version: u32,
    pub page_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub cmdline: Vec<u8>,
    pub tags_addr: u32,
    pub name: Vec<u8>,
    pub dtb_addr: u64,
    pub ramdisks: Vec<Vec<u8>>,
    /// v4 ramdisk table metadata, parallel to `ramdisks`. Empty on v3.
    pub ramdisk_table: Vec<VendorRamdiskMeta>,
    pub dtb: Option<Vec<u8>>,
    pub bootconfig: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BootImage {
    V0V2(BootImageV0V2),
    V3V4(BootImageV3V4),
    Vendor(VendorBootImage),
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| PatchError::Corrupt(format!("boot image truncated at offset {offset}")))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    data.get(offset..offset + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| PatchError::Corrupt(format!("boot image truncated at offset {offset}")))
}

fn read_bytes(data: &[u8], offset: usize, len: usize) -> Result<Vec<u8>> {
    data.get(offset..offset + len)
        .map(|b| b.to_vec())
        .ok_or_else(|| PatchError::Corrupt(format!("boot image truncated at offset {offset}")))
}

fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    let rem = buf.len() % alignment;
    if rem != 0 {
        buf.resize(buf.len() + alignment - rem, 0);
    }
}

fn push_padded(buf: &mut Vec<u8>, section: &[u8], alignment: usize) {
    buf.extend_from_slice(section);
    pad_to(buf, alignment);
}

/// Take a section of `size` bytes at `*offset`, advancing the offset past the
/// section's page padding. Zero-size sections yield `None`.
fn take_section(data: &[u8], offset: &mut usize, size: usize, page: usize) -> Result<Option<Vec<u8>>> {
    if size == 0 {
        return Ok(None);
    }
    let section = read_bytes(data, *offset, size)?;
    *offset += size.div_ceil(page) * page;
    Ok(Some(section))
}

fn trimmed(field: &[u8]) -> String {
    let end = field.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

impl BootImage {
    pub fn load_autodetect(data: &[u8]) -> Result<Self> {
        if data.starts_with(BOOT_MAGIC) {
            let header_version = read_u32(data, 40)?;
            match header_version {
                0..=2 => parse_v0v2(data, header_version).map(BootImage::V0V2),
                3 | 4 => parse_v3v4(data, header_version).map(BootImage::V3V4),
                v => Err(PatchError::UnsupportedFormat(format!(
                    "boot image header version {v}"
                ))),
            }
        } else if data.starts_with(VENDOR_BOOT_MAGIC) {
            let header_version = read_u32(data, 8)?;
            match header_version {
                3 | 4 => parse_vendor(data, header_version).map(BootImage::Vendor),
                v => Err(PatchError::UnsupportedFormat(format!(
                    "vendor boot header version {v}"
                ))),
            }
        } else {
            Err(PatchError::UnsupportedFormat(format!(
                "unrecognized boot image magic: {:02x?}",
                &data[..data.len().min(8)]
            )))
        }
    }

    pub fn generate(&self) -> Result<Vec<u8>> {
        match self {
            BootImage::V0V2(img) => generate_v0v2(img),
            BootImage::V3V4(img) => generate_v3v4(img),
            BootImage::Vendor(img) => generate_vendor(img),
        }
    }

    pub fn ramdisks(&self) -> &[Vec<u8>] {
        match self {
            BootImage::V0V2(img) => &img.ramdisks,
            BootImage::V3V4(img) => &img.ramdisks,
            BootImage::Vendor(img) => &img.ramdisks,
        }
    }

    pub fn ramdisks_mut(&mut self) -> &mut Vec<Vec<u8>> {
        match self {
            BootImage::V0V2(img) => &mut img.ramdisks,
            BootImage::V3V4(img) => &mut img.ramdisks,
            BootImage::Vendor(img) => &mut img.ramdisks,
        }
    }

    pub fn kernel(&self) -> Option<&[u8]> {
        match self {
            BootImage::V0V2(img) => img.kernel.as_deref(),
            BootImage::V3V4(img) => img.kernel.as_deref(),
            BootImage::Vendor(_) => None,
        }
    }

    pub fn second(&self) -> Option<&[u8]> {
        match self {
            BootImage::V0V2(img) => img.second.as_deref(),
            _ => None,
        }
    }

    pub fn recovery_dtbo(&self) -> Option<&[u8]> {
        match self {
            BootImage::V0V2(img) => img.recovery_dtbo.as_deref(),
            _ => None,
        }
    }

    pub fn dtb(&self) -> Option<&[u8]> {
        match self {
            BootImage::V0V2(img) => img.dtb.as_deref(),
            BootImage::Vendor(img) => img.dtb.as_deref(),
            _ => None,
        }
    }

    pub fn bootconfig(&self) -> Option<&[u8]> {
        match self {
            BootImage::Vendor(img) => img.bootconfig.as_deref(),
            _ => None,
        }
    }

    /// Non-size header fields, keyed by stable names, for compatibility
    /// comparison between two images.
    pub fn header_fields(&self) -> BTreeMap<&'static str, String> {
        let mut fields = BTreeMap::new();
        match self {
            BootImage::V0V2(img) => {
                fields.insert("header_version", img.header_version.to_string());
                fields.insert("kernel_addr", format!("{:#x}", img.kernel_addr));
                fields.insert("ramdisk_addr", format!("{:#x}", img.ramdisk_addr));
                fields.insert("second_addr", format!("{:#x}", img.second_addr));
                fields.insert("tags_addr", format!("{:#x}", img.tags_addr));
                fields.insert("page_size", img.page_size.to_string());
                fields.insert("os_version", format!("{:#x}", img.os_version));
                fields.insert("name", trimmed(&img.name));
                fields.insert("cmdline", trimmed(&img.cmdline));
                fields.insert("id", hex::encode(&img.id));
                fields.insert("extra_cmdline", trimmed(&img.extra_cmdline));
                if img.header_version >= 1 {
                    fields.insert(
                        "recovery_dtbo_offset",
                        format!("{:#x}", img.recovery_dtbo_offset),
                    );
                }
                if img.header_version >= 2 {
                    fields.insert("dtb_addr", format!("{:#x}", img.dtb_addr));
                }
            }
            BootImage::V3V4(img) => {
                fields.insert("header_version", img.header_version.to_string());
                fields.insert("os_version", format!("{:#x}", img.os_version));
                fields.insert("cmdline", trimmed(&img.cmdline));
            }
            BootImage::Vendor(img) => {
                fields.insert("header_version", img.header_version.to_string());
                fields.insert("page_size", img.page_size.to_string());
                fields.insert("kernel_addr", format!("{:#x}", img.kernel_addr));
                fields.insert("ramdisk_addr", format!("{:#x}", img.ramdisk_addr));
                fields.insert("cmdline", trimmed(&img.cmdline));
                fields.insert("tags_addr", format!("{:#x}", img.tags_addr));
                fields.insert("name", trimmed(&img.name));
                fields.insert("dtb_addr", format!("{:#x}", img.dtb_addr));
            }
        }
        fields
    }
}

fn parse_v0v2(data: &[u8], header_version: u32) -> Result<BootImageV0V2> {
    let kernel_size = read_u32(data, 8)? as usize;
    let kernel_addr = read_u32(data, 12)?;
    let ramdisk_size = read_u32(data, 16)? as usize;
    let ramdisk_addr = read_u32(data, 20)?;
    let second_size = read_u32(data, 24)? as usize;
    let second_addr = read_u32(data, 28)?;
    let tags_addr = read_u32(data, 32)?;
    let page_size = read_u32(data, 36)?;
    let os_version = read_u32(data, 44)?;
    let name = read_bytes(data, 48, BOOT_NAME_SIZE)?;
    let cmdline = read_bytes(data, 64, BOOT_ARGS_SIZE)?;
    let id = read_bytes(data, 576, BOOT_ID_SIZE)?;
    let extra_cmdline = read_bytes(data, 608, BOOT_EXTRA_ARGS_SIZE)?;

    if !(512..=16384).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(PatchError::Corrupt(format!(
            "implausible page size: {page_size}"
        )));
    }
    let page = page_size as usize;

    let mut recovery_dtbo_size = 0usize;
    let mut recovery_dtbo_offset = 0u64;
    let mut dtb_size = 0usize;
    let mut dtb_addr = 0u64;

    if header_version >= 1 {
        recovery_dtbo_size = read_u32(data, 1632)? as usize;
        recovery_dtbo_offset = read_u64(data, 1636)?;
    }
    if header_version >= 2 {
        dtb_size = read_u32(data, 1648)? as usize;
        dtb_addr = read_u64(data, 1652)?;
    }

    let mut offset = page;
    let kernel = take_section(data, &mut offset, kernel_size, page)?;
    let ramdisk = take_section(data, &mut offset, ramdisk_size, page)?;
    let second = take_section(data, &mut offset, second_size, page)?;
    let recovery_dtbo = take_section(data, &mut offset, recovery_dtbo_size, page)?;
    let dtb = take_section(data, &mut offset, dtb_size, page)?;

    Ok(BootImageV0V2 {
        header_version,
        kernel_addr,
        ramdisk_addr,
        second_addr,
        tags_addr,
        page_size,
        os_version,
        name,
        cmdline,
        id,
        extra_cmdline,
        recovery_dtbo_offset,
        dtb_addr,
        kernel,
        ramdisks: ramdisk.into_iter().collect(),
        second,
        recovery_dtbo,
        dtb,
    })
}

fn parse_v3v4(data: &[u8], header_version: u32) -> Result<BootImageV3V4> {
    let kernel_size = read_u32(data, 8)? as usize;
    let ramdisk_size = read_u32(data, 12)? as usize;
    let os_version = read_u32(data, 16)?;
    let mut reserved = [0u32; 4];
    for (i, slot) in reserved.iter_mut().enumerate() {
        *slot = read_u32(data, 24 + i * 4)?;
    }
    let cmdline = read_bytes(data, 44, BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE)?;
    let signature_size = if header_version == 4 {
        read_u32(data, 1580)? as usize
    } else {
        0
    };

    let mut offset = V3_PAGE_SIZE;
    let kernel = take_section(data, &mut offset, kernel_size, V3_PAGE_SIZE)?;
    let ramdisk = take_section(data, &mut offset, ramdisk_size, V3_PAGE_SIZE)?;
    let boot_signature = take_section(data, &mut offset, signature_size, V3_PAGE_SIZE)?;

    Ok(BootImageV3V4 {
        header_version,
        os_version,
        reserved,
        cmdline,
        kernel,
        ramdisks: ramdisk.into_iter().collect(),
        boot_signature,
    })
}

fn parse_vendor(data: &[u8], header_version: u32) -> Result<VendorBootImage> {
    let page_size = read_u32(data, 12)?;
    let kernel_addr = read_u32(data, 16)?;
    let ramdisk_addr = read_u32(data, 20)?;
    let vendor_ramdisk_size = read_u32(data, 24)? as usize;
    let cmdline = read_bytes(data, 28, VENDOR_BOOT_ARGS_SIZE)?;
    let tags_addr = read_u32(data, 2076)?;
    let name = read_bytes(data, 2080, VENDOR_BOOT_NAME_SIZE)?;
    let dtb_size = read_u32(data, 2100)? as usize;
    let dtb_addr = read_u64(data, 2104)?;

    if !(512..=16384).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(PatchError::Corrupt(format!(
            "implausible page size: {page_size}"
        )));
    }
    let page = page_size as usize;

    let (table_size, table_entry_num, table_entry_size, bootconfig_size) = if header_version == 4 {
        (
            read_u32(data, 2112)? as usize,
            read_u32(data, 2116)? as usize,
            read_u32(data, 2120)? as usize,
            read_u32(data, 2124)? as usize,
        )
    } else {
        (0, 0, 0, 0)
    };

    let header_len: usize = if header_version == 4 { 2128 } else { 2112 };
    let mut offset = header_len.div_ceil(page) * page;

    let ramdisk_section = take_section(data, &mut offset, vendor_ramdisk_size, page)?
        .unwrap_or_default();
    let dtb = take_section(data, &mut offset, dtb_size, page)?;

    let mut ramdisks = Vec::new();
    let mut ramdisk_table = Vec::new();

    if header_version == 4 {
        if table_entry_size != VENDOR_RAMDISK_TABLE_ENTRY_SIZE {
            return Err(PatchError::UnsupportedFormat(format!(
                "vendor ramdisk table entry size {table_entry_size}"
            )));
        }
        let table = take_section(data, &mut offset, table_size, page)?.unwrap_or_default();
        for i in 0..table_entry_num {
            let base = i * table_entry_size;
            let rd_size = read_u32(&table, base)? as usize;
            let rd_offset = read_u32(&table, base + 4)? as usize;
            let ramdisk_type = read_u32(&table, base + 8)?;
            let rd_name = read_bytes(&table, base + 12, VENDOR_RAMDISK_NAME_SIZE)?;
            let board_id = read_bytes(&table, base + 44, VENDOR_RAMDISK_BOARD_ID_SIZE)?;

            let end = rd_offset
                .checked_add(rd_size)
                .filter(|&e| e <= ramdisk_section.len())
                .ok_or_else(|| {
                    PatchError::Corrupt("vendor ramdisk table entry out of range".into())
                })?;
            ramdisks.push(ramdisk_section[rd_offset..end].to_vec());
            ramdisk_table.push(VendorRamdiskMeta {
                ramdisk_type,
                name: rd_name,
                board_id,
            });
        }
    } else if !ramdisk_section.is_empty() {
        ramdisks.push(ramdisk_section);
    }

    let bootconfig = take_section(data, &mut offset, bootconfig_size, page)?;

    Ok(VendorBootImage {
        header_version,
        page_size,
        kernel_addr,
        ramdisk_addr,
        cmdline,
        tags_addr,
        name,
        dtb_addr,
        ramdisks,
        ramdisk_table,
        dtb,
        bootconfig,
    })
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_fixed(buf: &mut Vec<u8>, field: &[u8], len: usize, what: &str) -> Result<()> {
    if field.len() != len {
        return Err(PatchError::Corrupt(format!(
            "{what} field must be {len} bytes, got {}",
            field.len()
        )));
    }
    buf.extend_from_slice(field);
    Ok(())
}

fn section_len(section: &Option<Vec<u8>>) -> usize {
    section.as_ref().map_or(0, |s| s.len())
}

fn generate_v0v2(img: &BootImageV0V2) -> Result<Vec<u8>> {
    if img.ramdisks.len() > 1 {
        return Err(PatchError::Corrupt(format!(
            "boot v{} images carry at most one ramdisk, got {}",
            img.header_version,
            img.ramdisks.len()
        )));
    }
    let page = img.page_size as usize;
    let ramdisk_size = img.ramdisks.first().map_or(0, |r| r.len());

    let mut buf = Vec::new();
    buf.extend_from_slice(BOOT_MAGIC);
    write_u32(&mut buf, img.kernel.as_ref().map_or(0, |k| k.len()) as u32);
    write_u32(&mut buf, img.kernel_addr);
    write_u32(&mut buf, ramdisk_size as u32);
    write_u32(&mut buf, img.ramdisk_addr);
    write_u32(&mut buf, section_len(&img.second) as u32);
    write_u32(&mut buf, img.second_addr);
    write_u32(&mut buf, img.tags_addr);
    write_u32(&mut buf, img.page_size);
    write_u32(&mut buf, img.header_version);
    write_u32(&mut buf, img.os_version);
    write_fixed(&mut buf, &img.name, BOOT_NAME_SIZE, "name")?;
    write_fixed(&mut buf, &img.cmdline, BOOT_ARGS_SIZE, "cmdline")?;
    write_fixed(&mut buf, &img.id, BOOT_ID_SIZE, "id")?;
    write_fixed(&mut buf, &img.extra_cmdline, BOOT_EXTRA_ARGS_SIZE, "extra_cmdline")?;

    if img.header_version >= 1 {
        write_u32(&mut buf, section_len(&img.recovery_dtbo) as u32);
        write_u64(&mut buf, img.recovery_dtbo_offset);
        // header_size field
        write_u32(&mut buf, if img.header_version == 1 { 1648 } else { 1660 });
    }
    if img.header_version >= 2 {
        write_u32(&mut buf, section_len(&img.dtb) as u32);
        write_u64(&mut buf, img.dtb_addr);
    }

    pad_to(&mut buf, page);
    if let Some(kernel) = &img.kernel {
        push_padded(&mut buf, kernel, page);
    }
    if let Some(ramdisk) = img.ramdisks.first() {
        push_padded(&mut buf, ramdisk, page);
    }
    if let Some(second) = &img.second {
        push_padded(&mut buf, second, page);
    }
    if let Some(recovery_dtbo) = &img.recovery_dtbo {
        push_padded(&mut buf, recovery_dtbo, page);
    }
    if let Some(dtb) = &img.dtb {
        push_padded(&mut buf, dtb, page);
    }

    Ok(buf)
}

fn generate_v3v4(img: &BootImageV3V4) -> Result<Vec<u8>> {
    if img.ramdisks.len() > 1 {
        return Err(PatchError::Corrupt(format!(
            "boot v{} images carry at most one ramdisk, got {}",
            img.header_version,
            img.ramdisks.len()
        )));
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(BOOT_MAGIC);
    write_u32(&mut buf, img.kernel.as_ref().map_or(0, |k| k.len()) as u32);
    write_u32(&mut buf, img.ramdisks.first().map_or(0, |r| r.len()) as u32);
    write_u32(&mut buf, img.os_version);
    // header_size
    write_u32(&mut buf, if img.header_version == 4 { 1584 } else { 1580 });
    for value in img.reserved {
        write_u32(&mut buf, value);
    }
    write_u32(&mut buf, img.header_version);
    write_fixed(
        &mut buf,
        &img.cmdline,
        BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE,
        "cmdline",
    )?;
    if img.header_version == 4 {
        write_u32(&mut buf, section_len(&img.boot_signature) as u32);
    }

    pad_to(&mut buf, V3_PAGE_SIZE);
    if let Some(kernel) = &img.kernel {
        push_padded(&mut buf, kernel, V3_PAGE_SIZE);
    }
    if let Some(ramdisk) = img.ramdisks.first() {
        push_padded(&mut buf, ramdisk, V3_PAGE_SIZE);
    }
    if let Some(signature) = &img.boot_signature {
        push_padded(&mut buf, signature, V3_PAGE_SIZE);
    }

    Ok(buf)
}

fn generate_vendor(img: &VendorBootImage) -> Result<Vec<u8>> {
    let page = img.page_size as usize;

    if img.header_version == 3 && img.ramdisks.len() > 1 {
        return Err(PatchError::Corrupt(
            "vendor boot v3 images carry at most one ramdisk".into(),
        ));
    }
    if img.header_version == 4 && img.ramdisk_table.len() != img.ramdisks.len() {
        return Err(PatchError::Corrupt(format!(
            "vendor ramdisk table has {} entries for {} ramdisks",
            img.ramdisk_table.len(),
            img.ramdisks.len()
        )));
    }

    let mut ramdisk_section = Vec::new();
    let mut table = Vec::new();
    for (i, ramdisk) in img.ramdisks.iter().enumerate() {
        if img.header_version == 4 {
            let meta = &img.ramdisk_table[i];
            write_u32(&mut table, ramdisk.len() as u32);
            write_u32(&mut table, ramdisk_section.len() as u32);
            write_u32(&mut table, meta.ramdisk_type);
            write_fixed(&mut table, &meta.name, VENDOR_RAMDISK_NAME_SIZE, "ramdisk name")?;
            write_fixed(
                &mut table,
                &meta.board_id,
                VENDOR_RAMDISK_BOARD_ID_SIZE,
                "board id",
            )?;
        }
        ramdisk_section.extend_from_slice(ramdisk);
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(VENDOR_BOOT_MAGIC);
    write_u32(&mut buf, img.header_version);
    write_u32(&mut buf, img.page_size);
    write_u32(&mut buf, img.kernel_addr);
    write_u32(&mut buf, img.ramdisk_addr);
    write_u32(&mut buf, ramdisk_section.len() as u32);
    write_fixed(&mut buf, &img.cmdline, VENDOR_BOOT_ARGS_SIZE, "cmdline")?;
    write_u32(&mut buf, img.tags_addr);
    write_fixed(&mut buf, &img.name, VENDOR_BOOT_NAME_SIZE, "name")?;
    // header_size
    write_u32(&mut buf, if img.header_version == 4 { 2128 } else { 2112 });
    write_u32(&mut buf, section_len(&img.dtb) as u32);
    write_u64(&mut buf, img.dtb_addr);
    if img.header_version == 4 {
        write_u32(&mut buf, table.len() as u32);
        write_u32(&mut buf, img.ramdisk_table.len() as u32);
        write_u32(&mut buf, VENDOR_RAMDISK_TABLE_ENTRY_SIZE as u32);
        write_u32(&mut buf, section_len(&img.bootconfig) as u32);
    }

    pad_to(&mut buf, page);
    if !ramdisk_section.is_empty() {
        push_padded(&mut buf, &ramdisk_section, page);
    }
    if let Some(dtb) = &img.dtb {
        push_padded(&mut buf, dtb, page);
    }
    if img.header_version == 4 {
        if !table.is_empty() {
            push_padded(&mut buf, &table, page);
        }
        if let Some(bootconfig) = &img.bootconfig {
            push_padded(&mut buf, bootconfig, page);
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_v3() -> BootImage {
        let mut cmdline = vec![0u8; BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE];
        cmdline[..14].copy_from_slice(b"console=ttyS0 ");
        BootImage::V3V4(BootImageV3V4 {
            header_version: 3,
            os_version: 0x1400_0000,
            reserved: [0; 4],
            cmdline,
            kernel: Some(b"kernel blob".to_vec()),
            ramdisks: vec![b"ramdisk blob".to_vec()],
            boot_signature: None,
        })
    }

    #[test]
    fn test_v3_round_trip() {
        let image = sample_v3();
        let bytes = image.generate().unwrap();
        assert_eq!(bytes.len() % V3_PAGE_SIZE, 0);

        let parsed = BootImage::load_autodetect(&bytes).unwrap();
        assert_eq!(parsed, image);
        assert_eq!(parsed.kernel(), Some(&b"kernel blob"[..]));
        assert_eq!(parsed.ramdisks().len(), 1);
    }

    #[test]
    fn test_v2_round_trip() {
        let image = BootImage::V0V2(BootImageV0V2 {
            header_version: 2,
            kernel_addr: 0x10008000,
            ramdisk_addr: 0x11000000,
            second_addr: 0x10f00000,
            tags_addr: 0x10000100,
            page_size: 2048,
            os_version: 0x1300_0000,
            name: vec![0; BOOT_NAME_SIZE],
            cmdline: vec![0; BOOT_ARGS_SIZE],
            id: vec![0xab; BOOT_ID_SIZE],
            extra_cmdline: vec![0; BOOT_EXTRA_ARGS_SIZE],
            recovery_dtbo_offset: 0,
            dtb_addr: 0x1f000000,
            kernel: Some(vec![1; 5000]),
            ramdisks: vec![vec![2; 100]],
            second: None,
            recovery_dtbo: None,
            dtb: Some(vec![3; 70]),
        });

        let bytes = image.generate().unwrap();
        let parsed = BootImage::load_autodetect(&bytes).unwrap();
        assert_eq!(parsed, image);
        assert!(parsed.dtb().is_some());
        assert!(parsed.second().is_none());
    }

    #[test]
    fn test_vendor_v4_round_trip() {
        let mut name = vec![0u8; VENDOR_RAMDISK_NAME_SIZE];
        name[..7].copy_from_slice(b"default");
        let image = BootImage::Vendor(VendorBootImage {
            header_version: 4,
            page_size: 4096,
            kernel_addr: 0,
            ramdisk_addr: 0,
            cmdline: vec![0; VENDOR_BOOT_ARGS_SIZE],
            tags_addr: 0,
            name: vec![0; VENDOR_BOOT_NAME_SIZE],
            dtb_addr: 0,
            ramdisks: vec![b"first ramdisk".to_vec(), b"second ramdisk".to_vec()],
            ramdisk_table: vec![
                VendorRamdiskMeta {
                    ramdisk_type: 1,
                    name: name.clone(),
                    board_id: vec![0; VENDOR_RAMDISK_BOARD_ID_SIZE],
                },
                VendorRamdiskMeta {
                    ramdisk_type: 2,
                    name,
                    board_id: vec![0; VENDOR_RAMDISK_BOARD_ID_SIZE],
                },
            ],
            dtb: Some(b"device tree".to_vec()),
            bootconfig: Some(b"androidboot.hardware=test\n".to_vec()),
        });

        let bytes = image.generate().unwrap();
        let parsed = BootImage::load_autodetect(&bytes).unwrap();
        assert_eq!(parsed, image);
        assert_eq!(parsed.ramdisks().len(), 2);
        assert_eq!(parsed.bootconfig(), Some(&b"androidboot.hardware=test\n"[..]));
    }

    #[test]
    fn test_unknown_magic() {
        let result = BootImage::load_autodetect(b"GARBAGE!not a boot image");
        assert!(matches!(result, Err(PatchError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_truncated_image() {
        let bytes = sample_v3().generate().unwrap();
        let result = BootImage::load_autodetect(&bytes[..4096 + 4]);
        assert!(matches!(result, Err(PatchError::Corrupt(_))));
    }

    #[test]
    fn test_header_fields_differ_across_versions() {
        let v3 = sample_v3().header_fields();
        assert!(v3.contains_key("cmdline"));
        assert!(!v3.contains_key("extra_cmdline"));
        assert!(!v3.contains_key("id"));
    }
}
