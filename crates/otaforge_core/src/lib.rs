pub mod error;

pub mod avb;
pub mod boot;
pub mod bootimg;
pub mod compression;
pub mod crypto;
pub mod ota;
pub mod patcher;
pub mod payload;
pub mod planner;
pub mod proto;
pub mod ramdisk;
pub mod vbmeta;

pub use boot::{BootPatch, MagiskRootPatch, OtaCertPatch, PrepatchedImage, WarningFn};
pub use bootimg::BootImage;
pub use crypto::{Certificate, SigningKey, cert_matches_key, read_passphrase};
pub use error::{PatchError, Result};
pub use patcher::{PatchContext, extract_ota, patch_ota};
pub use payload::{NullReporter, ProgressReporter};
