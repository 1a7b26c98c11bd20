use anyhow::{Context, bail};
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use otaforge_core::boot::{self, BootPatch, MagiskRootPatch, PrepatchedImage, WarningFn};
use otaforge_core::bootimg::BootImage;
use otaforge_core::crypto::{Certificate, SigningKey, cert_matches_key, read_passphrase};
use otaforge_core::patcher::{PatchContext, extract_ota, patch_ota};
use otaforge_core::payload::ProgressReporter;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "otaforge",
    version,
    about = "Re-sign Android OTA packages with your own keys, optionally rooting the boot image"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Patch a full OTA zip
    Patch(PatchArgs),
    /// Extract images from an OTA zip's payload
    Extract(ExtractArgs),
    /// Print the Magisk config from a patched boot image
    MagiskInfo(MagiskInfoArgs),
}

#[derive(Args)]
#[command(group(ArgGroup::new("root").required(true)))]
#[command(group(ArgGroup::new("pass_avb")))]
#[command(group(ArgGroup::new("pass_ota")))]
struct PatchArgs {
    /// Path to original OTA zip
    #[arg(long)]
    input: PathBuf,

    /// Path to new OTA zip (default: <input>.patched)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Private key for signing vbmeta images
    #[arg(long)]
    privkey_avb: PathBuf,

    /// Private key for signing the OTA
    #[arg(long)]
    privkey_ota: PathBuf,

    /// Certificate for the OTA signing key
    #[arg(long)]
    cert_ota: PathBuf,

    /// Environment variable containing the AVB private key passphrase
    #[arg(long, group = "pass_avb")]
    passphrase_avb_env_var: Option<String>,

    /// File containing the AVB private key passphrase
    #[arg(long, group = "pass_avb")]
    passphrase_avb_file: Option<PathBuf>,

    /// Environment variable containing the OTA private key passphrase
    #[arg(long, group = "pass_ota")]
    passphrase_ota_env_var: Option<String>,

    /// File containing the OTA private key passphrase
    #[arg(long, group = "pass_ota")]
    passphrase_ota_file: Option<PathBuf>,

    /// Use a partition image from a file instead of the original payload
    #[arg(long, num_args = 2, value_names = ["PARTITION", "PATH"], action = ArgAction::Append)]
    replace: Vec<String>,

    /// Path to Magisk APK
    #[arg(long, group = "root")]
    magisk: Option<PathBuf>,

    /// Path to prepatched boot image
    #[arg(long, group = "root")]
    prepatched: Option<PathBuf>,

    /// Skip applying a root patch
    #[arg(long, group = "root")]
    rootless: bool,

    /// Magisk preinit block device
    #[arg(long, requires = "magisk")]
    magisk_preinit_device: Option<String>,

    /// Magisk random seed (defaults to a fixed value for reproducibility)
    #[arg(long, requires = "magisk")]
    magisk_random_seed: Option<u64>,

    /// Ignore Magisk compatibility/version warnings
    #[arg(long, requires = "magisk")]
    ignore_magisk_warnings: bool,

    /// Ignore compatibility issues with prepatched boot images (repeatable)
    #[arg(long, requires = "prepatched", action = ArgAction::Count)]
    ignore_prepatched_compat: u8,

    /// Forcibly clear vbmeta flags if they disable AVB
    #[arg(long)]
    clear_vbmeta_flags: bool,

    /// Boot partition name or role
    #[arg(long, default_value = "@gki_ramdisk")]
    boot_partition: String,
}

#[derive(Args)]
#[command(group(ArgGroup::new("selection")))]
struct ExtractArgs {
    /// Path to OTA zip
    #[arg(long)]
    input: PathBuf,

    /// Output directory for extracted images
    #[arg(long, default_value = ".")]
    directory: PathBuf,

    /// Extract all images from the payload
    #[arg(long, group = "selection")]
    all: bool,

    /// Extract only the boot image
    #[arg(long, group = "selection")]
    boot_only: bool,

    /// Boot partition name or role
    #[arg(long, default_value = "@gki_ramdisk")]
    boot_partition: String,
}

#[derive(Args)]
struct MagiskInfoArgs {
    /// Path to a Magisk-patched boot image
    #[arg(long)]
    image: PathBuf,
}

fn print_status(msg: &str) {
    println!("{}", format!("***** {msg} *****").bold());
}

fn print_warning(msg: &str) {
    eprintln!("{}", format!("***** [WARNING] {msg} *****").red().bold());
}

struct ConsoleReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ConsoleReporter {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }
}

impl ProgressReporter for ConsoleReporter {
    fn begin_step(&self, msg: &str) {
        let _ = self.multi.println(format!("***** {msg} *****").bold().to_string());
    }

    fn on_start(&self, partition: &str, total_ops: u64) {
        let bar = self.multi.add(ProgressBar::new(total_ops.max(1)));
        let style = ProgressStyle::with_template("{msg:16} [{elapsed_precise}] {wide_bar} {pos}/{len}")
            .unwrap();
        bar.set_style(style);
        bar.set_message(partition.to_string());
        self.bars.lock().unwrap().insert(partition.to_string(), bar);
    }

    fn on_progress(&self, partition: &str, completed_ops: u64, _total_ops: u64) {
        if let Some(bar) = self.bars.lock().unwrap().get(partition) {
            bar.set_position(completed_ops);
        }
    }

    fn on_complete(&self, partition: &str) {
        if let Some(bar) = self.bars.lock().unwrap().remove(partition) {
            bar.finish_and_clear();
        }
    }

    fn warning(&self, msg: &str) {
        print_warning(msg);
    }
}

fn parse_replace_args(pairs: &[String]) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    let mut map = BTreeMap::new();
    for chunk in pairs.chunks(2) {
        if chunk.len() != 2 {
            bail!("--replace requires a partition name and a file path");
        }
        if map
            .insert(chunk[0].clone(), PathBuf::from(&chunk[1]))
            .is_some()
        {
            bail!("--replace given twice for partition {}", chunk[0]);
        }
    }
    Ok(map)
}

fn load_key(
    path: &Path,
    env_var: Option<&str>,
    file: Option<&Path>,
) -> anyhow::Result<SigningKey> {
    let passphrase = read_passphrase(env_var, file)?;
    SigningKey::load(path, passphrase.as_deref())
        .with_context(|| format!("failed to load private key {}", path.display()))
}

async fn patch_command(args: PatchArgs) -> anyhow::Result<()> {
    let output = args.output.clone().unwrap_or_else(|| {
        let mut s = args.input.as_os_str().to_owned();
        s.push(".patched");
        PathBuf::from(s)
    });

    let warning_fn: WarningFn = Arc::new(|msg: &str| print_warning(msg));

    let root_patch = if args.rootless {
        None
    } else if let Some(magisk) = &args.magisk {
        let patch = MagiskRootPatch::new(
            magisk,
            args.magisk_preinit_device.clone(),
            args.magisk_random_seed,
        )?;
        match patch.validate() {
            Ok(()) => {}
            Err(e) if args.ignore_magisk_warnings => print_warning(&e.to_string()),
            Err(e) => return Err(e.into()),
        }
        Some(Arc::new(BootPatch::Magisk(patch)))
    } else {
        let prepatched = args.prepatched.as_ref().unwrap();
        Some(Arc::new(BootPatch::Prepatched(PrepatchedImage::new(
            prepatched,
            args.ignore_prepatched_compat + 1,
            warning_fn,
        ))))
    };

    let key_avb = load_key(
        &args.privkey_avb,
        args.passphrase_avb_env_var.as_deref(),
        args.passphrase_avb_file.as_deref(),
    )?;
    let key_ota = load_key(
        &args.privkey_ota,
        args.passphrase_ota_env_var.as_deref(),
        args.passphrase_ota_file.as_deref(),
    )?;
    let cert_ota = Certificate::load(&args.cert_ota)
        .with_context(|| format!("failed to load certificate {}", args.cert_ota.display()))?;

    if !cert_matches_key(&cert_ota, &key_ota)? {
        bail!("OTA certificate does not match the OTA private key");
    }

    let context = PatchContext {
        replace_images: parse_replace_args(&args.replace)?,
        boot_partition: args.boot_partition.clone(),
        root_patch,
        clear_vbmeta_flags: args.clear_vbmeta_flags,
        key_avb: Arc::new(key_avb),
        key_ota: Arc::new(key_ota),
        cert_ota: Arc::new(cert_ota),
    };

    let start = Instant::now();
    patch_ota(
        &args.input,
        &output,
        &context,
        Arc::new(ConsoleReporter::new()),
    )
    .await?;

    print_status(&format!("Completed after {:.1}s", start.elapsed().as_secs_f64()));
    Ok(())
}

async fn extract_command(args: ExtractArgs) -> anyhow::Result<()> {
    extract_ota(
        &args.input,
        &args.directory,
        &args.boot_partition,
        args.all,
        args.boot_only,
        Arc::new(ConsoleReporter::new()),
    )
    .await?;
    Ok(())
}

fn magisk_info_command(args: MagiskInfoArgs) -> anyhow::Result<()> {
    let data = std::fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let image = BootImage::load_autodetect(&data)?;
    let config = boot::magisk_info(&image)?;
    print!("{}", String::from_utf8_lossy(&config));
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Patch(args) => patch_command(args).await,
        Command::Extract(args) => extract_command(args).await,
        Command::MagiskInfo(args) => magisk_info_command(args),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
