//! inokey: per-inode encryption key tooling
//!
//! Commands:
//!   derive --nonce <hex> --master <hex>  - derive a per-file key
//!   context <file>                       - decode a stored encryption context
//!   resolve --context <file> --keyring <toml> [--kind file|dir|symlink]
//!                                        - dry-run key setup for one inode
//!   tag <descriptor>                     - show the keyring tags that would be tried

mod keyfile;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

use inokey_core::config::InokeyConfig;
use inokey_core::types::{CONTENTS_KEY_SIZE, NONCE_SIZE};
use inokey_core::{EncryptionContext, InodeKind, KeyDescriptor};
use inokey_crypto::keyring::key_tag;
use inokey_crypto::{build_deriver, Inode, KeyInfo};

use crate::keyfile::{load_keyring, FileContext};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "inokey",
    version,
    about = "Per-inode encryption key tooling",
    long_about = "inokey: derive per-file keys, inspect encryption contexts, and dry-run key setup"
)]
struct Cli {
    /// Path to inokey.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "INOKEY_CONFIG",
        default_value = "/etc/inokey/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "INOKEY_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "INOKEY_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Derive a per-file key: AES-128-ECB of the master key under the nonce
    Derive {
        /// Context nonce (16 bytes, hex)
        #[arg(long)]
        nonce: String,
        /// Master key (32 bytes, hex)
        #[arg(long)]
        master: String,
    },

    /// Decode and validate a 28-byte encryption context
    Context {
        /// File holding the raw context bytes
        file: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run key setup for one inode against a keyring file
    Resolve {
        /// File holding the raw context bytes (may be absent in dummy mode)
        #[arg(long)]
        context: PathBuf,
        /// Keyring file
        #[arg(long, short = 'k')]
        keyring: PathBuf,
        /// Inode kind
        #[arg(long, default_value = "file")]
        kind: Kind,
    },

    /// Show the keyring tags tried for a key descriptor
    Tag {
        /// Key descriptor (8 bytes, hex)
        descriptor: String,
    },
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    File,
    Dir,
    Symlink,
}

impl From<Kind> for InodeKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::File => InodeKind::Regular,
            Kind::Dir => InodeKind::Directory,
            Kind::Symlink => InodeKind::Symlink,
        }
    }
}

// ── Entry point ────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = InokeyConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match cli.log_format.clone() {
        Some(format) => format,
        None => parse_log_format(&config.log.format)?,
    };
    init_logging(&level, &format);

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "inokey starting"
    );

    match cli.command {
        Commands::Derive { nonce, master } => cmd_derive(&config, &nonce, &master),
        Commands::Context { file, json } => cmd_context(&file, json),
        Commands::Resolve {
            context,
            keyring,
            kind,
        } => cmd_resolve(&config, &context, &keyring, kind.into()),
        Commands::Tag { descriptor } => cmd_tag(&config, &descriptor),
    }
}

fn parse_log_format(s: &str) -> Result<LogFormat> {
    match s {
        "json" => Ok(LogFormat::Json),
        "text" => Ok(LogFormat::Text),
        other => bail!("unknown log format in config: {other} (expected json or text)"),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Commands ───────────────────────────────────────────────────────────────────

fn decode_fixed<const N: usize>(what: &str, s: &str) -> Result<Zeroizing<[u8; N]>> {
    let bytes = Zeroizing::new(hex::decode(s).with_context(|| format!("{what} is not hex"))?);
    if bytes.len() != N {
        bail!("{what} is {} bytes (expected {N})", bytes.len());
    }
    let mut out = Zeroizing::new([0u8; N]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn cmd_derive(config: &InokeyConfig, nonce: &str, master: &str) -> Result<()> {
    let nonce = decode_fixed::<NONCE_SIZE>("nonce", nonce)?;
    let master = decode_fixed::<CONTENTS_KEY_SIZE>("master key", master)?;

    let deriver = build_deriver(config.derivation.backend, None)
        .context("selecting derivation backend")?;
    let key = deriver.derive(&nonce, &master)?;

    println!("{}", hex::encode(key.as_bytes()));
    Ok(())
}

fn cmd_context(file: &Path, json: bool) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("reading context: {}", file.display()))?;
    let ctx = EncryptionContext::from_bytes(&bytes)?;
    let validity = ctx.validate();

    if json {
        let out = serde_json::json!({
            "format": ctx.format,
            "contents_mode": ctx.contents_mode,
            "filenames_mode": ctx.filenames_mode,
            "flags": ctx.flags,
            "descriptor": ctx.descriptor.to_hex(),
            "nonce": hex::encode(ctx.nonce),
            "valid": validity.is_ok(),
            "error": validity.as_ref().err().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("format:          {}", ctx.format);
        println!("contents mode:   {}", ctx.contents_mode);
        println!("filenames mode:  {}", ctx.filenames_mode);
        println!("flags:           {:#04x}", ctx.flags);
        println!("descriptor:      {}", ctx.descriptor);
        println!("nonce:           {}", hex::encode(ctx.nonce));
        match &validity {
            Ok(()) => println!("valid:           yes"),
            Err(e) => println!("valid:           no ({e})"),
        }
    }

    validity.map_err(Into::into)
}

fn cmd_resolve(
    config: &InokeyConfig,
    context: &Path,
    keyring: &Path,
    kind: InodeKind,
) -> Result<()> {
    let fs = Arc::new(FileContext {
        path: context.to_path_buf(),
        alternate_prefix: config.keyring.alternate_prefix.clone(),
        dummy: config.policy.dummy_context,
    });
    let keyring = Arc::new(load_keyring(keyring)?);
    let ki = KeyInfo::from_config(config, fs, keyring, None)
        .context("building key setup from config")?;

    let inode = Inode::new(1, kind);
    ki.get_encryption_info(&inode)
        .with_context(|| format!("key setup for {}", context.display()))?;

    match inode.crypt_info() {
        Some(ci) => {
            println!("key:             attached");
            println!("descriptor:      {}", ci.descriptor());
            println!("contents mode:   {}", ci.contents_mode());
            println!("filenames mode:  {}", ci.filenames_mode());
            let transform = ci.with_transform(|tfm| (tfm.suite(), tfm.flags().bits()));
            match transform {
                Some((suite, flags)) => {
                    println!("transform:       {suite} (flags {flags:#x})")
                }
                None => println!("transform:       none (inline hardware)"),
            }
        }
        None => println!("key:             deferred (master key not in keyring)"),
    }
    println!("hw encrypted:    {}", ki.is_hardware_encrypted(&inode));

    ki.put_encryption_info(&inode, None);
    Ok(())
}

fn cmd_tag(config: &InokeyConfig, descriptor: &str) -> Result<()> {
    let descriptor: KeyDescriptor = descriptor.parse()?;

    println!("{}", key_tag(&config.keyring.primary_prefix, &descriptor));
    if let Some(prefix) = &config.keyring.alternate_prefix {
        println!("{}", key_tag(prefix, &descriptor));
    }
    Ok(())
}
