//! blobcipher: encrypt blobs at rest with authenticated headers
//!
//! Commands:
//!   encrypt <in> <out> --domain <id>  - encrypt a file under the domain's latest cipher key
//!   decrypt <in> <out>                - decrypt a blob, verifying its auth tokens
//!   inspect <blob> [--json]           - print the decoded encryption header
//!   verify-header <blob>              - check header metadata and the header auth token
//!   config show                       - display current configuration
//!
//! Base ciphers come from a keyring file (see `keyring.rs`); the cipher key
//! cache is scrubbed on exit, on panic and on Ctrl-C.

mod blob;
mod keyring;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prometheus_client::{encoding::text::encode, registry::Registry};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use blobcipher_core::config::CipherConfig;
use blobcipher_core::types::{
    EncryptAuthTokenMode, EncryptDomainId, UsageType, ENCRYPT_HEADER_DOMAIN_ID,
};
use blobcipher_crypto::{
    install_panic_scrubber, AuthTokens, CipherKeyCache, Decryptor, EncryptHeader, Encryptor,
    ScrubGuard,
};

use crate::keyring::Keyring;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "blobcipher",
    version,
    about = "Blob encryption at rest",
    long_about = "blobcipher: AES-256-CTR blob encryption with HMAC-authenticated headers"
)]
struct Cli {
    /// Path to blobcipher.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "BLOBCIPHER_CONFIG",
        default_value = "/etc/blobcipher/config.toml"
    )]
    config: PathBuf,

    /// Keyring file (overrides config keyring.path)
    #[arg(long, short = 'k', env = "BLOBCIPHER_KEYRING")]
    keyring: Option<PathBuf>,

    /// Print cipher metrics (Prometheus text format) to stderr before exit
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file under the latest cipher key of an encryption domain
    Encrypt {
        /// Plaintext input file
        input: PathBuf,
        /// Blob output file (header followed by ciphertext)
        output: PathBuf,
        /// Encryption domain id
        #[arg(long, short = 'd', allow_negative_numbers = true)]
        domain: EncryptDomainId,
        /// Auth token mode: none, single or multi (overrides config)
        #[arg(long, short = 'm')]
        mode: Option<EncryptAuthTokenMode>,
        /// Usage tag for metrics (overrides config)
        #[arg(long)]
        usage: Option<UsageType>,
    },

    /// Decrypt a blob file
    Decrypt {
        /// Blob input file
        input: PathBuf,
        /// Plaintext output file
        output: PathBuf,
        /// Usage tag for metrics (overrides config)
        #[arg(long)]
        usage: Option<UsageType>,
    },

    /// Print the encryption header of a blob file
    Inspect {
        /// Blob file
        input: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Verify a blob's header without decrypting the payload
    #[command(name = "verify-header")]
    VerifyHeader {
        /// Blob file
        input: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CipherConfig::load(&cli.config)?;
    init_logging(&config.log.level, &config.log.format);

    let cache = Arc::new(CipherKeyCache::from_config(&config.cache));
    install_panic_scrubber(cache.clone());
    let _scrub = ScrubGuard::new(cache.clone());
    spawn_signal_scrubber(cache.clone());

    let keyring_path = cli.keyring.clone().unwrap_or_else(|| config.keyring.path.clone());

    let result = match cli.command {
        Commands::Encrypt {
            input,
            output,
            domain,
            mode,
            usage,
        } => {
            let mode = mode.unwrap_or(config.encryption.auth_token_mode);
            let usage = usage.unwrap_or(config.encryption.usage);
            cmd_encrypt(&cache, &keyring_path, &input, &output, domain, mode, usage).await
        }
        Commands::Decrypt {
            input,
            output,
            usage,
        } => {
            let usage = usage.unwrap_or(config.encryption.usage);
            cmd_decrypt(&cache, &keyring_path, &input, &output, usage).await
        }
        Commands::Inspect { input, json } => cmd_inspect(&input, json).await,
        Commands::VerifyHeader { input } => {
            cmd_verify_header(&cache, &keyring_path, &input, config.encryption.usage).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    };

    if cli.metrics {
        print_metrics(&cache)?;
    }
    result
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output; logs go to stderr.
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Key scrubbing ─────────────────────────────────────────────────────────────

fn spawn_signal_scrubber(cache: Arc<CipherKeyCache>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted: scrubbing cipher key cache");
            cache.cleanup_all();
            std::process::exit(130);
        }
    });
}

fn print_metrics(cache: &CipherKeyCache) -> Result<()> {
    let mut registry = Registry::default();
    cache.metrics().register(&mut registry);
    let mut body = String::new();
    encode(&mut body, &registry).context("encoding metrics")?;
    eprint!("{body}");
    Ok(())
}

// ── `blobcipher encrypt` ──────────────────────────────────────────────────────

async fn cmd_encrypt(
    cache: &CipherKeyCache,
    keyring_path: &Path,
    input: &Path,
    output: &Path,
    domain: EncryptDomainId,
    mode: EncryptAuthTokenMode,
    usage: UsageType,
) -> Result<()> {
    let keyring = Keyring::load(keyring_path).await?;
    if keyring.is_empty() {
        anyhow::bail!("keyring {} lists no keys", keyring_path.display());
    }
    keyring.register_latest(cache)?;

    let text_key = cache
        .get_latest_cipher_key(domain)?
        .with_context(|| format!("no fresh cipher key for domain {domain} in keyring"))?;
    let header_key = match mode {
        EncryptAuthTokenMode::None => None,
        _ => Some(
            cache
                .get_latest_cipher_key(ENCRYPT_HEADER_DOMAIN_ID)?
                .with_context(|| {
                    format!(
                        "auth token mode {mode} needs a fresh header key \
                         (domain {ENCRYPT_HEADER_DOMAIN_ID}) in keyring"
                    )
                })?,
        ),
    };

    let plaintext = Zeroizing::new(
        tokio::fs::read(input)
            .await
            .with_context(|| format!("reading input: {}", input.display()))?,
    );

    let encrypted = Encryptor::with_random_iv(text_key, header_key, mode, usage, cache.random())?
        .with_metrics(cache.metrics())
        .encrypt(&plaintext)?;
    blob::write(output, &encrypted).await?;

    let details = encrypted.header.cipher_text_details;
    info!(
        domain_id = details.domain_id,
        base_cipher_id = details.base_cipher_id,
        mode = %mode,
        bytes = plaintext.len(),
        "encrypted {}",
        input.display()
    );
    println!(
        "{} -> {} ({} bytes, domain {}, base cipher {}, auth {mode})",
        input.display(),
        output.display(),
        plaintext.len(),
        details.domain_id,
        details.base_cipher_id,
    );
    Ok(())
}

// ── `blobcipher decrypt` ──────────────────────────────────────────────────────

/// Resolve the keys a header names and build its decryptor.
fn decryptor_for(
    cache: &CipherKeyCache,
    keyring: &Keyring,
    header: &EncryptHeader,
    usage: UsageType,
) -> Result<Decryptor> {
    let mut keys = header
        .key_refs()
        .iter()
        .map(|details| keyring.resolve(cache, details))
        .collect::<Result<Vec<_>>>()?
        .into_iter();
    let text_key = keys.next().context("header names no cipher text key")?;
    let header_key = keys.next();

    Ok(Decryptor::for_header(text_key, header_key, header, usage).with_metrics(cache.metrics()))
}

async fn cmd_decrypt(
    cache: &CipherKeyCache,
    keyring_path: &Path,
    input: &Path,
    output: &Path,
    usage: UsageType,
) -> Result<()> {
    let keyring = Keyring::load(keyring_path).await?;
    let bytes = blob::read(input).await?;
    let (header, ciphertext) = blob::from_bytes(&bytes)?;

    let decryptor = decryptor_for(cache, &keyring, &header, usage)?;
    let plaintext = Zeroizing::new(
        decryptor
            .decrypt(ciphertext, &header)
            .with_context(|| format!("decrypting {}", input.display()))?,
    );

    tokio::fs::write(output, plaintext.as_slice())
        .await
        .with_context(|| format!("writing output: {}", output.display()))?;

    info!(
        domain_id = header.cipher_text_details.domain_id,
        mode = %header.auth_token_mode(),
        bytes = plaintext.len(),
        "decrypted {}",
        input.display()
    );
    println!(
        "{} -> {} ({} bytes)",
        input.display(),
        output.display(),
        plaintext.len()
    );
    Ok(())
}

// ── `blobcipher inspect` ──────────────────────────────────────────────────────

fn inspect_json(header: &EncryptHeader, ciphertext_len: usize) -> serde_json::Value {
    let tokens = match &header.auth_tokens {
        AuthTokens::None => json!(null),
        AuthTokens::Single { token } => json!({ "token": hex::encode(token) }),
        AuthTokens::Multi {
            cipher_text_token,
            header_token,
        } => json!({
            "cipher_text_token": hex::encode(cipher_text_token),
            "header_token": hex::encode(header_token),
        }),
    };
    json!({
        "flags": header.flags,
        "cipher_text_details": header.cipher_text_details,
        "cipher_header_details": header.cipher_header_details,
        "iv": hex::encode(header.iv),
        "auth_token_mode": header.auth_token_mode().as_str(),
        "auth_tokens": tokens,
        "ciphertext_len": ciphertext_len,
    })
}

async fn cmd_inspect(input: &Path, as_json: bool) -> Result<()> {
    let bytes = blob::read(input).await?;
    let (header, ciphertext) = blob::from_bytes(&bytes)?;

    if as_json {
        let doc = inspect_json(&header, ciphertext.len());
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let flags = header.flags;
    let text = header.cipher_text_details;
    println!("blob:            {}", input.display());
    println!("header size:     {}", flags.size);
    println!("header version:  {}", flags.header_version);
    println!("encrypt mode:    {}", flags.encrypt_mode);
    println!("auth token mode: {}", header.auth_token_mode());
    println!(
        "text key:        domain {} base cipher {} salt {}",
        text.domain_id, text.base_cipher_id, text.salt
    );
    if header.auth_token_mode() != EncryptAuthTokenMode::None {
        let hk = header.cipher_header_details;
        println!(
            "header key:      domain {} base cipher {} salt {}",
            hk.domain_id, hk.base_cipher_id, hk.salt
        );
    }
    println!("iv:              {}", hex::encode(header.iv));
    match &header.auth_tokens {
        AuthTokens::None => {}
        AuthTokens::Single { token } => println!("token:           {}", hex::encode(token)),
        AuthTokens::Multi {
            cipher_text_token,
            header_token,
        } => {
            println!("text token:      {}", hex::encode(cipher_text_token));
            println!("header token:    {}", hex::encode(header_token));
        }
    }
    println!("ciphertext:      {} bytes", ciphertext.len());
    Ok(())
}

// ── `blobcipher verify-header` ────────────────────────────────────────────────

async fn cmd_verify_header(
    cache: &CipherKeyCache,
    keyring_path: &Path,
    input: &Path,
    usage: UsageType,
) -> Result<()> {
    let bytes = blob::read(input).await?;
    let (header, _) = blob::from_bytes(&bytes)?;
    if header.auth_token_mode() == EncryptAuthTokenMode::Single {
        anyhow::bail!(
            "{}: single auth token headers are only verified together with the payload \
             (use `blobcipher decrypt`)",
            input.display()
        );
    }

    let keyring = Keyring::load(keyring_path).await?;
    let decryptor = decryptor_for(cache, &keyring, &header, usage)?;
    decryptor
        .verify_header_auth_token(&header)
        .with_context(|| format!("verifying header of {}", input.display()))?;

    println!(
        "{}: header OK (auth token mode {})",
        input.display(),
        header.auth_token_mode()
    );
    Ok(())
}

// ── `blobcipher config show` ──────────────────────────────────────────────────

fn cmd_config_show(config: &CipherConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
