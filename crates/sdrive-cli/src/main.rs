//! sdrive: StormDrive client-side encryption CLI
//!
//! Account commands:
//!   init --user <id>          - create an account, root folder, and recovery phrase
//!   unlock                    - check the password against the keybundle
//!   passwd                    - change the account password
//!   recover                   - unlock with the recovery phrase and set a new password
//!   rotate-recovery           - issue a new recovery phrase
//!
//! Content commands:
//!   mkdir <folder> [--parent] - create a folder key (root folder if no parent)
//!   encrypt <in> <out>        - encrypt a file into a chunk stream + manifest
//!   decrypt <in> <out>        - decrypt a chunk stream using its manifest
//!   config show               - display current configuration
//!
//! Keybundle and folder metadata are plain JSON files standing in for the
//! metadata service. Neither contains an unwrapped key.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use sdrive_core::config::SdriveConfig;
use sdrive_core::types::Keybundle;
use sdrive_crypto::{
    create_account, AesGcmProvider, ChunkCipher, DecryptPipeline, InMemoryFolders, KdfParams,
    Keyring, RecoverySecret, SecretKey, StreamManifest, StreamParams,
};

const ROOT_FOLDER_ID: &str = "root";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sdrive",
    version,
    about = "StormDrive zero-knowledge encryption client",
    long_about = "sdrive: manage an account key hierarchy and encrypt files client-side"
)]
struct Cli {
    /// Path to sdrive.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SDRIVE_CONFIG",
        default_value = "~/.config/sdrive/config.toml"
    )]
    config: PathBuf,

    /// Log level filter (overrides config; RUST_LOG wins over both)
    #[arg(long, env = "SDRIVE_LOG")]
    log: Option<String>,

    /// Log format (overrides config)
    #[arg(long, env = "SDRIVE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new account: keybundle, root folder key, recovery phrase
    ///
    /// The password is read from SDRIVE_NEW_PASSWORD or prompted twice.
    Init {
        /// Account identifier bound into every wrapped key
        #[arg(long, short = 'u')]
        user: String,
        /// Overwrite an existing keybundle
        #[arg(long)]
        force: bool,
    },

    /// Verify the password unlocks the keybundle
    Unlock,

    /// Change the account password (recovery phrase is unchanged)
    Passwd,

    /// Unlock with the recovery phrase and set a new password
    ///
    /// The phrase is read from SDRIVE_RECOVERY_PHRASE or prompted.
    Recover,

    /// Replace the recovery phrase; the old phrase stops working
    #[command(name = "rotate-recovery")]
    RotateRecovery,

    /// Create a folder key
    Mkdir {
        /// New folder identifier
        folder: String,
        /// Parent folder (default: the account root folder)
        #[arg(long, short = 'p')]
        parent: Option<String>,
    },

    /// Encrypt a file into a chunk stream and write `<output>.manifest.json`
    Encrypt {
        /// Plaintext input file
        input: PathBuf,
        /// Ciphertext output file
        output: PathBuf,
        /// Folder whose key wraps the stream's content key
        #[arg(long, short = 'f', default_value = ROOT_FOLDER_ID)]
        folder: String,
        /// MIME type bound into each chunk (overrides config default)
        #[arg(long)]
        file_type: Option<String>,
    },

    /// Decrypt a chunk stream
    Decrypt {
        /// Ciphertext input file
        input: PathBuf,
        /// Plaintext output file
        output: PathBuf,
        /// Manifest path (default: `<input>.manifest.json`)
        #[arg(long, short = 'm')]
        manifest: Option<PathBuf>,
        /// Resume at this chunk; the output must already hold every earlier chunk
        #[arg(long, default_value_t = 0)]
        from_chunk: u32,
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
    let config_path = expand_tilde(&cli.config);
    let (config, from_file) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    if !from_file {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Init { user, force } => cmd_init(&config, &user, force).await,
        Commands::Unlock => cmd_unlock(&config).await,
        Commands::Passwd => cmd_passwd(&config).await,
        Commands::Recover => cmd_recover(&config).await,
        Commands::RotateRecovery => cmd_rotate_recovery(&config).await,
        Commands::Mkdir { folder, parent } => cmd_mkdir(&config, &folder, parent.as_deref()).await,
        Commands::Encrypt {
            input,
            output,
            folder,
            file_type,
        } => cmd_encrypt(&config, &input, &output, &folder, file_type).await,
        Commands::Decrypt {
            input,
            output,
            manifest,
            from_chunk,
        } => cmd_decrypt(&config, &input, &output, manifest.as_deref(), from_chunk).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, from_file),
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

// ── Config loading ────────────────────────────────────────────────────────────

/// Returns the config and whether it came from a file.
async fn load_config(path: &Path) -> Result<(SdriveConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((SdriveConfig::default(), false))
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

fn manifest_path_for(stream: &Path) -> PathBuf {
    let mut name = stream.as_os_str().to_os_string();
    name.push(".manifest.json");
    PathBuf::from(name)
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating directory: {}", dir.display()))?;
    }
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

// ── Secrets from env or terminal ─────────────────────────────────────────────

fn read_secret(env_var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(SecretString::from(value));
    }
    let value = rpassword::prompt_password(prompt).context("reading from terminal")?;
    Ok(SecretString::from(value))
}

fn read_new_password() -> Result<SecretString> {
    if let Ok(value) = std::env::var("SDRIVE_NEW_PASSWORD") {
        return Ok(SecretString::from(value));
    }
    let first = rpassword::prompt_password("New password: ").context("reading password")?;
    let second = rpassword::prompt_password("Repeat password: ").context("reading password")?;
    if first != second {
        anyhow::bail!("passwords do not match");
    }
    if first.is_empty() {
        anyhow::bail!("password must not be empty");
    }
    Ok(SecretString::from(first))
}

fn print_recovery_phrase(recovery: &RecoverySecret) -> Result<()> {
    let phrase = recovery.to_mnemonic().context("encoding recovery phrase")?;
    println!();
    println!("Recovery phrase (write it down; it is shown once):");
    println!();
    println!("  {}", phrase.as_str());
    println!();
    Ok(())
}

// ── Local metadata store ─────────────────────────────────────────────────────

/// Keybundle + folder metadata loaded from the configured JSON files, with
/// a keyring ready to unlock.
struct Vault {
    keyring: Keyring,
    bundle: Keybundle,
    folders: InMemoryFolders,
    bundle_path: PathBuf,
    folders_path: PathBuf,
}

impl Vault {
    fn keyring(config: &SdriveConfig) -> Keyring {
        Keyring::new(
            Arc::new(AesGcmProvider::new()),
            KdfParams::from(&config.crypto),
        )
    }

    async fn load(config: &SdriveConfig) -> Result<Self> {
        let bundle_path = expand_tilde(&config.storage.keybundle_path);
        let folders_path = expand_tilde(&config.storage.folders_path);

        let data = tokio::fs::read(&bundle_path).await.with_context(|| {
            format!(
                "reading keybundle: {} (run `sdrive init` first)",
                bundle_path.display()
            )
        })?;
        let bundle: Keybundle = serde_json::from_slice(&data)
            .with_context(|| format!("parsing keybundle: {}", bundle_path.display()))?;

        let folders = if folders_path.exists() {
            let data = tokio::fs::read(&folders_path)
                .await
                .with_context(|| format!("reading folders: {}", folders_path.display()))?;
            InMemoryFolders::from_json(&data)?
        } else {
            InMemoryFolders::new()
        };

        Ok(Self {
            keyring: Self::keyring(config),
            bundle,
            folders,
            bundle_path,
            folders_path,
        })
    }

    /// Load and unlock with the account password.
    async fn unlock(config: &SdriveConfig) -> Result<Self> {
        let vault = Self::load(config).await?;
        let password = read_secret("SDRIVE_PASSWORD", "Password: ")?;
        vault
            .keyring
            .unlock_with_password(&vault.bundle, &password)
            .await
            .context("unlocking keybundle")?;
        Ok(vault)
    }

    async fn save_bundle(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.bundle).context("serializing keybundle")?;
        write_file(&self.bundle_path, &data).await
    }

    async fn save_folders(&self) -> Result<()> {
        let data = self.folders.to_json()?;
        write_file(&self.folders_path, &data).await
    }

    async fn folder_key(&self, folder_id: &str) -> Result<SecretKey> {
        self.keyring
            .resolve_folder_key(&self.folders, folder_id)
            .await
            .with_context(|| format!("resolving folder key: {folder_id}"))
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ── `sdrive init` ─────────────────────────────────────────────────────────────

async fn cmd_init(config: &SdriveConfig, user: &str, force: bool) -> Result<()> {
    let bundle_path = expand_tilde(&config.storage.keybundle_path);
    let folders_path = expand_tilde(&config.storage.folders_path);
    if bundle_path.exists() && !force {
        anyhow::bail!(
            "keybundle already exists: {} (use --force to overwrite)",
            bundle_path.display()
        );
    }

    let password = read_new_password()?;
    let keyring = Vault::keyring(config);
    let account = create_account(
        keyring.provider().as_ref(),
        user,
        &password,
        &KdfParams::from(&config.crypto),
    )
    .await
    .context("creating account")?;

    keyring.unlock_with_mak(user, account.mak)?;
    let root = keyring.create_root_folder_key(ROOT_FOLDER_ID)?;
    let folders = InMemoryFolders::new();
    folders.insert(root);

    let vault = Vault {
        keyring,
        bundle: account.bundle,
        folders,
        bundle_path,
        folders_path,
    };
    vault.save_bundle().await?;
    vault.save_folders().await?;
    vault.keyring.lock();

    info!(user, "account created");
    println!("Account created for {user}");
    println!("  keybundle: {}", vault.bundle_path.display());
    println!("  folders:   {}", vault.folders_path.display());
    print_recovery_phrase(&account.recovery)
}

// ── `sdrive unlock` ───────────────────────────────────────────────────────────

async fn cmd_unlock(config: &SdriveConfig) -> Result<()> {
    let vault = Vault::unlock(config).await?;
    println!(
        "Unlocked account {} ({} folders)",
        vault.bundle.user_id,
        vault.folders.len()
    );
    vault.keyring.lock();
    Ok(())
}

// ── `sdrive passwd` / `recover` / `rotate-recovery` ──────────────────────────

async fn cmd_passwd(config: &SdriveConfig) -> Result<()> {
    let mut vault = Vault::unlock(config).await?;
    let new_password = read_new_password()?;
    vault.bundle = vault
        .keyring
        .change_password(&vault.bundle, &new_password)
        .await
        .context("changing password")?;
    vault.save_bundle().await?;
    vault.keyring.lock();
    println!("Password changed for {}", vault.bundle.user_id);
    Ok(())
}

async fn cmd_recover(config: &SdriveConfig) -> Result<()> {
    let mut vault = Vault::load(config).await?;
    let phrase = read_secret("SDRIVE_RECOVERY_PHRASE", "Recovery phrase: ")?;
    let recovery = {
        use secrecy::ExposeSecret;
        RecoverySecret::from_mnemonic(phrase.expose_secret()).context("parsing recovery phrase")?
    };
    vault
        .keyring
        .unlock_with_recovery_key(&vault.bundle, &recovery)
        .await
        .context("unlocking with recovery phrase")?;

    let new_password = read_new_password()?;
    vault.bundle = vault
        .keyring
        .change_password(&vault.bundle, &new_password)
        .await
        .context("setting new password")?;
    vault.save_bundle().await?;
    vault.keyring.lock();
    println!("Password reset for {}", vault.bundle.user_id);
    Ok(())
}

async fn cmd_rotate_recovery(config: &SdriveConfig) -> Result<()> {
    let mut vault = Vault::unlock(config).await?;
    let (bundle, recovery) = vault
        .keyring
        .reset_recovery_secret(&vault.bundle)
        .context("rotating recovery phrase")?;
    vault.bundle = bundle;
    vault.save_bundle().await?;
    vault.keyring.lock();
    println!("Recovery phrase replaced for {}", vault.bundle.user_id);
    print_recovery_phrase(&recovery)
}

// ── `sdrive mkdir` ────────────────────────────────────────────────────────────

async fn cmd_mkdir(config: &SdriveConfig, folder: &str, parent: Option<&str>) -> Result<()> {
    let vault = Vault::unlock(config).await?;
    if vault.folders.get(folder).is_some() {
        anyhow::bail!("folder already exists: {folder}");
    }

    let meta = match parent {
        Some(parent_id) => {
            let parent_key = vault.folder_key(parent_id).await?;
            vault
                .keyring
                .create_child_folder_key(folder, parent_id, &parent_key)?
        }
        None => vault.keyring.create_root_folder_key(folder)?,
    };
    vault.folders.insert(meta);
    vault.save_folders().await?;
    vault.keyring.lock();

    println!(
        "Created folder {folder} (parent: {})",
        parent.unwrap_or("none")
    );
    Ok(())
}

// ── `sdrive encrypt` ──────────────────────────────────────────────────────────

async fn cmd_encrypt(
    config: &SdriveConfig,
    input: &Path,
    output: &Path,
    folder: &str,
    file_type: Option<String>,
) -> Result<()> {
    let vault = Vault::unlock(config).await?;
    let folder_key = vault.folder_key(folder).await?;

    let file_size = tokio::fs::metadata(input)
        .await
        .with_context(|| format!("stat {}", input.display()))?
        .len();
    let file_type = file_type.unwrap_or_else(|| config.crypto.default_file_type.clone());
    let params = StreamParams::new(
        uuid::Uuid::new_v4().to_string(),
        config.crypto.chunk_size,
        file_size,
        file_type,
    )?;

    let provider = vault.keyring.provider().clone();
    let content_key = SecretKey::generate(provider.as_ref());
    let manifest = StreamManifest::seal(
        provider.as_ref(),
        &params,
        Some(folder),
        &folder_key,
        &content_key,
    )?;
    let cipher = ChunkCipher::new(provider, &content_key, params)?;
    vault.keyring.lock();

    let mut reader = BufReader::new(
        File::open(input)
            .await
            .with_context(|| format!("opening {}", input.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(output)
            .await
            .with_context(|| format!("creating {}", output.display()))?,
    );

    let total = cipher.total_chunks();
    let pb = make_progress_bar(u64::from(total), "encrypt");
    pb.set_message(input.display().to_string());
    let mut buf = Vec::new();
    for index in 0..total {
        buf.resize(cipher.params().plaintext_len(index)?, 0);
        reader
            .read_exact(&mut buf)
            .await
            .with_context(|| format!("reading chunk {index} of {}", input.display()))?;
        let chunk = cipher.encrypt_chunk(index, &buf)?;
        writer.write_all(&chunk.to_package()).await?;
        pb.inc(1);
    }
    writer.flush().await?;
    pb.finish_and_clear();

    let manifest_path = manifest_path_for(output);
    write_file(&manifest_path, &manifest.to_bytes()?).await?;

    info!(
        stream = %manifest.c1.enc_stream_id,
        chunks = total,
        bytes = file_size,
        "encrypted"
    );
    println!(
        "{} → {} ({} chunks, {})",
        input.display(),
        output.display(),
        total,
        fmt_bytes(file_size)
    );
    println!("  manifest: {}", manifest_path.display());
    Ok(())
}

// ── `sdrive decrypt` ──────────────────────────────────────────────────────────

async fn cmd_decrypt(
    config: &SdriveConfig,
    input: &Path,
    output: &Path,
    manifest_path: Option<&Path>,
    from_chunk: u32,
) -> Result<()> {
    let manifest_path = manifest_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest_path_for(input));
    let data = tokio::fs::read(&manifest_path)
        .await
        .with_context(|| format!("reading manifest: {}", manifest_path.display()))?;
    let manifest = StreamManifest::from_bytes(&data)?;
    let params = manifest.stream_params()?;
    let folder_id = manifest
        .wrapped_fk
        .folder_id
        .clone()
        .context("manifest does not name the folder holding its key")?;

    let vault = Vault::unlock(config).await?;
    let folder_key = vault.folder_key(&folder_id).await?;

    let mut source = File::open(input)
        .await
        .with_context(|| format!("opening {}", input.display()))?;
    if from_chunk > 0 {
        let offset = params.package_offset(from_chunk)?;
        source.seek(std::io::SeekFrom::Start(offset)).await?;
    }

    let mut pipeline = DecryptPipeline::from_manifest(
        vault.keyring.provider().clone(),
        &manifest,
        &folder_key,
        ReaderStream::new(source),
    )?
    .with_start_index(from_chunk)?;
    vault.keyring.lock();

    let out = if from_chunk > 0 {
        open_for_resume(output, &params, from_chunk).await?
    } else {
        File::create(output)
            .await
            .with_context(|| format!("creating {}", output.display()))?
    };
    let mut writer = BufWriter::new(out);

    let pb = make_progress_bar(u64::from(pipeline.total_chunks()), "decrypt");
    pb.set_position(u64::from(from_chunk));
    pb.set_message(input.display().to_string());
    while let Some(chunk) = pipeline.next_chunk().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // Keep what was verified so far; `--from-chunk` resumes here.
                writer.flush().await?;
                pb.abandon();
                return Err(e).with_context(|| {
                    format!(
                        "decrypting {} at chunk {}",
                        input.display(),
                        pipeline.next_index()
                    )
                });
            }
        };
        writer.write_all(&chunk.plaintext).await?;
        pb.inc(1);
    }
    writer.flush().await?;
    pb.finish_and_clear();

    info!(
        stream = %params.enc_stream_id,
        chunks = params.total_chunks(),
        bytes = params.file_size,
        "decrypted"
    );
    println!(
        "{} → {} ({})",
        input.display(),
        output.display(),
        fmt_bytes(params.file_size)
    );
    Ok(())
}

/// Open a partially decrypted `output` positioned where chunk `from_chunk`
/// belongs. Shorter than every earlier chunk is refused; anything past that
/// point is a torn write and is cut off.
async fn open_for_resume(output: &Path, params: &StreamParams, from_chunk: u32) -> Result<File> {
    let expected = (u64::from(from_chunk) * u64::from(params.chunk_size)).min(params.file_size);
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(output)
        .await
        .with_context(|| format!("opening {} to resume", output.display()))?;
    let len = file.metadata().await?.len();
    if len < expected {
        anyhow::bail!(
            "{} holds {len} bytes; resuming at chunk {from_chunk} needs {expected}",
            output.display()
        );
    }
    if len > expected {
        warn!(
            path = %output.display(),
            len,
            expected,
            "truncating partial output before resume"
        );
        file.set_len(expected).await?;
    }
    file.seek(std::io::SeekFrom::Start(expected)).await?;
    Ok(file)
}

// ── `sdrive config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &SdriveConfig, config_path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
