//! symcrypt - Symmetric encryption command line
//!
//! Usage:
//!   symcrypt generate --app-name <app>   - Generate keys and a new configuration
//!   symcrypt rotate --app-name <app>     - Add a new key version to each environment
//!   symcrypt encrypt [--value <text>]    - Encrypt a value, a file or stdin
//!   symcrypt decrypt [--value <text>]    - Decrypt a value, a file or stdin
//!   symcrypt info [<file>]               - Show configured ciphers or a file's header

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use symmetric_encryption::{
    config::{Config, DEFAULT_CONFIG_FILE, ENVIRONMENT_VAR},
    crypto::DEFAULT_CIPHER,
    keystore::{self, GenerateOptions, KeystoreContext, KeystoreKind, RotateOptions},
    stream::{self, ReaderOptions, Writer, WriterOptions, DEFAULT_BUFFER_SIZE},
    CipherRegistry, EncryptOptions, Error, Plaintext, Result,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "symcrypt")]
#[command(author = "symmetric-encryption Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Symmetric encryption with envelope key management")]
struct Cli {
    /// Configuration file path (.yml, .yaml or .json)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Environment within the configuration file
    #[arg(short, long, env = ENVIRONMENT_VAR)]
    environment: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum KeystoreArg {
    File,
    Environment,
    Memory,
    Aws,
    Gcp,
}

/// Where new keys are stored
#[derive(clap::Args)]
struct KeystoreArgs {
    /// Directory for key files
    #[arg(long)]
    key_path: Option<PathBuf>,

    /// AWS regions to hold a copy of each key
    #[arg(long, value_delimiter = ',')]
    regions: Vec<String>,

    /// Fail instead of creating a missing AWS KMS master key
    #[arg(long)]
    no_auto_create_master_key: bool,

    /// Google Cloud project (defaults to GOOGLE_CLOUD_PROJECT)
    #[arg(long)]
    project_id: Option<String>,

    /// Google Cloud KMS location (defaults to GOOGLE_CLOUD_LOCATION or global)
    #[arg(long)]
    location_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate keys for every environment and write a new configuration
    Generate {
        /// Application name, used in key file names and master key aliases
        #[arg(long)]
        app_name: String,

        /// Keystore for the new keys
        #[arg(long, value_enum, default_value = "file")]
        keystore: KeystoreArg,

        /// Environments to generate (defaults to development,test,release,production)
        #[arg(long, value_delimiter = ',')]
        environments: Vec<String>,

        /// Cipher for the new keys
        #[arg(long, default_value = DEFAULT_CIPHER.name())]
        cipher_name: String,

        #[command(flatten)]
        store: KeystoreArgs,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Add a new key version to each environment
    Rotate {
        /// Application name, used in key file names and master key aliases
        #[arg(long)]
        app_name: String,

        /// Environments to rotate (defaults to all)
        #[arg(long, value_delimiter = ',')]
        environments: Vec<String>,

        /// Add the new key as a secondary so it can be deployed before use
        #[arg(long)]
        rolling_deploy: bool,

        /// Keystore for the new keys (defaults to the current one)
        #[arg(long, value_enum)]
        keystore: Option<KeystoreArg>,

        #[command(flatten)]
        store: KeystoreArgs,
    },

    /// Encrypt a value, or a file or stdin as a stream
    Encrypt {
        /// Value to encrypt; prints the encoded result
        #[arg(long, conflicts_with = "input")]
        value: Option<String>,

        /// File to encrypt (defaults to stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// File to write (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Compress before encrypting
        #[arg(long)]
        compress: bool,

        /// Use a random IV (always on for streams)
        #[arg(long)]
        random_iv: bool,
    },

    /// Decrypt a value, or a file or stdin as a stream
    Decrypt {
        /// Encoded value to decrypt
        #[arg(long, conflicts_with = "input")]
        value: Option<String>,

        /// File to decrypt (defaults to stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// File to write (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the configured ciphers, or the header of an encrypted file
    Info {
        /// Encrypted file to inspect
        file: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let config_path = expand_tilde(&cli.config);
    let environment = cli
        .environment
        .clone()
        .unwrap_or_else(Config::current_environment);

    if let Err(e) = run_command(cli.command, &config_path, &environment) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path, environment: &str) -> Result<()> {
    match command {
        Commands::Generate {
            app_name,
            keystore,
            environments,
            cipher_name,
            store,
            force,
        } => cmd_generate(config_path, &app_name, keystore, &environments, cipher_name, store, force),

        Commands::Rotate {
            app_name,
            environments,
            rolling_deploy,
            keystore,
            store,
        } => cmd_rotate(config_path, app_name, environments, rolling_deploy, keystore, store),

        Commands::Encrypt {
            value,
            input,
            output,
            compress,
            random_iv,
        } => {
            let registry = load_registry(config_path, environment)?;
            match value {
                Some(value) => {
                    let options = EncryptOptions {
                        random_iv,
                        compress,
                        header: None,
                    };
                    println!("{}", registry.encrypt_str(&value, &options)?);
                    Ok(())
                }
                None => cmd_encrypt_stream(&registry, input, output, compress),
            }
        }

        Commands::Decrypt {
            value,
            input,
            output,
        } => {
            let registry = load_registry(config_path, environment)?;
            match value {
                Some(value) => {
                    let plaintext = registry.decrypt(value.trim().as_bytes(), None)?;
                    write_plaintext(&mut io::stdout().lock(), &plaintext)
                }
                None => cmd_decrypt_stream(&registry, input, output),
            }
        }

        Commands::Info { file } => cmd_info(config_path, environment, file),
    }
}

fn load_registry(config_path: &Path, environment: &str) -> Result<CipherRegistry> {
    let config = Config::load(config_path)?;
    CipherRegistry::from_config(config.environment(environment)?, &KeystoreContext::default())
}

fn keystore_kind(arg: KeystoreArg, store: &KeystoreArgs) -> KeystoreKind {
    match arg {
        KeystoreArg::File => KeystoreKind::File,
        KeystoreArg::Environment => KeystoreKind::Environment,
        KeystoreArg::Memory => KeystoreKind::Memory,
        KeystoreArg::Aws => KeystoreKind::Aws {
            regions: store.regions.clone(),
            auto_create_master_key: !store.no_auto_create_master_key,
        },
        KeystoreArg::Gcp => KeystoreKind::Gcp {
            project_id: store.project_id.clone(),
            location_id: store.location_id.clone(),
        },
    }
}

fn cmd_generate(
    config_path: &Path,
    app_name: &str,
    keystore: KeystoreArg,
    environments: &[String],
    cipher_name: String,
    store: KeystoreArgs,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file {:?} already exists, use --force to overwrite it or `rotate` to add keys",
            config_path
        )));
    }

    let kind = keystore_kind(keystore, &store);
    let mut template = GenerateOptions {
        cipher_name,
        ..GenerateOptions::new(app_name, "")
    };
    if let Some(key_path) = store.key_path {
        template.key_path = expand_tilde(&key_path);
    }

    info!("Generating keys for {}...", app_name);
    let config = keystore::generate_data_keys(&kind, environments, &template, &KeystoreContext::default())?;
    config.save(config_path)?;

    println!("Configuration written to {:?}", config_path);
    for name in config.environment_names() {
        println!("  {}", name);
    }
    Ok(())
}

fn cmd_rotate(
    config_path: &Path,
    app_name: String,
    environments: Vec<String>,
    rolling_deploy: bool,
    keystore: Option<KeystoreArg>,
    store: KeystoreArgs,
) -> Result<()> {
    let mut config = Config::load(config_path)?;
    let options = RotateOptions {
        environments,
        app_name,
        rolling_deploy,
        keystore: keystore.map(|arg| keystore_kind(arg, &store)),
        key_path: store.key_path.as_deref().map(expand_tilde),
    };

    let rotated = keystore::rotate_keys(&mut config, &options, &KeystoreContext::default())?;
    config.save(config_path)?;

    if rotated.is_empty() {
        println!("No environments rotated (inline keys are never rotated)");
    }
    for name in rotated {
        println!("Rotated {}", name);
    }
    if rolling_deploy {
        println!("Deploy the new keys everywhere, then rotate again without --rolling-deploy");
    }
    Ok(())
}

fn cmd_encrypt_stream(
    registry: &CipherRegistry,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    compress: bool,
) -> Result<()> {
    let mut source = open_input(input.as_deref())?;
    let target = open_output(output.as_deref())?;
    let options = WriterOptions {
        compress,
        ..WriterOptions::default()
    };

    let size = Writer::encrypt_stream(&mut source, target, registry, options, DEFAULT_BUFFER_SIZE)?;
    info!("Encrypted {} bytes", size);
    Ok(())
}

fn cmd_decrypt_stream(
    registry: &CipherRegistry,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    let source = open_input(input.as_deref())?;
    let mut target = open_output(output.as_deref())?;

    let size = stream::decrypt_stream(source, &mut target, registry, ReaderOptions::default())?;
    target.flush()?;
    info!("Decrypted {} bytes", size);
    Ok(())
}

fn cmd_info(config_path: &Path, environment: &str, file: Option<PathBuf>) -> Result<()> {
    if let Some(file) = file {
        let registry = load_registry(config_path, environment)?;
        let reader = stream::Reader::open_file(&file, &registry, ReaderOptions::default())?;

        println!("File: {:?}", file);
        println!("Header: {}", if reader.header_present() { "present" } else { "absent" });
        println!("Key version: {}", reader.version());
        println!("Compressed: {}", if reader.is_compressed() { "yes" } else { "no" });
        return Ok(());
    }

    let config = Config::load(config_path)?;
    let env = config.environment(environment)?;

    println!("symmetric-encryption Configuration");
    println!("==================================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Environment: {}", environment);
    println!();
    for (i, cipher) in env.ciphers.iter().enumerate() {
        println!(
            "{} v{}: {} ({}, {}, header {})",
            if i == 0 { "primary  " } else { "secondary" },
            cipher.version,
            cipher.cipher_name,
            cipher.key_source.kind(),
            cipher.encoding,
            if cipher.always_add_header { "on" } else { "off" }
        );
    }
    Ok(())
}

/// Write decrypted bytes unchanged; text gets a trailing newline
fn write_plaintext<W: Write>(out: &mut W, plaintext: &Plaintext) -> Result<()> {
    out.write_all(plaintext.as_bytes())?;
    if plaintext.is_text() {
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn Read>> {
    Ok(match path {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(io::stdin().lock()),
    })
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    })
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_plaintext_keeps_binary_bytes() {
        let bytes = vec![0xFF, 0x00, 0xFE, b'\n', 0x80];
        let mut out = Vec::new();
        write_plaintext(&mut out, &Plaintext::from_bytes(bytes.clone())).unwrap();
        assert_eq!(out, bytes);

        let mut out = Vec::new();
        write_plaintext(&mut out, &Plaintext::from_bytes(b"hello".to_vec())).unwrap();
        assert_eq!(out, b"hello\n");
    }
}
