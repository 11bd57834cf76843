//! pkcryptfs - Encrypted overlay filesystem with per-user public-key access
//!
//! Usage:
//!   pkcryptfs keygen                          - Generate an RSA key pair
//!   pkcryptfs init <root>                     - Initialize an encrypted root
//!   pkcryptfs add-user <root> <new_user> ...  - Grant access to another user
//!   pkcryptfs delete-user <root> <user>       - Revoke a user
//!   pkcryptfs list-users <root>               - List authorized users
//!   pkcryptfs status <root>                   - Show root settings
//!   pkcryptfs mount <root> <mount_point>      - Mount the filesystem
//!   pkcryptfs unmount <mount_point>           - Unmount the filesystem

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pkcryptfs::{
    config::MountConfig,
    crypto::keywrap::{
        generate_key_pair, read_private_key, read_public_key, write_private_key,
        write_public_key, DEFAULT_RSA_BITS,
    },
    fs::PkCryptFs,
    session::Session,
    users::UserStore,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_PRIVATE_KEY: &str = "~/.config/pkcryptfs/private.pem";
const DEFAULT_PUBLIC_KEY: &str = "~/.config/pkcryptfs/public.pem";

#[derive(Parser)]
#[command(name = "pkcryptfs")]
#[command(author = "pkcryptfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Encrypted overlay filesystem with per-user public-key access control")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an RSA key pair for a user
    Keygen {
        /// Private key output path
        #[arg(long, default_value = DEFAULT_PRIVATE_KEY)]
        private_key: PathBuf,

        /// Public key output path
        #[arg(long, default_value = DEFAULT_PUBLIC_KEY)]
        public_key: PathBuf,

        /// RSA modulus size in bits
        #[arg(long, default_value_t = DEFAULT_RSA_BITS)]
        bits: usize,
    },

    /// Initialize a new encrypted root with its first user
    Init {
        /// Directory holding the encrypted data
        root: PathBuf,

        /// First user (defaults to the current login)
        #[arg(short, long)]
        user: Option<String>,

        /// Public key of the first user
        #[arg(long, default_value = DEFAULT_PUBLIC_KEY)]
        public_key: PathBuf,

        /// Block size in bytes (at least 8)
        #[arg(long)]
        block_size: Option<usize>,
    },

    /// Grant access to a new user
    AddUser {
        /// Directory holding the encrypted data
        root: PathBuf,

        /// Name of the new user
        new_user: String,

        /// Public key of the new user
        new_public_key: PathBuf,

        /// Authorized user granting access (defaults to the current login)
        #[arg(short, long)]
        user: Option<String>,

        /// Private key of the authorized user
        #[arg(long, default_value = DEFAULT_PRIVATE_KEY)]
        private_key: PathBuf,
    },

    /// Revoke a user's access
    DeleteUser {
        /// Directory holding the encrypted data
        root: PathBuf,

        /// User to remove
        user: String,
    },

    /// List authorized users
    ListUsers {
        /// Directory holding the encrypted data
        root: PathBuf,
    },

    /// Show encrypted root status
    Status {
        /// Directory holding the encrypted data
        root: PathBuf,
    },

    /// Mount the filesystem
    Mount {
        /// Directory holding the encrypted data
        root: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// User to authenticate as (defaults to the current login)
        #[arg(short, long)]
        user: Option<String>,

        /// Private key of the user
        #[arg(long, default_value = DEFAULT_PRIVATE_KEY)]
        private_key: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Keep the mount when the process exits
        #[arg(long)]
        no_auto_unmount: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    // Run the command
    if let Err(e) = run_command(cli.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Keygen {
            private_key,
            public_key,
            bits,
        } => cmd_keygen(&expand_tilde(&private_key), &expand_tilde(&public_key), bits),

        Commands::Init {
            root,
            user,
            public_key,
            block_size,
        } => cmd_init(&root, user, &expand_tilde(&public_key), block_size),

        Commands::AddUser {
            root,
            new_user,
            new_public_key,
            user,
            private_key,
        } => cmd_add_user(
            &root,
            user,
            &expand_tilde(&private_key),
            &new_user,
            &new_public_key,
        ),

        Commands::DeleteUser { root, user } => cmd_delete_user(&root, &user),

        Commands::ListUsers { root } => cmd_list_users(&root),

        Commands::Status { root } => cmd_status(&root),

        Commands::Mount {
            root,
            mount_point,
            user,
            private_key,
            allow_other,
            no_auto_unmount,
        } => {
            let config = MountConfig {
                mount_point,
                allow_other,
                auto_unmount: !no_auto_unmount,
            };
            cmd_mount(&root, user, &expand_tilde(&private_key), &config)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),
    }
}

fn cmd_keygen(private_path: &Path, public_path: &Path, bits: usize) -> anyhow::Result<()> {
    for path in [private_path, public_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
    }

    info!("Generating {} bit RSA key pair...", bits);
    let private_key = generate_key_pair(bits)?;

    write_private_key(&private_key, private_path)
        .with_context(|| format!("Cannot write {}", private_path.display()))?;
    write_public_key(&private_key.to_public_key(), public_path)
        .with_context(|| format!("Cannot write {}", public_path.display()))?;

    info!("Private key: {}", private_path.display());
    info!("Public key: {}", public_path.display());
    Ok(())
}

fn cmd_init(
    root: &Path,
    user: Option<String>,
    public_key_path: &Path,
    block_size: Option<usize>,
) -> anyhow::Result<()> {
    let user = resolve_user(user)?;
    let public_key = read_public_key(public_key_path)
        .with_context(|| format!("Cannot load public key {}", public_key_path.display()))?;

    std::fs::create_dir_all(root)
        .with_context(|| format!("Cannot create {}", root.display()))?;

    let store = UserStore::new(root);
    store.init(&user, &public_key, block_size)?;

    info!("Encrypted root {} ready for {}", root.display(), user);
    info!("Mount it with 'pkcryptfs mount {} <mount_point>'", root.display());
    Ok(())
}

fn cmd_add_user(
    root: &Path,
    user: Option<String>,
    private_key_path: &Path,
    new_user: &str,
    new_public_key_path: &Path,
) -> anyhow::Result<()> {
    let user = resolve_user(user)?;
    let private_key = read_private_key(private_key_path)
        .with_context(|| format!("Cannot load private key {}", private_key_path.display()))?;
    let new_public_key = read_public_key(new_public_key_path).with_context(|| {
        format!("Cannot load public key {}", new_public_key_path.display())
    })?;

    UserStore::new(root).add_user(&user, &private_key, new_user, &new_public_key)?;

    info!("User {} added", new_user);
    Ok(())
}

fn cmd_delete_user(root: &Path, user: &str) -> anyhow::Result<()> {
    UserStore::new(root).delete_user(user)?;
    info!("User {} deleted", user);
    Ok(())
}

fn cmd_list_users(root: &Path) -> anyhow::Result<()> {
    for user in UserStore::new(root).list_users()? {
        println!("{}", user);
    }
    Ok(())
}

fn cmd_status(root: &Path) -> anyhow::Result<()> {
    let store = UserStore::new(root);
    let config = store.config()?;
    let users = store.list_users()?;

    println!("pkcryptfs Status");
    println!("================");
    println!();
    println!("Root: {}", root.display());
    println!("Configuration: {}", store.layout().config_file().display());
    println!("Block size: {} bytes", config.block_size()?);
    println!("Users ({}):", users.len());
    for user in users {
        println!("  {}", user);
    }

    Ok(())
}

fn cmd_mount(
    root: &Path,
    user: Option<String>,
    private_key_path: &Path,
    config: &MountConfig,
) -> anyhow::Result<()> {
    // Every user of the mount would act with root's rights on the lower files
    if nix::unistd::geteuid().is_root() {
        bail!("Refusing to mount as root");
    }

    let user = resolve_user(user)?;
    let private_key = read_private_key(private_key_path)
        .with_context(|| format!("Cannot load private key {}", private_key_path.display()))?;

    let root = root
        .canonicalize()
        .with_context(|| format!("Cannot access {}", root.display()))?;

    info!("Starting pkcryptfs...");
    let session = Session::open(&root, &user, &private_key)?;
    let fs = PkCryptFs::new(session);

    // Ensure mount point exists
    std::fs::create_dir_all(&config.mount_point)
        .with_context(|| format!("Cannot create {}", config.mount_point.display()))?;

    info!("Mounting at {:?}", config.mount_point);
    fuser::mount2(fs, &config.mount_point, &config.mount_options())
        .with_context(|| format!("Cannot mount on {}", config.mount_point.display()))?;

    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> anyhow::Result<()> {
    info!("Unmounting {:?}...", mount_point);

    // Use fusermount/umount
    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        bail!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    }
}

/// The given user name, or the login name of the calling user
fn resolve_user(user: Option<String>) -> anyhow::Result<String> {
    if let Some(user) = user {
        return Ok(user);
    }

    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid).context("Cannot look up the current user")? {
        Some(entry) => Ok(entry.name),
        None => bail!("No user name for uid {}, pass --user", uid),
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
