use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use crypta::volume::create::CreateProgress;
use crypta::volume::headers;
use crypta::volume::{
    CreateOptions, Credentials, MountOptions, MountTable, create_hidden_volume, create_volume,
    open_volume,
};
use crypta::{CancelToken, CascadeId, KdfId};
use std::sync::OnceLock;

/// Mount table for this process; `list` walks it.
fn table() -> &'static MountTable {
    static TABLE: OnceLock<MountTable> = OnceLock::new();
    TABLE.get_or_init(MountTable::new)
}

/// How long a dismount waits for in-flight writes before forcing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "crypta", version, about = "TrueCrypt-compatible encrypted volumes")]
struct Args {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Mount a volume and serve it to the host over loopback NFS
    Mount(MountArgs),
    /// Unmount a mountpoint; the server exits when its client disconnects
    Dismount(DismountArgs),
    /// Create a volume container (or a hidden volume inside one)
    Create(CreateArgs),
    /// Change the password and/or keyfiles of a volume
    Change(ChangeArgs),
    /// Save all four header slots to a file
    BackupHeaders(BackupArgs),
    /// Restore header slots from a file or from the internal backup
    RestoreHeaders(RestoreArgs),
    /// List volumes mounted by this process
    List,
    /// List candidate raw block devices
    ListDevices,
    /// Run the cryptographic self-tests
    Test,
    /// Print the version
    Version,
}

#[derive(Debug, clap::Args)]
struct MountArgs {
    volume: PathBuf,
    /// Where to ask the OS to mount the served filesystem
    mountpoint: Option<PathBuf>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long, value_delimiter = ',')]
    keyfiles: Vec<PathBuf>,
    #[arg(long)]
    read_only: bool,
    /// Use the backup headers at the end of the container
    #[arg(long)]
    backup_headers: bool,
    /// Protect a hidden volume while writing to the outer one
    #[arg(long)]
    protect_hidden: bool,
    #[arg(long)]
    hidden_password: Option<String>,
    #[arg(long, value_delimiter = ',')]
    hidden_keyfiles: Vec<PathBuf>,
    /// Try only this KDF (mount speed-up)
    #[arg(long = "hash", value_enum)]
    kdf: Option<CliKdf>,
    /// Try only this cascade
    #[arg(long = "encryption", value_parser = parse_cascade)]
    cascade: Option<CascadeId>,
    /// The KDF option names the legacy (TrueCrypt 7.1a) parameter set
    #[arg(long)]
    legacy: bool,
}

#[derive(Debug, clap::Args)]
struct DismountArgs {
    /// Mountpoint to pass to the host umount
    mountpoint: Option<PathBuf>,
    #[arg(long)]
    all: bool,
}

#[derive(Debug, clap::Args)]
struct CreateArgs {
    volume: PathBuf,
    /// Container size in bytes (hidden volume size with --hidden); 0 means
    /// the size of the target device
    #[arg(long)]
    size: u64,
    /// Create a hidden volume inside an existing container
    #[arg(long)]
    hidden: bool,
    #[arg(long = "encryption", value_parser = parse_cascade, default_value = "AES")]
    cascade: CascadeId,
    #[arg(long = "hash", value_enum, default_value_t = CliKdf::Sha512)]
    kdf: CliKdf,
    /// Use the legacy TrueCrypt 7.1a PBKDF2 iteration counts
    #[arg(long)]
    legacy: bool,
    /// Skip the random fill of the data area
    #[arg(long)]
    quick: bool,
    /// Filesystem to put on the new volume (delegated to host tools)
    #[arg(long, default_value = "none")]
    filesystem: String,
    #[arg(long)]
    password: Option<String>,
    #[arg(long, value_delimiter = ',')]
    keyfiles: Vec<PathBuf>,
    /// Outer volume password (with --hidden)
    #[arg(long)]
    outer_password: Option<String>,
    #[arg(long, value_delimiter = ',')]
    outer_keyfiles: Vec<PathBuf>,
    /// Confirm writing to a raw block device
    #[arg(long)]
    yes_wipe_device: bool,
}

#[derive(Debug, clap::Args)]
struct ChangeArgs {
    volume: PathBuf,
    #[arg(long)]
    password: Option<String>,
    #[arg(long, value_delimiter = ',')]
    keyfiles: Vec<PathBuf>,
    #[arg(long)]
    new_password: Option<String>,
    #[arg(long, value_delimiter = ',')]
    new_keyfiles: Vec<PathBuf>,
    /// Re-seal with a different KDF
    #[arg(long = "new-hash", value_enum)]
    new_kdf: Option<CliKdf>,
    #[arg(long)]
    legacy: bool,
}

#[derive(Debug, clap::Args)]
struct BackupArgs {
    volume: PathBuf,
    #[arg(long)]
    to: PathBuf,
}

#[derive(Debug, clap::Args)]
struct RestoreArgs {
    volume: PathBuf,
    /// Restore the primary slots from the in-container backup slots
    #[arg(long, conflicts_with = "from_file")]
    from_internal: bool,
    #[arg(long)]
    from_file: Option<PathBuf>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long, value_delimiter = ',')]
    keyfiles: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliKdf {
    Sha512,
    Ripemd160,
    Whirlpool,
    Streebog,
    Argon2id,
    Argon2idMax,
}

impl CliKdf {
    fn to_kdf(self, legacy: bool) -> KdfId {
        let strengthened = !legacy;
        match self {
            CliKdf::Sha512 => KdfId::Pbkdf2Sha512 { strengthened },
            CliKdf::Ripemd160 => KdfId::Pbkdf2Ripemd160 { strengthened },
            CliKdf::Whirlpool => KdfId::Pbkdf2Whirlpool { strengthened },
            CliKdf::Streebog => KdfId::Pbkdf2Streebog { strengthened },
            CliKdf::Argon2id => KdfId::Argon2id,
            CliKdf::Argon2idMax => KdfId::Argon2idMax,
        }
    }
}

fn parse_cascade(value: &str) -> Result<CascadeId, String> {
    CascadeId::from_name(value).ok_or_else(|| {
        let names: Vec<&str> = CascadeId::ALL.iter().map(|c| c.name()).collect();
        format!("unknown cascade {value:?}; expected one of {}", names.join(", "))
    })
}

fn main() -> ExitCode {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init()
        .unwrap();

    match run(args.cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("crypta: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Mount(args) => mount(args),
        Command::Dismount(args) => dismount(args),
        Command::Create(args) => create(args),
        Command::Change(args) => change(args),
        Command::BackupHeaders(args) => {
            headers::backup_headers(&args.volume, &args.to)?;
            println!("headers written to {}", args.to.display());
            Ok(())
        }
        Command::RestoreHeaders(args) => restore(args),
        Command::List => {
            // The table only covers this process; mounts are foreground.
            let mounts = table().list();
            if mounts.is_empty() {
                println!("no volumes mounted by this process");
            }
            for info in mounts {
                println!(
                    "slot {}: {} ({} bytes{})",
                    info.slot,
                    info.path.display(),
                    info.size_bytes,
                    if info.read_only { ", read-only" } else { "" },
                );
            }
            Ok(())
        }
        Command::ListDevices => list_devices(),
        Command::Test => {
            crypta::crypto::selftest::run_all_tests()?;
            println!("all self-tests passed");
            Ok(())
        }
        Command::Version => {
            println!("crypta {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn mount(args: MountArgs) -> anyhow::Result<()> {
    let creds = credentials(args.password, args.keyfiles, "Volume password: ")?;
    let protect_hidden = if args.protect_hidden {
        Some(credentials(
            args.hidden_password,
            args.hidden_keyfiles,
            "Hidden volume password: ",
        )?)
    } else {
        None
    };

    let options = MountOptions {
        use_backup_headers: args.backup_headers,
        read_only: args.read_only,
        protect_hidden,
        kdf: args.kdf.map(|k| k.to_kdf(args.legacy)),
        cascade: args.cascade,
    };

    let cancel = CancelToken::new();
    let volume = open_volume(&args.volume, &creds, &options, &cancel)?;
    println!(
        "mounted {} ({} bytes, {})",
        args.volume.display(),
        volume.size_bytes(),
        volume.cascade(),
    );

    let translator = volume.translator();
    let slot = table().insert(volume)?;
    let server = crypta::serve::NfsServer::bind(translator)?;
    let port = server.local_port();
    let runner = crypta::serve::ServerRunner::spawn(server);
    println!("serving slot {slot} on 127.0.0.1:{port}");

    if let Some(mountpoint) = &args.mountpoint {
        if let Err(err) = os_mount(port, mountpoint) {
            runner.shutdown(DRAIN_TIMEOUT);
            if let Some(volume) = table().remove(slot) {
                let _ = volume.dismount();
            }
            return Err(err);
        }
        println!("mounted at {}", mountpoint.display());
    } else {
        println!("mount it with: mount -t nfs -o nfsvers=4.0,port={port},tcp 127.0.0.1:/ <dir>");
    }

    // Foreground: serve until the host unmounts (or ^C kills us).
    let outcome = runner.wait()?;
    log::debug!("server exited: {outcome:?}");
    let volume = table().remove(slot).expect("volume still in table");
    let triggered = volume.protection_triggered();
    volume.dismount()?;
    if triggered {
        eprintln!("warning: a write hit the protected hidden volume and was blocked");
    }
    Ok(())
}

fn dismount(args: DismountArgs) -> anyhow::Result<()> {
    if args.all {
        bail!("dismount --all applies to a serving process; unmount each mountpoint instead");
    }
    let mountpoint = args.mountpoint.context("mountpoint required")?;
    let status = std::process::Command::new("umount").arg(&mountpoint).status()?;
    if !status.success() {
        bail!("umount {} failed", mountpoint.display());
    }
    // The serving process sees its client disconnect and exits on its own.
    Ok(())
}

fn create(args: CreateArgs) -> anyhow::Result<()> {
    let options = CreateOptions {
        size: if args.hidden { 0 } else { args.size },
        cascade: args.cascade,
        kdf: args.kdf.to_kdf(args.legacy),
        quick_format: args.quick,
        user_confirmed: args.yes_wipe_device,
        ..Default::default()
    };
    let cancel = CancelToken::new();

    if args.hidden {
        let outer = credentials(args.outer_password, args.outer_keyfiles, "Outer volume password: ")?;
        let hidden = credentials(args.password, args.keyfiles, "Hidden volume password: ")?;
        create_hidden_volume(&args.volume, &outer, &hidden, args.size, &options, &cancel)?;
        println!("hidden volume created in {}", args.volume.display());
    } else {
        let creds = credentials(args.password, args.keyfiles, "Volume password: ")?;
        let progress = CreateProgress::new();
        create_volume(&args.volume, &creds, &options, &progress, &cancel)?;
        let (done, _) = progress.snapshot();
        println!("created {} ({done} bytes formatted)", args.volume.display());
    }

    if args.filesystem != "none" {
        log::warn!(
            "filesystem creation ({}) is delegated to host tools after mounting",
            args.filesystem
        );
    }
    Ok(())
}

fn change(args: ChangeArgs) -> anyhow::Result<()> {
    let old = credentials(args.password, args.keyfiles, "Current password: ")?;
    let new = credentials(args.new_password, args.new_keyfiles, "New password: ")?;
    let new_kdf = args.new_kdf.map(|k| k.to_kdf(args.legacy));
    headers::change_credentials(
        &args.volume,
        &old,
        &new,
        new_kdf,
        &MountOptions::default(),
        &CancelToken::new(),
    )?;
    println!("credentials changed for {}", args.volume.display());
    Ok(())
}

fn restore(args: RestoreArgs) -> anyhow::Result<()> {
    if let Some(from) = &args.from_file {
        headers::restore_headers_from_file(&args.volume, from)?;
    } else if args.from_internal {
        let creds = credentials(args.password, args.keyfiles, "Volume password: ")?;
        headers::restore_headers_from_internal(
            &args.volume,
            &creds,
            &MountOptions::default(),
            &CancelToken::new(),
        )?;
    } else {
        bail!("pass --from-internal or --from-file FILE");
    }
    println!("headers restored for {}", args.volume.display());
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let entries = match std::fs::read_dir("/sys/block") {
        Ok(entries) => entries,
        Err(_) => {
            println!("no block device listing on this platform");
            return Ok(());
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        let sectors: u64 = std::fs::read_to_string(entry.path().join("size"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        println!("/dev/{name}\t{} bytes", sectors * 512);
    }
    Ok(())
}

/// Builds credentials from the flag or an interactive prompt, stirring the
/// keystroke timing into the entropy pool while it is at it.
fn credentials(
    password: Option<String>,
    keyfiles: Vec<PathBuf>,
    prompt: &str,
) -> anyhow::Result<Credentials> {
    let password = match password {
        Some(p) => p,
        None => {
            eprint!("{prompt}");
            std::io::stderr().flush().ok();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            crypta::crypto::rng::pool().lock().unwrap().stir_timing_jitter();
            line.trim_end_matches('\n').to_string()
        }
    };
    Ok(Credentials::new(password.into_bytes()).with_keyfiles(keyfiles))
}

fn os_mount(port: u16, mountpoint: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(mountpoint).ok();
    let status = std::process::Command::new("mount")
        .arg("-t")
        .arg("nfs")
        .arg("-o")
        .arg(format!("nfsvers=4.0,port={port},tcp,soft,noac"))
        .arg("127.0.0.1:/")
        .arg(mountpoint)
        .status()?;
    if !status.success() {
        bail!("host NFS mount failed (is the NFS client installed?)");
    }
    Ok(())
}
