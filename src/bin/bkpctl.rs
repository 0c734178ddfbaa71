//! Control-channel client for `bkpfs`.
//!
//! Talks to a mounted versioning filesystem purely through `ioctl(2)` on an
//! open file handle, using the wire format in `bkpfs::control::wire`.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;

use bkpfs::control::wire;
use bkpfs::BkpError;
use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Which {
    Newest,
    Oldest,
    Nth(u32),
}

impl Which {
    fn encode(self) -> i32 {
        match self {
            Which::Newest => 0,
            Which::Oldest => -1,
            Which::Nth(n) => n as i32,
        }
    }
}

impl std::str::FromStr for Which {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(Which::Newest),
            "oldest" => Ok(Which::Oldest),
            other => other
                .parse::<u32>()
                .map(Which::Nth)
                .map_err(|_| format!("not newest, oldest, or a version number: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteTarget {
    Newest,
    Oldest,
    All,
}

impl std::str::FromStr for DeleteTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(DeleteTarget::Newest),
            "oldest" => Ok(DeleteTarget::Oldest),
            "all" => Ok(DeleteTarget::All),
            other => Err(format!("not newest, oldest, or all: {other:?}")),
        }
    }
}

/// Inspect and manage a versioned file's retained backups.
#[derive(Parser, Debug)]
#[command(name = "bkpctl", about = "Control client for the bkpfs control channel")]
struct Args {
    /// Versioned file to operate on
    file: PathBuf,

    /// List the retention window and current backup count
    #[arg(short = 'l', long)]
    list: bool,

    /// Delete one or all backups: newest|oldest|all
    #[arg(short = 'd', long = "delete", value_name = "WHICH")]
    delete: Option<DeleteTarget>,

    /// Print a backup's contents to stdout: newest|oldest|N
    #[arg(short = 'v', long = "view", value_name = "WHICH")]
    view: Option<Which>,

    /// Restore a backup's contents into the live file: newest|N
    #[arg(short = 'r', long = "restore", value_name = "WHICH")]
    restore: Option<Which>,
}

fn open_ctl(path: &PathBuf) -> std::io::Result<std::fs::File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn ioctl_raw(fd: i32, cmd: u32, in_data: &[u8], out_buf: &mut [u8]) -> std::io::Result<()> {
    let mut payload = in_data.to_vec();
    payload.resize(payload.len().max(out_buf.len()), 0);
    let ret = unsafe { libc::ioctl(fd, cmd as libc::c_ulong, payload.as_mut_ptr()) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let n = out_buf.len().min(payload.len());
    out_buf[..n].copy_from_slice(&payload[..n]);
    Ok(())
}

fn get_max(fd: i32) -> std::io::Result<u32> {
    let mut out = [0u8; 4];
    ioctl_raw(fd, wire::GET_MAX, &[], &mut out)?;
    Ok(u32::from_le_bytes(out))
}

fn get_count(fd: i32) -> std::io::Result<u32> {
    let mut out = [0u8; 4];
    ioctl_raw(fd, wire::GET_COUNT, &[], &mut out)?;
    Ok(u32::from_le_bytes(out))
}

fn get_size(fd: i32, which: Which) -> std::io::Result<u64> {
    let mut out = [0u8; 8];
    ioctl_raw(fd, wire::GET_SIZE, &which.encode().to_le_bytes(), &mut out)?;
    Ok(u64::from_le_bytes(out))
}

fn view(fd: i32, which: Which) -> std::io::Result<Vec<u8>> {
    let size = get_size(fd, which)? as usize;
    let mut in_data = Vec::with_capacity(12);
    in_data.extend_from_slice(&which.encode().to_le_bytes());
    in_data.extend_from_slice(&0u64.to_le_bytes());
    let mut out = vec![0u8; size];
    ioctl_raw(fd, wire::VIEW, &in_data, &mut out)?;
    Ok(out)
}

fn delete(fd: i32, target: DeleteTarget) -> std::io::Result<()> {
    let selector = match target {
        DeleteTarget::Newest => 0i32,
        DeleteTarget::Oldest => -1,
        DeleteTarget::All => 1,
    };
    ioctl_raw(fd, wire::DELETE, &selector.to_le_bytes(), &mut [])
}

fn restore(fd: i32, which: Which) -> std::io::Result<()> {
    ioctl_raw(fd, wire::RESTORE, &which.encode().to_le_bytes(), &mut [])
}

fn run(args: &Args) -> Result<(), String> {
    let file = open_ctl(&args.file).map_err(|err| {
        format!(
            "{}: {}",
            BkpError::from_io(&err).category_label(),
            args.file.display()
        )
    })?;
    let fd = file.as_raw_fd();

    if let Some(which) = args.view {
        let bytes = view(fd, which).map_err(|err| format!("view failed: {err}"))?;
        use std::io::Write;
        std::io::stdout()
            .write_all(&bytes)
            .map_err(|err| format!("write to stdout failed: {err}"))?;
    }

    if let Some(target) = args.delete {
        delete(fd, target).map_err(|err| format!("delete failed: {err}"))?;
    }

    if let Some(which) = args.restore {
        restore(fd, which).map_err(|err| format!("restore failed: {err}"))?;
    }

    if args.list || (args.delete.is_none() && args.view.is_none() && args.restore.is_none()) {
        let maxvers = get_max(fd).map_err(|err| format!("getmax failed: {err}"))?;
        let count = get_count(fd).map_err(|err| format!("getcount failed: {err}"))?;
        println!("{}: {count}/{maxvers} versions retained", args.file.display());
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("bkpctl: {msg}");
            ExitCode::FAILURE
        }
    }
}
