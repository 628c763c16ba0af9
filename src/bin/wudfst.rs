use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_derive::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use wudfst::error::Error;
use wudfst::format::fst::cache::CacheStats;
use wudfst::format::fst::{ClusterInfo, FileHandle, FstVolume};
use wudfst::format::source::ClusterDataSource;
use wudfst::format::{content, wud};
use wudfst::pki::{Aes128Key, Keys};

type Volume<'a> = FstVolume<Box<dyn ClusterDataSource + 'a>>;

#[derive(Parser)]
#[command(name = "wudfst", about = "Browse and extract Wii U disc images and title folders")]
struct Opt {
    /// Key file to load instead of ~/.config/wiiu/keys.txt.
    #[arg(long = "keys")]
    keys: Option<PathBuf>,

    /// Disc key of the image, as 32 hex digits.
    #[arg(long = "disc-key")]
    disc_key: Option<Aes128Key>,

    /// A .wud image, or a folder holding title.tmd, title.tik and the .app
    /// contents.
    input: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory.
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Extract a single file.
    Extract { path: String, output_file: PathBuf },
    /// Extract the whole volume into a directory.
    Dump { output_directory: PathBuf },
    /// Print clusters and counters as JSON.
    Info,
    /// Check every cluster against the title metadata hashes.
    Verify,
}

const COPY_CHUNK: usize = 0x10000;

fn open_volume(opt: &Opt, keys: &Keys) -> Result<Volume<'static>, Error> {
    if opt.input.is_dir() {
        info!("Opening title folder {}", opt.input.display());
        return Ok(content::open_from_content_folder(&opt.input, keys)?.boxed());
    }
    info!("Opening disc image {}", opt.input.display());
    let volume = match opt.disc_key {
        Some(key) => wud::open_from_disc_image_with_key(&opt.input, keys, key)?,
        None => wud::open_from_disc_image(&opt.input, keys)?,
    };
    Ok(volume.boxed())
}

fn list(volume: &Volume, path: &str) -> Result<(), Error> {
    for handle in volume.read_dir(path)? {
        if volume.is_directory(handle) {
            println!("{:>10}  {}/", "<dir>", volume.name(handle));
        } else {
            let link = if volume.has_link_flag(handle) { " (link)" } else { "" };
            println!("{:>10}  {}{}", volume.file_size(handle), volume.name(handle), link);
        }
    }
    Ok(())
}

/// Streams one file to `output`. Returns false when the volume could not
/// supply every byte.
fn copy_file(volume: &mut Volume, handle: FileHandle, output: &Path) -> Result<bool, Error> {
    let mut option = OpenOptions::new();
    let output_option = option.write(true).create(true).truncate(true);
    let mut out_file = output_option.open(output).map_err(|err| (err, output))?;

    let size = volume.file_size(handle);
    let mut buf = vec![0; COPY_CHUNK];
    let mut offset = 0u32;
    while offset < size {
        let want = COPY_CHUNK.min((size - offset) as usize);
        let read = volume.read_file(handle, offset, &mut buf[..want]);
        out_file.write_all(&buf[..read]).map_err(|err| (err, output))?;
        offset += read as u32;
        if read < want {
            return Ok(false);
        }
    }
    Ok(true)
}

fn extract(volume: &mut Volume, path: &str, output_file: &Path) -> Result<(), Error> {
    let handle = match volume.open_file(path, true) {
        Some(handle) => handle,
        None => {
            println!("No file at {}", path);
            process::exit(1);
        }
    };
    if !copy_file(volume, handle, output_file)? {
        warn!("{} is truncated, the volume is damaged", path);
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), Error> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) => Err((err, path).into()),
    }
}

fn dump(volume: &mut Volume, output_directory: &Path) -> Result<(), Error> {
    create_dir(output_directory)?;
    let mut pending = vec![String::new()];
    let mut damaged = 0usize;
    while let Some(dir) = pending.pop() {
        let children: Vec<FileHandle> = volume.read_dir(&dir)?.collect();
        for handle in children {
            let path = volume.path(handle);
            let target = match volume.host_path(handle) {
                Some(relative) => output_directory.join(relative),
                None => {
                    warn!("Skipping {:?}, its name is not a plain path component", path);
                    damaged += 1;
                    continue;
                }
            };
            if volume.is_directory(handle) {
                create_dir(&target)?;
                pending.push(path);
            } else {
                println!("Writing {}", path);
                if !copy_file(volume, handle, &target)? {
                    warn!("{} is truncated", path);
                    damaged += 1;
                }
            }
        }
    }
    if damaged > 0 {
        warn!("{} entries were skipped or could not be read completely", damaged);
    }
    Ok(())
}

#[derive(Serialize)]
struct VolumeInfo {
    entries: usize,
    files: usize,
    offset_factor: u32,
    clusters: Vec<ClusterInfo>,
    cache: CacheStats,
    corruption_detected: bool,
}

fn info(volume: &Volume) -> Result<(), Error> {
    let info = VolumeInfo {
        entries: volume.entry_count(),
        files: volume.file_count(),
        offset_factor: volume.offset_factor(),
        clusters: volume.cluster_info(),
        cache: volume.cache_stats(),
        corruption_detected: volume.corruption_detected(),
    };
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn verify(volume: &mut Volume) -> Result<(), Error> {
    let outcomes = volume.verify_all()?;
    for (index, outcome) in outcomes.iter().enumerate() {
        println!("cluster {:>4}: {:?}", index, outcome);
    }
    if volume.corruption_detected() {
        println!("Volume is damaged");
        process::exit(2);
    }
    Ok(())
}

fn process_args(opt: &Opt) -> Result<(), Error> {
    let keys = Keys::new(opt.keys.as_deref())?;
    let mut volume = open_volume(opt, &keys)?;
    match opt.command {
        Command::Ls { ref path } => list(&volume, path),
        Command::Extract { ref path, ref output_file } => extract(&mut volume, path, output_file),
        Command::Dump { ref output_directory } => dump(&mut volume, output_directory),
        Command::Info => info(&volume),
        Command::Verify => verify(&mut volume),
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = process_args(&Opt::parse()) {
        println!("Error ({}): {}", e.code(), e);
        process::exit(1)
    }
}
