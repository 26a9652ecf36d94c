#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use e4s_damage::DamageMap;
use e4s_image::Ext4Image;
use e4s_scan::{scan, ScanReport};
use e4s_tree::{
    cache_file_path, default_cache_dir, load_tree, node_paths, remove_cache, status_letters,
    store_tree, FileNode, FileTree,
};
use e4s_types::{BlockNumber, InodeNumber};
use serde::Serialize;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pages held by the block cache (4 KiB each).
const CACHE_PAGES: usize = 4096;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "e4s", about = "ext4salvage — recover files from damaged ext4 images")]
struct Cli {
    /// Log more (repeat for trace output).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ImageArgs {
    /// Path to the filesystem image.
    image: PathBuf,
    /// GNU ddrescue map file describing which image bytes were rescued.
    #[arg(long)]
    ddrescue_log: Option<PathBuf>,
    /// Ignore any cached scan result and rescan the image.
    #[arg(long)]
    force_scan: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the image (or load a cached scan) and print a damage summary.
    Scan {
        #[command(flatten)]
        image: ImageArgs,
    },
    /// List files with their status letters.
    List {
        #[command(flatten)]
        image: ImageArgs,
        /// Include healthy files (default lists only damaged ones).
        #[arg(long)]
        all: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Print aggregate damage counters.
    Summary {
        #[command(flatten)]
        image: ImageArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Copy surviving file data into a target directory.
    Extract {
        #[command(flatten)]
        image: ImageArgs,
        /// Directory to extract into.
        target: PathBuf,
        /// Only extract entries whose path starts with this prefix.
        #[arg(long)]
        path: Option<String>,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ListEntry {
    inode: u32,
    status: String,
    paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SummaryOutput {
    directories: u64,
    regular_files: u64,
    symlinks: u64,
    damaged: u64,
    bad_inodes: u64,
    image_bytes: u64,
    unreadable_image_bytes: u64,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan { image } => scan_cmd(&image),
        Command::List { image, all, json } => list_cmd(&image, all, json),
        Command::Summary { image, json } => summary_cmd(&image, json),
        Command::Extract {
            image,
            target,
            path,
        } => extract_cmd(&image, &target, path.as_deref()),
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Damage map / image / tree acquisition ───────────────────────────────────

fn build_damage_map(args: &ImageArgs) -> Result<DamageMap> {
    let image_size = fs::metadata(&args.image)
        .with_context(|| format!("cannot stat image {}", args.image.display()))?
        .len();
    match &args.ddrescue_log {
        Some(log) => {
            let text = fs::read_to_string(log)
                .with_context(|| format!("cannot read ddrescue map {}", log.display()))?;
            let map = DamageMap::parse_ddrescue(&text, image_size)
                .with_context(|| format!("malformed ddrescue map {}", log.display()))?;
            info!(
                target: "e4s",
                bad_bytes = map.total_bad_bytes(),
                "ddrescue map loaded"
            );
            Ok(map)
        }
        None => Ok(DamageMap::all_good_map(image_size)),
    }
}

fn open_image(args: &ImageArgs, damage: DamageMap) -> Result<Ext4Image> {
    Ext4Image::open(&args.image, Arc::new(damage), CACHE_PAGES)
        .with_context(|| format!("cannot open {}", args.image.display()))
}

/// Identity strings recorded inside the cache file.
fn identity_lines(args: &ImageArgs) -> (String, String) {
    let image = args.image.display().to_string();
    let log = args
        .ddrescue_log
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    (image, log)
}

fn tree_cache_path(args: &ImageArgs) -> Option<PathBuf> {
    let dir = default_cache_dir()?;
    match cache_file_path(&dir, &args.image, args.ddrescue_log.as_deref()) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(target: "e4s", error = %err, "cannot derive tree cache path");
            None
        }
    }
}

/// Load the cached tree or run a full scan (writing a fresh cache).
fn acquire_tree(args: &ImageArgs) -> Result<(FileTree, bool)> {
    let cache_path = tree_cache_path(args);
    let (image_line, log_line) = identity_lines(args);

    if !args.force_scan {
        if let Some(path) = &cache_path {
            match load_tree(path, &image_line, &log_line) {
                Ok(Some(tree)) => {
                    info!(target: "e4s", path = %path.display(), "using cached scan");
                    return Ok((tree, true));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "e4s", error = %err, "tree cache unusable; rescanning");
                }
            }
        }
    }

    let damage = build_damage_map(args)?;
    let image = open_image(args, damage)?;
    let report = run_scan(&image, cache_path.as_deref())?;
    eprintln!(
        "scanned {} nodes ({} unreadable inodes{})",
        report.tree.len(),
        report.unreadable_inodes,
        if report.root_recovered {
            ", root directory recovered"
        } else {
            ""
        }
    );

    if let Some(path) = &cache_path {
        if let Err(err) = store_tree(&report.tree, path, &image_line, &log_line) {
            warn!(target: "e4s", error = %err, "could not write tree cache");
            let _ = remove_cache(path);
        }
    }
    Ok((report.tree, false))
}

/// Run the scan; a failed scan must not leave a stale cache behind.
fn run_scan(image: &Ext4Image, cache_path: Option<&Path>) -> Result<ScanReport> {
    let mut last_percent = u32::MAX;
    let result = scan(image, |current, total| {
        let percent = current * 100 / total.max(1);
        if percent != last_percent {
            last_percent = percent;
            eprint!("\rscanning inodes: {percent:3}%");
        }
        true
    });
    eprintln!();
    match result {
        Ok(report) => Ok(report),
        Err(err) => {
            if let Some(path) = cache_path {
                let _ = remove_cache(path);
            }
            Err(err).context("scan failed")
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn scan_cmd(args: &ImageArgs) -> Result<()> {
    let (tree, cached) = acquire_tree(args)?;
    print_summary_human(args, &tree, cached)
}

fn list_cmd(args: &ImageArgs, all: bool, json: bool) -> Result<()> {
    let (tree, _) = acquire_tree(args)?;

    let entries: Vec<ListEntry> = tree
        .iter()
        .filter(|node| all || !node.status().ok())
        .map(|node| ListEntry {
            inode: node.ino().0,
            status: status_letters(node.status()),
            paths: node_paths(&tree, node.ino()),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        for path in &entry.paths {
            println!("{} {:>8} {}", entry.status, entry.inode, path);
        }
    }
    Ok(())
}

fn summarize(args: &ImageArgs, tree: &FileTree) -> Result<SummaryOutput> {
    let damage = build_damage_map(args)?;
    let mut out = SummaryOutput {
        directories: 0,
        regular_files: 0,
        symlinks: 0,
        damaged: 0,
        bad_inodes: 0,
        image_bytes: damage.image_size(),
        unreadable_image_bytes: damage.total_bad_bytes(),
    };
    for node in tree.iter() {
        match node {
            FileNode::Directory(_) => out.directories += 1,
            FileNode::RegularFile(_) => out.regular_files += 1,
            FileNode::SymbolicLink(_) => out.symlinks += 1,
        }
        let status = node.status();
        if !status.ok() {
            out.damaged += 1;
        }
        if status.contains(e4s_tree::FileStatus::BAD_INODE) {
            out.bad_inodes += 1;
        }
    }
    Ok(out)
}

fn print_summary_human(args: &ImageArgs, tree: &FileTree, cached: bool) -> Result<()> {
    let summary = summarize(args, tree)?;
    if cached {
        println!("(from tree cache)");
    }
    println!(
        "{} directories, {} files, {} symlinks",
        summary.directories, summary.regular_files, summary.symlinks
    );
    println!(
        "{} damaged ({} with unreadable inodes)",
        summary.damaged, summary.bad_inodes
    );
    println!(
        "{} of {} image bytes unreadable",
        summary.unreadable_image_bytes, summary.image_bytes
    );
    Ok(())
}

fn summary_cmd(args: &ImageArgs, json: bool) -> Result<()> {
    let (tree, cached) = acquire_tree(args)?;
    if json {
        let summary = summarize(args, &tree)?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    print_summary_human(args, &tree, cached)
}

// ── Extraction ──────────────────────────────────────────────────────────────

fn extract_cmd(args: &ImageArgs, target: &Path, prefix: Option<&str>) -> Result<()> {
    let (tree, _) = acquire_tree(args)?;
    let damage = build_damage_map(args)?;
    let image = open_image(args, damage)?;

    if target.exists() && !target.is_dir() {
        bail!("extraction target {} is not a directory", target.display());
    }
    fs::create_dir_all(target)?;

    let mut extracted = 0_u64;
    let mut flagged = 0_u64;
    for node in tree.iter() {
        for path in node_paths(&tree, node.ino()) {
            if let Some(prefix) = prefix {
                if !path.starts_with(prefix) {
                    continue;
                }
            }
            let dest = target.join(path.trim_start_matches('/'));
            match node {
                FileNode::Directory(_) => {
                    fs::create_dir_all(&dest)?;
                }
                FileNode::RegularFile(_) => {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    extract_file(&image, node.ino(), node.common().size, &dest)?;
                }
                FileNode::SymbolicLink(link) => {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let resolved = link.target.clone().or_else(|| {
                        let view = image.inode(node.ino()).ok()?;
                        image.symlink_target(&view)
                    });
                    match resolved {
                        Some(target_path) => make_symlink(&target_path, &dest)?,
                        None => {
                            warn!(
                                target: "e4s",
                                inode = node.ino().0,
                                "symlink target unreadable; skipped"
                            );
                            continue;
                        }
                    }
                }
            }
            let status = node.status();
            if !status.ok() {
                flagged += 1;
                apply_status_xattr(&dest, &status_letters(status));
            }
            extracted += 1;
        }
    }

    println!(
        "extracted {extracted} entries into {} ({flagged} flagged damaged)",
        target.display()
    );
    Ok(())
}

/// Copy a file's surviving bytes; unmapped and unreachable ranges stay zero.
fn extract_file(image: &Ext4Image, ino: InodeNumber, size: u64, dest: &Path) -> Result<()> {
    let mut out = fs::File::create(dest)
        .with_context(|| format!("cannot create {}", dest.display()))?;
    out.set_len(size)?;

    let view = match image.inode(ino) {
        Ok(view) if view.ok() => view,
        _ => return Ok(()), // nothing recoverable beyond the empty shell
    };

    let bs = u64::from(image.block_size().get());
    for extent in image.extents(&view).filter(|e| e.ok && e.block_count > 0) {
        let logical_start = u64::from(extent.logical_block) * bs;
        if logical_start >= size {
            continue;
        }
        let mapped = image
            .cache()
            .map_extent(BlockNumber(extent.physical_block), u64::from(extent.block_count))?;
        let take = mapped.data().len().min((size - logical_start) as usize);
        let mut data = mapped.data()[..take].to_vec();
        // The on-disk bytes of unreadable ranges are stale garbage from
        // the rescue; they extract as zeros, like holes.
        if !mapped.ok() {
            zero_unreadable_ranges(&mut data, extent.physical_block * bs, image.damage());
        }
        out.seek(SeekFrom::Start(logical_start))?;
        out.write_all(&data)?;
        debug!(
            target: "e4s::extract",
            inode = ino.0,
            logical_start,
            bytes = take,
            intact = mapped.ok(),
            "extent copied"
        );
    }
    Ok(())
}

/// Zero the sub-ranges of `buf` (starting at image offset `start`) that the
/// damage map marks unreadable.
fn zero_unreadable_ranges(buf: &mut [u8], start: u64, damage: &DamageMap) {
    let end = start + buf.len() as u64;
    for region in damage.regions() {
        if region.good || region.end() <= start {
            continue;
        }
        if region.position >= end {
            break;
        }
        let lo = (region.position.max(start) - start) as usize;
        let hi = (region.end().min(end) - start) as usize;
        buf[lo..hi].fill(0);
    }
    // Anything past the damage map's coverage never existed in the image.
    let image_size = damage.image_size();
    if image_size < end {
        let lo = image_size.saturating_sub(start) as usize;
        buf[lo..].fill(0);
    }
}

#[cfg(unix)]
fn make_symlink(target_path: &str, dest: &Path) -> Result<()> {
    // Re-extraction over an existing tree replaces old links.
    let _ = fs::remove_file(dest);
    std::os::unix::fs::symlink(target_path, dest)
        .with_context(|| format!("cannot create symlink {}", dest.display()))
}

#[cfg(not(unix))]
fn make_symlink(target_path: &str, dest: &Path) -> Result<()> {
    fs::write(dest, target_path).with_context(|| format!("cannot write {}", dest.display()))
}

/// Record the damage letters on the extracted entry; best effort only.
fn apply_status_xattr(dest: &Path, letters: &str) {
    if let Err(err) = xattr::set(dest, "user.e4s.status", letters.as_bytes()) {
        debug!(
            target: "e4s::extract",
            path = %dest.display(),
            error = %err,
            "could not set status xattr"
        );
    }
}
