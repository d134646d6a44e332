//! machtree - inspect Mach-O binaries, fat binaries and dyld shared caches.
//!
//! Prints the node tree of a file, or one decoded table of each image in it.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use machtree::dyld_info::Export;
use machtree::{
    parse_file, BindKind, ExportKind, MachImage, NodeId, NodeTree, OutOfRangePolicy, ParseOptions,
};

/// Inspect Mach-O binaries, fat binaries and dyld shared caches.
#[derive(Parser, Debug)]
#[command(name = "machtree")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "1", global = true)]
    verbosity: u8,

    /// Leave out fixups that fall outside their segment instead of keeping them
    #[arg(long, global = true)]
    drop_out_of_range: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the node tree of a file
    Info {
        /// Show warnings attached to each node
        #[arg(short, long)]
        warnings: bool,

        /// File to parse
        path: PathBuf,
    },

    /// List the symbol table of each image
    Symbols {
        /// Only images whose architecture contains this string
        #[arg(short, long)]
        arch: Option<String>,

        /// File to parse
        path: PathBuf,
    },

    /// List bind actions of each image
    Binds {
        /// Only images whose architecture contains this string
        #[arg(short, long)]
        arch: Option<String>,

        /// Include weak binds
        #[arg(long)]
        weak: bool,

        /// Include lazy binds
        #[arg(long)]
        lazy: bool,

        /// File to parse
        path: PathBuf,
    },

    /// List rebase actions of each image
    Rebases {
        /// Only images whose architecture contains this string
        #[arg(short, long)]
        arch: Option<String>,

        /// File to parse
        path: PathBuf,
    },

    /// List or look up exported symbols of each image
    Exports {
        /// Only images whose architecture contains this string
        #[arg(short, long)]
        arch: Option<String>,

        /// Look up a single symbol instead of listing all
        #[arg(short, long)]
        lookup: Option<String>,

        /// File to parse
        path: PathBuf,
    },

    /// Show a dyld shared cache and its images
    Cache {
        /// Filter images by path substring
        #[arg(short, long)]
        filter: Option<String>,

        /// Show header addresses
        #[arg(short = 'A', long)]
        addresses: bool,

        /// Parse and summarize the image with this install path
        #[arg(short, long)]
        image: Option<String>,

        /// Path to the cache file
        path: PathBuf,
    },

    /// Parse an image mapped in a live process
    Process {
        /// Process id
        pid: u32,

        /// Header address (hex, e.g., 0x100000000)
        address: String,
    },

    /// Summarize many files in parallel
    Scan {
        /// Number of parallel jobs (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Files to parse
        paths: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    let options = ParseOptions {
        out_of_range: if cli.drop_out_of_range {
            OutOfRangePolicy::Drop
        } else {
            OutOfRangePolicy::PassThrough
        },
        ..Default::default()
    };

    match cli.command {
        Commands::Info { path, warnings } => cmd_info(&path, options, warnings),
        Commands::Symbols { path, arch } => cmd_symbols(&path, options, arch.as_deref()),
        Commands::Binds {
            path,
            arch,
            weak,
            lazy,
        } => cmd_binds(&path, options, arch.as_deref(), weak, lazy),
        Commands::Rebases { path, arch } => cmd_rebases(&path, options, arch.as_deref()),
        Commands::Exports { path, arch, lookup } => {
            cmd_exports(&path, options, arch.as_deref(), lookup.as_deref())
        }
        Commands::Cache {
            path,
            filter,
            addresses,
            image,
        } => cmd_cache(&path, options, filter.as_deref(), addresses, image.as_deref()),
        Commands::Process { pid, address } => cmd_process(pid, &address, options),
        Commands::Scan { paths, jobs } => cmd_scan(&paths, options, jobs),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn open(path: &Path, options: ParseOptions) -> Result<(NodeTree, NodeId)> {
    let start = Instant::now();
    let parsed = parse_file(path, options)
        .with_context(|| format!("Failed to parse: {}", path.display()))?;
    info!(
        "Parsed {} ({} nodes) in {:.2}s",
        path.display(),
        parsed.0.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(parsed)
}

/// Collects every image in the tree, depth first, keeping those whose
/// architecture matches `arch`.
fn images(tree: &NodeTree, arch: Option<&str>) -> Vec<NodeId> {
    let mut found = Vec::new();
    let mut stack = vec![tree.root()];
    while let Some(id) = stack.pop() {
        let node = tree.get(id);
        if let Some(image) = node.as_mach_image() {
            if arch.map_or(true, |arch| image.arch_name().contains(arch)) {
                found.push(id);
            }
        }
        stack.extend(node.children().into_iter().rev());
    }
    found
}

fn image_title(tree: &NodeTree, id: NodeId) -> String {
    let node = tree.get(id);
    match node.as_mach_image() {
        Some(image) => format!(
            "{} {} at {:#x}{}",
            image.arch_name(),
            image.filetype_name(),
            image.address,
            image
                .install_name
                .as_ref()
                .map(|name| format!(" ({name})"))
                .unwrap_or_default()
        ),
        None => format!("{id}"),
    }
}

fn cmd_info(path: &Path, options: ParseOptions, show_warnings: bool) -> Result<()> {
    let (tree, _) = open(path, options)?;
    print_node(&tree, tree.root(), 0, show_warnings);
    Ok(())
}

fn print_node(tree: &NodeTree, id: NodeId, depth: usize, show_warnings: bool) {
    let node = tree.get(id);
    let indent = "  ".repeat(depth);
    let range = node
        .range()
        .map(|range| {
            let mut text = String::new();
            if let Some(context) = range.context {
                text.push_str(&format!(" @{:#x}+{:#x}", context.address, context.size));
            }
            if let Some(vm) = range.vm {
                text.push_str(&format!(" vm {:#x}+{:#x}", vm.address, vm.size));
            }
            text
        })
        .unwrap_or_default();
    println!("{indent}{}{range}{}", node.class(), describe(tree, id));

    if show_warnings {
        for warning in node.warnings().iter() {
            println!("{indent}  ! {warning}");
        }
    } else if !node.warnings().is_empty() {
        warn!("{} {}: {} warnings", node.class(), id, node.warnings().len());
    }

    for child in node.children() {
        print_node(tree, child, depth + 1, show_warnings);
    }
}

fn describe(tree: &NodeTree, id: NodeId) -> String {
    let node = tree.get(id);
    if let Some(image) = node.as_mach_image() {
        format!(" {} {} slide {:#x}", image.arch_name(), image.filetype_name(), image.slide)
    } else if let Some(arch) = node.as_fat_arch() {
        format!(" {}", arch.arch_name())
    } else if let Some(command) = node.as_load_command() {
        format!(" {}", command.name())
    } else if let Some(segment) = node.as_segment() {
        format!(" {}", segment.name)
    } else if let Some(section) = node.as_section() {
        format!(" {}", section.full_name())
    } else if let Some(table) = node.as_symbol_table() {
        format!(" {} symbols", table.symbols.len())
    } else if let Some(rebases) = node.as_rebase_info() {
        format!(" {} actions", rebases.actions.len())
    } else if let Some(binds) = node.as_bind_info() {
        format!(" {} {} actions", binds.actions.len(), binds.kind.name())
    } else if let Some(trie) = node.as_export_trie() {
        format!(" {} exports", trie.exports.len())
    } else if let Some(cache) = node.as_shared_cache() {
        format!(" {} {} images", cache.architecture(), cache.image_count())
    } else if let Some(string) = node.as_cstring() {
        format!(" {:?}", string.value())
    } else {
        String::new()
    }
}

fn cmd_symbols(path: &Path, options: ParseOptions, arch: Option<&str>) -> Result<()> {
    let (tree, _) = open(path, options)?;
    for image in images(&tree, arch) {
        println!("{}:", image_title(&tree, image));
        let Some(table) = MachImage::symbol_table(&tree, image) else {
            continue;
        };
        let node = tree.get(table);
        let Some(table) = node.as_symbol_table() else {
            continue;
        };
        for symbol in &table.symbols {
            println!(
                "  {:#018x} {:02x} {:>3} {:?} {}",
                symbol.value, symbol.n_type, symbol.n_sect, symbol.kind, symbol.name
            );
        }
    }
    Ok(())
}

fn cmd_binds(
    path: &Path,
    options: ParseOptions,
    arch: Option<&str>,
    weak: bool,
    lazy: bool,
) -> Result<()> {
    let (tree, _) = open(path, options)?;
    let mut kinds = vec![BindKind::Regular];
    if weak {
        kinds.push(BindKind::Weak);
    }
    if lazy {
        kinds.push(BindKind::Lazy);
    }

    for image in images(&tree, arch) {
        println!("{}:", image_title(&tree, image));
        for kind in &kinds {
            let Some(info) = MachImage::bind_info(&tree, image, *kind) else {
                continue;
            };
            let node = tree.get(info);
            let Some(info) = node.as_bind_info() else {
                continue;
            };
            for action in &info.actions {
                let address = action
                    .address
                    .map(|a| format!("{a:#018x}"))
                    .unwrap_or_else(|| format!("seg{}+{:#x}", action.segment_index, action.segment_offset));
                let ordinal = action
                    .library_ordinal
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<9} {} {:>3} {}{:+}",
                    kind.name(),
                    address,
                    ordinal,
                    action.symbol_name,
                    action.addend
                );
            }
            if let Some(error) = &info.error {
                warn!("{} stopped early: {}", kind.name(), error);
            }
        }
    }
    Ok(())
}

fn cmd_rebases(path: &Path, options: ParseOptions, arch: Option<&str>) -> Result<()> {
    let (tree, _) = open(path, options)?;
    for image in images(&tree, arch) {
        println!("{}:", image_title(&tree, image));
        let Some(info) = MachImage::rebase_info(&tree, image) else {
            continue;
        };
        let node = tree.get(info);
        let Some(info) = node.as_rebase_info() else {
            continue;
        };
        for action in &info.actions {
            match action.address {
                Some(address) => print!("  {address:#018x} type {}", action.rebase_type),
                None => print!(
                    "  seg{}+{:#x} type {}",
                    action.segment_index, action.segment_offset, action.rebase_type
                ),
            }
            match action.target {
                Some(target) => println!(" -> {target:#x}"),
                None => println!(),
            }
        }
        if info.dropped > 0 {
            info!("{} out-of-range rebases dropped", info.dropped);
        }
    }
    Ok(())
}

fn print_export(export: &Export) {
    match &export.kind {
        ExportKind::Regular { address } => println!("  {address:#018x} {}", export.name),
        ExportKind::ReExport {
            ordinal,
            imported_name,
        } => println!(
            "  re-export #{ordinal} {}{}",
            export.name,
            imported_name
                .as_ref()
                .map(|name| format!(" as {name}"))
                .unwrap_or_default()
        ),
        ExportKind::StubAndResolver {
            stub_offset,
            resolver_offset,
        } => println!(
            "  {stub_offset:#018x} {} (resolver {resolver_offset:#x})",
            export.name
        ),
    }
}

fn cmd_exports(
    path: &Path,
    options: ParseOptions,
    arch: Option<&str>,
    lookup: Option<&str>,
) -> Result<()> {
    let (tree, _) = open(path, options)?;
    for image in images(&tree, arch) {
        println!("{}:", image_title(&tree, image));
        let Some(trie) = MachImage::export_trie(&tree, image) else {
            continue;
        };
        let node = tree.get(trie);
        let Some(trie) = node.as_export_trie() else {
            continue;
        };
        match lookup {
            Some(name) => match trie.lookup(name, &tree.options().export_terminals)? {
                Some(export) => print_export(&export),
                None => println!("  {name} not exported"),
            },
            None => trie.exports.iter().for_each(print_export),
        }
    }
    Ok(())
}

fn cmd_cache(
    path: &Path,
    options: ParseOptions,
    filter: Option<&str>,
    addresses: bool,
    image: Option<&str>,
) -> Result<()> {
    let (tree, top) = open(path, options)?;
    let node = tree.get(top);
    let Some(cache) = node.as_shared_cache() else {
        bail!("Not a dyld shared cache: {}", path.display());
    };

    if let Some(name) = image {
        let entry = cache
            .image_named(&tree, top, name)
            .with_context(|| format!("Image not found: {name}"))?;
        let id = entry
            .header
            .pointee(&tree)
            .into_result()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .with_context(|| format!("Image has no header: {name}"))?;
        print_node(&tree, id, 0, true);
        return Ok(());
    }

    println!("Dyld Shared Cache Information");
    println!("==============================");
    println!("Path:         {}", path.display());
    println!("Architecture: {}", cache.architecture());
    println!("UUID:         {}", cache.uuid());
    println!("Images:       {}", cache.image_count());
    println!("Mappings:     {}", cache.mappings.len());

    println!("\nMappings:");
    for (i, mapping) in cache.mappings.iter().enumerate() {
        println!(
            "  [{:2}] {:#018x} - {:#018x} ({:>8}) file {:#x}{}",
            i,
            mapping.address,
            mapping.address.saturating_add(mapping.size),
            format_size(mapping.size),
            mapping.file_offset,
            if mapping.slide_info_file_size > 0 {
                " [slide]"
            } else {
                ""
            }
        );
    }

    println!("\nImages:");
    for entry in cache.images(&tree, top) {
        let path = entry.path_string(&tree).unwrap_or_else(|| "?".to_string());
        if filter.is_some_and(|f| !path.contains(f)) {
            continue;
        }
        if addresses {
            println!("  {:#018x}  {}", entry.info.address, path);
        } else {
            println!("  {path}");
        }
    }

    for warning in node.warnings().iter() {
        warn!("{warning}");
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn cmd_process(pid: u32, address: &str, options: ParseOptions) -> Result<()> {
    let digits = address.trim_start_matches("0x").trim_start_matches("0X");
    let address = u64::from_str_radix(digits, 16)
        .with_context(|| format!("Invalid address: {address}"))?;
    let (tree, image) = machtree::parse_process(pid, address, options)
        .with_context(|| format!("Failed to parse image at {address:#x} in process {pid}"))?;
    print_node(&tree, image, 0, true);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn cmd_process(_pid: u32, _address: &str, _options: ParseOptions) -> Result<()> {
    bail!("Reading process memory is only supported on Linux");
}

/// One line of `scan` output.
struct ScanSummary {
    path: PathBuf,
    outcome: Result<String>,
}

fn summarize(path: &Path, options: ParseOptions) -> Result<String> {
    let (tree, top) = parse_file(path, options)?;
    let image_count = images(&tree, None).len();
    let warning_count = count_warnings(&tree, tree.root());
    Ok(format!(
        "{} with {} images, {} nodes, {} warnings",
        tree.get(top).class(),
        image_count,
        tree.len(),
        warning_count
    ))
}

fn count_warnings(tree: &NodeTree, id: NodeId) -> usize {
    let node = tree.get(id);
    let own = node.warnings().len();
    own + node
        .children()
        .into_iter()
        .map(|child| count_warnings(tree, child))
        .sum::<usize>()
}

fn cmd_scan(paths: &[PathBuf], options: ParseOptions, jobs: Option<usize>) -> Result<()> {
    if paths.is_empty() {
        bail!("No files given");
    }

    // Configure thread pool
    if let Some(n) = jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .ok();
    }

    let start = Instant::now();
    let summaries: Vec<ScanSummary> = paths
        .par_iter()
        .map(|path| ScanSummary {
            path: path.clone(),
            outcome: summarize(path, options.clone()),
        })
        .collect();

    let mut failed = 0;
    for summary in &summaries {
        match &summary.outcome {
            Ok(text) => println!("{}: {}", summary.path.display(), text),
            Err(e) => {
                failed += 1;
                println!("{}: error: {:#}", summary.path.display(), e);
            }
        }
    }

    info!(
        "Scanned {}/{} files in {:.2}s",
        summaries.len() - failed,
        summaries.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
