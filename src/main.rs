//! ocigraph CLI - container image graph store command line interface

use std::fs::{self, File};
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ocigraph::ops::{
    container_diff, create_container, filesystem, gc, image, import_tar, layer, list_containers,
    list_images, list_layers, remove_container, remove_image, resolve_container, start_container,
    stop_container, verify, CommandHooks, NoopHooks, RuntimeHooks,
};
use ocigraph::{
    resolve_image, tag_image, tags_for_image, Compression, Config, Distribution, Error, Graph,
};

#[derive(Parser)]
#[command(name = "ocigraph")]
#[command(about = "copy-on-write layer graph for container images")]
#[command(version)]
struct Cli {
    /// store root
    #[arg(short, long, global = true, env = "OCIGRAPH_ROOT", default_value = "/var/lib/ocigraph")]
    root: PathBuf,

    /// log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Dir,
    Zfs,
}

#[derive(Clone, Copy, ValueEnum)]
enum CompressionArg {
    Gzip,
    Zstd,
    Xz,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Gzip => Compression::Gzip,
            CompressionArg::Zstd => Compression::Zstd,
            CompressionArg::Xz => Compression::Xz,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new store at --root
    Init {
        #[arg(long, value_enum, default_value = "dir")]
        backend: BackendArg,

        /// parent zfs dataset for the zfs backend
        #[arg(long, default_value = "rpool/ocigraph")]
        dataset: String,

        /// layer compression used when saving archives
        #[arg(long, value_enum)]
        compression: Option<CompressionArg>,
    },

    /// create a base image from a rootfs tarball
    Import {
        tarball: PathBuf,

        #[arg(short, long)]
        tag: Option<String>,

        /// file holding the image config blob
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// list images
    Images,

    /// list layers
    Layers,

    /// show an image record
    Inspect {
        /// image tag, id or id prefix
        image: String,
    },

    /// point a tag at an image
    Tag { image: String, name: String },

    /// remove an image and the layers only it used
    Rmi { image: String },

    /// write an image to an archive
    Save { image: String, archive: PathBuf },

    /// register the image in an archive
    Load {
        archive: PathBuf,

        #[arg(short, long)]
        tag: Option<String>,
    },

    /// create a container from an image
    Create { image: String },

    /// mount a container and hand it to the runtime
    Start { id: String },

    /// stop a running container
    Stop { id: String },

    /// remove a container and its filesystem
    Rm { id: String },

    /// list containers
    Ps,

    /// show changes in a container's filesystem
    Diff { container: String },

    /// remove unreferenced layers, filesystems and blobs
    Gc {
        /// only report what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// check store integrity
    Verify,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn hooks(graph: &Graph) -> Box<dyn RuntimeHooks> {
    match CommandHooks::from_config(&graph.config().runtime) {
        Some(hooks) => Box::new(hooks),
        None => Box::new(NoopHooks),
    }
}

fn run(cli: Cli) -> ocigraph::Result<()> {
    let root = cli.root;

    match cli.command {
        Commands::Init {
            backend,
            dataset,
            compression,
        } => {
            let mut config = match backend {
                BackendArg::Dir => Config::default(),
                BackendArg::Zfs => Config::zfs(dataset),
            };
            if let Some(compression) = compression {
                config.distribution.compression = compression.into();
            }
            let graph = Graph::init(&root, config)?;
            println!(
                "initialized {} store at {}",
                graph.config().backend.kind,
                root.display()
            );
        }

        Commands::Import {
            tarball,
            tag,
            config,
        } => {
            let graph = Graph::open(&root)?;
            let config = match config {
                Some(path) => fs::read(&path).map_err(|e| Error::Io { path, source: e })?,
                None => b"{}".to_vec(),
            };
            let file = File::open(&tarball).map_err(|e| Error::Io {
                path: tarball.clone(),
                source: e,
            })?;
            let image = import_tar(&graph, BufReader::new(file), &config)?;
            if let Some(tag) = tag {
                tag_image(&graph, &tag, &image.id)?;
            }
            println!("{}", image.id);
        }

        Commands::Images => {
            let graph = Graph::open(&root)?;
            for image in list_images(&graph)? {
                let tags = tags_for_image(&graph, &image.id)?;
                println!(
                    "{}  {} layers  {}",
                    image.id.short(),
                    image.layers.len(),
                    if tags.is_empty() { "<none>".to_string() } else { tags.join(", ") }
                );
            }
        }

        Commands::Layers => {
            let graph = Graph::open(&root)?;
            for layer in list_layers(&graph)? {
                let parent = layer
                    .parent
                    .map(|p| p.short())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  parent {}  {} bytes  {} changes",
                    layer.id.short(),
                    parent,
                    layer.size_bytes,
                    layer.changeset.len()
                );
            }
        }

        Commands::Inspect { image: name } => {
            let graph = Graph::open(&root)?;
            let image = image(&graph, &resolve_image(&graph, &name)?)?;
            println!("{}", serde_json::to_string_pretty(&image)?);
            for id in &image.layers {
                let layer = layer(&graph, id)?;
                println!(
                    "layer {}  diff {}  {} bytes",
                    layer.id, layer.diff_id, layer.size_bytes
                );
            }
        }

        Commands::Tag { image, name } => {
            let graph = Graph::open(&root)?;
            let id = resolve_image(&graph, &image)?;
            tag_image(&graph, &name, &id)?;
            println!("tagged {} as {}", id.short(), name);
        }

        Commands::Rmi { image } => {
            let graph = Graph::open(&root)?;
            let id = resolve_image(&graph, &image)?;
            let removed = remove_image(&graph, &id)?;
            println!("removed image {} and {} layers", id.short(), removed.len());
        }

        Commands::Save { image, archive } => {
            let graph = Graph::open(&root)?;
            let id = resolve_image(&graph, &image)?;
            let saved = Distribution::for_graph(&graph).save(&graph, &id, &archive)?;
            println!(
                "saved {} ({} layers, {} bytes) to {}",
                saved.image.short(),
                saved.layers,
                saved.size,
                archive.display()
            );
        }

        Commands::Load { archive, tag } => {
            let graph = Graph::open(&root)?;
            let image = Distribution::for_graph(&graph).load(&graph, &archive, tag.as_deref())?;
            println!("{}", image.id);
        }

        Commands::Create { image } => {
            let graph = Graph::open(&root)?;
            let id = resolve_image(&graph, &image)?;
            let container = create_container(&graph, &id)?;
            println!("{}", container.id);
        }

        Commands::Start { id } => {
            let graph = Graph::open(&root)?;
            let id = resolve_container(&graph, &id)?;
            let container = start_container(&graph, hooks(&graph).as_ref(), &id)?;
            let fs = filesystem(&graph, &container.filesystem)?;
            println!("{}", fs.mount_path.display());
        }

        Commands::Stop { id } => {
            let graph = Graph::open(&root)?;
            let id = resolve_container(&graph, &id)?;
            stop_container(&graph, hooks(&graph).as_ref(), &id)?;
            println!("stopped {}", id.short());
        }

        Commands::Rm { id } => {
            let graph = Graph::open(&root)?;
            let id = resolve_container(&graph, &id)?;
            remove_container(&graph, &id)?;
            println!("removed {}", id.short());
        }

        Commands::Ps => {
            let graph = Graph::open(&root)?;
            for container in list_containers(&graph)? {
                println!(
                    "{}  {}  image {}",
                    container.id.short(),
                    container.state,
                    container.image.short()
                );
            }
        }

        Commands::Diff { container } => {
            let graph = Graph::open(&root)?;
            let id = resolve_container(&graph, &container)?;
            for change in container_diff(&graph, &id)?.changes() {
                println!("{} {}", change.kind.marker(), change.path);
            }
        }

        Commands::Gc { dry_run } => {
            let graph = Graph::open(&root)?;
            let stats = gc(&graph, dry_run)?;

            let action = if dry_run { "would remove" } else { "removed" };
            println!(
                "{} {} layers, {} filesystems, {} blobs, {} staging entries",
                action,
                stats.layers_removed,
                stats.filesystems_removed,
                stats.blobs_removed,
                stats.staging_removed
            );
            println!("freed {} bytes", stats.bytes_freed);
        }

        Commands::Verify => {
            let graph = Graph::open(&root)?;
            let report = verify(&graph)?;

            println!(
                "checked {} layers, {} images, {} blobs",
                report.layers_checked, report.images_checked, report.blobs_checked
            );
            for problem in &report.problems {
                println!("  {}", problem);
            }

            if report.is_ok() {
                println!("store is healthy");
            } else {
                return Err(Error::InvalidState(format!(
                    "store integrity check found {} problems",
                    report.problems.len()
                )));
            }
        }
    }

    Ok(())
}
