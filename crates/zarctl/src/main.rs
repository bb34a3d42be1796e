//! zarctl: build and inspect zar directory images.
//!
//! Write mode walks a directory tree (or replays a manifest) into a
//! single-file image; read mode maps an existing image and prints its
//! structure, optionally with file contents and a filter query.  Both
//! modes may be combined in one invocation; write runs first.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use zar::builder::{build_image, build_image_from_manifest};
use zar::reader::{ImageItem, ImageReader, Lookup};
use zar::walk::ManifestFormat;

/// Build and read zar directory images.
#[derive(Debug, Parser)]
#[command(name = "zarctl", version)]
struct Args {
    /// Root directory to generate the image from.
    #[arg(long, default_value = "./")]
    dir: PathBuf,

    /// Image file to read.
    #[arg(long, default_value = "test.img")]
    img: PathBuf,

    /// Output image name.
    #[arg(short = 'o', default_value = "test.img")]
    output: PathBuf,

    /// Generate an image.
    #[arg(short = 'w')]
    write: bool,

    /// Read an image.
    #[arg(short = 'r')]
    read: bool,

    /// Pad each file payload out to the next page boundary.
    #[arg(long = "pagealign")]
    page_align: bool,

    /// Show file contents while reading.
    #[arg(long)]
    detail: bool,

    /// Drive the build from a manifest instead of walking --dir.
    #[arg(long)]
    config: bool,

    /// Path to the manifest file.
    #[arg(long = "configPath", default_value = "")]
    config_path: PathBuf,

    /// Format of the manifest. Known: seq
    #[arg(long = "configFormat", default_value = "seq")]
    config_format: String,

    /// Query a path against the image's membership filter.
    #[arg(long)]
    lookup: Option<String>,
}

fn write_image(args: &Args) -> Result<()> {
    info!("root dir: {:?}", args.dir);

    if args.config {
        let format: ManifestFormat = args.config_format.parse()?;
        build_image_from_manifest(
            &args.config_path,
            &args.dir,
            &args.output,
            args.page_align,
            format,
        )
        .with_context(|| {
            format!(
                "building {:?} from manifest {:?}",
                args.output, args.config_path
            )
        })
    } else {
        build_image(&args.dir, &args.output, args.page_align)
            .with_context(|| format!("building {:?} from {:?}", args.output, args.dir))
    }
}

fn read_image(args: &Args) -> Result<()> {
    let reader =
        ImageReader::open(&args.img).with_context(|| format!("opening image {:?}", args.img))?;
    let descriptor = reader
        .read_descriptor()
        .with_context(|| format!("reading footer of {:?}", args.img))?;

    // The filter and entry blobs decode independently; report a failed
    // section and keep going with the other one.
    let filter = match reader.read_filter(&descriptor) {
        Ok(filter) => Some(filter),
        Err(err) => {
            eprintln!("cannot decode filter: {err}");
            None
        }
    };
    let entries = match reader.read_entries(&descriptor) {
        Ok(entries) => Some(entries),
        Err(err) => {
            eprintln!("cannot decode entries: {err}");
            None
        }
    };

    if let Some(entries) = &entries {
        reader.traverse(entries, args.detail, |item| match item {
            ImageItem::DirectoryOpen { name, depth } => {
                println!("{:1$}[folder] {name}", "", 2 * depth);
            }
            ImageItem::DirectoryClose { depth } => {
                println!("{:1$}[flag] leave folder", "", 2 * depth);
            }
            ImageItem::File { name, depth, data } => match data {
                Some(bytes) => println!(
                    "{:1$}[regular file] {name} (data: {2})",
                    "",
                    2 * depth,
                    String::from_utf8_lossy(bytes)
                ),
                None => println!("{:1$}[regular file] {name}", "", 2 * depth),
            },
            ImageItem::Symlink {
                name,
                target,
                depth,
            } => {
                println!("{:1$}[symlink] {name} -> {target}", "", 2 * depth);
            }
            ImageItem::Whiteout { name, depth } => {
                println!("{:1$}[whiteout] {name}", "", 2 * depth);
            }
        })?;
    }

    if let Some(path) = &args.lookup {
        match &filter {
            Some(filter) => match reader.lookup(filter, path) {
                Lookup::Absent => println!("{path}: definitely absent"),
                Lookup::MaybePresent => println!("{path}: maybe present"),
            },
            None => eprintln!("cannot answer lookup: the filter did not decode"),
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.write {
        write_image(&args)?;
    }

    if args.read {
        info!("img selected: {:?}", args.img);
        read_image(&args)?;
    }

    Ok(())
}
