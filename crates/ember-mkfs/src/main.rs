use clap::Parser;
use ember_fs::{ImageBuilder, MAX_DENTRIES, NAME_LEN};
use std::path::PathBuf;

/// Write a filesystem image: boot block, one inode per file in argument
/// order, then the files' data blocks.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Output image path
    image: PathBuf,

    /// Files to pack; each is stored under its file name
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    if cli.files.len() > MAX_DENTRIES {
        eprintln!("too many files: the boot block holds {MAX_DENTRIES} entries");
        std::process::exit(1);
    }

    let mut builder = ImageBuilder::new();
    for path in &cli.files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.is_empty() || name.len() > NAME_LEN {
            eprintln!("bad file name {path:?} (at most {NAME_LEN} bytes)");
            std::process::exit(1);
        }
        let data = std::fs::read(path)?;
        println!("{name}: {} bytes", data.len());
        builder = builder.file(name, &data);
    }

    let image = builder.build();
    std::fs::write(&cli.image, &image)?;
    println!(
        "wrote {} ({} bytes, {} blocks)",
        cli.image.display(),
        image.len(),
        image.len() / ember_fs::BLOCK_SIZE
    );
    Ok(())
}
