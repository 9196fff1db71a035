use clap::{Parser, Subcommand};
use ember_runtime::{Runtime, RuntimeConfig};
use std::error::Error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a disk image and run its init program
    Run {
        /// Path to the filesystem image
        #[arg(short, long)]
        disk: PathBuf,

        /// Name of the init executable on the image
        #[arg(short, long, default_value = "init")]
        init: String,

        /// Guest memory size in bytes
        #[arg(long, default_value_t = 8 * 1024 * 1024)]
        memory: usize,

        /// mtime ticks per executed instruction
        #[arg(long, default_value_t = 100)]
        mtime_step: u64,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            disk,
            init,
            memory,
            mtime_step,
        } => {
            let image = Runtime::load_disk(&disk)?;
            let mut runtime = Runtime::new(
                image,
                RuntimeConfig {
                    memory_size: memory,
                    mtime_step,
                    init,
                    echo_console: true,
                },
            )?;
            let exit = runtime.run()?;
            println!("\nmachine exited: {exit:?}");
        }
    }

    Ok(())
}
