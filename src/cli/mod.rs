pub mod commands;
pub mod mount;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::Result;

#[derive(Parser)]
#[command(name = "remotefs-fuse")]
#[command(about = "Mount a remote HTTP-backed directory tree as a local filesystem")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mount the remote filesystem
    Mount {
        /// Server address: IP, host:port, or full URL
        server: String,

        /// Mount point (default: ~/mnt/remote-fs)
        mount_point: Option<PathBuf>,

        /// Detach and run in the background
        #[arg(long)]
        daemon: bool,

        /// Allow other users to access the filesystem
        #[arg(short, long)]
        allow_other: bool,

        /// Stay in the foreground (default)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point (default: the configured one)
        mount_point: Option<PathBuf>,

        /// Force unmount
        #[arg(short, long)]
        force: bool,
    },

    /// Signal the running daemon to unmount and exit
    Stop,

    /// Show mount and daemon status
    Status {
        /// Mount point to check (default: the configured one)
        #[arg(short, long)]
        mount_point: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        commands::init_logging(self.debug, self.verbose)?;

        match self.command {
            Commands::Mount {
                server,
                mount_point,
                daemon,
                allow_other,
                foreground,
            } => {
                mount::mount(
                    server,
                    mount_point,
                    daemon && !foreground,
                    allow_other,
                    self.config,
                )
                .await
            }
            Commands::Unmount { mount_point, force } => {
                mount::unmount(mount_point, force, self.config).await
            }
            Commands::Stop => commands::stop(self.config).await,
            Commands::Status { mount_point } => commands::status(mount_point, self.config).await,
            Commands::Completions { shell } => {
                commands::generate_completions(shell);
                Ok(())
            }
        }
    }
}
