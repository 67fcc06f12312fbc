use camino::Utf8PathBuf;

#[derive(clap::Parser)]
pub(crate) struct Cli {
    /// Path to the configuration file
    #[clap(long, short)]
    pub(crate) config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    pub(crate) command: Commands,
}

#[derive(clap::Subcommand)]
pub(crate) enum Commands {
    /// Run the server
    Run,
    /// Scan the library once and exit
    Scan,
    /// Run an online backup of the database
    Backup,
}
