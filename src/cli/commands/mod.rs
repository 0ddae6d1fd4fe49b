pub mod describe;
pub mod packages;
pub mod serve;

pub use describe::DescribeCommand;
pub use packages::PackagesCommand;
pub use serve::ServeCommand;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Interstellar server
    Serve(ServeCommand),
    /// List protocol packages available for discovery
    Packages(PackagesCommand),
    /// Show the stubs and methods of protocol packages
    Describe(DescribeCommand),
}
