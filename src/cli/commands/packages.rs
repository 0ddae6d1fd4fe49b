use clap::Args;

#[derive(Args)]
pub struct PackagesCommand {
    /// Only list packages of this remote service
    #[arg(long)]
    pub service: Option<String>,
}
