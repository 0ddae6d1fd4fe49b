use clap::Args;

#[derive(Args)]
pub struct ServeCommand {
    /// Listen address in host:port format
    #[arg(long, value_name = "HOST:PORT")]
    pub listen: Option<String>,
}
