use clap::Args;

#[derive(Args)]
pub struct DescribeCommand {
    /// Package identifiers, e.g. grpc-userip-monolith
    #[arg(required = true)]
    pub packages: Vec<String>,
}
