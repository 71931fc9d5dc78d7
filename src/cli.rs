use clap::Parser;

#[derive(Parser)]
#[command(name = "coastguard")]
#[command(about = "Cross-cluster ingress NetworkPolicy translator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Colon-separated list of kubeconfig paths with embedded authinfo
    #[arg(long, env = "KUBECONFIG", default_value = "")]
    pub kubeconfig: String,

    /// Kubeconfig context of a dataplane cluster (use several times)
    #[arg(long = "dp-context")]
    pub dp_contexts: Vec<String>,
}
