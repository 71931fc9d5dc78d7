use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;

use crate::controller::Controller;

/* ============================= CONFIG ============================= */

/// Startup configuration for cluster discovery, parsed once from the CLI and
/// passed down explicitly.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Kubeconfig paths to try, in order, for every context.
    pub kubeconfigs: Vec<PathBuf>,

    /// One kubeconfig context per dataplane cluster; the context name doubles
    /// as the cluster ID.
    pub contexts: Vec<String>,
}

impl DiscoveryConfig {
    /// `kubeconfig` is a colon-separated path list, matching the KUBECONFIG
    /// environment convention.
    pub fn new(kubeconfig: &str, contexts: Vec<String>) -> Self {
        let kubeconfigs = kubeconfig
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();

        Self {
            kubeconfigs,
            contexts,
        }
    }
}

/* ============================= DISCOVERY ============================= */

/// Resolve every configured dataplane context to a client and hand it to the
/// controller. Any failure here is fatal: a misconfigured cluster list is an
/// operator error, not something to limp along with.
pub async fn start(config: &DiscoveryConfig, controller: &Arc<Controller>) -> Result<()> {
    if config.contexts.is_empty() {
        bail!("no dataplane contexts configured, use --dp-context at least once");
    }
    if config.kubeconfigs.is_empty() {
        bail!("no kubeconfig available, set --kubeconfig or KUBECONFIG");
    }

    for context in &config.contexts {
        let client = client_for_context(&config.kubeconfigs, context)
            .await
            .with_context(|| format!("loading client config for context {context}"))?;

        info!(cluster = %context, "discovered cluster from parameters");
        controller.on_add(context, client).await;
    }

    Ok(())
}

/// Try each kubeconfig path in order; first one that knows the context wins.
async fn client_for_context(paths: &[PathBuf], context: &str) -> Result<Client> {
    let mut errors = Vec::new();

    for path in paths {
        match client_from_file(path, context).await {
            Ok(client) => return Ok(client),
            Err(e) => errors.push(format!("{}: {e:#}", path.display())),
        }
    }

    bail!(
        "no kubeconfig matched context {context}: [{}]",
        errors.join("; ")
    )
}

async fn client_from_file(path: &Path, context: &str) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("reading kubeconfig {}", path.display()))?;

    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };

    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .context("building client config")?;

    Ok(Client::try_from(config)?)
}

/* ============================= TESTS ============================= */
