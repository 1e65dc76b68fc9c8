// chorus - Broadcast-ringing SIP proxy
// Copyright (C) 2025 Chorus Contributors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! chorusd: stateful broadcast-ringing SIP proxy over UDP.
//!
//! REGISTER terminates locally against the SQLite user directory; INVITEs to
//! broadcast addresses ring every configured contact in parallel; everything
//! else is proxied statefully between the downstream and upstream sides.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sip_proxy::{BroadcastPolicy, BroadcastRule, Proxy, ProxyConfig};
use sip_registrar::{DirectoryStore, Registrar};
use sip_routing::{RouteMemory, UpstreamResolver};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use userdir::SqliteDirectory;

mod admin;
mod stack;

const USER_LOAD_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// UDP address to listen on for downstream clients (host:port)
    #[arg(long, default_value = "0.0.0.0:5060")]
    listen: String,
    /// Upstream SIP server UDP address (host:port), used as default fallback
    #[arg(long)]
    upstream: Option<String>,
    /// Local UDP address to use for upstream traffic
    #[arg(long, default_value = "0.0.0.0:0")]
    upstream_bind: String,
    /// How long to remember downstream transaction routes, in seconds
    #[arg(long, default_value_t = 300, value_name = "SECONDS")]
    route_ttl: u64,
    /// Path to the SQLite database containing the SIP user directory
    #[arg(long)]
    user_db: PathBuf,
    /// HTTP address for the admin web UI (requires admin credentials)
    #[arg(long)]
    http_listen: Option<String>,
    /// Username required for the admin web UI
    #[arg(long)]
    admin_user: Option<String>,
    /// Password required for the admin web UI
    #[arg(long)]
    admin_pass: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    let admin_config = match (&args.http_listen, &args.admin_user, &args.admin_pass) {
        (Some(listen), Some(user), Some(pass)) => Some(admin::AdminConfig {
            listen: listen.clone(),
            admin_user: user.clone(),
            admin_pass: pass.clone(),
        }),
        (None, None, None) => None,
        _ => bail!("--http-listen, --admin-user, and --admin-pass must be set together"),
    };

    let directory = SqliteDirectory::open(&args.user_db)
        .await
        .with_context(|| format!("open user database {}", args.user_db.display()))?;

    let users = tokio::time::timeout(USER_LOAD_TIMEOUT, directory.list_users())
        .await
        .context("timed out loading user directory")?
        .with_context(|| format!("load users from {}", args.user_db.display()))?;
    info!(
        count = users.len(),
        path = %args.user_db.display(),
        "loaded user directory entries"
    );

    let rules = directory
        .list_broadcast_rules()
        .await
        .context("load broadcast rules")?;
    let policy = BroadcastPolicy::new(
        rules
            .into_iter()
            .map(|rule| BroadcastRule {
                address: rule.address,
                targets: rule.targets.into_iter().map(|t| t.contact_uri).collect(),
            })
            .collect(),
    );
    info!(rules = policy.rule_count(), "loaded broadcast rules");

    let default_upstream: Option<SocketAddr> = match &args.upstream {
        Some(upstream) => Some(
            tokio::net::lookup_host(upstream.as_str())
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .with_context(|| format!("resolve upstream address {}", upstream))?,
        ),
        None => None,
    };

    let store: Arc<dyn DirectoryStore> = Arc::new(directory.clone());
    let registrar = Arc::new(Registrar::new(store));
    let resolver = Arc::new(UpstreamResolver::new(
        &users,
        Arc::clone(&registrar),
        default_upstream,
    ));
    let routes = Arc::new(RouteMemory::new(Duration::from_secs(args.route_ttl)));

    let proxy = Arc::new(Proxy::new(ProxyConfig {
        registrar: Some(registrar),
        broadcast: Some(Arc::new(policy)),
        ..ProxyConfig::default()
    }));

    let shutdown = CancellationToken::new();
    let sip_stack = stack::SipStack::start(
        stack::StackConfig {
            listen: args.listen.clone(),
            upstream_bind: args.upstream_bind.clone(),
        },
        Arc::clone(&proxy),
        resolver,
        routes,
        shutdown.clone(),
    )
    .await?;

    let admin_task = admin_config.map(|config| {
        let directory = directory.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = admin::serve(directory, config, shutdown).await {
                warn!(error = %err, "admin web UI exited");
            }
        })
    });

    wait_for_shutdown_signal().await;
    info!("shutdown requested, stopping proxy");
    shutdown.cancel();

    if let Some(task) = admin_task {
        if tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!("admin web UI did not stop in time");
        }
    }
    proxy.stop().await;
    sip_stack.join().await;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = interrupt.await;
                return;
            }
        };
        tokio::select! {
            _ = interrupt => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
}
