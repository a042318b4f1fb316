use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dnsedge::cache::MessageCache;
use dnsedge::config::{Config, Env};
use dnsedge::errcoll::{ErrorCollector, StderrErrorCollector};
use dnsedge::filter::storage::{Storage, StorageConfig};
use dnsedge::filter::FilterEngine;
use dnsedge::geoip::EmptyGeoIp;
use dnsedge::pipeline::Pipeline;
use dnsedge::profile::InMemoryProfileDb;
use dnsedge::querylog::{EmptyQueryLog, FileSystemQueryLog, QueryLog};
use dnsedge::ratelimit::{AllowlistUpdater, RateLimiter};
use dnsedge::server::{self, dnscrypt::DnsCryptServer, Protocol, ServerGroup};
use dnsedge::upstream::{HealthChecker, Upstream};

/// Idle timeout for TCP/TLS sessions and QUIC connections.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request deadline on the HTTP surface.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let env = Env::read().context("reading environment")?;
    tracing_init(&env);

    if let Some(path) = &env.ssl_key_log_file {
        // rustls's KeyLogFile reads SSLKEYLOGFILE.
        std::env::set_var("SSLKEYLOGFILE", path);
    }

    let config = Arc::new(
        Config::try_from_file(&env.config_path)
            .with_context(|| format!("loading config from {}", env.config_path.display()))?,
    );

    let errcoll: Arc<dyn ErrorCollector> = Arc::new(StderrErrorCollector);
    if env.sentry_dsn != "stderr" {
        tracing::warn!(
            "SENTRY_DSN is set but no sentry sink is linked in; errors go to stderr",
        );
    }

    let ratelimiter = Arc::new(RateLimiter::new(&config.ratelimit));
    let cache = Arc::new(MessageCache::new(&config.cache));
    let engine = Arc::new(FilterEngine::new(config.filters.custom_filter_cache_size));

    let storage = Arc::new(Storage::new(
        StorageConfig {
            filter_index_url: env.filter_index_url.clone(),
            blocked_service_index_url: env.blocked_service_index_url.clone(),
            general_safe_search_url: env.general_safe_search_url.clone(),
            youtube_safe_search_url: env.youtube_safe_search_url.clone(),
            cache_dir: env.filter_cache_path.clone(),
            refresh_timeout: config.filters.refresh_timeout.as_duration(),
            safe_browsing_block_host: config.safe_browsing.block_host.clone(),
            adult_blocking_block_host: config.adult_blocking.block_host.clone(),
        },
        Arc::clone(&engine),
        Arc::clone(&errcoll),
    ));

    // Serve with whatever filters we can get; an unreachable index must not
    // keep the edge down.
    storage.refresh_with_timeout().await;
    tokio::spawn(Arc::clone(&storage).run(config.filters.refresh_interval.as_duration()));

    if let (Some(url), Some(interval)) = (
        env.consul_allowlist_url.clone(),
        config.ratelimit.allowlist.refresh_interval,
    ) {
        let updater = AllowlistUpdater::new(
            url,
            config.ratelimit.allowlist.list.iter().map(|c| c.0).collect(),
            Arc::clone(&ratelimiter),
            Arc::clone(&errcoll),
        );
        tokio::spawn(updater.run(interval.as_duration()));
    }

    let upstream = Arc::new(Upstream::new(&config.upstream));
    if config.upstream.healthcheck.enabled {
        let checker = HealthChecker::new(Arc::clone(&upstream), &config.upstream);
        tokio::spawn(checker.run());
    }

    let querylog: Arc<dyn QueryLog> = if config.query_log.enabled {
        Arc::new(FileSystemQueryLog::new(env.querylog_path.clone()))
    } else {
        Arc::new(EmptyQueryLog)
    };

    // The profile backend is an external service; without one configured
    // every query runs with the server group's filtering group alone.
    let profiles = Arc::new(InMemoryProfileDb::default());
    if env.backend_endpoint.is_some() {
        tracing::warn!("BACKEND_ENDPOINT is set but no backend client is linked in");
    }

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&config),
        Arc::clone(&ratelimiter),
        cache,
        Arc::clone(&engine),
        upstream,
        profiles,
        Arc::new(EmptyGeoIp),
        querylog,
        Arc::clone(&errcoll),
    ));

    let mut servers = JoinSet::new();
    for group_conf in &config.server_groups {
        let group = Arc::new(
            ServerGroup::from_config(group_conf, &config.filtering_groups)
                .with_context(|| format!("building server group {:?}", group_conf.name))?,
        );

        for srv in &group_conf.servers {
            let dnscrypt = match (&srv.protocol, &srv.dnscrypt) {
                (Protocol::DnsCrypt, Some(conf)) => Some(Arc::new(
                    DnsCryptServer::new(conf)
                        .with_context(|| format!("building dnscrypt server {:?}", srv.name))?,
                )),
                _ => None,
            };

            for &addr in &srv.bind_addresses {
                let pipeline = Arc::clone(&pipeline);
                let group = Arc::clone(&group);
                match srv.protocol {
                    Protocol::DnsUdp => {
                        servers.spawn(server::udp::serve(pipeline, group, addr));
                    }
                    Protocol::DnsTcp => {
                        servers.spawn(server::tcp::serve(
                            pipeline,
                            group,
                            addr,
                            STREAM_IDLE_TIMEOUT,
                        ));
                    }
                    Protocol::Tls => {
                        servers.spawn(server::tcp::serve_tls(
                            pipeline,
                            group,
                            addr,
                            STREAM_IDLE_TIMEOUT,
                        ));
                    }
                    Protocol::Https => {
                        servers.spawn(server::https::serve(
                            pipeline,
                            group,
                            addr,
                            HTTP_REQUEST_TIMEOUT,
                        ));
                    }
                    Protocol::Quic => {
                        servers.spawn(server::quic::serve(
                            pipeline,
                            group,
                            addr,
                            STREAM_IDLE_TIMEOUT,
                        ));
                    }
                    Protocol::DnsCrypt => {
                        // NB: unwrap is safe: validated in Config::validate.
                        let dnscrypt = Arc::clone(dnscrypt.as_ref().unwrap());
                        servers.spawn(dnscrypt.serve(pipeline, group, addr));
                    }
                }
            }
        }
    }

    tracing::info!("dnsedge started");

    let mut sigterm = unix_signal(SignalKind::terminate()).context("installing SIGTERM")?;
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("quitting from SIGTERM");
        }
        Some(finished) = servers.join_next() => {
            match finished {
                Ok(Ok(())) => anyhow::bail!("server exited unexpectedly"),
                Ok(Err(err)) => return Err(err).context("server failed"),
                Err(err) => return Err(err).context("server task panicked"),
            }
        }
    }

    if config.filters.refresh_on_shutdown {
        tracing::info!("final filter refresh before shutdown");
        storage.refresh_with_timeout().await;
    }

    tracing::info!("goodbye");
    Ok(())
}

fn tracing_init(env: &Env) {
    let default_level = if env.verbose { "dnsedge=debug" } else { "dnsedge=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_level.into());

    if env.log_timestamp {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().without_time())
            .with(filter)
            .init();
    }
}
