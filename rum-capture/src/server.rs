use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use diskqueue::QueueConfig;
use geoip::{GeoIpClient, GeoLookup};
use health::{HealthHandle, HealthRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cdn::{CdnResolver, DnsCnameLookup, ProviderTable};
use crate::config::Config;
use crate::enrich::Enricher;
use crate::feed::PrintFeeder;
use crate::ingest::IngestConfig;
use crate::replay::{
    DiskReplayQueue, ReplayFilter, ReplayIngest, ReplayQueue, UploadConfig, UploadWorker,
    WorkerGroup,
};
use crate::router::{self, RouterParts};
use crate::sourcemap::handlers::SourceMapState;
use crate::sourcemap::{SourceMapConfig, SourceMapStore};

const MIB: u64 = 1024 * 1024;

fn geo_lookup(config: &Config) -> anyhow::Result<Option<Arc<dyn GeoLookup + Send + Sync>>> {
    let Some(city_db) = &config.maxmind_db_path else {
        tracing::info!("MAXMIND_DB_PATH not set, geo tags stay unknown");
        return Ok(None);
    };
    let client = GeoIpClient::new(city_db, config.maxmind_isp_db_path.as_deref())
        .with_context(|| format!("failed to open GeoIP database {}", city_db.display()))?;
    let client: Arc<dyn GeoLookup + Send + Sync> = Arc::new(client);
    Ok(Some(client))
}

fn cdn_resolver(config: &Config) -> anyhow::Result<CdnResolver> {
    let providers = match &config.cdn.cdn_map {
        Some(raw) => ProviderTable::from_json(raw).context("invalid CDN_MAP")?,
        None => ProviderTable::builtin()?,
    };
    let lookup = DnsCnameLookup::from_system_conf()?;
    Ok(CdnResolver::new(
        Box::new(lookup),
        providers,
        config.cdn.cache_capacity,
        config.cdn.cache_ttl.0,
    ))
}

/// Keeps native extractions and the web cache in line with the archives on disk.
async fn scan_loop(
    store: Arc<SourceMapStore>,
    interval: Duration,
    liveness: HealthHandle,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let scanning = store.clone();
        match tokio::task::spawn_blocking(move || scanning.scan(true, false)).await {
            Ok(Ok(())) => liveness.report_healthy().await,
            Ok(Err(e)) => tracing::warn!("source map scan failed: {}", e),
            Err(e) => tracing::error!("source map scan task failed: {}", e),
        }
    }
}

async fn liveness_loop(handle: HealthHandle, cancel: CancellationToken) {
    loop {
        handle.report_healthy().await;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
        }
    }
}

struct Replay {
    ingest: Arc<ReplayIngest>,
    workers: WorkerGroup,
}

async fn start_replay(
    config: &Config,
    upload_url: &str,
    liveness: &HealthRegistry,
    cancel: &CancellationToken,
) -> anyhow::Result<Replay> {
    let settings = &config.replay;
    let upload_url = Url::parse(upload_url).context("invalid REPLAY_UPLOAD_URL")?;
    let filter = match &settings.filter_rules {
        Some(raw) => ReplayFilter::from_json(raw)?,
        None => ReplayFilter::default(),
    };
    let queue = DiskReplayQueue::open(QueueConfig {
        path: settings.cache_path.clone(),
        capacity_bytes: settings.cache_capacity_mib.saturating_mul(MIB),
        segment_bytes: settings.cache_segment_mib.saturating_mul(MIB),
        clear_on_start: settings.cache_clear_on_start,
    })
    .with_context(|| format!("failed to open replay queue {}", settings.cache_path.display()))?;
    let queue: Arc<dyn ReplayQueue + Send + Sync> = Arc::new(queue);

    let upload = UploadConfig {
        upload_url,
        global_tags: settings.global_tags.clone(),
        attempts: settings.upload_attempts.max(1),
        timeout: settings.upload_timeout.0,
        empty_queue_sleep: settings.empty_queue_sleep.0,
        retry_policy: config.retry_policy.policy(),
    };
    // a worker reports between uploads, which can take every attempt
    let deadline = (upload.timeout + config.retry_policy.maximum_interval.0)
        * upload.attempts
        + upload.empty_queue_sleep
        + Duration::from_secs(30);
    let worker_liveness = liveness.register("replay_workers", deadline).await;

    let mut uploaders = Vec::with_capacity(settings.workers);
    for _ in 0..settings.workers {
        let worker = UploadWorker::new(queue.clone(), upload.clone(), worker_liveness.clone())
            .context("failed to build the replay upload client")?;
        uploaders.push(Arc::new(worker));
    }
    let uploaders = Arc::new(uploaders);
    let workers = WorkerGroup::spawn(
        settings.workers,
        settings.max_worker_panics,
        worker_liveness,
        cancel.clone(),
        {
            let cancel = cancel.clone();
            move |id| {
                let worker = uploaders[id].clone();
                let cancel = cancel.clone();
                async move { worker.run(cancel).await }
            }
        },
    );

    let ingest = Arc::new(ReplayIngest {
        queue,
        filter,
        max_body_bytes: settings.max_body_bytes,
    });
    Ok(Replay { ingest, workers })
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new_with_strategy("liveness", config.healthcheck_strategy.clone());
    let cancel = CancellationToken::new();

    let store = Arc::new(SourceMapStore::new(SourceMapConfig {
        data_dir: config.sourcemap.data_dir.clone(),
        web_stale_after: config.sourcemap.web_stale_after.0,
        tool_concurrency: config.sourcemap.tool_concurrency,
        tool_timeout: config.sourcemap.tool_timeout.0,
        tools: config.sourcemap.tools(),
    }));
    ensure_platform_dirs(&store)?;
    let scan_interval = config.sourcemap.scan_interval.0;
    let scan_liveness = liveness
        .register("sourcemap_scan", scan_interval * 3)
        .await;
    tokio::spawn(scan_loop(
        store.clone(),
        scan_interval,
        scan_liveness,
        cancel.clone(),
    ));

    let http_liveness = liveness.register("http", Duration::from_secs(30)).await;
    tokio::spawn(liveness_loop(http_liveness, cancel.clone()));

    let enricher = Arc::new(Enricher::new(
        geo_lookup(&config)?,
        Arc::new(cdn_resolver(&config)?),
        store.clone(),
    ));

    let replay = match &config.replay.upload_url {
        Some(url) => Some(start_replay(&config, url, &liveness, &cancel).await?),
        None => {
            tracing::info!("REPLAY_UPLOAD_URL not set, session replay is disabled");
            None
        }
    };

    let parts = RouterParts {
        rum_endpoints: config.rum_endpoints.0.clone(),
        ingest: IngestConfig {
            app_id_allow_list: config.app_id_allow_list(),
            origin_ip_header: config.rum_origin_ip_header.clone(),
            max_inflated_bytes: config.rum_max_inflated_bytes,
        },
        enricher,
        sourcemaps: SourceMapState {
            store,
            upload_token: config.sourcemap.upload_token.clone(),
        },
        replay: replay
            .as_ref()
            .map(|r| (config.replay.endpoints.0.clone(), r.ingest.clone())),
        liveness,
    };
    let app = router::router(
        crate::time::SystemTime {},
        PrintFeeder {},
        parts,
        config.export_prometheus,
    );

    tracing::info!("listening on {:?}", listener.local_addr()?);
    let stopping = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        stopping.cancel();
    })
    .await?;

    cancel.cancel();
    if let Some(replay) = replay {
        replay.workers.join().await;
    }
    Ok(())
}

fn ensure_platform_dirs(store: &SourceMapStore) -> anyhow::Result<()> {
    for platform in crate::sourcemap::Platform::ALL {
        let dir = store.platform_dir(platform);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}
