use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use epcis_common::directus::DirectusStore;
use epcis_common::health::{HealthHandle, HealthRegistry};
use epcis_common::metrics;
use epcis_common::store::DocumentStore;
use epcis_dispatcher::config::Config;
use epcis_dispatcher::cycle::{Collections, DispatchPipeline};
use epcis_dispatcher::document::StoredDocumentSource;
use epcis_dispatcher::error::DispatchError;
use epcis_dispatcher::partner::{
    DashboardCredentials, PartnerStatusClient, PartnerSubmitClient, TokenCache,
};
use eyre::{Result, WrapErr};
use futures::future::{select, Either};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn dispatch_loop(
    pipeline: DispatchPipeline,
    liveness: HealthHandle,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match pipeline.run_cycle(&cancel).await {
            Ok(summary) => info!(?summary, "dispatch cycle finished"),
            Err(DispatchError::Cancelled) => {
                info!("dispatch cycle cancelled");
                break;
            }
            // An aborted cycle is retried on the next tick; the process stays live.
            Err(e) => error!("dispatch cycle aborted: {}", e),
        }
        liveness.report_healthy().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    let settings = config.dispatch_settings();
    let timeout = config.request_timeout.0;

    let store: Arc<dyn DocumentStore> = Arc::new(
        DirectusStore::new(config.cms_base_url.as_str(), &config.cms_api_key, timeout)
            .wrap_err("failed to create record store client")?,
    );

    let partner = &config.partner;
    let submission = PartnerSubmitClient::from_files(
        partner.endpoint.as_str(),
        &partner.cert_file,
        &partner.key_file,
        &partner.ca_file,
        timeout,
    )
    .wrap_err("failed to create partner submission client")?;
    let status = PartnerStatusClient::new(
        partner.dashboard_url.as_str(),
        partner.company_id.as_str(),
        DashboardCredentials {
            username: partner.username.clone(),
            password: partner.password.clone(),
            client_id: partner.client_id.as_str().to_owned(),
        },
        partner.status_lookback_days,
        Arc::new(TokenCache::new()),
        timeout,
    )
    .wrap_err("failed to create partner status client")?;

    let documents = StoredDocumentSource::new(
        store.clone(),
        config.default_receiver_gln.clone().map(|gln| gln.0),
    );
    let collections = Collections {
        shipping: config.shipping_collection.as_str().to_owned(),
        dispatch: config.dispatch_collection.as_str().to_owned(),
    };
    let pipeline = DispatchPipeline::new(
        store,
        &collections,
        Arc::new(documents),
        Arc::new(submission),
        Arc::new(status),
        settings,
    );

    let liveness = HealthRegistry::new("liveness");
    let deadline = config.liveness_deadline();
    let dispatcher_liveness = liveness
        .register(
            "dispatcher",
            time::Duration::try_from(deadline).unwrap_or(time::Duration::MAX),
        )
        .await;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!("failed to listen for shutdown signal: {}", e),
        }
        on_signal.cancel();
    });

    info!(
        batch_size = settings.batch_size,
        max_attempts = settings.max_attempts,
        failure_threshold = %settings.failure_threshold,
        "starting epcis dispatcher"
    );

    let recorder_handle =
        metrics::setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;
    let app = metrics::app(Some(recorder_handle), liveness);
    let bind = config.bind();
    let server_shutdown = cancel.clone();
    let http_server = Box::pin(metrics::serve(app, &bind, async move {
        server_shutdown.cancelled().await
    }));
    let dispatch_loop = Box::pin(dispatch_loop(
        pipeline,
        dispatcher_liveness,
        config.cycle_interval.0,
        cancel.clone(),
    ));

    match select(http_server, dispatch_loop).await {
        Either::Left((listen_result, _)) => {
            listen_result.wrap_err("metrics server failed")?;
            info!("metrics server stopped");
        }
        Either::Right((_, _)) => info!("dispatch loop stopped"),
    };

    Ok(())
}
