use {
    anyhow::{Context, bail},
    feedrelay_channels::{
        ApiSource, BotApiTransport, ChatSource, ChatSourceOptions, ConnectionSupervisor,
        FeedSource, LockFile, Source, SourceRegistry, SourceState, TransportOutbound,
    },
    feedrelay_core::{
        Config, ContentProcessor, DigestLog, Dispatcher, DryRunOutbound, HttpProcessor,
        MessageHandler, Outbound, PassthroughProcessor, PlainTextReader, RelayError,
        StatusReporter,
    },
    feedrelay_scheduler::{DailyDigest, DailySchedule},
    std::{collections::BTreeMap, sync::Arc},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

const CHAT_SOURCE_NAME: &str = "Telegram";

/// Wire every component from `config` and relay until a shutdown signal or
/// a fatal connection error.
pub async fn run(config: Config, dry_run: bool) -> anyhow::Result<()> {
    info!("Starting feedrelay (session {})", config.session_name);
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {:?}", config.data_dir))?;

    let transport = Arc::new(BotApiTransport::new()?);
    let outbound: Arc<dyn Outbound> = if dry_run {
        info!("Dry run: outbound messages are logged, not sent");
        Arc::new(DryRunOutbound::new())
    } else {
        if config.bot_token_file.is_none() {
            bail!("bot_token_file is required to send messages (use --dry-run to relay without sending)");
        }
        Arc::new(TransportOutbound::new(transport.clone()))
    };

    let processor: Arc<dyn ContentProcessor> =
        match (&config.processor_url, &config.processor_api_key) {
            (Some(url), Some(key)) => {
                info!("Processing content through {}", url);
                Arc::new(HttpProcessor::new(url, key, config.request_timeout())?)
            },
            _ => {
                info!("No processor configured, forwarding content unchanged");
                Arc::new(PassthroughProcessor)
            },
        };

    let token = CancellationToken::new();
    let status = StatusReporter::new(outbound.clone(), config.status_destination.clone())
        .with_chunking(config.chunking());
    let digest_log = Arc::new(DigestLog::default());
    let dispatcher = Dispatcher::new(
        Arc::new(config.routing_table()),
        processor.clone(),
        config.retry_policy()?,
        outbound.clone(),
        status.clone(),
    )
    .with_reader(Arc::new(PlainTextReader))
    .with_digest(digest_log.clone())
    .with_chunking(config.chunking())
    .with_max_document_bytes(config.max_document_bytes())
    .with_cancellation(token.child_token());
    let metrics = dispatcher.metrics();

    // Fatal errors raised by the chat connection after startup
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<RelayError>();

    let mut registry = SourceRegistry::new().with_max_in_flight(config.max_in_flight);
    let chat_id = format!("telegram_{}", config.session_name);
    if let Some(credential) = &config.bot_token_file {
        let supervisor = ConnectionSupervisor::new(
            transport.clone(),
            LockFile::new(config.lock_path()),
            credential.clone(),
        );
        let options = ChatSourceOptions {
            origins: config.monitored_origins.clone(),
            temp_dir: config.temp_dir(),
            max_document_bytes: config.max_document_bytes(),
        };
        let chat = ChatSource::new(CHAT_SOURCE_NAME, chat_id.as_str(), supervisor, options)
            .with_failure_notifier(fatal_tx.clone());
        registry.register(Arc::new(chat))?;
    }
    for feed in &config.feeds {
        registry.register(Arc::new(FeedSource::from_config(feed, config.request_timeout())?))?;
    }
    for api in &config.apis {
        registry.register(Arc::new(ApiSource::from_config(api, config.request_timeout())?))?;
    }
    if registry.is_empty() {
        bail!("No sources configured: set bot_token_file or add feeds/apis");
    }

    if !registry.start_all().await {
        bail!("No source could be started");
    }
    // A chat source that failed to start is a startup error, not a partial one
    if let Some(chat) = registry.get(&chat_id) {
        if chat.state() != SourceState::Running {
            registry.stop_all().await;
            bail!("Chat source failed to start (see log for the cause)");
        }
    }

    let registry = Arc::new(registry);
    status.report_startup(registry.len()).await;
    let status_task = status.start_periodic_updates(
        {
            let metrics = metrics.clone();
            move || metrics.snapshot()
        },
        config.status_interval(),
        token.child_token(),
    );

    let tz = config.daily_timezone()?;
    let schedule = DailySchedule::new(config.daily_time()?, tz);
    let destinations = config
        .routing_table()
        .destinations()
        .into_iter()
        .map(str::to_string)
        .collect();
    let digest = DailyDigest::new(digest_log, processor, outbound.clone(), destinations, tz)
        .with_chunking(config.chunking());
    let digest_task = {
        let token = token.child_token();
        tokio::spawn(async move {
            let digest = &digest;
            schedule.run("daily summary", token, move || digest.run()).await;
        })
    };

    let handler: Arc<dyn MessageHandler> = Arc::new(dispatcher);
    let mut fan_in = {
        let registry = registry.clone();
        let token = token.child_token();
        tokio::spawn(async move { registry.process_messages(handler, token).await })
    };

    let mut fan_in_done = false;
    let mut outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        },
        Some(e) = fatal_rx.recv() => {
            error!("Fatal connection error: {}", e);
            Err(e)
        },
        _ = &mut fan_in => {
            fan_in_done = true;
            warn!("All message streams ended");
            Ok(())
        },
    };
    // A fatal error closes the chat stream too, so either branch may win
    if outcome.is_ok() {
        if let Ok(e) = fatal_rx.try_recv() {
            error!("Fatal connection error: {}", e);
            outcome = Err(e);
        }
    }

    if let Err(e) = &outcome {
        status
            .report_error(e.kind(), &e.to_string(), &BTreeMap::new())
            .await;
    }

    info!("Shutting down");
    token.cancel();
    registry.stop_all().await;
    if !fan_in_done {
        if let Err(e) = fan_in.await {
            warn!("Fan-in task ended abnormally: {}", e);
        }
    }
    let _ = status_task.await;
    let _ = digest_task.await;

    let snapshot = metrics.snapshot();
    info!(
        "Relay stopped: {} received, {} processed, {} errors, {} dropped",
        snapshot.total_messages, snapshot.processed, snapshot.errors, snapshot.dropped
    );

    outcome.context("Relay stopped on a fatal error")
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
