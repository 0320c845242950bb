use std::{path::Path, process::ExitCode, sync::Arc, time::Duration};

use certpress::{
    application::{
        certificates::{CertificateService, GenerateCertificateCommand, Principal},
        error::AppError,
        receipts::{GenerateReceiptCommand, ReceiptService},
        render::{ArtifactStore, ResourceGovernor},
    },
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        memory::{EntitlementPolicy, MemoryStore},
        telemetry,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

// Returning instead of exiting lets the runtime drop in-flight tasks, and
// with them any engine guards, before the process ends.
#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_application_error(&error);
            ExitCode::FAILURE
        }
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, *args).await,
        config::Command::Receipt(args) => run_receipt(settings, *args).await,
    }
}

fn build_governor(settings: &config::Settings) -> ResourceGovernor {
    ResourceGovernor::new(
        settings.render.engine.clone(),
        settings.render.memory_alert_bytes,
    )
}

fn build_artifacts(settings: &config::Settings) -> ArtifactStore {
    ArtifactStore::new(
        settings.artifacts.directory.clone(),
        settings.artifacts.remove_after_delivery,
    )
}

fn build_service(settings: &config::Settings, store: Arc<MemoryStore>) -> CertificateService {
    CertificateService::new(
        store.clone(),
        store,
        build_governor(settings),
        build_artifacts(settings),
        settings.issuance(),
    )
}

fn entitlement_policy(settings: &config::Settings) -> EntitlementPolicy {
    if settings.entitlements.allow_all {
        EntitlementPolicy::AllowAll
    } else {
        EntitlementPolicy::Grants(settings.entitlements.grants.iter().cloned().collect())
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = Arc::new(MemoryStore::new(entitlement_policy(&settings)));
    let state = HttpState {
        certificates: Arc::new(build_service(&settings, store)),
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "certpress::serve",
        addr = %settings.server.addr,
        executable = %settings.render.engine.executable_path.display(),
        artifacts = %settings.artifacts.directory.display(),
        "Listening"
    );

    let grace = settings.server.graceful_shutdown;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown_rx.clone()))
        .into_future();

    match serve_with_grace(server, shutdown_rx, grace).await {
        Some(result) => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?
        }
        // Returning drops the runtime, which drops every in-flight request
        // and with it each engine guard.
        None => warn!(
            target = "certpress::serve",
            grace_secs = grace.as_secs(),
            "Graceful shutdown timed out, abandoning in-flight requests"
        ),
    }

    Ok(())
}

/// Drive `server` until it finishes, or until `grace` has passed since
/// shutdown was requested. In the latter case `server` is dropped unfinished.
async fn serve_with_grace<F: Future>(
    server: F,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
) -> Option<F::Output> {
    let expired = async move {
        shutdown_requested(shutdown).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        output = server => Some(output),
        () = expired => None,
    }
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// Engines run in their own process groups and never see a terminal Ctrl-C.
// In-flight renders have to finish so their engines are torn down.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "certpress::serve", error = %err, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "certpress::serve", error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(
        target = "certpress::serve",
        "Shutdown requested, draining in-flight requests"
    );
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let service = build_service(&settings, Arc::new(MemoryStore::allow_all()));
    let principal = Principal {
        user_id: args.owner,
    };
    let command = GenerateCertificateCommand {
        name: args.name,
        course: args.course,
        date: args.date,
    };

    let issued = service.generate(&principal, command).await?;
    let number = issued.record.certificate_number.clone();
    let bytes = issued
        .artifact
        .into_bytes()
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    write_output(&args.output, &bytes).await?;

    info!(
        target = "certpress::render",
        certificate_number = %number,
        bytes = bytes.len(),
        output = %args.output.display(),
        "Certificate written"
    );

    Ok(())
}

async fn run_receipt(
    settings: config::Settings,
    args: config::ReceiptArgs,
) -> Result<(), AppError> {
    let service = ReceiptService::new(
        &build_governor(&settings),
        build_artifacts(&settings),
        settings.receipts(),
    );
    let command = GenerateReceiptCommand {
        name: args.name,
        email: args.email,
        course: args.course,
        amount: args.amount,
        payment_id: args.payment_id,
        order_id: args.order_id,
        date: args.date,
    };

    let issued = service.generate(command).await?;
    let bytes = issued
        .artifact
        .into_bytes()
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    write_output(&args.output, &bytes).await?;

    info!(
        target = "certpress::receipt",
        receipt_number = %issued.receipt_number,
        bytes = bytes.len(),
        output = %args.output.display(),
        "Receipt written"
    );

    Ok(())
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))
}
