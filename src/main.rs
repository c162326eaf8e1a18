use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data,
};
use clap::Parser;
use db_controller::{self, Args, Settings, State, telemetry};
use tracing::*;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(c: Data<State>, _req: HttpRequest) -> impl Responder {
    if c.is_ready() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("starting")
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        anyhow::bail!("no rustls crypto provider available");
    }

    let args = Args::parse();
    let settings = Settings::new(&args)?;
    telemetry::init(settings.log_format)?;
    let drain_timeout = settings.graceful_shutdown_timeout()?;
    let (health_addr, metrics_addr) = (settings.health_addr.clone(), settings.metrics_addr.clone());

    // Initiatilize Kubernetes controller state
    let state = State::new(settings);
    let mut controllers = tokio::spawn(db_controller::run(state.clone()));

    let health_state = state.clone();
    let health_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(health_state.clone()))
            .wrap(middleware::Logger::default().exclude("/healthz").exclude("/readyz"))
            .service(index)
            .service(health)
            .service(ready)
    })
    .bind(&health_addr)?
    .disable_signals()
    .shutdown_timeout(5)
    .run();

    let metrics_state = state.clone();
    let metrics_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(metrics_state.clone()))
            .service(metrics)
    })
    .bind(&metrics_addr)?
    .disable_signals()
    .shutdown_timeout(5)
    .run();

    let servers = async { tokio::try_join!(health_server, metrics_server) };
    tokio::pin!(servers);

    let result = tokio::select! {
        res = &mut controllers => res,
        _ = shutdown_signal() => {
            info!("Shutdown signalled, draining reconciles for up to {drain_timeout:?}");
            match tokio::time::timeout(drain_timeout, &mut controllers).await {
                Ok(res) => res,
                Err(_) => {
                    warn!("Reconciles still running after {drain_timeout:?}, exiting");
                    controllers.abort();
                    Ok(Ok(()))
                }
            }
        }
        res = &mut servers => {
            res?;
            return Ok(());
        }
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Controller failed: {e}");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
