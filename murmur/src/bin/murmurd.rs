// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of murmur.
//
// murmur is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// murmur is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with murmur.  If not,
// see <http://www.gnu.org/licenses/>.

//! # murmurd
//!
//! The murmur daemon. It always runs in the foreground; run it under a supervisor (systemd, a
//! container runtime) if you need it kept alive.

use std::{
    fmt::Display,
    future::IntoFuture,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
    task::JoinHandle,
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};
use url::Url;

use murmur::{
    api::make_router,
    background_tasks,
    dynamodb::{Location as DynamoLocation, Tables as DynamoTables},
    fan_out::{self, Context, Dispatcher},
    feed::{Feed, Limits},
    http::error_response,
    memory::MemoryStore,
    metrics::{check_metric_names, Instruments},
    murmur::Murmur,
    storage::Repositories,
    util::Credentials,
};

/// The murmur application error type
///
/// [Debug] is implemented by hand, in terms of [Display]: `main()` returns `Result<(), Error>`,
/// and the runtime prints the `Debug` representation of any error it gets back.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("DynamoDB error: {source}"))]
    Dynamo {
        #[snafu(source(from(murmur::dynamodb::Error, Box::new)))]
        source: Box<murmur::dynamodb::Error>,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While building the OTLP exporter, {source}"))]
    OtlpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("ScyllaDB error: {source}"))]
    Scylla {
        #[snafu(source(from(murmur::scylla::Error, Box::new)))]
        source: Box<murmur::scylla::Error>,
    },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

const DEFAULT_CONFIG: &str = "/etc/murmur.toml";

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
    pub create_schema: bool,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = std::env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
            create_schema: matches.get_flag("create-schema"),
        })
    }
}

/// Where murmur keeps its data
// Deserialize only; the credentials are secrets.
#[derive(Clone, Debug, Default, Deserialize)]
pub enum StorageConfig {
    /// Keep everything in process; it's all lost on exit
    #[default]
    Memory,
    /// Use ScyllaDB over CQL
    Scylla {
        credentials: Option<Credentials>,
        /// Specify as "host:port"
        hosts: Vec<String>,
        /// Used only when creating the keyspace
        #[serde(rename = "replication-factor", default = "default_replication")]
        replication_factor: u32,
    },
    /// Use DynamoDB, or ScyllaDB over the Alternator interface
    Dynamo {
        credentials: Option<Credentials>,
        location: DynamoLocation,
        #[serde(default)]
        tables: DynamoTables,
    },
}

fn default_replication() -> u32 {
    3
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<Duration>,
}

/// murmur configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// Address at which to serve the API; specify as "address:port"
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
    #[serde(rename = "fan-out")]
    fan_out: fan_out::Config,
    #[serde(flatten)]
    limits: Limits,
    /// OTLP export target; None means don't export
    #[serde(rename = "otlp-export")]
    otlp_export: Option<OtelExportConfig>,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            public_address: "0.0.0.0:8080".parse::<SocketAddr>().unwrap(/* known good */),
            storage_config: StorageConfig::default(),
            fan_out: fan_out::Config::default(),
            limits: Limits::default(),
            otlp_export: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")]
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

fn parse_config_text(text: &str, pth: &std::path::Path) -> Result<ConfigV1> {
    match toml::from_str::<Configuration>(text) {
        Ok(Configuration::V1(cfg)) => Ok(cfg),
        Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
    }
}

/// Parse the murmur configuration file
///
/// If no file was named & there's nothing at the default location, run with defaults.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str(DEFAULT_CONFIG).unwrap(/* known good */), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => parse_config_text(&text, &pth),
        Err(_) if defaulted => Ok(ConfigV1::default()),
        Err(err) => Err(ConfigNotFoundSnafu { pth }.into_error(err)),
    }
}

/// Configure murmur logging
///
/// Logs go to stdout, as JSON unless `--plain` was given. This can only be installed once.
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers of different types, hence the box.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(std::io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stdout),
        )
    };

    Ok((formatter, filter))
}

/// Turn a request path into a legal OTel instrument name suffix: '/' becomes '.', and anything
/// outside `[-.0-9A-Za-z]` is dropped
fn metric_stem(path: &str) -> String {
    path.chars()
        .filter_map(|c| match c {
            '/' => Some('.'),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '.' => Some(c),
            _ => None,
        })
        .collect()
}

async fn otel_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let name = format!(
        "http.{}{}",
        request.method().as_str().to_lowercase(),
        metric_stem(request.uri().path())
    );
    global::meter("murmur").u64_counter(name).build().add(1, &[]);
    next.run(request).await
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Arc<Murmur>>) -> axum::response::Response {
    let mut output = Vec::new();
    if let Err(err) = state.exporter.export(&mut output) {
        error!("Failed to encode Prometheus metrics: {err:?}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
    }
    match String::from_utf8(output) {
        Ok(text) => text.into_response(),
        Err(err) => {
            error!("Non UTF-8 Prometheus exposition: {err:?}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Request IDs are just a counter; readable, and a rough gauge of how long we've been up
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .pipe(HeaderValue::from)
            .pipe(RequestId::new)
            .pipe(Some)
    }
}

/// Make the [Router] that will be accessible to the world
///
/// Incoming requests hit the `SetRequestIdLayer` first, so it's applied last:
///
/// ```text
/// SetRequestIdLayer -> OTel -> TraceLayer -> PropagateRequestIdLayer -> handler
/// ```
fn make_world_router(state: Arc<Murmur>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .merge(make_router(state.clone()))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(axum::middleware::from_fn(otel_middleware))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
        .with_state(state)
}

/// Connect to the configured store
async fn select_storage(config: &StorageConfig) -> Result<Repositories> {
    match config {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; nothing will survive a restart.");
            Ok(Repositories::from_backend(Arc::new(MemoryStore::new())))
        }
        StorageConfig::Scylla {
            credentials, hosts, ..
        } => murmur::scylla::Session::new(hosts, credentials)
            .await
            .context(ScyllaSnafu)?
            .pipe(Arc::new)
            .pipe(Repositories::from_backend)
            .pipe(Ok),
        StorageConfig::Dynamo {
            credentials,
            location,
            tables,
        } => murmur::dynamodb::Client::new(location, credentials, tables)
            .await
            .context(DynamoSnafu)?
            .pipe(Arc::new)
            .pipe(Repositories::from_backend)
            .pipe(Ok),
    }
}

/// Create tables (or keyspace & tables) in the configured store
async fn create_schema(config: &StorageConfig) -> Result<()> {
    match config {
        StorageConfig::Memory => {
            info!("In-memory storage needs no schema.");
            Ok(())
        }
        StorageConfig::Scylla {
            credentials,
            hosts,
            replication_factor,
        } => murmur::scylla::create_schema(hosts, credentials, *replication_factor)
            .await
            .context(ScyllaSnafu),
        StorageConfig::Dynamo {
            credentials,
            location,
            tables,
        } => murmur::dynamodb::Client::new(location, credentials, tables)
            .await
            .context(DynamoSnafu)?
            .create_schema()
            .await
            .context(DynamoSnafu),
    }
}

/// Signal the fan-out processor to stop & wait (up to `bound`) for it to drain
async fn drain_fan_out(
    processor: JoinHandle<background_tasks::Result<()>>,
    shutdown: Arc<Notify>,
    bound: Duration,
) {
    shutdown.notify_one();
    match tokio::time::timeout(bound, processor).await {
        Ok(Ok(Ok(()))) => info!("Fan-out drained."),
        Ok(Ok(Err(err))) => error!("Fan-out shut down uncleanly: {err:?}"),
        Ok(Err(err)) => error!("The fan-out processor panicked: {err:?}"),
        Err(_) => error!("Timed-out after {bound:?} waiting for fan-out to drain."),
    }
}

/// Serve murmur API requests until asked to stop
#[tracing::instrument(skip(cfg), fields(address = %cfg.public_address))]
async fn serve(cfg: ConfigV1) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
    let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;

    let exporter = init_telemetry(cfg.otlp_export.as_ref())?;
    let instruments = Arc::new(Instruments::new("murmur"));

    let repos = select_storage(&cfg.storage_config).await?;
    let (dispatcher, processor) = Dispatcher::new(Context::new(
        repos.clone(),
        cfg.fan_out.clone(),
        instruments.clone(),
    ));
    let state = Arc::new(Murmur {
        feed: Feed::new(repos, dispatcher, cfg.limits.clone(), instruments.clone()),
        instruments,
        exporter,
    });

    let nfy = Arc::new(Notify::new());
    let mut server = axum::serve(
        TcpListener::bind(cfg.public_address)
            .await
            .context(BindSnafu {
                addr: cfg.public_address,
            })?,
        make_world_router(state.clone()),
    )
    .with_graceful_shutdown(shutdown_signal(nfy.clone()))
    .into_future();
    info!("Listening on {}.", cfg.public_address);

    let (mut processor_join_handle, processor_shutdown) = processor.into_parts();
    // Give the processor its own drain timeout, plus a little slack.
    let drain_bound = cfg.fan_out.processor.shutdown_timeout + Duration::from_secs(1);

    tokio::select! {
        res = &mut server => {
            // The server should only ever exit when told to
            error!("The HTTP server exited unexpectedly ({res:?}); shutting-down.");
            drain_fan_out(processor_join_handle, processor_shutdown, drain_bound).await;
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM; terminating.");
            nfy.notify_one();
            if let Err(err) = server.await {
                error!("{err:?}");
            }
            drain_fan_out(processor_join_handle, processor_shutdown, drain_bound).await;
        }
        _ = sigint.recv() => {
            info!("Received SIGINT; terminating.");
            nfy.notify_one();
            if let Err(err) = server.await {
                error!("{err:?}");
            }
            drain_fan_out(processor_join_handle, processor_shutdown, drain_bound).await;
        }
        res = &mut processor_join_handle => {
            error!("The fan-out processor exited early with {res:?}; shutting-down.");
            nfy.notify_one();
            if let Err(err) = server.await {
                error!("{err:?}");
            }
        }
    }

    let stats = state.feed.dispatcher().stats();
    info!(
        "Fan-out totals: {} deliveries, {} backfills, {} entries written, {} failed, {} tasks rejected.",
        stats.deliveries,
        stats.backfills,
        stats.entries_written,
        stats.entries_failed,
        stats.tasks_rejected
    );
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// Metrics are always available for scraping at `/metrics`; if an OTLP collector is configured,
/// they're pushed there as well.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<PrometheusExporter> {
    check_metric_names();
    let prom_exporter = PrometheusExporter::new();

    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "murmur"))
                .build(),
        )
        .with_reader(prom_exporter.clone());

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OtlpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    global::set_meter_provider(provider.build());

    Ok(prom_exporter)
}

async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    let (cfg, formatter, filter) = match parse_config(&opts.cfg)
        .and_then(|cfg| configure_logging(&opts.log_opts).map(|(f, e)| (cfg, f, e)))
    {
        Ok(x) => x,
        Err(err) => {
            error!("While configuring murmur: {err:?}");
            return Err(err);
        }
    };

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)?;
    drop(bootstrap_logging_guard);

    info!("murmur version {} starting.", crate_version!());
    debug!("Configuration: {cfg:?}");

    if opts.create_schema {
        create_schema(&cfg.storage_config).await
    } else {
        serve(cfg).await
    }
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        Command::new("murmurd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A social feed service")
            .long_about(
                "`murmur` lets users post short messages, follow one another & read a home timeline \
                 assembled from the people they follow.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("MURMUR_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file",
                    ),
            )
            .arg(
                Arg::new("create-schema")
                    .long("create-schema")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MURMUR_CREATE_SCHEMA")
                    .help("create the tables murmur needs in the configured store, then exit"),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MURMUR_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MURMUR_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MURMUR_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("MURMUR_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}
