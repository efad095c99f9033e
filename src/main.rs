//! CLI entry point for the arrival reconciler.
//!
//! Provides subcommands for decoding a single feed, rendering the nearest
//! trip of a route once, watching it live, and matching vehicles to a trip.

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use gtfs_rt_reconciler::{
    config::{EnvKeyStore, ReconcilerConfig, parse_timezone},
    decode::{FeedDecoder, FeedFormat},
    fetch::{BasicClient, fetch_source},
    live::{FeedSource, LiveBoard, LiveSources, poll_vehicles},
    merger::OverrideMerger,
    model::{DisplayStopRow, OverrideMaps, ScheduledStopTime, VehiclePosition},
    output::{append_records, append_rows, print_json, print_pretty},
    selector::{ScheduleSelector, Selection, SelectionRequest, ViewContext},
    snapshot::FeedSnapshot,
    stats::SnapshotStats,
    store::{JsonOverrideStore, StaticTimetable, TimetableStore, load_override_maps},
    time::{GtfsTime, ServiceDay},
    vehicles::{FleetCatalog, VehicleMatcher},
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_reconciler")]
#[command(about = "Reconcile real-time transit feeds with the static timetable", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode one trip-update feed from a file or URL
    Decode {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// Wire format of the payload (zip/gzip envelopes are detected)
        #[arg(short, long, value_enum, default_value = "gtfs-rt-protobuf")]
        format: FeedFormat,

        /// Keep only updates for this line
        #[arg(short, long)]
        line: Option<String>,

        /// GTFS directory used to settle absolute-time updates
        #[arg(short, long)]
        timetable: Option<PathBuf>,

        /// Agency timezone
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// CSV file to append snapshot statistics to
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Select the trip nearest to a time and print its rows once
    Board {
        #[arg(short, long, default_value = "reconciler.json")]
        config: PathBuf,

        #[arg(short, long)]
        route: String,

        #[arg(short, long)]
        direction: Option<u32>,

        /// Service date (YYYY-MM-DD), defaults to today in the agency timezone
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Target time (HH:MM[:SS], may exceed 24:00), defaults to now
        #[arg(long)]
        time: Option<String>,
    },
    /// Keep the nearest trip of a route refreshed until Ctrl+C
    Watch {
        #[arg(short, long, default_value = "reconciler.json")]
        config: PathBuf,

        #[arg(short, long)]
        route: String,

        #[arg(short, long)]
        direction: Option<u32>,

        /// Additional routes polled into the same snapshot
        #[arg(long = "also")]
        extra_routes: Vec<String>,

        #[arg(long)]
        date: Option<NaiveDate>,

        #[arg(long)]
        time: Option<String>,

        /// CSV file to append rendered rows to
        #[arg(short, long)]
        output: Option<String>,

        /// Stop after this many renders (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 0)]
        renders: usize,
    },
    /// Find the vehicle currently running a trip
    Vehicles {
        #[arg(short, long, default_value = "reconciler.json")]
        config: PathBuf,

        #[arg(value_name = "TRIP_ID")]
        trip_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/gtfs_rt_reconciler.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_reconciler.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(LevelFilter::INFO.into()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive(LevelFilter::DEBUG.into()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Decode {
            source,
            format,
            line,
            timetable,
            timezone,
            output,
        } => {
            let tz = parse_timezone(&timezone)?;
            let store = match timetable {
                Some(dir) => StaticTimetable::load(&dir)
                    .with_context(|| format!("loading timetable from {}", dir.display()))?,
                None => StaticTimetable::default(),
            };
            decode_once(&source, format, line.as_deref(), tz, &store, output.as_deref()).await?;
        }
        Commands::Board {
            config,
            route,
            direction,
            date,
            time,
        } => {
            let runtime = Runtime::load(&config).await?;
            let (date, target) = view_time(runtime.tz, date, time.as_deref())?;
            board_once(&runtime, &route, direction, date, target).await?;
        }
        Commands::Watch {
            config,
            route,
            direction,
            extra_routes,
            date,
            time,
            output,
            renders,
        } => {
            let runtime = Runtime::load(&config).await?;
            let (date, target) = view_time(runtime.tz, date, time.as_deref())?;
            let mut routes = vec![route.clone()];
            routes.extend(extra_routes);
            let span = tracing::info_span!("watch", route = %route, date = %date);
            watch(runtime, routes, direction, date, target, output, renders)
                .instrument(span)
                .await?;
        }
        Commands::Vehicles { config, trip_id } => {
            let runtime = Runtime::load(&config).await?;
            let Some(feed) = &runtime.vehicle_positions else {
                bail!("no vehicle_positions endpoint configured");
            };
            let positions = poll_vehicles(feed).await?;
            let matcher = VehicleMatcher::new(runtime.config.network_id.clone(), runtime.catalog);
            match matcher.match_trip(&trip_id, &positions, Utc::now().timestamp()) {
                Some(found) => print_json(&found)?,
                None => info!(trip_id, positions = positions.len(), "No vehicle matched"),
            }
        }
    }

    Ok(())
}

/// Everything loaded from a config file once at startup.
struct Runtime {
    config: ReconcilerConfig,
    tz: Tz,
    timetable: Arc<StaticTimetable>,
    overrides: Arc<JsonOverrideStore>,
    trip_updates: FeedSource,
    vehicle_positions: Option<FeedSource>,
    catalog: FleetCatalog,
}

impl Runtime {
    #[tracing::instrument(fields(config = %path.display()))]
    async fn load(path: &Path) -> Result<Self> {
        let config = ReconcilerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?;
        let tz = config.tz()?;
        let keys = EnvKeyStore;

        let timetable = StaticTimetable::load(&config.timetable_dir).with_context(|| {
            format!("loading timetable from {}", config.timetable_dir.display())
        })?;

        let client = config
            .trip_updates
            .client(&keys)
            .await
            .context("building trip-update client")?;
        let trip_updates = FeedSource::new(
            Arc::from(client),
            config.trip_updates.url.clone(),
            FeedDecoder::new(config.trip_updates.format, tz),
        );

        let vehicle_positions = match &config.vehicle_positions {
            Some(endpoint) => {
                let client = endpoint
                    .client(&keys)
                    .await
                    .context("building vehicle-position client")?;
                Some(FeedSource::new(
                    Arc::from(client),
                    endpoint.url.clone(),
                    FeedDecoder::new(endpoint.format, tz),
                ))
            }
            None => None,
        };

        let catalog = match &config.fleet_catalog {
            Some(path) => FleetCatalog::load(path)
                .with_context(|| format!("loading fleet catalog {}", path.display()))?,
            None => FleetCatalog::default(),
        };

        info!(
            network_id = %config.network_id,
            fleet = catalog.len(),
            "Configuration loaded"
        );

        Ok(Self {
            overrides: Arc::new(JsonOverrideStore::new(config.overrides_path.clone())),
            timetable: Arc::new(timetable),
            config,
            tz,
            trip_updates,
            vehicle_positions,
            catalog,
        })
    }

    fn context(&self, route: &str, direction: Option<u32>, date: NaiveDate) -> ViewContext {
        ViewContext {
            network_id: self.config.network_id.clone(),
            route_id: route.to_string(),
            direction_id: direction,
            date,
        }
    }
}

/// Date and target time of the view, defaulting to now in `tz`.
fn view_time(tz: Tz, date: Option<NaiveDate>, time: Option<&str>) -> Result<(NaiveDate, GtfsTime)> {
    let now = Utc::now().with_timezone(&tz);
    let date = date.unwrap_or_else(|| now.date_naive());
    let target = match time {
        Some(raw) => raw.parse::<GtfsTime>()?,
        None => GtfsTime::from_hms(now.hour(), now.minute(), now.second()),
    };
    Ok((date, target))
}

#[tracing::instrument(skip(store, output), fields(source = %source))]
async fn decode_once<S: TimetableStore>(
    source: &str,
    format: FeedFormat,
    line: Option<&str>,
    tz: Tz,
    store: &S,
    output: Option<&str>,
) -> Result<()> {
    let client = BasicClient::new();
    let decoder = FeedDecoder::new(format, tz);

    let stats = match fetch_source(&client, source).await {
        Ok(bytes) => match decoder.try_decode(&bytes, line, store).await {
            Ok(decoded) => {
                print_json(&decoded.snapshot.to_entries())?;
                print_pretty(&decoded.stats);
                SnapshotStats::from_snapshot(&decoded.snapshot)
            }
            Err(e) => {
                error!(error = %e, "Feed decode failed");
                SnapshotStats::from_error("decode_error", &e.to_string())
            }
        },
        Err(e) => {
            error!(error = %e, "Feed fetch failed");
            SnapshotStats::from_error("fetch_error", &e.to_string())
        }
    };

    info!(
        stops = stats.stops,
        skipped = stats.skipped,
        on_time_pct = stats.on_time_pct(),
        "Snapshot summary"
    );
    if let Some(path) = output {
        append_records(path, &[stats])?;
    }
    Ok(())
}

/// Override maps for the view; a store failure is logged and shows none.
async fn initial_overrides(runtime: &Runtime, date: NaiveDate) -> OverrideMaps {
    let network_id = &runtime.config.network_id;
    match load_override_maps(runtime.overrides.as_ref(), network_id, date).await {
        Ok(maps) => maps,
        Err(e) => {
            warn!(error = %e, "Override load failed, showing feed data only");
            OverrideMaps::empty(network_id, date)
        }
    }
}

/// Selects the trip nearest `target` and returns it with its stop times.
async fn select_trip(
    runtime: &Runtime,
    selector: &ScheduleSelector<StaticTimetable>,
    context: ViewContext,
    target: GtfsTime,
    overrides: &OverrideMaps,
) -> Result<Option<(String, Vec<ScheduledStopTime>)>> {
    let mut selection = selector
        .select(&SelectionRequest { context, target })
        .await
        .context("selecting trip")?;
    selection.annotate(overrides);

    match &selection {
        Selection::NoSchedule { date } => {
            warn!(%date, network_id = %runtime.config.network_id, "No schedule for this date");
            Ok(None)
        }
        Selection::Superseded => Ok(None),
        Selection::Selected { trips, .. } => {
            let Some(candidate) = selection.selected() else {
                warn!(trips = trips.len(), "No trip to display");
                return Ok(None);
            };
            let trip_id = candidate.trip.trip_id.clone();
            info!(
                trip_id = %trip_id,
                departure = %candidate.effective_departure,
                source = ?candidate.source,
                cancelled = candidate.trip.manual.is_manually_cancelled,
                delayed = candidate.trip.manual.is_manually_delayed,
                "Trip selected"
            );
            let stop_times = selector.stop_times(&trip_id).await?;
            Ok(Some((trip_id, stop_times)))
        }
    }
}

async fn board_once(
    runtime: &Runtime,
    route: &str,
    direction: Option<u32>,
    date: NaiveDate,
    target: GtfsTime,
) -> Result<()> {
    let selector = ScheduleSelector::new(Arc::clone(&runtime.timetable));
    let context = runtime.context(route, direction, date);
    let overrides = initial_overrides(runtime, date).await;
    let Some((trip_id, stop_times)) =
        select_trip(runtime, &selector, context, target, &overrides).await?
    else {
        return Ok(());
    };

    let feed = &runtime.trip_updates;
    let snapshot = match fetch_source(&*feed.client, &feed.location).await {
        Ok(bytes) => {
            feed.decoder
                .decode(&bytes, Some(route), runtime.timetable.as_ref())
                .await
        }
        Err(e) => {
            warn!(error = %e, "Trip-update fetch failed, showing schedule only");
            FeedSnapshot::empty()
        }
    };

    let mut merger = OverrideMerger::new(ServiceDay::new(date, runtime.tz));
    let rows = merger.merge(&stop_times, &snapshot, &overrides);
    render(&rows, None)?;

    if let Some(vehicles) = &runtime.vehicle_positions {
        match poll_vehicles(vehicles).await {
            Ok(positions) => {
                let matcher =
                    VehicleMatcher::new(runtime.config.network_id.clone(), runtime.catalog.clone());
                if let Some(found) = matcher.match_trip(&trip_id, &positions, Utc::now().timestamp())
                {
                    print_json(&found)?;
                }
            }
            Err(e) => warn!(error = %e, "Vehicle fetch failed"),
        }
    }
    Ok(())
}

async fn watch(
    runtime: Runtime,
    routes: Vec<String>,
    direction: Option<u32>,
    date: NaiveDate,
    target: GtfsTime,
    output: Option<String>,
    renders: usize,
) -> Result<()> {
    let selector = ScheduleSelector::new(Arc::clone(&runtime.timetable));
    let context = runtime.context(&routes[0], direction, date);
    let initial = initial_overrides(&runtime, date).await;
    let Some((trip_id, stop_times)) =
        select_trip(&runtime, &selector, context, target, &initial).await?
    else {
        return Ok(());
    };

    let board = LiveBoard::start(
        LiveSources {
            network_id: runtime.config.network_id.clone(),
            date,
            routes,
            trip_updates: runtime.trip_updates.clone(),
            vehicle_positions: runtime.vehicle_positions.clone(),
            timetable: runtime.timetable.clone(),
            overrides: runtime.overrides.clone(),
        },
        runtime.config.refresh,
    );
    let matcher = VehicleMatcher::new(runtime.config.network_id.clone(), runtime.catalog.clone());
    let mut merger = OverrideMerger::new(ServiceDay::new(date, runtime.tz));
    let mut snapshots = board.subscribe_snapshot();
    let mut overrides = board.subscribe_overrides();
    let mut vehicles = board.subscribe_vehicles();
    let mut vehicles_live = runtime.vehicle_positions.is_some();

    // Start-up overrides stand until the first override poll lands.
    let mut current = Arc::new(initial);
    let rows = merger.merge(&stop_times, &board.snapshot(), &current);
    render(&rows, output.as_deref())?;
    let mut rendered = 1usize;

    while renders == 0 || rendered < renders {
        let rows = tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                Some(merger.merge(&stop_times, &board.snapshot(), &current))
            }
            changed = overrides.changed() => {
                if changed.is_err() {
                    break;
                }
                current = board.overrides();
                merger.on_overrides(&stop_times, &board.snapshot(), &current)
            }
            changed = vehicles.changed(), if vehicles_live => {
                if changed.is_err() {
                    vehicles_live = false;
                } else {
                    log_vehicle(&matcher, &trip_id, &board.vehicles());
                }
                None
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping refresh loops");
                break;
            }
        };

        if let Some(rows) = rows {
            render(&rows, output.as_deref())?;
            rendered += 1;
        }
    }

    info!(rendered, "Watch finished");
    Ok(())
}

fn log_vehicle(matcher: &VehicleMatcher, trip_id: &str, positions: &[VehiclePosition]) {
    match matcher.match_trip(trip_id, positions, Utc::now().timestamp()) {
        Some(found) => info!(
            vehicle_id = %found.vehicle_id,
            label = %found.label,
            lat = found.lat,
            lon = found.lon,
            rule = ?found.rule,
            "Vehicle"
        ),
        None => debug!(trip_id, positions = positions.len(), "No vehicle matched"),
    }
}

fn render(rows: &[DisplayStopRow], output: Option<&str>) -> Result<()> {
    for row in rows {
        let badge = match (row.skipped, row.delay_minutes) {
            (true, _) => "skipped".to_string(),
            (false, Some(0)) => "on time".to_string(),
            (false, Some(d)) => format!("{d:+} min"),
            (false, None) => String::new(),
        };
        info!(
            stop_sequence = row.stop_sequence,
            stop_id = %row.stop_id,
            scheduled = %row.scheduled_display(),
            effective = %row.effective_display(),
            badge = %badge,
            source = ?row.source,
            "Stop"
        );
    }
    if let Some(path) = output {
        append_rows(path, rows, Utc::now().timestamp())?;
    }
    Ok(())
}
