/*
 * Copyright 2020 Damian Peckett <damian@pecke.tt>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::controller::{autoscaler_key, upsert_task, AutoscalerTask, ControllerContext};
use crate::error::*;
use crate::reconciler::{ReconcilerSettings, CALL_TIMEOUT, RESYNC_INTERVAL, RETRY_INTERVAL};
use crate::resource::MongoRouterAutoscaler;
use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_parser, Arg, ArgMatches,
    Command, ValueEnum,
};
use futures::{pin_mut, StreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use slog::{crit, debug, error, info, o, warn, Drain, Level, LevelFilter, Logger};
use snafu::ResultExt;
use std::collections::{HashMap, HashSet};
use std::panic;
use std::process::exit;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

/// Per autoscaler task lifecycle.
mod controller;
/// Router autoscaler error types.
mod error;
/// Kubernetes api abstraction.
mod kubernetes;
/// Prometheus metric source.
mod metrics;
/// A single reconcile cycle.
mod reconciler;
/// Autoscaler resource types.
mod resource;
/// Autoscaling control strategies.
mod strategy;
/// Requeue timer.
mod timer;

/// Log level command line argument.
#[derive(Clone, Copy, PartialEq, Debug, ValueEnum)]
pub enum LogLevelArgument {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArgument> for Level {
    fn from(level_arg: LogLevelArgument) -> Level {
        match level_arg {
            LogLevelArgument::Critical => Level::Critical,
            LogLevelArgument::Error => Level::Error,
            LogLevelArgument::Warning => Level::Warning,
            LogLevelArgument::Info => Level::Info,
            LogLevelArgument::Debug => Level::Debug,
            LogLevelArgument::Trace => Level::Trace,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let matches = cli().get_matches();

    if matches.subcommand_matches("crd").is_some() {
        let crd = serde_yaml::to_string(&MongoRouterAutoscaler::crd())
            .context(YamlSerialization {})?;
        print!("{}", crd);
        return Ok(());
    }

    let log_level = matches
        .get_one::<LogLevelArgument>("LOG_LEVEL")
        .copied()
        .unwrap_or(LogLevelArgument::Info);
    let logger = Logger::root(
        StdMutex::new(LevelFilter::new(
            slog_json::Json::default(std::io::stdout()),
            log_level.into(),
        ))
        .map(slog::Fuse),
        o!("application" => crate_name!(), "version" => crate_version!()),
    );

    // Replace the panic handler with one that will exit the process on panics (in any thread).
    // This lets Kubernetes restart the process if we hit anything unexpected.
    let panic_logger = logger.clone();
    let _ = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        crit!(panic_logger, "Thread panicked"; "error" => format!("{}", panic_info));
        exit(1);
    }));

    let settings = reconciler_settings(&matches);
    let kube_client = Client::try_default().await.context(Kube {})?;
    let http_client = reqwest::Client::builder()
        .timeout(settings.call_timeout)
        .build()
        .context(HttpClient {})?;

    let autoscaler_api: Api<MongoRouterAutoscaler> = match matches.get_one::<String>("NAMESPACE") {
        Some(namespace) => Api::namespaced(kube_client.clone(), namespace),
        None => Api::all(kube_client.clone()),
    };

    let context = ControllerContext {
        kube_client,
        http_client,
    };

    // Handles for managing the lifecycle of autoscaler tasks, keyed by namespace/name.
    let mut tasks: HashMap<String, AutoscalerTask> = HashMap::new();
    // Autoscalers seen during a relist, anything else was deleted while we weren't watching.
    let mut relisted: Option<HashSet<String>> = None;

    info!(logger, "Watching autoscalers";
        "namespace" => matches.get_one::<String>("NAMESPACE").cloned().unwrap_or_else(|| "*".into()),
        "resync_interval_seconds" => settings.resync_interval.as_secs(),
        "retry_interval_seconds" => settings.retry_interval.as_secs());

    let events = watcher(autoscaler_api, watcher::Config::default()).default_backoff();
    pin_mut!(events);
    let shutdown = shutdown_signal();
    pin_mut!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => {
                info!(logger, "Received shutdown signal");
                break;
            }
            event = events.next() => event,
        };

        match event {
            Some(Ok(watcher::Event::Init)) => {
                debug!(logger, "Relisting autoscalers");
                relisted = Some(HashSet::new());
            }
            Some(Ok(watcher::Event::InitApply(autoscaler))) => {
                if let (Some(relisted), Some(key)) = (relisted.as_mut(), autoscaler_key(&autoscaler)) {
                    relisted.insert(key);
                }
                upsert_task(&logger, &context, &settings, &mut tasks, autoscaler);
            }
            Some(Ok(watcher::Event::InitDone)) => {
                if let Some(relisted) = relisted.take() {
                    tasks.retain(|key, _| {
                        let exists = relisted.contains(key);
                        if !exists {
                            info!(logger, "Removing vanished autoscaler"; "autoscaler" => key.as_str());
                        }
                        exists
                    });
                }
            }
            Some(Ok(watcher::Event::Apply(autoscaler))) => {
                upsert_task(&logger, &context, &settings, &mut tasks, autoscaler);
            }
            Some(Ok(watcher::Event::Delete(autoscaler))) => {
                if let Some(key) = autoscaler_key(&autoscaler) {
                    info!(logger, "Deleted autoscaler";
                        "autoscaler_namespace" => autoscaler.namespace().unwrap_or_default(),
                        "autoscaler_name" => autoscaler.name_any());
                    // Dropping the handle will terminate the task.
                    tasks.remove(&key);
                }
            }
            Some(Err(err)) => {
                warn!(logger, "Failed to watch autoscalers"; "error" => format!("{}", err));
            }
            None => {
                error!(logger, "Autoscaler watch ended unexpectedly");
                break;
            }
        }
    }

    // Cancels any in-flight reconcile cycles before their status is written.
    tasks.clear();
    info!(logger, "Stopped all autoscaler tasks");

    Ok(())
}

fn cli() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .author(crate_authors!())
        .arg(
            Arg::new("LOG_LEVEL")
                .long("log-level")
                .env("LOG_LEVEL")
                .help("set the application log level")
                .value_parser(value_parser!(LogLevelArgument))
                .ignore_case(true)
                .default_value("info"),
        )
        .arg(
            Arg::new("NAMESPACE")
                .long("namespace")
                .env("WATCH_NAMESPACE")
                .help("only watch autoscalers in this namespace (default: all namespaces)"),
        )
        .arg(duration_arg(
            "RESYNC_INTERVAL",
            "resync-interval",
            "delay between reconcile cycles of an autoscaler",
            "45s",
        ))
        .arg(duration_arg(
            "RETRY_INTERVAL",
            "retry-interval",
            "delay before retrying a cycle that hit a recoverable error",
            "60s",
        ))
        .arg(duration_arg(
            "CALL_TIMEOUT",
            "call-timeout",
            "timeout for each kubernetes or prometheus call",
            "10s",
        ))
        .subcommand(
            Command::new("crd").about("print the MongoRouterAutoscaler custom resource definition"),
        )
}

fn duration_arg(
    id: &'static str,
    long: &'static str,
    help: &'static str,
    default: &'static str,
) -> Arg {
    Arg::new(id)
        .long(long)
        .env(id)
        .help(help)
        .value_parser(humantime::parse_duration)
        .default_value(default)
}

fn reconciler_settings(matches: &ArgMatches) -> ReconcilerSettings {
    let duration = |id: &str, fallback: Duration| {
        matches
            .get_one::<Duration>(id)
            .copied()
            .unwrap_or(fallback)
    };

    ReconcilerSettings {
        resync_interval: duration("RESYNC_INTERVAL", RESYNC_INTERVAL),
        retry_interval: duration("RETRY_INTERVAL", RETRY_INTERVAL),
        call_timeout: duration("CALL_TIMEOUT", CALL_TIMEOUT),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => futures::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => (),
        _ = terminate => (),
    }
}
