//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing subscriber setup for the botdeck daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "BOTDECK_LOG";
const STANDARD_ENV: &str = "RUST_LOG";
/// HTTP and socket internals are only interesting when asked for.
const DEFAULT_DIRECTIVE: &str = "info,hyper=warn,reqwest=warn,tungstenite=warn";

static GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

/// Available stdout log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

struct FilterChoice {
    filter: EnvFilter,
    source: &'static str,
    rejected: Vec<String>,
}

/// First parsable directive of `BOTDECK_LOG` and `RUST_LOG`, else the default.
fn choose_filter(custom: Option<String>, standard: Option<String>) -> FilterChoice {
    let mut rejected = Vec::new();
    for (source, directive) in [(LOG_ENV, custom), (STANDARD_ENV, standard)] {
        let Some(directive) = directive else {
            continue;
        };
        match EnvFilter::try_new(&directive) {
            Ok(filter) => {
                return FilterChoice {
                    filter,
                    source,
                    rejected,
                }
            }
            Err(err) => rejected.push(format!("{source}={directive}: {err}")),
        }
    }
    FilterChoice {
        filter: EnvFilter::new(DEFAULT_DIRECTIVE),
        source: "default",
        rejected,
    }
}

fn stdout_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer().with_timer(fmt::time::UtcTime::rfc_3339());
    match format {
        LogFormat::StructuredJson => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => layer.with_target(true).with_writer(writer).boxed(),
    }
}

/// The file always carries JSON so controller spans (`user`) stay queryable.
fn file_layer<S>(writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_writer(writer)
        .boxed()
}

/// Install the global subscriber: the chosen stdout format plus a daily
/// rolling JSON file `<prefix>.log` under `config.directory`, where the
/// prefix defaults to `service_name`. A second call keeps the first
/// subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let choice = choose_filter(std::env::var(LOG_ENV).ok(), std::env::var(STANDARD_ENV).ok());
    let installed = tracing_subscriber::registry()
        .with(choice.filter)
        .with(stdout_layer(config.format, stdout_writer))
        .with(file_layer(file_writer))
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set([file_guard, stdout_guard]);
    }

    for rejected in &choice.rejected {
        warn!(directive = %rejected, "ignoring unparsable log filter");
    }
    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        format = ?config.format,
        filter = choice.source,
        "tracing initialised"
    );
    Ok(())
}
