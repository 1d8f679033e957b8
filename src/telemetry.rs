// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::fmt::{Debug, Write as _};
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing::{Event, Subscriber, field, info, warn};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, filter, filter::EnvFilter, prelude::*, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

const LOG_FORMAT: &str = "LOG_FORMAT";
const DEFAULT_FILTER: &str = "info";

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, EnvFilter, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// Install the global subscriber. `LOG_FORMAT=json` selects JSON output; `RUST_LOG` sets the filter.
pub fn setup_logging() {
    Lazy::force(&APPLICATION_START_TIME);
    tracing_subscriber::registry().with(fmt_layer()).init();
}

fn json_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::format().json().flatten_event(true);
    Box::new(
        tracing_subscriber::fmt::layer()
            .event_format(format)
            .fmt_fields(format::JsonFields::default()),
    )
}

fn plain_fmt() -> BoxLayer {
    Box::new(
        tracing_subscriber::fmt::layer()
            .event_format(GatewayFormat)
            .fmt_fields(GatewayFormat),
    )
}

fn fmt_layer() -> BoxLayer {
    let format = match env::var(LOG_FORMAT).as_deref() {
        Ok("json") => json_fmt(),
        _ => plain_fmt(),
    };
    let (layer, reload) = reload::Layer::new(format.with_filter(default_env_filter()));
    if LOG_HANDLE.set(reload).is_err() {
        warn!("log handle already initialized");
    }
    Box::new(layer)
}

fn default_env_filter() -> EnvFilter {
    let directives = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    EnvFilter::builder()
        .with_regex(false)
        .parse(&directives)
        .unwrap_or_else(|e| {
            eprintln!("invalid {}={directives:?} ({e}), using {DEFAULT_FILTER}", EnvFilter::DEFAULT_ENV);
            EnvFilter::new(DEFAULT_FILTER)
        })
}

/// set_level adds `level` to the current filter. With `reset`, it is applied on top of the
/// startup filter instead.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
    let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
    let directive = if reset {
        format!("{},{level}", default_env_filter())
    } else {
        let current = handle.with_current(|f| f.filter().to_string())?;
        format!("{current},{level}")
    };
    let filter = EnvFilter::builder().parse(directive)?;
    info!("new log filter is {filter}");
    handle.modify(|layer| *layer.filter_mut() = filter)?;
    Ok(())
}

pub fn get_current_loglevel() -> Result<String, Error> {
    let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
    Ok(handle.with_current(|f| f.filter().to_string())?)
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse failure: {0}")]
    InvalidFilter(#[from] filter::ParseError),
    #[error("reload failure: {0}")]
    Reload(#[from] reload::Error),
    #[error("logging is not initialized")]
    Uninitialized,
}

/// GatewayFormat writes `time\tlevel\ttarget:span{fields}\tmessage\tk=v ...`.
struct GatewayFormat;

struct Visitor<'writer> {
    res: std::fmt::Result,
    first: bool,
    writer: Writer<'writer>,
}

impl field::Visit for Visitor<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.record_debug(field, &value)
    }

    fn record_debug(&mut self, field: &field::Field, val: &dyn Debug) {
        if self.res.is_err() {
            return;
        }
        self.res = if field.name() == "message" {
            write!(self.writer, "{val:?}\t")
        } else {
            let sep = if std::mem::take(&mut self.first) { "" } else { " " };
            write!(self.writer, "{sep}{}={val:?}", field.name())
        };
    }
}

impl<'writer> FormatFields<'writer> for GatewayFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        let mut visitor = Visitor {
            writer,
            res: Ok(()),
            first: true,
        };
        fields.record(&mut visitor);
        visitor.res
    }
}

impl<S, N> FormatEvent<S, N> for GatewayFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        use tracing_log::NormalizeEvent;
        use tracing_subscriber::fmt::time::{FormatTime, SystemTime};

        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        SystemTime.format_time(&mut writer)?;
        write!(writer, "\t{}\t", meta.level().as_str().to_ascii_lowercase())?;
        let target = meta.target();
        write!(writer, "{}", target.strip_prefix("tunnelgate::").unwrap_or(target))?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.metadata().name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        }
        if event.fields().next().is_some() {
            writer.write_char('\t')?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use once_cell::sync::Lazy;

    static TRACING: Lazy<()> = Lazy::new(super::setup_logging);

    /// Install logging once per test binary.
    pub fn setup_test_logging() {
        Lazy::force(&TRACING);
    }
}
