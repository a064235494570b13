//! Log line format, log files and log tailing.
//!
//! Lines look like `[2024-05-01 12:00:00.123] [wallet_1][INJ/USDT] message k=v`.
//! `wallet` and `market` are taken from the event or any enclosing span.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::Local;
use ringbuffer::{AllocRingBuffer, RingBufferExt, RingBufferWrite};
use tracing::{
    field::{Field, Visit},
    span, Event, Level, Subscriber,
};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation as AppenderRotation},
};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, MakeWriter},
    layer::{Context, Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{LoggingConfig, Rotation};

/// `wallet` / `market` values recorded on a span.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct SpanTags {
    wallet: Option<String>,
    market: Option<String>,
}

impl SpanTags {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "wallet" => self.wallet = Some(value),
            "market" => self.market = Some(value),
            _ => {}
        }
    }
}

impl Visit for SpanTags {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set(field.name(), format!("{value:?}"));
    }
}

/// Stores each span's `wallet` and `market` fields as raw values so
/// [`BotLineFormat`] does not depend on how fmt layers render span fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpanTagLayer;

impl<S> Layer<S> for SpanTagLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut tags = SpanTags::default();
        attrs.record(&mut tags);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(tags);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(tags) = span.extensions_mut().get_mut::<SpanTags>() {
                values.record(tags);
            }
        }
    }
}

/// `[timestamp] [wallet][market] message` formatter. Needs [`SpanTagLayer`]
/// in the same subscriber to pick up span context.
#[derive(Clone, Copy, Debug, Default)]
pub struct BotLineFormat;

#[derive(Default)]
struct LineVisitor {
    message: String,
    tags: SpanTags,
    extra: Vec<String>,
}

impl LineVisitor {
    fn record(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = value,
            "wallet" | "market" => self.tags.set(name, value),
            _ => self.extra.push(format!("{name}={value}")),
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field.name(), format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for BotLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        // Innermost span wins; fields on the event itself win over spans.
        let mut tags = SpanTags::default();
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                if let Some(span_tags) = span.extensions().get::<SpanTags>() {
                    if span_tags.wallet.is_some() {
                        tags.wallet = span_tags.wallet.clone();
                    }
                    if span_tags.market.is_some() {
                        tags.market = span_tags.market.clone();
                    }
                }
            }
        }
        let wallet = visitor.tags.wallet.as_deref().or(tags.wallet.as_deref());
        let market = visitor.tags.market.as_deref().or(tags.market.as_deref());

        let level = *event.metadata().level();
        write!(
            writer,
            "[{}] [{}][{}] ",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            wallet.unwrap_or("-"),
            market.unwrap_or("-"),
        )?;
        if level != Level::INFO {
            write!(writer, "{level}: ")?;
        }
        write!(writer, "{}", visitor.message)?;
        for extra in &visitor.extra {
            write!(writer, " {extra}")?;
        }
        writeln!(writer)
    }
}

/// `<prefix>.log` capped at `max_bytes`; the previous file is kept as
/// `<prefix>.log.1`.
#[derive(Debug)]
pub struct SizeCappedFile {
    path: PathBuf,
    rolled: PathBuf,
    max_bytes: u64,
    file: File,
    size: u64,
}

impl SizeCappedFile {
    pub fn new(config: &LoggingConfig) -> io::Result<Self> {
        let directory = PathBuf::from(&config.directory);
        fs::create_dir_all(&directory)?;
        let path = directory.join(format!("{}.log", config.prefix));
        let rolled = directory.join(format!("{}.log.1", config.prefix));
        let (file, size) = Self::open(&path)?;
        Ok(Self {
            path,
            rolled,
            max_bytes: config.max_bytes.max(1),
            file,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path) -> io::Result<(File, u64)> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, &self.rolled)?;
        let (file, size) = Self::open(&self.path)?;
        self.file = file;
        self.size = size;
        Ok(())
    }
}

impl Write for SizeCappedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        let written = self.file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Background file writer for the configured rotation. Daily files are named
/// `<prefix>.YYYY-MM-DD.log`. Dropping the guard flushes pending lines.
pub fn file_writer(config: &LoggingConfig) -> io::Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.directory)?;
    match config.rotation {
        Rotation::Daily => {
            let appender = RollingFileAppender::builder()
                .rotation(AppenderRotation::DAILY)
                .filename_prefix(&config.prefix)
                .filename_suffix("log")
                .build(&config.directory)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            Ok(tracing_appender::non_blocking(appender))
        }
        Rotation::Size => Ok(tracing_appender::non_blocking(SizeCappedFile::new(config)?)),
    }
}

/// Registry with the span tag layer, stderr output and an optional file
/// output, all in the bot line format.
fn bot_subscriber<W>(filter: EnvFilter, file: Option<W>) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let stderr_layer = tracing_subscriber::fmt::layer()
        .event_format(BotLineFormat)
        .with_writer(io::stderr);
    let file_layer = file.map(|writer| {
        tracing_subscriber::fmt::layer()
            .event_format(BotLineFormat)
            .with_ansi(false)
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(SpanTagLayer)
        .with(stderr_layer)
        .with(file_layer)
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Keep the returned guard alive for as long as the file should be
/// written.
pub fn init_tracing(config: Option<&LoggingConfig>) -> io::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard) = match config {
        Some(config) => {
            let (writer, guard) = file_writer(config)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    if bot_subscriber(filter, writer).try_init().is_err() {
        // Tracing already initialised elsewhere.
    }
    Ok(guard)
}

/// Most recently modified `<prefix>*` file in `directory`.
pub fn latest_log_file(directory: &Path, prefix: &str) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) || !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Last `lines` lines of `path`.
pub fn tail_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut window: AllocRingBuffer<String> =
        AllocRingBuffer::with_capacity(lines.next_power_of_two());
    for line in reader.lines() {
        window.push(line?);
    }
    let collected = window.to_vec();
    let skip = collected.len().saturating_sub(lines);
    Ok(collected.into_iter().skip(skip).collect())
}
