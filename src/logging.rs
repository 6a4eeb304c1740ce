use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::FilterFn, prelude::*, Layer};

/// Emit one event inside a named span, so every line carries the traffic
/// direction it belongs to.
#[macro_export]
macro_rules! log {
    ($direction:literal, $level:expr, $($arg:tt)*) => {{
        let span = $crate::tracing::span!(target: "mailgate", $level, $direction);
        let _guard = span.enter();

        $crate::tracing::event!(target: "mailgate", $level, $($arg)*)
    }};
}

/// Log a line received from the client.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($arg:tt)*) => {
        $crate::log!("incoming", $crate::tracing::Level::$level, $($arg)*)
    };

    ($($arg:tt)*) => {
        $crate::log!("incoming", $crate::tracing::Level::TRACE, $($arg)*)
    };
}

/// Log a reply written to the client.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($arg:tt)*) => {
        $crate::log!("outgoing", $crate::tracing::Level::$level, $($arg)*)
    };

    ($($arg:tt)*) => {
        $crate::log!("outgoing", $crate::tracing::Level::TRACE, $($arg)*)
    };
}

/// Log engine-internal state changes.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)*) => {
        $crate::log!("internal", $crate::tracing::Level::$level, $($arg)*)
    };

    ($($arg:tt)*) => {
        $crate::log!("internal", $crate::tracing::Level::TRACE, $($arg)*)
    };
}

/// The level used when `LOG_LEVEL` is unset or unparseable.
const fn fallback_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

/// Install the global subscriber.
///
/// `LOG_LEVEL` accepts anything `LevelFilter` can parse (`error`, `warn`,
/// `info`, `debug`, `trace`, `off`). Only this crate's own targets are
/// emitted; file and line locations appear in debug builds.
pub fn init() {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(fallback_level());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_file(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("mailgate")
                })),
        )
        .init();
}
