//! Diagnostics routing. Every heap keeps a [`HeapLog`] handle and logs
//! through [`heap_log!`]. Messages go to the [`log`] facade under the
//! `segheap` target unless a custom [`LogSink`] has been registered, in which
//! case the sink receives them instead.
//!
//! Chatty levels (`Debug`, `Trace`) only come out in debug mode. Warnings and
//! errors always do.

use std::{fmt, sync::Arc};

use log::Level;

/// Target used for every message sent to the [`log`] facade.
pub const LOG_TARGET: &str = "segheap";

/// Custom destination for heap diagnostics.
///
/// Any `Fn(Level, &fmt::Arguments)` closure that is `Send + Sync` is a sink:
///
/// ```rust
/// use segheap::Heap;
///
/// let mut heap = Heap::new();
/// heap.set_log_sink(|level: log::Level, message: &std::fmt::Arguments<'_>| {
///     eprintln!("[{level}] {message}");
/// });
/// ```
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &fmt::Arguments<'_>);
}

impl<F> LogSink for F
where
    F: Fn(Level, &fmt::Arguments<'_>) + Send + Sync,
{
    fn log(&self, level: Level, message: &fmt::Arguments<'_>) {
        self(level, message)
    }
}

/// Logging handle shared by the components of one heap.
#[derive(Clone, Default)]
pub(crate) struct HeapLog {
    /// Debug mode. Enables `Debug` and `Trace` messages.
    pub verbose: bool,
    sink: Option<Arc<dyn LogSink>>,
}

impl HeapLog {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            sink: None,
        }
    }

    pub fn set_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sink = Some(sink);
    }

    pub fn clear_sink(&mut self) {
        self.sink = None;
    }

    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level <= Level::Info || self.verbose
    }

    /// Emits `message` if `level` passes the debug mode filter.
    #[inline]
    pub fn emit(&self, level: Level, message: fmt::Arguments<'_>) {
        if self.enabled(level) {
            self.report(level, message);
        }
    }

    /// Emits `message` unconditionally.
    pub fn report(&self, level: Level, message: fmt::Arguments<'_>) {
        match &self.sink {
            Some(sink) => sink.log(level, &message),
            None => log::log!(target: LOG_TARGET, level, "{}", message),
        }
    }
}

impl fmt::Debug for HeapLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapLog")
            .field("verbose", &self.verbose)
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}

/// `heap_log!(log, Warn, "format {}", args)`. The level is any variant name
/// of [`log::Level`].
macro_rules! heap_log {
    ($log:expr, $level:ident, $($arg:tt)+) => {
        $log.emit(::log::Level::$level, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn capture() -> (HeapLog, Arc<Mutex<Vec<(Level, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);

        let mut log = HeapLog::new(false);
        log.set_sink(Arc::new(move |level: Level, message: &fmt::Arguments<'_>| {
            sink_lines.lock().unwrap().push((level, message.to_string()));
        }));

        (log, lines)
    }

    #[test]
    fn debug_messages_need_verbose_mode() {
        let (mut log, lines) = capture();

        heap_log!(log, Debug, "hidden {}", 1);
        heap_log!(log, Warn, "shown {}", 2);

        log.verbose = true;
        heap_log!(log, Trace, "shown {}", 3);

        let lines = lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                (Level::Warn, String::from("shown 2")),
                (Level::Trace, String::from("shown 3")),
            ]
        );
    }

    #[test]
    fn report_ignores_filter() {
        let (log, lines) = capture();

        log.report(Level::Debug, format_args!("status"));

        assert_eq!(lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn clearing_sink_falls_back_to_facade() {
        let (mut log, lines) = capture();

        log.clear_sink();
        heap_log!(log, Error, "goes to the log crate");

        assert!(lines.lock().unwrap().is_empty());
    }
}
