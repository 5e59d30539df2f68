//! Development server.
//!
//! Serves the output directory over HTTP and keeps open browser tabs fresh:
//!
//! 1. **HTTP server**: `axum` with `tower-http`'s `ServeDir`, on a current
//!    thread tokio runtime of its own. HTML responses get a small client
//!    script injected.
//! 2. **WebSocket server**: dedicated threads using `tungstenite` which hold
//!    the connections of open pages.
//! 3. **Output watcher**: any change below the output directory broadcasts
//!    `"reload"`, and the client script reloads the page.

mod http;
mod reload;

pub use http::inject_script;
pub use reload::{client_script, reserve_port};

use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

use camino::Utf8Path;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};

use crate::config;
use crate::error::{ServeError, WatchError};

const SETTLE: Duration = Duration::from_millis(100);

/// A running development server. Dropping it stops the output watcher; the
/// server threads live until the process exits.
pub struct DevServer {
    port: u16,
    reload_port: u16,
    http: JoinHandle<Result<(), ServeError>>,
    _watcher: Debouncer<RecommendedWatcher, RecommendedCache>,
    _reload: [JoinHandle<()>; 2],
}

impl DevServer {
    /// Starts serving `output`, which is created if missing.
    pub fn start(config: &config::Serve, output: &Utf8Path) -> Result<Self, ServeError> {
        std::fs::create_dir_all(output)?;

        let (listener, reload_port) = reserve_port(config.host, config.reload_port)?;
        let (tx_reload, reload_threads) = reload::start(listener);

        let watcher = watch_output(output, tx_reload)?;

        let address = SocketAddr::new(config.host, config.port);
        let http = http::start(address, output.to_owned(), client_script(reload_port))?;

        Ok(Self {
            port: config.port,
            reload_port,
            http,
            _watcher: watcher,
            _reload: reload_threads,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn reload_port(&self) -> u16 {
        self.reload_port
    }

    /// Blocks until the HTTP server stops.
    pub fn wait(self) -> Result<(), ServeError> {
        self.http
            .join()
            .unwrap_or_else(|_| Err(ServeError::Io(std::io::Error::other("HTTP server panicked"))))
    }
}

fn watch_output(
    output: &Utf8Path,
    tx_reload: Sender<()>,
) -> Result<Debouncer<RecommendedWatcher, RecommendedCache>, WatchError> {
    let mut debouncer = new_debouncer(SETTLE, None, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                let changed = events
                    .iter()
                    .any(|event| !matches!(event.kind, EventKind::Access(_)));
                if changed {
                    // The broadcast thread is gone, nobody to reload.
                    let _ = tx_reload.send(());
                }
            }
            Err(errors) => {
                for error in errors {
                    tracing::error!("output watch error: {error}");
                }
            }
        }
    })?;

    debouncer.watch(output.as_std_path(), RecursiveMode::Recursive)?;
    tracing::info!("reloading browsers on changes in {}", output);

    Ok(debouncer)
}
