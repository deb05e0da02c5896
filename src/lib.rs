pub mod store;
pub mod talk;
pub mod types;

pub use crate::store::{MessageStore, PocketBaseStore, StoreError};
pub use crate::talk::conversation::{ConversationController, MessageListSnapshot};
pub use crate::talk::error::{Result, TalkError};
pub use crate::talk::messages::{Message, MessageKind, SenderProfile};
pub use crate::talk::outbound_queue::{PendingMessage, PendingStatus, QueueRunReport};
pub use crate::talk::uploads::{AttachmentFile, UploadManager, UploadStatus, UploadTask};
pub use crate::talk::{Pipeline, PipelineConfig, Talk, TalkConfig};

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

static TRACING_GUARDS: OnceLock<Mutex<Option<(WorkerGuard, Option<WorkerGuard>)>>> =
    OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once per process: stdout plus a daily log file.
///
/// `RUST_LOG` overrides the default `info` filter. If the log directory cannot
/// be used, logging continues on stdout only.
pub fn init_tracing(logs_dir: &Path) {
    TRACING_INIT.get_or_init(|| {
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("talk")
            .filename_suffix("log")
            .build(logs_dir);

        let (file_layer, file_guard) = match file_appender {
            Ok(appender) => {
                let (non_blocking_file, file_guard) = tracing_appender::non_blocking(appender);
                let layer = Layer::new()
                    .with_writer(non_blocking_file)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(file_guard))
            }
            Err(e) => {
                eprintln!("Failed to create log file in {}: {}", logs_dir.display(), e);
                (None, None)
            }
        };

        TRACING_GUARDS
            .set(Mutex::new(Some((stdout_guard, file_guard))))
            .ok();

        // Another subscriber may already be installed by the host application.
        let _ = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
    });
}
