pub mod error;
pub mod services;
pub mod session;

use std::sync::Once;

pub use error::{ChatError, ErrorKind, Result};
pub use services::chat_connection::{ConnectionState, ReconnectPolicy};
pub use services::chat_delivery_queue::{QueuePartition, QueueSnapshot};
pub use services::chat_directory::DirectoryClient;
pub use services::chat_message_store::{MessageStore, SharedStore};
pub use services::chat_transport::{Connector, MemoryConnector, MemoryPeer, WebSocketConnector};
pub use services::chat_types::{
    ChatEvent, ConversationKey, Frame, Message, MessageStatus, Receipt, RecentContact, UserRecord,
};
pub use services::config::{ChatConfig, ConfigService};
pub use session::ChatSession;

static LOGGING: Once = Once::new();

/// Install the global logger once. `RUST_LOG` overrides `level` when set.
pub fn init_logging(level: &str) {
    LOGGING.call_once(|| {
        let level = level.parse().unwrap_or(log::LevelFilter::Info);
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(level)
            .filter_module("tungstenite", log::LevelFilter::Warn)
            .filter_module("tokio_tungstenite", log::LevelFilter::Warn)
            .filter_module("reqwest", log::LevelFilter::Warn)
            .filter_module("hyper", log::LevelFilter::Warn)
            .filter_module("hyper_util", log::LevelFilter::Warn);
        if let Ok(filters) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        if builder.try_init().is_ok() {
            log::info!("Logging initialized at level: {}", level);
        }
    });
}

/// Open the store under the configured data dir and start a session for `local_id`
/// over a real WebSocket.
pub async fn connect(local_id: &str, config: &ChatConfig) -> Result<ChatSession> {
    init_logging(&config.logging.level);
    let store = MessageStore::open_shared(&config.storage.data_dir)?;
    ChatSession::start(
        local_id,
        config,
        store,
        std::sync::Arc::new(WebSocketConnector::new(config.connect_timeout())),
    )
    .await
}
