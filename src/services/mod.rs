// Service layer: storage, queueing, transport and delivery coordination

pub mod chat_connection;
pub mod chat_delivery_queue;
pub mod chat_directory;
pub mod chat_message_store;
pub mod chat_service;
pub mod chat_transport;
pub mod chat_types;
pub mod config;

pub use chat_connection::ConnectionSupervisor;
pub use chat_delivery_queue::DeliveryQueue;
pub use chat_directory::DirectoryClient;
pub use chat_message_store::MessageStore;
pub use chat_service::ChatService;
pub use self::config::ConfigService;
