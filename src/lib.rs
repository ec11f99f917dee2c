#![allow(non_snake_case)]

// Модель данных и хранилище
pub mod version;
pub mod changeset;
pub mod engine;   // src/engine/{mod,snapshot,ops,log,store}.rs

// Конфигурация и метрики
pub mod config;
pub mod metrics;

// Конвейер уведомлений
pub mod catalog;
pub mod coordinator;
pub mod worker;
pub mod signal;
pub mod dispatch;
pub mod notification;
pub mod notifier;

// Удобные реэкспорты
pub use version::VersionToken;
pub use changeset::{TableChangeSet, TransactionChangeInfo};
pub use engine::{
    object_type_for_table_name, table_for_object_type, Database, DatabaseConfig, LogEngine, Row, RowKey,
    SharedDatabase, Snapshot, StorageEngine, Table, WriteTransaction,
};
pub use config::{NotifierBuilder, NotifierConfig};
pub use catalog::{CatalogEntry, RegistryWatcher};
pub use coordinator::{Coordinator, RegisterOutcome};
pub use dispatch::DeliveryDispatcher;
pub use notification::{ChangeMap, ChangeNotification, DatabaseHandle, DiffKind};
pub use notifier::{GlobalNotifier, NotifierTarget};
pub use worker::{compute_notification, DiffWorker, WorkBase, WorkItem, WorkQueue};
