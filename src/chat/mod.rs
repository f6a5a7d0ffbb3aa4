pub mod entries;
pub mod integrity;
pub mod manager;
pub mod mutations;
pub mod registry;
pub mod state;
pub mod sync;

pub use manager::{ChatCell, HttpJournalBackend, JournalBackend, JournalEntryManager, RefreshOptions};
pub use registry::{EntryManagerCache, EntryManagerLease, JournalEntryManagerRef};
pub use state::JournalChatState;
pub use sync::{sync_chat, ChatSyncConfig, ChatSyncError};
