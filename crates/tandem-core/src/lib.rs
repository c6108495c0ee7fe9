//! Tandem Core Library
//!
//! Collaborative state synchronization for the Tandem whiteboard: the
//! replicated element store, undo/redo, presence, owner liveness, the
//! encrypted room transport and the owner's edit history.

pub mod awareness;
pub mod clock;
pub mod config;
pub mod crdt;
pub mod crypto;
pub mod element;
pub mod history;
pub mod liveness;
pub mod observer;
pub mod permission;
pub mod room;
pub mod session;
pub mod storage;
pub mod sync;
pub mod undo;

pub use awareness::{AwarenessState, AwarenessTracker, Viewport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use crdt::{ElementStore, StoreError};
pub use crypto::{CryptoError, RoomKey, generate_room_key, import_key};
pub use element::{Element, ElementId, ElementKind, ElementPatch, SerializableColor};
pub use history::{HistoryEntry, HistoryManager, OperationKind};
pub use liveness::{LivenessEvent, LivenessState, OwnerLivenessMonitor};
pub use observer::SubscriptionId;
pub use permission::{Permission, PermissionGate};
pub use room::{ConnectionChange, ConnectionStatus};
pub use session::{EncryptionStatus, Session, SessionBuilder, SessionOptions, UserInfo};
#[cfg(not(target_arch = "wasm32"))]
pub use session::open;
pub use storage::{HistoryStorage, MemoryHistoryStorage, StorageError};
pub use sync::{ClientMessage, ConnectionState, ServerMessage, SyncEvent, Transport};
#[cfg(not(target_arch = "wasm32"))]
pub use sync::PlatformWebSocket;
pub use undo::UndoRedoStack;
