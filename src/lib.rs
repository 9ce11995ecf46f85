//! Replica synchronization for a collaborative shape canvas.
//!
//! Each client keeps a full replica of a room's shapes, applies local edits
//! immediately, and converges with peers by broadcasting whole-record
//! operations over a room channel. Conflicts resolve last-delivered-wins;
//! edits made while disconnected wait in a durable FIFO queue.
//!
//! | Module        | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | `shape`       | `ShapeRecord` and id aliases                           |
//! | `operation`   | `Operation` upsert/remove and wire payloads            |
//! | `history`     | bounded undo/redo snapshots                            |
//! | `store`       | `ReplicaStore`, the single write path for the registry |
//! | `conflict`    | advisory notices for edits to selected shapes          |
//! | `presence`    | roster and cursor projection                           |
//! | `queue`       | `OfflineQueue` with memory and file stores             |
//! | `transport`   | channel traits plus memory and WebSocket transports    |
//! | `persistence` | write-behind buffer and Postgres sink                  |
//! | `session`     | one room's lifecycle, tying the above together         |
//! | `relay`       | axum WebSocket broker the WebSocket transport talks to |
//! | `config`      | environment-driven settings                            |

pub mod config;
pub mod conflict;
pub mod history;
pub mod operation;
pub mod persistence;
pub mod presence;
pub mod queue;
pub mod relay;
pub mod session;
pub mod shape;
pub mod store;
pub mod transport;

pub use operation::Operation;
pub use session::{Session, SessionOptions, SessionView};
pub use shape::{ActorId, RoomId, ShapeId, ShapeKind, ShapeRecord};
