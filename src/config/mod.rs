//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! conf/main.conf, conf/server.conf, conf/worlds.conf
//!     → ini.rs (parse INI documents)
//!     → validation.rs (DEFAULT merge, coercion, references, lints)
//!     → Configuration (validated, immutable)
//!     → shared via Arc with the WorldManager
//!
//! On auto port allocation:
//!     store.rs reloads worlds.conf under the instance lock
//!     → chosen port written back into the world's section
//! ```
//!
//! # Design Decisions
//! - Records are immutable once loaded; edits only ever touch worlds.conf
//! - A broken world or server section never hides the valid ones
//! - Rewrites keep comments and untouched lines byte for byte

pub mod ini;
pub mod loader;
pub mod paths;
pub mod schema;
pub mod selection;
pub mod store;
pub mod template;
pub mod validation;

pub use loader::{load_config, Configuration};
pub use paths::InstancePaths;
pub use schema::{GlobalSettings, LockTimeout, LogLevel, PortRange, PortSetting, ServerType, WorldSpec};
pub use selection::{Selection, SelectionError};
pub use store::WorldsStore;
pub use validation::{ConfigError, ConfigWarning};
