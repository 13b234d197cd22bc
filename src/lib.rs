//! Diffable ordered-collection engine.
//!
//! Callers describe the whole desired arrangement of sections and items as
//! an immutable [`Snapshot`]. A [`DataSource`] diffs it against the
//! arrangement it currently retains and forwards the resulting
//! [`EditScript`] (deletes, inserts, moves, reloads) to a
//! [`PresentationAdapter`], one apply at a time.
//!
//! ```no_run
//! use diffable_source::{DataSource, Item, RecordingAdapter, Snapshot};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = DataSource::new(RecordingAdapter::new())?;
//! let mut builder = Snapshot::builder();
//! builder
//!     .append_section("Illinois")?
//!     .append_items(vec![Item::leaf("Chicago", json!({ "population": 2710000 }))], "Illinois")?;
//! source.apply(builder.build(), true)?;
//! source.wait_until_idle()?;
//! # Ok(())
//! # }
//! ```
mod config;
mod data_source;
mod diff_engine;
mod errors;
mod presentation;
mod snapshot;
mod types;

pub use config::DataSourceConfig;
pub use data_source::{DataSource, DataSourceState};
pub use diff_engine::{DiffEngine, diff};
pub use errors::{DataSourceError, PresentationError, SnapshotError, SnapshotSide};
pub use presentation::{ListMirror, MirrorRow, MirrorSection, PresentationAdapter, Presented, RecordingAdapter};
pub use snapshot::{Item, ItemKind, Section, Snapshot, SnapshotBuilder, SnapshotIndex};
pub use types::{
    ContentHash, Edit, EditAction, EditCounts, EditScript, Identifiable, IndexPath, ItemEdit, ItemId, SectionEdit,
    SectionId, same_content, same_identity,
};
