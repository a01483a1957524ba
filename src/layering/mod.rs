//! The layering pipeline.
//!
//! ```text
//! TopologicalSorter -> LayerAssigner -> LevelGrouper -> PositionEncoder
//! ```
//!
//! Each stage reads the previous stage's committed output from the store and
//! re-initializes its own scratch state, so any stage can be re-run after a
//! partial failure.

pub mod layers;
pub mod levels;
pub mod positions;
pub mod progress;
pub mod topo_sort;

pub use layers::{LayerAssigner, LayerReport};
pub use levels::{group_levels, GroupedBlock, Grouping, LevelGrouper, SublevelGroup};
pub use positions::{level_color, sublevel_color, EncodedLayout, PositionEncoder, RunFacts};
pub use progress::{LayoutProgress, LayoutStage, ProgressRegistry, ProgressReporter};
pub use topo_sort::{SortReport, TopologicalSorter};
